use web_push::{
    ContentEncoding, IsahcWebPushClient, SubscriptionInfo, VapidSignatureBuilder, WebPushClient,
    WebPushMessageBuilder,
};

use crate::config::AppConfig;
use crate::db;
use crate::types::{MessageId, ThreadId, UserId};

/// 通知プレビューに載せる本文の最大文字数。
const PREVIEW_MAX_CHARS: usize = 120;

/// 1ユーザの全サブスクリプションにPush通知を送信する内部ヘルパー。
async fn send_push_to_user(
    pool: &db::Db,
    vapid_private: &str,
    client: &IsahcWebPushClient,
    user_id: &UserId,
    payload: &str,
) {
    let subscriptions = match db::push::get_subscriptions_for_user(pool, user_id).await {
        Ok(subs) => subs,
        Err(e) => {
            tracing::warn!("failed to get subscriptions for {user_id}: {e}");
            return;
        }
    };

    for sub in &subscriptions {
        let subscription = SubscriptionInfo::new(&sub.endpoint, &sub.p256dh, &sub.auth);

        let partial = match VapidSignatureBuilder::from_base64_no_sub(vapid_private) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("vapid key error: {e}");
                continue;
            }
        };
        let sig = match partial.add_sub_info(&subscription).build() {
            Ok(sig) => sig,
            Err(e) => {
                tracing::warn!("vapid build error: {e}");
                continue;
            }
        };

        let mut msg_builder = WebPushMessageBuilder::new(&subscription);
        msg_builder.set_vapid_signature(sig);
        msg_builder.set_payload(ContentEncoding::Aes128Gcm, payload.as_bytes());

        let message = match msg_builder.build() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("push message build error: {e}");
                continue;
            }
        };

        match client.send(message).await {
            Ok(()) => {}
            Err(e) => {
                let err_str = e.to_string();
                // 410 Gone: 購読が無効化されたので削除
                if err_str.contains("410") {
                    tracing::info!("removing expired subscription for {user_id}");
                    let _ = db::push::delete_subscription_by_endpoint(pool, &sub.endpoint).await;
                } else {
                    tracing::warn!("push send error for {user_id}: {e}");
                }
            }
        }
    }
}

/// オフライン受信者への新着メッセージ通知。
/// 副次チャネルなので、VAPID鍵が未設定なら黙って成功扱いにし、
/// 送信失敗もメッセージ送信経路には影響させない。
/// ペイロードはJSON形式: {"type":"message","thread_id":"...","message_id":"...",
/// "sender_id":"...","sender_name":"...","preview":"..."}
pub async fn send_message_notification(
    pool: &db::Db,
    config: &AppConfig,
    recipient: &UserId,
    sender: &UserId,
    thread_id: &ThreadId,
    message_id: &MessageId,
    preview: Option<&str>,
) -> Result<(), String> {
    let vapid_private = match config.vapid_private_key.as_ref() {
        Some(key) => key,
        None => return Ok(()),
    };

    let client = IsahcWebPushClient::new().map_err(|e| e.to_string())?;

    let sender_name = db::users::get_user(pool, sender)
        .await
        .ok()
        .flatten()
        .map(|u| u.display_name)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| sender.to_string());

    let preview = preview.map(|text| truncate_chars(text, PREVIEW_MAX_CHARS));
    let payload = serde_json::json!({
        "type": "message",
        "thread_id": thread_id.as_str(),
        "message_id": message_id.as_str(),
        "sender_id": sender.as_str(),
        "sender_name": sender_name,
        "preview": preview,
    })
    .to_string();

    send_push_to_user(pool, vapid_private, &client, recipient, &payload).await;
    Ok(())
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}

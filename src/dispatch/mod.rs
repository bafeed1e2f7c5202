use crate::config::AppConfig;
use crate::db::models::{MessageContent, MessageRow, ThreadParticipantRow, ThreadSummaryRow};
use crate::db::{self, Db};
use crate::error::AppError;
use crate::push;
use crate::realtime::ServerEvent;
use crate::realtime::presence::PresenceHub;
use crate::types::{ListingId, MessageId, ThreadId, UserId};

#[derive(Debug)]
pub struct SendMessageInput {
    pub thread_id: Option<ThreadId>,
    pub recipient_id: Option<UserId>,
    pub listing_id: Option<ListingId>,
    pub content: MessageContent,
}

/// スレッドを取得または作成する。自分自身との会話と、どちらか一方向でも
/// ブロック関係がある相手は拒否する。
pub async fn create_or_get_thread(
    pool: &Db,
    sender: &UserId,
    recipient: &UserId,
    listing: Option<&ListingId>,
) -> Result<ThreadSummaryRow, AppError> {
    check_pair(pool, sender, recipient).await?;

    let (thread, _created) = db::threads::find_or_create(pool, sender, recipient, listing).await?;
    let thread_id = ThreadId(thread.id);
    db::threads::summary_for(pool, &thread_id, sender)
        .await?
        .ok_or_else(|| AppError::NotFound("thread not found".into()))
}

/// メッセージ送信の本体。RESTとイベントチャネルの両方から呼ばれる。
///
/// 1. 本文検証とスレッド解決（ブロック・参加者チェック）
/// 2. ログへ追記（ここまでに失敗したら何も起きていない）
/// 3. スレッド側の記録更新（失敗してもメッセージは残る。ログのみ）
/// 4. 参加者ごとにイベント配信、オンライン受信者は delivered へ遷移、
///    オフライン受信者にはPush通知（投げっぱなし）
pub async fn send_message(
    pool: &Db,
    presence: &PresenceHub,
    config: &AppConfig,
    sender: &UserId,
    input: SendMessageInput,
) -> Result<MessageRow, AppError> {
    input
        .content
        .validate()
        .map_err(AppError::InvalidContent)?;

    let (thread_id, created, pre_participants) = match (&input.thread_id, &input.recipient_id) {
        (Some(thread_id), _) => {
            let thread = db::threads::get(pool, thread_id)
                .await?
                .ok_or_else(|| AppError::NotFound("thread not found".into()))?;
            let participants = db::threads::participants(pool, thread_id).await?;
            if !participants.iter().any(|p| p.user_id == sender.as_str()) {
                return Err(AppError::Forbidden("not a participant of this thread".into()));
            }
            let other = participants
                .iter()
                .find(|p| p.user_id != sender.as_str())
                .ok_or_else(|| AppError::NotFound("recipient not found in thread".into()))?;
            let other = UserId(other.user_id.clone());
            if db::blocks::is_blocked_either(pool, sender, &other).await? {
                return Err(AppError::Blocked("messaging is not possible with this user".into()));
            }
            (ThreadId(thread.id), false, participants)
        }
        (None, Some(recipient)) => {
            check_pair(pool, sender, recipient).await?;
            let (thread, created) =
                db::threads::find_or_create(pool, sender, recipient, input.listing_id.as_ref())
                    .await?;
            let thread_id = ThreadId(thread.id);
            let participants = db::threads::participants(pool, &thread_id).await?;
            (thread_id, created, participants)
        }
        (None, None) => {
            return Err(AppError::BadRequest(
                "thread_id or recipient_id is required".into(),
            ));
        }
    };

    let message_id = MessageId::new_v4();
    let at = chrono::Utc::now();
    db::messages::create_message(pool, &message_id, &thread_id, sender, &input.content, at)
        .await?;
    let message = db::messages::get_message_by_id(pool, &message_id)
        .await?
        .ok_or_else(|| AppError::Internal("message vanished after append".into()))?;

    // メッセージ本体は確定済み。ここから先の失敗で送信自体は失敗させない
    // （サマリはログから再計算可能だが、メッセージの喪失は許されない）。
    if let Err(e) = db::threads::on_message_appended(
        pool,
        &thread_id,
        sender,
        input.content.text(),
        input.content.image_key(),
        at,
    )
    .await
    {
        tracing::error!(
            thread = %thread_id,
            message = %message_id,
            error = %e,
            "thread bookkeeping failed after message append"
        );
    }

    fan_out(
        pool,
        presence,
        config,
        sender,
        &thread_id,
        &message,
        created,
        &pre_participants,
    )
    .await;

    Ok(message)
}

/// 参加者ごとのイベント配信。各参加者には自分自身の未読数を含む
/// サマリを添える（送信者の他デバイスにも届く）。
#[allow(clippy::too_many_arguments)]
async fn fan_out(
    pool: &Db,
    presence: &PresenceHub,
    config: &AppConfig,
    sender: &UserId,
    thread_id: &ThreadId,
    message: &MessageRow,
    created: bool,
    pre_participants: &[ThreadParticipantRow],
) {
    for participant in pre_participants {
        let user_id = UserId(participant.user_id.clone());
        let summary = match db::threads::summary_for(pool, thread_id, &user_id).await {
            Ok(Some(summary)) => summary,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(thread = %thread_id, user = %user_id, error = %e, "summary fetch failed during fan-out");
                continue;
            }
        };

        let delivered = presence
            .send_to_user(
                &user_id,
                &ServerEvent::NewMessage {
                    message: message.clone(),
                    thread: summary.clone(),
                },
            )
            .await;

        // 新規スレッド、またはこの参加者がローカル削除していたスレッドの復活
        if created || participant.locally_deleted_at.is_some() {
            presence
                .send_to_user(&user_id, &ServerEvent::NewThread { thread: summary })
                .await;
        }

        if user_id == *sender {
            continue;
        }

        if delivered > 0 {
            let message_id = MessageId(message.id.clone());
            if let Err(e) = db::messages::mark_delivered(pool, &message_id).await {
                tracing::warn!(message = %message_id, error = %e, "failed to mark message delivered");
            }
        } else {
            // オフライン参加者は次回フェッチで未読数と本文を受け取る。
            // Push通知は副次チャネルで、失敗しても送信は成功のまま。
            let pool = pool.clone();
            let config = config.clone();
            let recipient = user_id.clone();
            let sender = sender.clone();
            let thread_id = thread_id.clone();
            let message_id = MessageId(message.id.clone());
            let preview = message.text.clone();
            tokio::spawn(async move {
                if let Err(e) = push::send_message_notification(
                    &pool,
                    &config,
                    &recipient,
                    &sender,
                    &thread_id,
                    &message_id,
                    preview.as_deref(),
                )
                .await
                {
                    tracing::warn!(user = %recipient, "push notification failed: {e}");
                }
            });
        }
    }
}

/// スレッドを既読にする。メッセージ側のステータス遷移と参加者の未読数
/// リセットを行い、相手側に既読イベントを通知する。冪等。
pub async fn mark_thread_read(
    pool: &Db,
    presence: &PresenceHub,
    thread_id: &ThreadId,
    reader: &UserId,
) -> Result<(), AppError> {
    db::threads::get(pool, thread_id)
        .await?
        .ok_or_else(|| AppError::NotFound("thread not found".into()))?;
    if !db::threads::is_participant(pool, thread_id, reader).await? {
        return Err(AppError::Forbidden("not a participant of this thread".into()));
    }

    db::messages::mark_read(pool, thread_id, reader).await?;
    db::threads::mark_read(pool, thread_id, reader).await?;

    let participants = db::threads::participants(pool, thread_id).await?;
    for participant in participants {
        if participant.user_id == reader.as_str() {
            continue;
        }
        presence
            .send_to_user(
                &UserId(participant.user_id),
                &ServerEvent::MessagesRead {
                    thread_id: thread_id.clone(),
                    reader_id: reader.clone(),
                },
            )
            .await;
    }
    Ok(())
}

async fn check_pair(pool: &Db, sender: &UserId, recipient: &UserId) -> Result<(), AppError> {
    if sender == recipient {
        return Err(AppError::SelfConversation);
    }
    db::users::get_user(pool, recipient)
        .await?
        .ok_or_else(|| AppError::NotFound("recipient not found".into()))?;
    if db::blocks::is_blocked_either(pool, sender, recipient).await? {
        return Err(AppError::Blocked("messaging is not possible with this user".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::test_config;
    use crate::db::testing;
    use crate::types::ConnectionId;
    use tokio::sync::mpsc;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        pool: Db,
        presence: PresenceHub,
        config: AppConfig,
        alice: UserId,
        bob: UserId,
    }

    async fn harness() -> Harness {
        let pool = testing::pool().await;
        let alice = testing::seed_user(&pool, "alice", "Alice").await;
        let bob = testing::seed_user(&pool, "bob", "Bob").await;
        Harness {
            pool,
            presence: PresenceHub::new(),
            config: test_config(),
            alice,
            bob,
        }
    }

    async fn connect(h: &Harness, user: &UserId) -> (ConnectionId, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = ConnectionId::new_v4();
        h.presence.register(user, &conn, tx).await;
        (conn, rx)
    }

    fn text(body: &str) -> MessageContent {
        MessageContent::Text { text: body.into() }
    }

    fn to_recipient(recipient: &UserId, content: MessageContent) -> SendMessageInput {
        SendMessageInput {
            thread_id: None,
            recipient_id: Some(recipient.clone()),
            listing_id: None,
            content,
        }
    }

    #[tokio::test]
    async fn first_contact_creates_thread_and_counts_unread() {
        let h = harness().await;

        let message = send_message(
            &h.pool,
            &h.presence,
            &h.config,
            &h.alice,
            to_recipient(&h.bob, text("hello")),
        )
        .await
        .unwrap();
        let thread_id = ThreadId(message.thread_id.clone());

        let bob_view = db::threads::summary_for(&h.pool, &thread_id, &h.bob)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bob_view.unread_count, 1);
        assert_eq!(bob_view.last_message_text.as_deref(), Some("hello"));

        let alice_view = db::threads::summary_for(&h.pool, &thread_id, &h.alice)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alice_view.unread_count, 0);
    }

    #[tokio::test]
    async fn online_recipient_gets_events_and_delivered_status() {
        let h = harness().await;
        let (_conn, mut bob_rx) = connect(&h, &h.bob).await;

        let message = send_message(
            &h.pool,
            &h.presence,
            &h.config,
            &h.alice,
            to_recipient(&h.bob, text("hello")),
        )
        .await
        .unwrap();

        // 新規スレッドなので new_message と new_thread の両方が届く
        let first = bob_rx.try_recv().unwrap();
        match first {
            ServerEvent::NewMessage { message: m, thread } => {
                assert_eq!(m.id, message.id);
                assert_eq!(thread.unread_count, 1);
            }
            other => panic!("expected new_message, got {other:?}"),
        }
        assert!(matches!(
            bob_rx.try_recv().unwrap(),
            ServerEvent::NewThread { .. }
        ));

        // オンライン配信できたので delivered へ遷移している
        let stored = db::messages::get_message_by_id(&h.pool, &MessageId(message.id.clone()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, "delivered");
    }

    #[tokio::test]
    async fn offline_recipient_sees_messages_on_next_fetch() {
        let h = harness().await;

        for body in ["un", "deux", "trois"] {
            send_message(
                &h.pool,
                &h.presence,
                &h.config,
                &h.alice,
                to_recipient(&h.bob, text(body)),
            )
            .await
            .unwrap();
        }

        let threads = db::threads::list_for_user(&h.pool, &h.bob).await.unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].unread_count, 3);

        let thread_id = ThreadId(threads[0].id.clone());
        let mut rows = db::messages::list_for_thread(&h.pool, &thread_id, &h.bob, None, 20)
            .await
            .unwrap();
        rows.reverse();
        let texts: Vec<_> = rows.iter().filter_map(|m| m.text.as_deref()).collect();
        assert_eq!(texts, vec!["un", "deux", "trois"]);
        // 誰にも配信されていないので sent のまま
        assert!(rows.iter().all(|m| m.status == "sent"));
    }

    #[tokio::test]
    async fn send_then_list_includes_the_message_last() {
        let h = harness().await;

        send_message(
            &h.pool,
            &h.presence,
            &h.config,
            &h.alice,
            to_recipient(&h.bob, text("premier")),
        )
        .await
        .unwrap();
        let sent = send_message(
            &h.pool,
            &h.presence,
            &h.config,
            &h.alice,
            to_recipient(&h.bob, text("dernier")),
        )
        .await
        .unwrap();

        let thread_id = ThreadId(sent.thread_id.clone());
        let mut rows = db::messages::list_for_thread(&h.pool, &thread_id, &h.alice, None, 20)
            .await
            .unwrap();
        rows.reverse();
        assert_eq!(rows.last().unwrap().id, sent.id);
    }

    #[tokio::test]
    async fn mark_read_zeroes_counter_and_notifies_sender() {
        let h = harness().await;
        let (_conn, mut alice_rx) = connect(&h, &h.alice).await;

        let message = send_message(
            &h.pool,
            &h.presence,
            &h.config,
            &h.alice,
            to_recipient(&h.bob, text("hello")),
        )
        .await
        .unwrap();
        let thread_id = ThreadId(message.thread_id.clone());
        // 送信時に自分のデバイスへ届いた分を読み捨てる
        while alice_rx.try_recv().is_ok() {}

        mark_thread_read(&h.pool, &h.presence, &thread_id, &h.bob)
            .await
            .unwrap();

        let bob_view = db::threads::summary_for(&h.pool, &thread_id, &h.bob)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bob_view.unread_count, 0);

        match alice_rx.try_recv().unwrap() {
            ServerEvent::MessagesRead { thread_id: t, reader_id } => {
                assert_eq!(t.as_str(), thread_id.as_str());
                assert_eq!(reader_id.as_str(), "bob");
            }
            other => panic!("expected messages_read, got {other:?}"),
        }

        // 冪等: もう一度呼んでも成功し、状態は変わらない
        mark_thread_read(&h.pool, &h.presence, &thread_id, &h.bob)
            .await
            .unwrap();
        let bob_view = db::threads::summary_for(&h.pool, &thread_id, &h.bob)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bob_view.unread_count, 0);
    }

    #[tokio::test]
    async fn revived_thread_emits_new_thread_event() {
        let h = harness().await;

        let message = send_message(
            &h.pool,
            &h.presence,
            &h.config,
            &h.alice,
            to_recipient(&h.bob, text("hello")),
        )
        .await
        .unwrap();
        let thread_id = ThreadId(message.thread_id.clone());

        db::threads::hide_locally(&h.pool, &thread_id, &h.bob)
            .await
            .unwrap();

        let (_conn, mut bob_rx) = connect(&h, &h.bob).await;
        send_message(
            &h.pool,
            &h.presence,
            &h.config,
            &h.alice,
            to_recipient(&h.bob, text("toujours là ?")),
        )
        .await
        .unwrap();

        assert!(matches!(
            bob_rx.try_recv().unwrap(),
            ServerEvent::NewMessage { .. }
        ));
        assert!(matches!(
            bob_rx.try_recv().unwrap(),
            ServerEvent::NewThread { .. }
        ));

        // さらにもう1通送っても new_thread は繰り返されない
        send_message(
            &h.pool,
            &h.presence,
            &h.config,
            &h.alice,
            to_recipient(&h.bob, text("encore")),
        )
        .await
        .unwrap();
        assert!(matches!(
            bob_rx.try_recv().unwrap(),
            ServerEvent::NewMessage { .. }
        ));
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn guards_reject_invalid_sends() {
        let h = harness().await;

        // 自分自身との会話
        let err = send_message(
            &h.pool,
            &h.presence,
            &h.config,
            &h.alice,
            to_recipient(&h.alice, text("moi")),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::SelfConversation));

        // 空本文
        let err = send_message(
            &h.pool,
            &h.presence,
            &h.config,
            &h.alice,
            to_recipient(&h.bob, text("   ")),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidContent(_)));

        // ブロック関係
        db::blocks::block(&h.pool, &h.bob, &h.alice).await.unwrap();
        let err = send_message(
            &h.pool,
            &h.presence,
            &h.config,
            &h.alice,
            to_recipient(&h.bob, text("hello")),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Blocked(_)));

        // 拒否された送信は何も残さない
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(&h.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn outsider_cannot_send_into_a_thread() {
        let h = harness().await;
        let carol = testing::seed_user(&h.pool, "carol", "Carol").await;

        let message = send_message(
            &h.pool,
            &h.presence,
            &h.config,
            &h.alice,
            to_recipient(&h.bob, text("privé")),
        )
        .await
        .unwrap();

        let err = send_message(
            &h.pool,
            &h.presence,
            &h.config,
            &carol,
            SendMessageInput {
                thread_id: Some(ThreadId(message.thread_id.clone())),
                recipient_id: None,
                listing_id: None,
                content: text("intrusion"),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn create_or_get_thread_is_stable_across_callers() {
        let h = harness().await;

        let first = create_or_get_thread(&h.pool, &h.alice, &h.bob, None)
            .await
            .unwrap();
        let second = create_or_get_thread(&h.pool, &h.bob, &h.alice, None)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        let err = create_or_get_thread(&h.pool, &h.alice, &h.alice, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SelfConversation));
    }
}

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Duration;

use super::presence::EventSender;
use super::{ClientEvent, ServerEvent};
use crate::AppState;
use crate::auth::{self, AuthenticatedUser};
use crate::db;
use crate::dispatch::{self, SendMessageInput};
use crate::types::{ConnectionId, ThreadId, UserId};

/// ハンドシェイク（authenticateフレーム）の受信期限。
/// 期限内に認証できない接続はPresenceに登録される前に切断される。
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// 1本のWebSocket接続のライフサイクル。
/// 認証 → Presence登録 → コマンドループ → 切断時のクリーンアップ。
pub async fn run(state: AppState, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let user = match handshake(&state, &mut ws_rx).await {
        Ok(user) => user,
        Err(message) => {
            tracing::debug!("realtime handshake rejected: {message}");
            send_event(&mut ws_tx, &ServerEvent::Error { message }).await;
            let _ = ws_tx.close().await;
            return;
        }
    };

    let user_id = user.user_id;
    let conn_id = ConnectionId::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    let went_online = state.presence.register(&user_id, &conn_id, tx.clone()).await;
    tracing::debug!(user = %user_id, conn = %conn_id, "realtime connection established");
    if went_online {
        if let Err(e) = db::users::set_online(&state.pool, &user_id).await {
            tracing::warn!(user = %user_id, error = %e, "failed to persist online state");
        }
        state
            .presence
            .broadcast(&ServerEvent::PresenceChanged {
                user_id: user_id.clone(),
                online: true,
                last_seen: None,
            })
            .await;
    }

    // 送信側: 自分宛キューのイベントをソケットへ流す
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // 受信側: コマンドループ
    while let Some(frame) = ws_rx.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => handle_event(&state, &user_id, &conn_id, &tx, event).await,
            Err(e) => {
                let _ = tx.send(ServerEvent::Error {
                    message: format!("malformed event: {e}"),
                });
            }
        }
    }

    // 切断時のクリーンアップは必ず行う
    writer.abort();
    if let Some((user_id, went_offline)) = state.presence.unregister(&conn_id).await
        && went_offline
    {
        let now = chrono::Utc::now();
        if let Err(e) = db::users::set_offline(&state.pool, &user_id, now).await {
            tracing::warn!(user = %user_id, error = %e, "failed to persist offline state");
        }
        state
            .presence
            .broadcast(&ServerEvent::PresenceChanged {
                user_id,
                online: false,
                last_seen: Some(now.to_rfc3339()),
            })
            .await;
    }
}

/// 最初のフレームを期限付きで待ち、`authenticate` として検証する。
/// 他のイベントが先に来た場合は認証エラーとして扱う。
async fn handshake(
    state: &AppState,
    ws_rx: &mut SplitStream<WebSocket>,
) -> Result<AuthenticatedUser, String> {
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Close(_)) | Err(_) => return None,
                // ping/pong等のプロトコルフレームは認証フレームに数えない
                Ok(_) => continue,
            }
        }
        None
    })
    .await;

    let text = match first {
        Ok(Some(text)) => text,
        Ok(None) => return Err("connection closed before authentication".into()),
        Err(_) => return Err("authentication timed out".into()),
    };

    match serde_json::from_str::<ClientEvent>(&text) {
        Ok(ClientEvent::Authenticate { token }) => {
            auth::authenticate(&state.pool, &state.config, &token)
                .await
                .map_err(|e| e.to_string())
        }
        _ => Err("authentication required".into()),
    }
}

async fn handle_event(
    state: &AppState,
    user_id: &UserId,
    conn_id: &ConnectionId,
    tx: &EventSender,
    event: ClientEvent,
) {
    match event {
        ClientEvent::Authenticate { .. } => {
            let _ = tx.send(ServerEvent::Error {
                message: "already authenticated".into(),
            });
        }
        ClientEvent::JoinThread { thread_id } => {
            // 参加者でない場合は黙って無視する（致命的エラーにしない）
            match db::threads::is_participant(&state.pool, &thread_id, user_id).await {
                Ok(true) => state.presence.join_thread(conn_id, &thread_id).await,
                Ok(false) => {
                    tracing::debug!(user = %user_id, thread = %thread_id, "join refused: not a participant");
                }
                Err(e) => {
                    tracing::warn!(thread = %thread_id, error = %e, "join check failed");
                }
            }
        }
        ClientEvent::LeaveThread { thread_id } => {
            state.presence.leave_thread(conn_id, &thread_id).await;
        }
        ClientEvent::Typing { thread_id, typing } => {
            forward_typing(state, user_id, conn_id, &thread_id, typing).await;
        }
        ClientEvent::SendMessage {
            thread_id,
            recipient_id,
            listing_id,
            content,
        } => {
            let input = SendMessageInput {
                thread_id,
                recipient_id,
                listing_id,
                content,
            };
            if let Err(e) =
                dispatch::send_message(&state.pool, &state.presence, &state.config, user_id, input)
                    .await
            {
                let _ = tx.send(ServerEvent::Error {
                    message: e.to_string(),
                });
            }
        }
        ClientEvent::MarkRead { thread_id } => {
            if let Err(e) =
                dispatch::mark_thread_read(&state.pool, &state.presence, &thread_id, user_id).await
            {
                let _ = tx.send(ServerEvent::Error {
                    message: e.to_string(),
                });
            }
        }
    }
}

/// タイピング通知はjoin済み接続にのみ転送される。join時に参加者チェックを
/// 通っているので、ここでDBを引き直す必要はない。
async fn forward_typing(
    state: &AppState,
    user_id: &UserId,
    conn_id: &ConnectionId,
    thread_id: &ThreadId,
    typing: bool,
) {
    state
        .presence
        .send_to_thread(
            conn_id,
            thread_id,
            &ServerEvent::Typing {
                thread_id: thread_id.clone(),
                user_id: user_id.clone(),
                typing,
            },
        )
        .await;
}

async fn send_event(ws_tx: &mut SplitSink<WebSocket, Message>, event: &ServerEvent) {
    if let Ok(text) = serde_json::to_string(event) {
        let _ = ws_tx.send(Message::Text(text.into())).await;
    }
}

pub mod gateway;
pub mod presence;

use serde::{Deserialize, Serialize};

use crate::db::models::{MessageContent, MessageRow, ThreadSummaryRow};
use crate::types::{ListingId, ThreadId, UserId};

/// サーバ→クライアントのイベント。
/// `new_message` / `new_thread` のスレッドサマリは受信者自身の未読数を含む。
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage {
        message: MessageRow,
        thread: ThreadSummaryRow,
    },
    /// 新規作成、またはローカル削除済みスレッドが新着で復活したとき。
    NewThread { thread: ThreadSummaryRow },
    MessagesRead {
        thread_id: ThreadId,
        reader_id: UserId,
    },
    Typing {
        thread_id: ThreadId,
        user_id: UserId,
        typing: bool,
    },
    PresenceChanged {
        user_id: UserId,
        online: bool,
        last_seen: Option<String>,
    },
    Error { message: String },
}

/// クライアント→サーバのコマンド。
/// 接続確立後、最初のフレームは必ず `authenticate` でなければならない。
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Authenticate {
        token: String,
    },
    JoinThread {
        thread_id: ThreadId,
    },
    LeaveThread {
        thread_id: ThreadId,
    },
    /// タイピング通知。保存されず、配信保証もないベストエフォート。
    Typing {
        thread_id: ThreadId,
        typing: bool,
    },
    SendMessage {
        thread_id: Option<ThreadId>,
        recipient_id: Option<UserId>,
        listing_id: Option<ListingId>,
        content: MessageContent,
    },
    MarkRead {
        thread_id: ThreadId,
    },
}

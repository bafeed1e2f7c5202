use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::AppState;
use crate::auth::AuthenticatedUser;
use crate::db;
use crate::db::models::{MessageContent, MessageRow};
use crate::dispatch::{self, SendMessageInput};
use crate::error::AppError;
use crate::types::{ListingId, MessageId, ThreadId, UserId};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/threads/{thread_id}/messages", get(list_messages))
        .route("/messages", post(send_message))
        .route("/messages/{message_id}", delete(delete_message))
        .route("/messages/{message_id}/report", post(report_message))
}

#[derive(Deserialize)]
struct MessagesQuery {
    /// このタイムスタンプより古いメッセージを返す（上スクロールでの遡り読み）。
    before: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    20
}

async fn list_messages(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Query(query): Query<MessagesQuery>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let thread_id = ThreadId(thread_id);
    super::thread::require_participant(&state, &thread_id, &auth.user_id).await?;

    let before = match query.before.as_deref() {
        Some(raw) => Some(
            chrono::DateTime::parse_from_rfc3339(raw)
                .map(|d| d.with_timezone(&chrono::Utc))
                .map_err(|_| AppError::BadRequest("before must be an RFC 3339 timestamp".into()))?,
        ),
        None => None,
    };
    let limit = query.limit.clamp(1, 100);

    let mut rows =
        db::messages::list_for_thread(&state.pool, &thread_id, &auth.user_id, before, limit)
            .await?;
    // 新しい順で取得しているので、表示用に時系列順へ反転する
    rows.reverse();

    let mut messages = Vec::with_capacity(rows.len());
    for row in &rows {
        messages.push(message_json(&state, row).await);
    }

    Ok(Json(serde_json::json!({ "messages": messages })))
}

#[derive(Deserialize)]
struct SendMessageBody {
    thread_id: Option<String>,
    recipient_id: Option<String>,
    listing_id: Option<String>,
    content: MessageContent,
}

async fn send_message(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let input = SendMessageInput {
        thread_id: body.thread_id.map(ThreadId),
        recipient_id: body.recipient_id.map(UserId),
        listing_id: body.listing_id.map(ListingId),
        content: body.content,
    };
    let message =
        dispatch::send_message(&state.pool, &state.presence, &state.config, &auth.user_id, input)
            .await?;
    let message = message_json(&state, &message).await;
    Ok(Json(serde_json::json!({ "message": message })))
}

#[derive(Deserialize)]
struct DeleteQuery {
    /// `me`（既定）は自分の画面からのみ消す。`everyone` は送信者だけが使える。
    #[serde(default = "default_scope")]
    scope: String,
}

fn default_scope() -> String {
    "me".into()
}

async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Query(query): Query<DeleteQuery>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let message_id = MessageId(message_id);
    let message = db::messages::get_message_by_id(&state.pool, &message_id)
        .await?
        .ok_or_else(|| AppError::NotFound("message not found".into()))?;
    let thread_id = ThreadId(message.thread_id.clone());
    super::thread::require_participant(&state, &thread_id, &auth.user_id).await?;

    match query.scope.as_str() {
        "me" => {
            db::messages::hide_for_user(&state.pool, &message_id, &auth.user_id).await?;
        }
        "everyone" => {
            if message.sender_id != auth.user_id.as_str() {
                return Err(AppError::Forbidden(
                    "only the sender can delete for everyone".into(),
                ));
            }
            db::messages::hide_globally(&state.pool, &message_id).await?;
        }
        _ => {
            return Err(AppError::BadRequest("scope must be 'me' or 'everyone'".into()));
        }
    }

    Ok(Json(serde_json::json!({ "deleted": true, "scope": query.scope })))
}

#[derive(Deserialize)]
struct ReportBody {
    reason: Option<String>,
}

async fn report_message(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    auth: AuthenticatedUser,
    Json(body): Json<ReportBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let message_id = MessageId(message_id);
    let message = db::messages::get_message_by_id(&state.pool, &message_id)
        .await?
        .ok_or_else(|| AppError::NotFound("message not found".into()))?;
    let thread_id = ThreadId(message.thread_id.clone());
    super::thread::require_participant(&state, &thread_id, &auth.user_id).await?;

    db::messages::report(&state.pool, &message_id, &auth.user_id, body.reason.as_deref()).await?;
    tracing::info!(message = %message_id, reporter = %auth.user_id, "message reported");

    Ok(Json(serde_json::json!({ "reported": true })))
}

/// 画像キーを署名付きURLに解決してレスポンスへ添える。
/// 解決に失敗してもメッセージ自体は返す（キーはそのまま残る）。
async fn message_json(state: &AppState, row: &MessageRow) -> serde_json::Value {
    let mut value = serde_json::json!(row);
    if let Some(key) = &row.image_key {
        match state.storage.url_for(key).await {
            Ok(url) => value["image_url"] = serde_json::Value::String(url),
            Err(e) => tracing::warn!(key = %key, "failed to resolve image url: {e}"),
        }
    }
    value
}

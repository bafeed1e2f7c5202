use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::AppState;
use crate::auth::AuthenticatedUser;
use crate::db;
use crate::dispatch;
use crate::error::AppError;
use crate::types::{ListingId, ThreadId, UserId};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/threads", get(list_threads).post(create_or_get_thread))
        .route("/threads/unread-count", get(unread_count))
        .route("/threads/{thread_id}", delete(hide_thread))
        .route("/threads/{thread_id}/read", post(mark_read))
        .route("/threads/{thread_id}/archive", post(archive_thread))
        .route("/threads/{thread_id}/unarchive", post(unarchive_thread))
}

#[derive(Deserialize)]
struct CreateThreadBody {
    recipient_id: String,
    listing_id: Option<String>,
}

/// 相手ユーザ（＋任意のリスティング）との会話を取得または開始する。
/// 同じ組み合わせで何度呼んでも同じスレッドが返る。
async fn create_or_get_thread(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
    Json(body): Json<CreateThreadBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let recipient = UserId(body.recipient_id);
    let listing = body.listing_id.map(ListingId);

    let thread =
        dispatch::create_or_get_thread(&state.pool, &auth.user_id, &recipient, listing.as_ref())
            .await?;

    Ok(Json(serde_json::json!({ "thread": thread })))
}

async fn list_threads(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let threads = db::threads::list_for_user(&state.pool, &auth.user_id).await?;
    Ok(Json(serde_json::json!({ "threads": threads })))
}

async fn unread_count(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let unread = db::threads::unread_total(&state.pool, &auth.user_id).await?;
    Ok(Json(serde_json::json!({ "unread": unread })))
}

async fn mark_read(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let thread_id = ThreadId(thread_id);
    dispatch::mark_thread_read(&state.pool, &state.presence, &thread_id, &auth.user_id).await?;
    Ok(Json(serde_json::json!({ "read": true })))
}

/// 自分の一覧からだけ会話を消す（ソフト削除）。
/// 相手には残り、新着があれば自分の一覧にも復活する。
async fn hide_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let thread_id = ThreadId(thread_id);
    require_participant(&state, &thread_id, &auth.user_id).await?;
    db::threads::hide_locally(&state.pool, &thread_id, &auth.user_id).await?;
    Ok(Json(serde_json::json!({ "hidden": true })))
}

async fn archive_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let thread_id = ThreadId(thread_id);
    require_participant(&state, &thread_id, &auth.user_id).await?;
    db::threads::set_archived(&state.pool, &thread_id, &auth.user_id, true).await?;
    Ok(Json(serde_json::json!({ "archived": true })))
}

async fn unarchive_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let thread_id = ThreadId(thread_id);
    require_participant(&state, &thread_id, &auth.user_id).await?;
    db::threads::set_archived(&state.pool, &thread_id, &auth.user_id, false).await?;
    Ok(Json(serde_json::json!({ "archived": false })))
}

pub(super) async fn require_participant(
    state: &AppState,
    thread_id: &ThreadId,
    user_id: &UserId,
) -> Result<(), AppError> {
    db::threads::get(&state.pool, thread_id)
        .await?
        .ok_or_else(|| AppError::NotFound("thread not found".into()))?;
    if !db::threads::is_participant(&state.pool, thread_id, user_id).await? {
        return Err(AppError::Forbidden("not a participant of this thread".into()));
    }
    Ok(())
}

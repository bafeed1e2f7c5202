use axum::extract::{Path, State};
use axum::routing::{get, put};
use axum::{Json, Router};

use crate::AppState;
use crate::auth::AuthenticatedUser;
use crate::db;
use crate::error::AppError;
use crate::types::UserId;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/users/{user_id}", get(get_user))
        .route("/users/{user_id}/block", put(block_user).delete(unblock_user))
}

/// 会話リスト・プロフィール表示用の公開情報（表示名とプレゼンス）。
async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    _auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let user_id = UserId(user_id);
    let user = db::users::get_user(&state.pool, &user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("user not found".into()))?;

    let mut value = serde_json::json!(&user);
    if let Some(key) = &user.avatar_key {
        match state.storage.url_for(key).await {
            Ok(url) => value["avatar_url"] = serde_json::Value::String(url),
            Err(e) => tracing::warn!(key = %key, "failed to resolve avatar url: {e}"),
        }
    }

    Ok(Json(serde_json::json!({ "user": value })))
}

async fn block_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let target = UserId(user_id);
    if target == auth.user_id {
        return Err(AppError::BadRequest("cannot block yourself".into()));
    }
    db::users::get_user(&state.pool, &target)
        .await?
        .ok_or_else(|| AppError::NotFound("user not found".into()))?;

    db::blocks::block(&state.pool, &auth.user_id, &target).await?;
    Ok(Json(serde_json::json!({ "blocked": true })))
}

async fn unblock_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let target = UserId(user_id);
    db::blocks::unblock(&state.pool, &auth.user_id, &target).await?;
    Ok(Json(serde_json::json!({ "blocked": false })))
}

use super::models::UserRow;
use super::{Db, bind_time, sql};
use crate::types::UserId;

#[tracing::instrument(skip(pool), err)]
pub async fn get_user(pool: &Db, id: &UserId) -> Result<Option<UserRow>, sqlx::Error> {
    let q = sql("SELECT * FROM users WHERE id = ?");
    sqlx::query_as::<_, UserRow>(&q)
        .bind(id.as_str())
        .fetch_optional(pool)
        .await
}

/// 認証サービス側で作成されたユーザをこちらのミラーに反映する。
#[tracing::instrument(skip(pool), err)]
pub async fn upsert_user(pool: &Db, id: &UserId, display_name: &str) -> Result<(), sqlx::Error> {
    let now = bind_time(chrono::Utc::now());
    let q = sql(
        "INSERT INTO users (id, display_name, created_at, updated_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT (id) DO UPDATE SET
             display_name = excluded.display_name,
             updated_at = excluded.updated_at",
    );
    sqlx::query(&q)
        .bind(id.as_str())
        .bind(display_name)
        .bind(&now)
        .bind(&now)
        .execute(pool)
        .await?;
    Ok(())
}

#[tracing::instrument(skip(pool), err)]
pub async fn set_online(pool: &Db, id: &UserId) -> Result<bool, sqlx::Error> {
    let q = sql("UPDATE users SET is_online = TRUE WHERE id = ?");
    let result = sqlx::query(&q).bind(id.as_str()).execute(pool).await?;
    Ok(result.rows_affected() > 0)
}

/// 最終接続の切断時刻を last_seen として記録する。
#[tracing::instrument(skip(pool), err)]
pub async fn set_offline(
    pool: &Db,
    id: &UserId,
    last_seen: chrono::DateTime<chrono::Utc>,
) -> Result<bool, sqlx::Error> {
    let q = sql("UPDATE users SET is_online = FALSE, last_seen = ? WHERE id = ?");
    let result = sqlx::query(&q)
        .bind(bind_time(last_seen))
        .bind(id.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

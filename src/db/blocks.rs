use super::{Db, bind_time, sql};
use crate::types::UserId;

#[tracing::instrument(skip(pool), err)]
pub async fn block(pool: &Db, user_id: &UserId, blocked: &UserId) -> Result<bool, sqlx::Error> {
    let q = sql(
        "INSERT INTO blocks (user_id, blocked_user_id, created_at) VALUES (?, ?, ?)
         ON CONFLICT (user_id, blocked_user_id) DO NOTHING",
    );
    let result = sqlx::query(&q)
        .bind(user_id.as_str())
        .bind(blocked.as_str())
        .bind(bind_time(chrono::Utc::now()))
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[tracing::instrument(skip(pool), err)]
pub async fn unblock(pool: &Db, user_id: &UserId, blocked: &UserId) -> Result<bool, sqlx::Error> {
    let q = sql("DELETE FROM blocks WHERE user_id = ? AND blocked_user_id = ?");
    let result = sqlx::query(&q)
        .bind(user_id.as_str())
        .bind(blocked.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// どちらか一方向でもブロック関係があれば true。
/// スレッド作成と送信の前に必ず確認される。
#[tracing::instrument(skip(pool), err)]
pub async fn is_blocked_either(pool: &Db, a: &UserId, b: &UserId) -> Result<bool, sqlx::Error> {
    let q = sql(
        "SELECT 1 FROM blocks
         WHERE (user_id = ? AND blocked_user_id = ?)
            OR (user_id = ? AND blocked_user_id = ?)",
    );
    let row: Option<(i32,)> = sqlx::query_as(&q)
        .bind(a.as_str())
        .bind(b.as_str())
        .bind(b.as_str())
        .bind(a.as_str())
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;

    #[tokio::test]
    async fn block_is_idempotent_and_directional() {
        let pool = testing::pool().await;
        let alice = testing::seed_user(&pool, "alice", "Alice").await;
        let bob = testing::seed_user(&pool, "bob", "Bob").await;

        assert!(!is_blocked_either(&pool, &alice, &bob).await.unwrap());

        assert!(block(&pool, &alice, &bob).await.unwrap());
        // 二重ブロックは no-op
        assert!(!block(&pool, &alice, &bob).await.unwrap());

        // どちらの向きで聞いても検出される
        assert!(is_blocked_either(&pool, &alice, &bob).await.unwrap());
        assert!(is_blocked_either(&pool, &bob, &alice).await.unwrap());

        assert!(unblock(&pool, &alice, &bob).await.unwrap());
        assert!(!is_blocked_either(&pool, &alice, &bob).await.unwrap());
    }
}

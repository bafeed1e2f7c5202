use super::models::PushSubscriptionRow;
use super::{Db, bind_time, sql};
use crate::types::{SubscriptionId, UserId};

#[tracing::instrument(skip(pool, p256dh, auth), err)]
pub async fn upsert_subscription(
    pool: &Db,
    id: &SubscriptionId,
    user_id: &UserId,
    endpoint: &str,
    p256dh: &str,
    auth: &str,
) -> Result<(), sqlx::Error> {
    // endpoint + user_id が同一なら更新、なければ挿入。
    // 同一ブラウザ（同一endpoint）で複数アカウントが購読できるようにする。
    let q = sql(
        "INSERT INTO push_subscriptions (id, user_id, endpoint, p256dh, auth, created_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(endpoint, user_id) DO UPDATE SET
            p256dh = excluded.p256dh,
            auth = excluded.auth",
    );
    sqlx::query(&q)
        .bind(id.as_str())
        .bind(user_id.as_str())
        .bind(endpoint)
        .bind(p256dh)
        .bind(auth)
        .bind(bind_time(chrono::Utc::now()))
        .execute(pool)
        .await?;
    Ok(())
}

#[tracing::instrument(skip(pool), err)]
pub async fn get_subscriptions_for_user(
    pool: &Db,
    user_id: &UserId,
) -> Result<Vec<PushSubscriptionRow>, sqlx::Error> {
    let q = sql("SELECT * FROM push_subscriptions WHERE user_id = ?");
    sqlx::query_as::<_, PushSubscriptionRow>(&q)
        .bind(user_id.as_str())
        .fetch_all(pool)
        .await
}

#[tracing::instrument(skip(pool), err)]
pub async fn delete_subscription_by_endpoint(pool: &Db, endpoint: &str) -> Result<(), sqlx::Error> {
    let q = sql("DELETE FROM push_subscriptions WHERE endpoint = ?");
    sqlx::query(&q).bind(endpoint).execute(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;

    #[tokio::test]
    async fn upsert_replaces_keys_for_same_endpoint() {
        let pool = testing::pool().await;
        let alice = testing::seed_user(&pool, "alice", "Alice").await;

        let id = SubscriptionId::new_v4();
        upsert_subscription(&pool, &id, &alice, "https://push/ep1", "k1", "a1")
            .await
            .unwrap();
        let id2 = SubscriptionId::new_v4();
        upsert_subscription(&pool, &id2, &alice, "https://push/ep1", "k2", "a2")
            .await
            .unwrap();

        let subs = get_subscriptions_for_user(&pool, &alice).await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].p256dh, "k2");

        delete_subscription_by_endpoint(&pool, "https://push/ep1")
            .await
            .unwrap();
        assert!(get_subscriptions_for_user(&pool, &alice)
            .await
            .unwrap()
            .is_empty());
    }
}

use super::models::{DeliveryStatus, MessageContent, MessageRow};
use super::{Db, bind_time, sql};
use crate::types::{MessageId, ThreadId, UserId};

#[tracing::instrument(skip(pool), err)]
pub async fn get_message_by_id(
    pool: &Db,
    id: &MessageId,
) -> Result<Option<MessageRow>, sqlx::Error> {
    let q = sql("SELECT * FROM messages WHERE id = ?");
    sqlx::query_as::<_, MessageRow>(&q)
        .bind(id.as_str())
        .fetch_optional(pool)
        .await
}

/// 検証済みの本文をログに追記する。本文の形状チェックは呼び出し側
/// （ディスパッチャ）が `MessageContent::validate` で行う。
#[tracing::instrument(skip(pool, content), err)]
pub async fn create_message(
    pool: &Db,
    id: &MessageId,
    thread_id: &ThreadId,
    sender_id: &UserId,
    content: &MessageContent,
    at: chrono::DateTime<chrono::Utc>,
) -> Result<(), sqlx::Error> {
    let metadata = content
        .metadata()
        .map(|m| serde_json::to_string(&m).unwrap_or_default());
    let q = sql(
        "INSERT INTO messages (id, thread_id, sender_id, kind, text, image_key, metadata, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    );
    sqlx::query(&q)
        .bind(id.as_str())
        .bind(thread_id.as_str())
        .bind(sender_id.as_str())
        .bind(content.kind())
        .bind(content.text())
        .bind(content.image_key())
        .bind(metadata)
        .bind(bind_time(at))
        .execute(pool)
        .await?;
    Ok(())
}

/// スレッドのメッセージを新しい順に取得する。
/// 閲覧者が非表示にしたもの・全体削除されたものは除外。
/// `before` は created_at の厳密な `<` 比較（境界行の重複読みを避ける）。
/// 呼び出し側は表示用に時系列順へ反転する。
#[tracing::instrument(skip(pool), err)]
pub async fn list_for_thread(
    pool: &Db,
    thread_id: &ThreadId,
    viewer: &UserId,
    before: Option<chrono::DateTime<chrono::Utc>>,
    limit: i64,
) -> Result<Vec<MessageRow>, sqlx::Error> {
    match before {
        Some(before) => {
            let q = sql(
                "SELECT m.* FROM messages m
                 WHERE m.thread_id = ?
                   AND m.deleted_globally = FALSE
                   AND NOT EXISTS (
                       SELECT 1 FROM message_hidden h
                       WHERE h.message_id = m.id AND h.user_id = ?)
                   AND m.created_at < ?
                 ORDER BY m.created_at DESC
                 LIMIT ?",
            );
            sqlx::query_as::<_, MessageRow>(&q)
                .bind(thread_id.as_str())
                .bind(viewer.as_str())
                .bind(bind_time(before))
                .bind(limit)
                .fetch_all(pool)
                .await
        }
        None => {
            let q = sql(
                "SELECT m.* FROM messages m
                 WHERE m.thread_id = ?
                   AND m.deleted_globally = FALSE
                   AND NOT EXISTS (
                       SELECT 1 FROM message_hidden h
                       WHERE h.message_id = m.id AND h.user_id = ?)
                 ORDER BY m.created_at DESC
                 LIMIT ?",
            );
            sqlx::query_as::<_, MessageRow>(&q)
                .bind(thread_id.as_str())
                .bind(viewer.as_str())
                .bind(limit)
                .fetch_all(pool)
                .await
        }
    }
}

/// スレッド内で reader 宛のメッセージを既読へ遷移させる。
/// ステータスは前進のみ。既に read のものは触らない（冪等）。
#[tracing::instrument(skip(pool), err)]
pub async fn mark_read(
    pool: &Db,
    thread_id: &ThreadId,
    reader: &UserId,
) -> Result<u64, sqlx::Error> {
    let q = sql(
        "UPDATE messages SET status = 'read'
         WHERE thread_id = ? AND sender_id <> ? AND status <> 'read'",
    );
    let result = sqlx::query(&q)
        .bind(thread_id.as_str())
        .bind(reader.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// sent -> delivered の前進遷移。read まで進んだものは戻さない。
#[tracing::instrument(skip(pool), err)]
pub async fn mark_delivered(pool: &Db, id: &MessageId) -> Result<bool, sqlx::Error> {
    let q = sql("UPDATE messages SET status = ? WHERE id = ? AND status = 'sent'");
    let result = sqlx::query(&q)
        .bind(DeliveryStatus::Delivered.as_str())
        .bind(id.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// 「自分にとって削除」。ログには残り、他の参加者には見え続ける。
#[tracing::instrument(skip(pool), err)]
pub async fn hide_for_user(
    pool: &Db,
    id: &MessageId,
    user_id: &UserId,
) -> Result<(), sqlx::Error> {
    let q = sql(
        "INSERT INTO message_hidden (message_id, user_id, created_at) VALUES (?, ?, ?)
         ON CONFLICT (message_id, user_id) DO NOTHING",
    );
    sqlx::query(&q)
        .bind(id.as_str())
        .bind(user_id.as_str())
        .bind(bind_time(chrono::Utc::now()))
        .execute(pool)
        .await?;
    Ok(())
}

/// 「全員にとって削除」。物理削除はしない。
#[tracing::instrument(skip(pool), err)]
pub async fn hide_globally(pool: &Db, id: &MessageId) -> Result<bool, sqlx::Error> {
    let q = sql("UPDATE messages SET deleted_globally = TRUE WHERE id = ?");
    let result = sqlx::query(&q).bind(id.as_str()).execute(pool).await?;
    Ok(result.rows_affected() > 0)
}

/// 通報フラグを立て、通報レコードを1件残す。二重通報は no-op。
#[tracing::instrument(skip(pool, reason), err)]
pub async fn report(
    pool: &Db,
    id: &MessageId,
    reporter: &UserId,
    reason: Option<&str>,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    let q = sql("UPDATE messages SET reported = TRUE WHERE id = ?");
    sqlx::query(&q).bind(id.as_str()).execute(&mut *tx).await?;

    let q = sql(
        "INSERT INTO reports (message_id, reporter_id, reason, created_at) VALUES (?, ?, ?, ?)
         ON CONFLICT (message_id, reporter_id) DO NOTHING",
    );
    sqlx::query(&q)
        .bind(id.as_str())
        .bind(reporter.as_str())
        .bind(reason)
        .bind(bind_time(chrono::Utc::now()))
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

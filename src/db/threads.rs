use super::models::{ThreadParticipantRow, ThreadRow, ThreadSummaryRow};
use super::{Db, bind_time, sql};
use crate::types::{ListingId, ThreadId, UserId};

/// 閲覧者自身の未読数と相手参加者の表示情報を含む集約SELECT。
/// 2者スレッド前提だが、クエリ自体は「自分以外の参加者」を引くだけで
/// 参加者数を固定していない。
const SUMMARY_SELECT: &str = "SELECT t.id, t.listing_id,
        p.unread_count, p.archived,
        o.user_id AS peer_id,
        u.display_name AS peer_display_name,
        u.is_online AS peer_is_online,
        u.last_seen AS peer_last_seen,
        t.last_message_text, t.last_message_image_key,
        t.last_message_sender_id, t.last_message_at,
        t.created_at, t.updated_at
     FROM threads t
     INNER JOIN thread_participants p ON p.thread_id = t.id AND p.user_id = ?
     INNER JOIN thread_participants o ON o.thread_id = t.id AND o.user_id <> ?
     LEFT JOIN users u ON u.id = o.user_id";

/// 参加者ペア（＋任意のリスティング）のスレッドを取得、なければ作成する。
/// `pair_key` のUNIQUE制約により同時作成は片方だけが勝ち、
/// 負けた側は既存行の取得にフォールバックする。
/// 戻り値の bool は新規作成されたかどうか。
#[tracing::instrument(skip(pool), err)]
pub async fn find_or_create(
    pool: &Db,
    a: &UserId,
    b: &UserId,
    listing: Option<&ListingId>,
) -> Result<(ThreadRow, bool), sqlx::Error> {
    let pair_key = ThreadId::pair_key(a, b, listing);

    if let Some(thread) = get_by_pair_key(pool, &pair_key).await? {
        return Ok((thread, false));
    }

    let id = ThreadId::new_v4();
    let now = bind_time(chrono::Utc::now());

    let mut tx = pool.begin().await?;
    let q = sql(
        "INSERT INTO threads (id, pair_key, listing_id, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT (pair_key) DO NOTHING",
    );
    let result = sqlx::query(&q)
        .bind(id.as_str())
        .bind(&pair_key)
        .bind(listing.map(ListingId::as_str))
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

    if result.rows_affected() == 0 {
        // 同時作成に負けた: 勝った側の行を引き直す
        drop(tx);
        let thread = get_by_pair_key(pool, &pair_key)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        return Ok((thread, false));
    }

    let q = sql("INSERT INTO thread_participants (thread_id, user_id) VALUES (?, ?)");
    for user in [a, b] {
        sqlx::query(&q)
            .bind(id.as_str())
            .bind(user.as_str())
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    let thread = get(pool, &id).await?.ok_or(sqlx::Error::RowNotFound)?;
    Ok((thread, true))
}

#[tracing::instrument(skip(pool), err)]
pub async fn get(pool: &Db, thread_id: &ThreadId) -> Result<Option<ThreadRow>, sqlx::Error> {
    let q = sql("SELECT * FROM threads WHERE id = ?");
    sqlx::query_as::<_, ThreadRow>(&q)
        .bind(thread_id.as_str())
        .fetch_optional(pool)
        .await
}

async fn get_by_pair_key(pool: &Db, pair_key: &str) -> Result<Option<ThreadRow>, sqlx::Error> {
    let q = sql("SELECT * FROM threads WHERE pair_key = ?");
    sqlx::query_as::<_, ThreadRow>(&q)
        .bind(pair_key)
        .fetch_optional(pool)
        .await
}

#[tracing::instrument(skip(pool), err)]
pub async fn participants(
    pool: &Db,
    thread_id: &ThreadId,
) -> Result<Vec<ThreadParticipantRow>, sqlx::Error> {
    let q = sql("SELECT * FROM thread_participants WHERE thread_id = ?");
    sqlx::query_as::<_, ThreadParticipantRow>(&q)
        .bind(thread_id.as_str())
        .fetch_all(pool)
        .await
}

#[tracing::instrument(skip(pool), err)]
pub async fn is_participant(
    pool: &Db,
    thread_id: &ThreadId,
    user_id: &UserId,
) -> Result<bool, sqlx::Error> {
    let q = sql("SELECT 1 FROM thread_participants WHERE thread_id = ? AND user_id = ?");
    let row: Option<(i32,)> = sqlx::query_as(&q)
        .bind(thread_id.as_str())
        .bind(user_id.as_str())
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

/// 指定ユーザ視点のスレッドサマリを1件取得する。
#[tracing::instrument(skip(pool), err)]
pub async fn summary_for(
    pool: &Db,
    thread_id: &ThreadId,
    viewer: &UserId,
) -> Result<Option<ThreadSummaryRow>, sqlx::Error> {
    let query = format!("{SUMMARY_SELECT} WHERE t.id = ?");
    let q = sql(&query);
    sqlx::query_as::<_, ThreadSummaryRow>(&q)
        .bind(viewer.as_str())
        .bind(viewer.as_str())
        .bind(thread_id.as_str())
        .fetch_optional(pool)
        .await
}

/// ユーザのスレッド一覧。ローカル削除済みのスレッドは、削除時刻より
/// 新しいアクティビティがあるもの（= 復活したもの）だけを含める。
#[tracing::instrument(skip(pool), err)]
pub async fn list_for_user(
    pool: &Db,
    user_id: &UserId,
) -> Result<Vec<ThreadSummaryRow>, sqlx::Error> {
    let query = format!(
        "{SUMMARY_SELECT}
         WHERE (p.locally_deleted_at IS NULL OR p.locally_deleted_at < t.updated_at)
         ORDER BY t.updated_at DESC"
    );
    let q = sql(&query);
    sqlx::query_as::<_, ThreadSummaryRow>(&q)
        .bind(user_id.as_str())
        .bind(user_id.as_str())
        .fetch_all(pool)
        .await
}

/// 新着メッセージ反映: 最終メッセージスナップショットと updatedAt を更新し、
/// 送信者以外の未読数をインクリメント、送信者自身はゼロに戻す。
/// 全てSQL側の単一UPDATEで行うため、同一スレッドへの並行追記で
/// カウンタが失われることはない。
#[tracing::instrument(skip(pool, text, image_key), err)]
pub async fn on_message_appended(
    pool: &Db,
    thread_id: &ThreadId,
    sender_id: &UserId,
    text: Option<&str>,
    image_key: Option<&str>,
    at: chrono::DateTime<chrono::Utc>,
) -> Result<(), sqlx::Error> {
    let at = bind_time(at);
    let mut tx = pool.begin().await?;

    let q = sql(
        "UPDATE threads SET
            last_message_text = ?,
            last_message_image_key = ?,
            last_message_sender_id = ?,
            last_message_at = ?,
            updated_at = ?
         WHERE id = ?",
    );
    sqlx::query(&q)
        .bind(text)
        .bind(image_key)
        .bind(sender_id.as_str())
        .bind(&at)
        .bind(&at)
        .bind(thread_id.as_str())
        .execute(&mut *tx)
        .await?;

    let q = sql(
        "UPDATE thread_participants SET unread_count = unread_count + 1
         WHERE thread_id = ? AND user_id <> ?",
    );
    sqlx::query(&q)
        .bind(thread_id.as_str())
        .bind(sender_id.as_str())
        .execute(&mut *tx)
        .await?;

    let q = sql(
        "UPDATE thread_participants SET unread_count = 0
         WHERE thread_id = ? AND user_id = ?",
    );
    sqlx::query(&q)
        .bind(thread_id.as_str())
        .bind(sender_id.as_str())
        .execute(&mut *tx)
        .await?;

    // 新着によってローカル削除は解除される（復活イベントは呼び出し側が
    // 更新前の状態から判定する）
    let q = sql("UPDATE thread_participants SET locally_deleted_at = NULL WHERE thread_id = ?");
    sqlx::query(&q)
        .bind(thread_id.as_str())
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

#[tracing::instrument(skip(pool), err)]
pub async fn mark_read(
    pool: &Db,
    thread_id: &ThreadId,
    user_id: &UserId,
) -> Result<bool, sqlx::Error> {
    let q = sql(
        "UPDATE thread_participants SET unread_count = 0
         WHERE thread_id = ? AND user_id = ?",
    );
    let result = sqlx::query(&q)
        .bind(thread_id.as_str())
        .bind(user_id.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[tracing::instrument(skip(pool), err)]
pub async fn hide_locally(
    pool: &Db,
    thread_id: &ThreadId,
    user_id: &UserId,
) -> Result<bool, sqlx::Error> {
    let q = sql(
        "UPDATE thread_participants SET locally_deleted_at = ?
         WHERE thread_id = ? AND user_id = ?",
    );
    let result = sqlx::query(&q)
        .bind(bind_time(chrono::Utc::now()))
        .bind(thread_id.as_str())
        .bind(user_id.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[tracing::instrument(skip(pool), err)]
pub async fn set_archived(
    pool: &Db,
    thread_id: &ThreadId,
    user_id: &UserId,
    archived: bool,
) -> Result<bool, sqlx::Error> {
    let q = sql(
        "UPDATE thread_participants SET archived = ?
         WHERE thread_id = ? AND user_id = ?",
    );
    let result = sqlx::query(&q)
        .bind(archived)
        .bind(thread_id.as_str())
        .bind(user_id.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// 表示対象スレッドの未読合計（バッジ表示用）。
#[tracing::instrument(skip(pool), err)]
pub async fn unread_total(pool: &Db, user_id: &UserId) -> Result<i64, sqlx::Error> {
    let q = sql(
        "SELECT COALESCE(SUM(p.unread_count), 0)
         FROM thread_participants p
         INNER JOIN threads t ON t.id = p.thread_id
         WHERE p.user_id = ?
           AND (p.locally_deleted_at IS NULL OR p.locally_deleted_at < t.updated_at)",
    );
    let total: (i64,) = sqlx::query_as(&q)
        .bind(user_id.as_str())
        .fetch_one(pool)
        .await?;
    Ok(total.0)
}

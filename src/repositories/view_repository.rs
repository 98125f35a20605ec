use chrono::{DateTime, Utc};
use sqlx::postgres::PgExecutor;
use sqlx::Row;
use uuid::Uuid;

/// True when a view record matches the non-empty visitor id OR the non-empty
/// composite fingerprint. Either signal alone proves prior viewing; this is
/// the anti-gaming policy, not an accident.
pub async fn has_viewed<'e, E: PgExecutor<'e>>(
    executor: E,
    post_id: Uuid,
    visitor_id: &str,
    composite_fingerprint: &str,
) -> Result<bool, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM view_records
            WHERE post_id = $1
            AND (
                ($2 <> '' AND visitor_id = $2)
                OR ($3 <> '' AND composite_fingerprint = $3)
            )
        ) AS seen
        "#,
    )
    .bind(post_id)
    .bind(visitor_id)
    .bind(composite_fingerprint)
    .fetch_one(executor)
    .await?;

    let seen: bool = row.get("seen");
    Ok(seen)
}

/// Appends a view record. The caller has already verified `has_viewed` is
/// false inside the same transaction.
pub async fn record_view<'e, E: PgExecutor<'e>>(
    executor: E,
    post_id: Uuid,
    visitor_id: &str,
    composite_fingerprint: &str,
    viewed_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO view_records (post_id, visitor_id, composite_fingerprint, viewed_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(post_id)
    .bind(visitor_id)
    .bind(composite_fingerprint)
    .bind(viewed_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn count_for_post<'e, E: PgExecutor<'e>>(
    executor: E,
    post_id: Uuid,
) -> Result<i64, sqlx::Error> {
    let row = sqlx::query("SELECT COUNT(*) AS total FROM view_records WHERE post_id = $1")
        .bind(post_id)
        .fetch_one(executor)
        .await?;
    let total: i64 = row.get("total");
    Ok(total)
}

/// Removes every view record for a post; part of the cascade.
pub async fn delete_all_for_post<'e, E: PgExecutor<'e>>(
    executor: E,
    post_id: Uuid,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM view_records WHERE post_id = $1")
        .bind(post_id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

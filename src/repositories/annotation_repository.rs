use sqlx::PgPool;
use sqlx::postgres::PgExecutor;
use uuid::Uuid;

use crate::models::Annotation;

/// Replaces any prior annotation by the same author for the same post, then
/// inserts the new one, in a single transaction. Readers never observe two
/// live annotations from one author.
pub async fn add_or_replace(
    pool: &PgPool,
    post_id: Uuid,
    author_fingerprint: &str,
    text: &str,
    position_x: f64,
    position_y: f64,
) -> Result<Annotation, sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM annotations WHERE post_id = $1 AND author_fingerprint = $2")
        .bind(post_id)
        .bind(author_fingerprint)
        .execute(&mut *tx)
        .await?;

    let annotation = sqlx::query_as::<_, Annotation>(
        r#"
        INSERT INTO annotations (post_id, author_fingerprint, text, position_x, position_y)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, post_id, author_fingerprint, text, position_x, position_y, created_at
        "#,
    )
    .bind(post_id)
    .bind(author_fingerprint)
    .bind(text)
    .bind(position_x)
    .bind(position_y)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(annotation)
}

/// Finite snapshot in insertion order; call again for a fresh one.
pub async fn list_for_post<'e, E: PgExecutor<'e>>(
    executor: E,
    post_id: Uuid,
) -> Result<Vec<Annotation>, sqlx::Error> {
    let annotations = sqlx::query_as::<_, Annotation>(
        r#"
        SELECT id, post_id, author_fingerprint, text, position_x, position_y, created_at
        FROM annotations
        WHERE post_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(post_id)
    .fetch_all(executor)
    .await?;
    Ok(annotations)
}

/// Removes every annotation for a post; part of the cascade.
pub async fn delete_all_for_post<'e, E: PgExecutor<'e>>(
    executor: E,
    post_id: Uuid,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM annotations WHERE post_id = $1")
        .bind(post_id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

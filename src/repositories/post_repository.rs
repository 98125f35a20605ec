use sqlx::postgres::PgExecutor;
use uuid::Uuid;

use crate::models::{AttachedFile, Post};

const POST_COLUMNS: &str = "id, slug, content, view_limit, current_views, \
     file_name, file_url, file_content_type, file_size, created_at";

/// Input data for inserting a new post. Slug generation and validation happen
/// in the lifecycle engine.
#[derive(Debug)]
pub struct NewPost {
    pub slug: String,
    pub content: String,
    pub view_limit: i32,
    pub file: Option<AttachedFile>,
}

/// Inserts a new post. Surfaces the unique-violation on `slug` unchanged so
/// the caller can regenerate and retry.
pub async fn insert_post<'e, E: PgExecutor<'e>>(
    executor: E,
    new_post: &NewPost,
) -> Result<Post, sqlx::Error> {
    let post = sqlx::query_as::<_, Post>(&format!(
        r#"
        INSERT INTO posts (slug, content, view_limit, file_name, file_url, file_content_type, file_size)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING {}
        "#,
        POST_COLUMNS
    ))
    .bind(&new_post.slug)
    .bind(&new_post.content)
    .bind(new_post.view_limit)
    .bind(new_post.file.as_ref().map(|f| f.name.as_str()))
    .bind(new_post.file.as_ref().map(|f| f.url.as_str()))
    .bind(new_post.file.as_ref().and_then(|f| f.content_type.as_deref()))
    .bind(new_post.file.as_ref().map(|f| f.size))
    .fetch_one(executor)
    .await?;
    Ok(post)
}

/// Fetches a post by slug without taking any lock. Used by read paths that
/// never mutate (websocket joins, annotation listing).
pub async fn get_post_by_slug<'e, E: PgExecutor<'e>>(
    executor: E,
    slug: &str,
) -> Result<Option<Post>, sqlx::Error> {
    let post = sqlx::query_as::<_, Post>(&format!(
        "SELECT {} FROM posts WHERE slug = $1",
        POST_COLUMNS
    ))
    .bind(slug)
    .fetch_optional(executor)
    .await?;
    Ok(post)
}

/// Fetches a post by slug and locks the row for the rest of the transaction.
/// The view-recording sequence runs entirely under this lock.
pub async fn get_post_by_slug_for_update<'e, E: PgExecutor<'e>>(
    executor: E,
    slug: &str,
) -> Result<Option<Post>, sqlx::Error> {
    let post = sqlx::query_as::<_, Post>(&format!(
        "SELECT {} FROM posts WHERE slug = $1 FOR UPDATE",
        POST_COLUMNS
    ))
    .bind(slug)
    .fetch_optional(executor)
    .await?;
    Ok(post)
}

/// Increments the view counter by exactly one and returns the new value.
pub async fn increment_views<'e, E: PgExecutor<'e>>(
    executor: E,
    post_id: Uuid,
) -> Result<i32, sqlx::Error> {
    let row: (i32,) = sqlx::query_as(
        r#"
        UPDATE posts
        SET current_views = current_views + 1
        WHERE id = $1
        RETURNING current_views
        "#,
    )
    .bind(post_id)
    .fetch_one(executor)
    .await?;
    Ok(row.0)
}

/// Deletes the post row itself. Dependent rows must already be gone; callers
/// run this last inside the cascade transaction.
pub async fn delete_post<'e, E: PgExecutor<'e>>(
    executor: E,
    post_id: Uuid,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM posts WHERE id = $1")
        .bind(post_id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

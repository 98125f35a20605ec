use axum::body::Bytes;
use chrono::Utc;
use rand::Rng;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::LifecycleError;
use crate::identity::VisitorIdentity;
use crate::models::{Post, ServerEvent, ViewOutcome};
use crate::presence::PresenceTracker;
use crate::repositories::{annotation_repository, post_repository, view_repository};
use crate::storage::LocalFileStorage;
use crate::websocket::FanoutHub;

const SLUG_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SLUG_MAX_ATTEMPTS: u32 = 64;
const VIEW_RETRY_ATTEMPTS: u32 = 3;

/// A file received with a create request, not yet stored.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub bytes: Bytes,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

/// Owns the per-post state machine: Active until the view budget is consumed,
/// then gone, with every dependent row deleted in the same transaction. All
/// counter mutations go through `process_view`; there is no decrement path.
pub struct PostLifecycle {
    pool: PgPool,
    storage: LocalFileStorage,
    hub: FanoutHub,
    presence: PresenceTracker,
    /// One mutex per live slug. Serializes the check-increment-maybe-delete
    /// sequence per post; different posts never contend.
    locks: Arc<RwLock<HashMap<String, Arc<Mutex<()>>>>>,
    max_view_limit: i32,
    max_content_length: usize,
    max_file_size: u64,
    slug_length: usize,
}

impl PostLifecycle {
    pub fn new(
        pool: PgPool,
        storage: LocalFileStorage,
        hub: FanoutHub,
        presence: PresenceTracker,
        max_view_limit: i32,
        max_content_length: usize,
        max_file_size: u64,
        slug_length: usize,
    ) -> Self {
        Self {
            pool,
            storage,
            hub,
            presence,
            locks: Arc::new(RwLock::new(HashMap::new())),
            max_view_limit,
            max_content_length,
            max_file_size,
            slug_length,
        }
    }

    /// Validates input, stores the attachment, and inserts the post under a
    /// freshly sampled slug. A storage insert failure after the file was
    /// written deletes the orphaned file before the error surfaces.
    pub async fn create_post(
        &self,
        content: String,
        view_limit: i32,
        file: Option<UploadedFile>,
    ) -> Result<Post, LifecycleError> {
        let content = content.trim().to_string();
        if content.is_empty() {
            return Err(LifecycleError::Validation("content must not be empty".into()));
        }
        if content.chars().count() > self.max_content_length {
            return Err(LifecycleError::Validation(format!(
                "content exceeds maximum length of {} characters",
                self.max_content_length
            )));
        }
        if view_limit < 1 || view_limit > self.max_view_limit {
            return Err(LifecycleError::Validation(format!(
                "view limit must be between 1 and {}",
                self.max_view_limit
            )));
        }
        if let Some(f) = &file {
            if f.bytes.len() as u64 > self.max_file_size {
                return Err(LifecycleError::Validation(format!(
                    "file exceeds maximum size of {} bytes",
                    self.max_file_size
                )));
            }
        }

        let stored = match file {
            Some(f) => Some(
                self.storage
                    .save_file(f.bytes, f.filename, f.content_type)
                    .await
                    .map_err(|e| LifecycleError::Dependency(e.into()))?,
            ),
            None => None,
        };

        for attempt in 1..=SLUG_MAX_ATTEMPTS {
            let new_post = post_repository::NewPost {
                slug: self.generate_slug(),
                content: content.clone(),
                view_limit,
                file: stored.clone(),
            };
            match post_repository::insert_post(&self.pool, &new_post).await {
                Ok(post) => {
                    info!(slug = %post.slug, view_limit, attempt, "created post");
                    return Ok(post);
                }
                Err(e) if is_unique_violation(&e) => continue,
                Err(e) => {
                    if let Some(f) = &stored {
                        if let Err(de) = self.storage.delete_file(&f.name).await {
                            warn!(file = %f.name, "failed to delete orphaned file: {}", de);
                        }
                    }
                    return Err(e.into());
                }
            }
        }

        // With a 36-char alphabet this many collisions means the slug space
        // or the RNG is broken, not bad luck.
        unreachable!("no free slug after {} attempts", SLUG_MAX_ATTEMPTS);
    }

    /// The atomic view-recording sequence. Repeat views from a known identity
    /// return the current counts unchanged; a new identity increments by
    /// exactly one; the view that reaches the limit tears the post down.
    pub async fn process_view(
        &self,
        slug: &str,
        identity: &VisitorIdentity,
    ) -> Result<ViewOutcome, LifecycleError> {
        let lock = self.slug_lock(slug).await;
        let _guard = lock.lock().await;

        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match self.run_view_transaction(slug, identity).await {
                Ok(outcome) => break outcome,
                Err(e) if is_serialization_conflict(&e) => {
                    if attempt >= VIEW_RETRY_ATTEMPTS {
                        warn!(slug, attempt, "view transaction conflict, retries exhausted");
                        return Err(LifecycleError::Conflict);
                    }
                    warn!(slug, attempt, "view transaction conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        };

        match &outcome {
            ViewOutcome::NotFound => {
                self.drop_slug_lock(slug).await;
            }
            ViewOutcome::Counted { post, counted: true } => {
                self.hub
                    .broadcast(
                        slug,
                        ServerEvent::ViewCountChanged {
                            current_views: post.current_views,
                            view_limit: post.view_limit,
                        },
                    )
                    .await;
            }
            ViewOutcome::Counted { counted: false, .. } => {}
            ViewOutcome::Exhausted { post } => {
                info!(slug, views = post.current_views, "post exhausted, deleted");
                if let Some(name) = &post.file_name {
                    if let Err(e) = self.storage.delete_file(name).await {
                        warn!(slug, file = %name, "failed to delete attached file: {}", e);
                    }
                }
                self.hub.close_group(slug).await;
                self.presence.clear_slug(slug).await;
                self.drop_slug_lock(slug).await;
            }
        }

        Ok(outcome)
    }

    async fn run_view_transaction(
        &self,
        slug: &str,
        identity: &VisitorIdentity,
    ) -> Result<ViewOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let Some(mut post) = post_repository::get_post_by_slug_for_update(&mut *tx, slug).await?
        else {
            tx.rollback().await?;
            return Ok(ViewOutcome::NotFound);
        };

        if view_repository::has_viewed(
            &mut *tx,
            post.id,
            &identity.visitor_id,
            &identity.composite_fingerprint,
        )
        .await?
        {
            tx.commit().await?;
            return Ok(ViewOutcome::Counted {
                post,
                counted: false,
            });
        }

        view_repository::record_view(
            &mut *tx,
            post.id,
            &identity.visitor_id,
            &identity.composite_fingerprint,
            Utc::now(),
        )
        .await?;
        let new_views = post_repository::increment_views(&mut *tx, post.id).await?;
        post.current_views = new_views;

        if new_views < post.view_limit {
            tx.commit().await?;
            return Ok(ViewOutcome::Counted { post, counted: true });
        }

        // Budget consumed: cascade in dependency order, one transaction.
        annotation_repository::delete_all_for_post(&mut *tx, post.id).await?;
        view_repository::delete_all_for_post(&mut *tx, post.id).await?;
        post_repository::delete_post(&mut *tx, post.id).await?;
        tx.commit().await?;

        Ok(ViewOutcome::Exhausted { post })
    }

    fn generate_slug(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.slug_length)
            .map(|_| SLUG_ALPHABET[rng.gen_range(0..SLUG_ALPHABET.len())] as char)
            .collect()
    }

    async fn slug_lock(&self, slug: &str) -> Arc<Mutex<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(slug) {
                return lock.clone();
            }
        }
        self.locks
            .write()
            .await
            .entry(slug.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn drop_slug_lock(&self, slug: &str) {
        self.locks.write().await.remove(slug);
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn is_serialization_conflict(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Database(db)
            if matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
    )
}

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;

pub mod config;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod lifecycle;
pub mod models;
pub mod presence;
pub mod repositories;
pub mod storage;
pub mod websocket;

use config::Config;
use handlers::post_handlers::{
    create_post_handler, health_handler, list_annotations_handler, view_post_handler,
};
use lifecycle::PostLifecycle;
use presence::PresenceTracker;
use storage::LocalFileStorage;
use websocket::connection::websocket_handler;
use websocket::FanoutHub;

/// Shared application state. The hub and presence tracker are explicitly
/// owned service instances constructed once here, never ambient globals.
#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub config: Arc<Config>,
    pub storage: LocalFileStorage,
    pub hub: FanoutHub,
    pub presence: PresenceTracker,
    pub lifecycle: Arc<PostLifecycle>,
}

impl AppState {
    pub fn new(db_pool: PgPool, config: Arc<Config>) -> Self {
        let storage = LocalFileStorage::new(
            config.upload_dir.clone(),
            config.upload_base_url.clone(),
        );
        let hub = FanoutHub::new();
        let presence = PresenceTracker::new();
        let lifecycle = Arc::new(PostLifecycle::new(
            db_pool.clone(),
            storage.clone(),
            hub.clone(),
            presence.clone(),
            config.max_view_limit,
            config.max_content_length,
            config.max_file_size,
            config.slug_length,
        ));

        Self {
            db_pool,
            config,
            storage,
            hub,
            presence,
            lifecycle,
        }
    }
}

/// Builds the application router over an already-constructed state, so tests
/// can hold onto the same hub/presence instances the routes use.
pub fn create_router(state: AppState) -> Router {
    let static_dir = PathBuf::from(&state.config.upload_dir);
    let static_service = ServeDir::new(static_dir);
    let upload_base_url = state.config.upload_base_url.clone();

    let max_body_size =
        state.config.max_file_size as usize + state.config.max_content_length + 16 * 1024;

    Router::new()
        .route("/health", get(health_handler))
        .route("/posts", post(create_post_handler))
        .route("/posts/:slug", get(view_post_handler))
        .route("/posts/:slug/annotations", get(list_annotations_handler))
        .route("/ws", get(websocket_handler))
        .nest_service(&upload_base_url, static_service)
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(max_body_size))
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A view-limited post. Deleted, along with every dependent row, the instant
/// `current_views` reaches `view_limit`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Post {
    pub id: Uuid,
    pub slug: String,
    pub content: String,
    pub view_limit: i32,
    pub current_views: i32,
    pub file_name: Option<String>,
    pub file_url: Option<String>,
    pub file_content_type: Option<String>,
    pub file_size: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// One row per unique viewer of a post. Never updated.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ViewRecord {
    pub id: Uuid,
    pub post_id: Uuid,
    pub visitor_id: String,
    pub composite_fingerprint: String,
    pub viewed_at: DateTime<Utc>,
}

/// A free-form annotation placed on a post. At most one live row per
/// (post, author fingerprint).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Annotation {
    pub id: Uuid,
    pub post_id: Uuid,
    pub author_fingerprint: String,
    pub text: String,
    pub position_x: f64,
    pub position_y: f64,
    pub created_at: DateTime<Utc>,
}

/// Result of running a view through the lifecycle engine.
#[derive(Debug, Clone)]
pub enum ViewOutcome {
    /// Slug does not resolve to a live post. Never-existed and
    /// already-deleted are indistinguishable here.
    NotFound,
    /// The view was accepted, or was a repeat from a known identity
    /// (`counted` is false for repeats; counts are unchanged in that case).
    Counted { post: Post, counted: bool },
    /// This view consumed the budget. The post and all dependents are gone;
    /// the returned snapshot is what the final viewer was served.
    Exhausted { post: Post },
}

/// Attachment metadata as stored by the blob layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedFile {
    pub name: String,
    pub url: String,
    pub content_type: Option<String>,
    pub size: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePostResponse {
    pub slug: String,
    pub view_limit: i32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewPostResponse {
    pub slug: String,
    pub content: String,
    pub current_views: i32,
    pub view_limit: i32,
    /// True when this view consumed the last of the budget.
    pub exhausted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<AttachedFile>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationResponse {
    pub text: String,
    pub position_x: f64,
    pub position_y: f64,
    pub author_fingerprint: String,
    pub created_at: DateTime<Utc>,
}

impl From<Annotation> for AnnotationResponse {
    fn from(a: Annotation) -> Self {
        Self {
            text: a.text,
            position_x: a.position_x,
            position_y: a.position_y,
            author_fingerprint: a.author_fingerprint,
            created_at: a.created_at,
        }
    }
}

/// Events pushed to realtime subscribers. A closed set so handling stays
/// exhaustive on both ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "connection_ack", rename_all = "camelCase")]
    ConnectionAck { connection_id: String },
    #[serde(rename = "view_count_changed", rename_all = "camelCase")]
    ViewCountChanged { current_views: i32, view_limit: i32 },
    #[serde(rename = "active_viewers_changed", rename_all = "camelCase")]
    ActiveViewersChanged { active_viewers: usize },
    #[serde(rename = "annotation_added", rename_all = "camelCase")]
    AnnotationAdded {
        text: String,
        position_x: f64,
        position_y: f64,
        author_fingerprint: String,
    },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "ping")]
    Ping,
}

/// Messages a realtime client may send over its connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Subscribe to a post's group. A committed viewer counts toward the
    /// active-viewer set; a feed/background join only receives events.
    #[serde(rename = "join", rename_all = "camelCase")]
    Join {
        slug: String,
        #[serde(default)]
        visitor_id: String,
        #[serde(default)]
        fingerprint: String,
        #[serde(default)]
        as_committed_viewer: bool,
    },
    #[serde(rename = "leave")]
    Leave { slug: String },
    #[serde(rename = "annotate", rename_all = "camelCase")]
    Annotate {
        slug: String,
        text: String,
        position_x: f64,
        position_y: f64,
    },
    #[serde(rename = "request_active_count", rename_all = "camelCase")]
    RequestActiveCount { slug: String },
    #[serde(rename = "pong")]
    Pong,
}

use axum::{
    extract::{Multipart, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{ApiError, LifecycleError};
use crate::identity;
use crate::lifecycle::UploadedFile;
use crate::models::{
    AnnotationResponse, AttachedFile, CreatePostResponse, Post, ViewOutcome, ViewPostResponse,
};
use crate::repositories::{annotation_repository, post_repository};
use crate::AppState;

pub const VISITOR_COOKIE: &str = "peek_visitor";
pub const FINGERPRINT_HEADER: &str = "x-device-fingerprint";

/// Handler to create a new post from a multipart form: `content`,
/// `view_limit`, optional `file`.
pub async fn create_post_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Response {
    let mut collected_content: Option<String> = None;
    let mut collected_view_limit: Option<String> = None;
    let mut collected_file: Option<UploadedFile> = None;

    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                let field_name = match field.name() {
                    Some(name) => name.to_string(),
                    None => continue,
                };

                match field_name.as_str() {
                    "content" => match field.text().await {
                        Ok(s) => collected_content = Some(s),
                        Err(e) => {
                            return (
                                StatusCode::BAD_REQUEST,
                                format!("Failed to read content field: {}", e),
                            )
                                .into_response()
                        }
                    },
                    "view_limit" => match field.text().await {
                        Ok(s) => collected_view_limit = Some(s),
                        Err(e) => {
                            return (
                                StatusCode::BAD_REQUEST,
                                format!("Failed to read view_limit field: {}", e),
                            )
                                .into_response()
                        }
                    },
                    "file" => {
                        let filename = field.file_name().map(|s| s.to_string());
                        let content_type = field.content_type().map(|s| s.to_string());
                        match field.bytes().await {
                            Ok(data) => {
                                if data.len() as u64 > state.config.max_file_size {
                                    return ApiError::PayloadTooLarge(format!(
                                        "File exceeds maximum size of {} bytes",
                                        state.config.max_file_size
                                    ))
                                    .into_response();
                                }
                                collected_file = Some(UploadedFile {
                                    bytes: data,
                                    filename,
                                    content_type,
                                });
                            }
                            Err(e) => {
                                return (
                                    StatusCode::BAD_REQUEST,
                                    format!("Failed to read file data: {}", e),
                                )
                                    .into_response()
                            }
                        }
                    }
                    _ => { /* Ignore other fields */ }
                }
            }
            Ok(None) => break,
            Err(e) => {
                if e.to_string().contains("body limit exceeded") {
                    return ApiError::PayloadTooLarge("Total upload size limit exceeded".into())
                        .into_response();
                }
                return (
                    StatusCode::BAD_REQUEST,
                    format!("Multipart processing error: {}", e),
                )
                    .into_response();
            }
        }
    }

    let content = match collected_content {
        Some(c) => c,
        None => {
            return ApiError::Validation("Missing required field: content".into()).into_response()
        }
    };
    let view_limit = match collected_view_limit.as_deref().map(str::parse::<i32>) {
        Some(Ok(limit)) => limit,
        Some(Err(_)) => {
            return ApiError::Validation("view_limit must be an integer".into()).into_response()
        }
        None => {
            return ApiError::Validation("Missing required field: view_limit".into())
                .into_response()
        }
    };

    match state
        .lifecycle
        .create_post(content, view_limit, collected_file)
        .await
    {
        Ok(post) => (
            StatusCode::CREATED,
            Json(CreatePostResponse {
                slug: post.slug,
                view_limit: post.view_limit,
            }),
        )
            .into_response(),
        Err(e) => {
            if matches!(e, LifecycleError::Dependency(_)) {
                error!("failed to create post: {}", e);
            }
            ApiError::from(e).into_response()
        }
    }
}

/// Handler to view a post. Resolves the visitor identity from the request,
/// runs the view through the lifecycle engine, and issues a visitor cookie
/// when the request carried none.
pub async fn view_post_handler(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    headers: HeaderMap,
) -> Response {
    let cookie_id = visitor_cookie(&headers);
    let fingerprint = header_value(&headers, FINGERPRINT_HEADER);
    let source_addr = source_address(&headers);

    // First contact mints a visitor id up front so the recorded view carries
    // it; the cookie goes out with the response below.
    let issued_id = match &cookie_id {
        Some(_) => None,
        None => Some(Uuid::new_v4().simple().to_string()),
    };
    let visitor_id = cookie_id.or_else(|| issued_id.clone());

    let identity = identity::resolve(
        visitor_id.as_deref(),
        fingerprint.as_deref(),
        source_addr.as_deref(),
    );

    let outcome = match state.lifecycle.process_view(&slug, &identity).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(slug, "view failed: {}", e);
            return ApiError::from(e).into_response();
        }
    };

    let mut response = match outcome {
        ViewOutcome::NotFound => return ApiError::NotFound("Post not found").into_response(),
        ViewOutcome::Counted { post, .. } => {
            (StatusCode::OK, Json(view_response(post, false))).into_response()
        }
        ViewOutcome::Exhausted { post } => {
            info!(slug, "served final view");
            (StatusCode::OK, Json(view_response(post, true))).into_response()
        }
    };

    if let Some(fresh_id) = issued_id {
        let cookie = format!(
            "{}={}; Path=/; Max-Age=31536000; SameSite=Lax",
            VISITOR_COOKIE, fresh_id
        );
        if let Ok(value) = header::HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }

    response
}

/// Handler to list a post's annotations: the snapshot a viewer loads first.
pub async fn list_annotations_handler(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Response {
    let post = match post_repository::get_post_by_slug(&state.db_pool, &slug).await {
        Ok(Some(post)) => post,
        Ok(None) => return ApiError::NotFound("Post not found").into_response(),
        Err(e) => {
            error!(slug, "failed to fetch post: {}", e);
            return ApiError::Internal("Storage failure").into_response();
        }
    };

    match annotation_repository::list_for_post(&state.db_pool, post.id).await {
        Ok(annotations) => {
            let body: Vec<AnnotationResponse> =
                annotations.into_iter().map(AnnotationResponse::from).collect();
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            error!(slug, "failed to fetch annotations: {}", e);
            ApiError::Internal("Storage failure").into_response()
        }
    }
}

pub async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

fn view_response(post: Post, exhausted: bool) -> ViewPostResponse {
    let file = match (post.file_name, post.file_url) {
        (Some(name), Some(url)) => Some(AttachedFile {
            name,
            url,
            content_type: post.file_content_type,
            size: post.file_size.unwrap_or(0),
        }),
        _ => None,
    };

    ViewPostResponse {
        slug: post.slug,
        content: post.content,
        current_views: post.current_views,
        view_limit: post.view_limit,
        exhausted,
        file,
    }
}

fn visitor_cookie(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        if name == VISITOR_COOKIE && !value.is_empty() {
            Some(value.to_string())
        } else {
            None
        }
    })
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Source address as reported by the reverse proxy in front of the service.
fn source_address(headers: &HeaderMap) -> Option<String> {
    if let Some(forwarded) = header_value(headers, "x-forwarded-for") {
        return forwarded
            .split(',')
            .next()
            .map(|addr| addr.trim().to_string())
            .filter(|addr| !addr.is_empty());
    }
    header_value(headers, "x-real-ip")
}

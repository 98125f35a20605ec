use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::GroupMembership;
use crate::models::{ClientMessage, ServerEvent};
use crate::repositories::{annotation_repository, post_repository};
use crate::AppState;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One task per realtime connection. All outbound traffic funnels through the
/// connection's channel and this task's sender half, so events reach the
/// socket in the order the hub queued them.
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4();
    info!(%connection_id, "new realtime connection");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    state.hub.register_connection(connection_id, tx).await;
    state
        .hub
        .send_to_connection(
            connection_id,
            ServerEvent::ConnectionAck {
                connection_id: connection_id.to_string(),
            },
        )
        .await;

    // Per-session record of joined slugs and the identity the client joined
    // with, used to attribute annotations.
    let mut joined: HashMap<String, String> = HashMap::new();

    let mut ping_interval = interval(Duration::from_secs(state.config.ping_interval_seconds));

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&state, connection_id, &mut joined, &text).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(%connection_id, "connection closed by client");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(%connection_id, "websocket error: {}", e);
                        break;
                    }
                    None => {
                        debug!(%connection_id, "connection terminated");
                        break;
                    }
                }
            }

            msg = rx.recv() => {
                match msg {
                    Some(msg) => {
                        if let Err(e) = ws_sender.send(msg).await {
                            warn!(%connection_id, "websocket send error: {}", e);
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                state.hub.send_to_connection(connection_id, ServerEvent::Ping).await;
            }
        }
    }

    // Transport-reported disconnect is authoritative: drop group membership
    // first, then presence, broadcasting any counts that changed.
    state.hub.remove_connection(connection_id).await;
    for (slug, count) in state.presence.leave_all(connection_id).await {
        state
            .hub
            .broadcast(
                &slug,
                ServerEvent::ActiveViewersChanged {
                    active_viewers: count,
                },
            )
            .await;
    }

    info!(%connection_id, "realtime connection cleaned up");
}

/// Dispatches one decoded client frame for a registered connection.
pub async fn handle_client_message(
    state: &AppState,
    connection_id: Uuid,
    joined: &mut HashMap<String, String>,
    text: &str,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            debug!(%connection_id, "malformed client message: {}", e);
            send_error(state, connection_id, "Malformed message").await;
            return;
        }
    };

    match message {
        ClientMessage::Join {
            slug,
            visitor_id,
            fingerprint,
            as_committed_viewer,
        } => {
            match post_repository::get_post_by_slug(&state.db_pool, &slug).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    send_error(state, connection_id, "Post not found").await;
                    return;
                }
                Err(e) => {
                    error!(slug, "failed to look up post for join: {}", e);
                    send_error(state, connection_id, "Storage failure").await;
                    return;
                }
            }

            let membership = if as_committed_viewer {
                GroupMembership::CommittedViewer
            } else {
                GroupMembership::Feed
            };
            state.hub.join_group(connection_id, &slug, membership).await;

            // Feed joins are tracked for cleanup only and never affect the
            // active-viewer set.
            let counted_visitor = if as_committed_viewer { visitor_id.as_str() } else { "" };
            let presence_change = state
                .presence
                .join(connection_id, &slug, counted_visitor)
                .await;

            // The post can exhaust between the lookup above and these
            // inserts, and the teardown sweep may have run before they
            // landed. Re-check: a live post here means the sweep is still
            // ahead of us and will cover this membership.
            match post_repository::get_post_by_slug(&state.db_pool, &slug).await {
                Ok(Some(_)) => {}
                other => {
                    state.hub.leave_group(connection_id, &slug).await;
                    state.presence.leave_slug(connection_id, &slug).await;
                    if let Err(e) = other {
                        error!(slug, "failed to look up post for join: {}", e);
                        send_error(state, connection_id, "Storage failure").await;
                    } else {
                        send_error(state, connection_id, "Post not found").await;
                    }
                    return;
                }
            }

            if let Some(count) = presence_change {
                state
                    .hub
                    .broadcast(
                        &slug,
                        ServerEvent::ActiveViewersChanged {
                            active_viewers: count,
                        },
                    )
                    .await;
            }

            let author_fingerprint = if fingerprint.is_empty() {
                visitor_id.clone()
            } else {
                fingerprint.clone()
            };
            joined.insert(slug.clone(), author_fingerprint);

            // Give the joiner a fresh count right away instead of making it
            // wait for the next membership change.
            let count = state.presence.active_count(&slug).await;
            state
                .hub
                .send_to_connection(
                    connection_id,
                    ServerEvent::ActiveViewersChanged {
                        active_viewers: count,
                    },
                )
                .await;
        }

        ClientMessage::Leave { slug } => {
            joined.remove(&slug);
            state.hub.leave_group(connection_id, &slug).await;
            if let Some(count) = state.presence.leave_slug(connection_id, &slug).await {
                state
                    .hub
                    .broadcast(
                        &slug,
                        ServerEvent::ActiveViewersChanged {
                            active_viewers: count,
                        },
                    )
                    .await;
            }
        }

        ClientMessage::Annotate {
            slug,
            text,
            position_x,
            position_y,
        } => {
            let Some(author_fingerprint) = joined.get(&slug).cloned() else {
                send_error(state, connection_id, "Join the post before annotating").await;
                return;
            };
            if author_fingerprint.is_empty() {
                send_error(state, connection_id, "An identity is required to annotate").await;
                return;
            }
            if state.hub.membership(connection_id, &slug).await
                != Some(GroupMembership::CommittedViewer)
            {
                send_error(state, connection_id, "Feed subscribers cannot annotate").await;
                return;
            }

            let text = text.trim().to_string();
            if text.is_empty() {
                send_error(state, connection_id, "Annotation text must not be empty").await;
                return;
            }
            if text.chars().count() > state.config.max_annotation_length {
                send_error(state, connection_id, "Annotation text too long").await;
                return;
            }
            if !(0.0..=100.0).contains(&position_x) || !(0.0..=100.0).contains(&position_y) {
                send_error(state, connection_id, "Annotation position out of range").await;
                return;
            }

            let post = match post_repository::get_post_by_slug(&state.db_pool, &slug).await {
                Ok(Some(post)) => post,
                Ok(None) => {
                    send_error(state, connection_id, "Post not found").await;
                    return;
                }
                Err(e) => {
                    error!(slug, "failed to look up post for annotation: {}", e);
                    send_error(state, connection_id, "Storage failure").await;
                    return;
                }
            };

            // Replace-then-broadcast: the store is consistent before any
            // subscriber hears about the new annotation.
            match annotation_repository::add_or_replace(
                &state.db_pool,
                post.id,
                &author_fingerprint,
                &text,
                position_x,
                position_y,
            )
            .await
            {
                Ok(annotation) => {
                    state
                        .hub
                        .broadcast(
                            &slug,
                            ServerEvent::AnnotationAdded {
                                text: annotation.text,
                                position_x: annotation.position_x,
                                position_y: annotation.position_y,
                                author_fingerprint: annotation.author_fingerprint,
                            },
                        )
                        .await;
                }
                Err(e) if is_foreign_key_violation(&e) => {
                    // The post was exhausted between the lookup and the insert.
                    send_error(state, connection_id, "Post not found").await;
                }
                Err(e) => {
                    error!(slug, "failed to store annotation: {}", e);
                    send_error(state, connection_id, "Storage failure").await;
                }
            }
        }

        ClientMessage::RequestActiveCount { slug } => {
            let count = state.presence.active_count(&slug).await;
            state
                .hub
                .send_to_connection(
                    connection_id,
                    ServerEvent::ActiveViewersChanged {
                        active_viewers: count,
                    },
                )
                .await;
        }

        ClientMessage::Pong => {
            debug!(%connection_id, "pong");
        }
    }
}

async fn send_error(state: &AppState, connection_id: Uuid, message: &str) {
    state
        .hub
        .send_to_connection(
            connection_id,
            ServerEvent::Error {
                message: message.to_string(),
            },
        )
        .await;
}

fn is_foreign_key_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23503"))
}

pub mod connection;

use axum::extract::ws::Message;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::ServerEvent;

pub type ConnectionSender = mpsc::UnboundedSender<Message>;

/// How a connection participates in a post's group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMembership {
    /// Full participant: counted in presence, may place annotations.
    CommittedViewer,
    /// Read-only observer, e.g. a post glanced at in a scrolling feed.
    Feed,
}

/// Group-multiplexed fan-out over all realtime connections. Events for one
/// group reach each member in broadcast order: delivery is a push into the
/// member's own unbounded channel, drained by a single writer task, and the
/// sends happen under one read guard of the group tables. Nothing here blocks
/// on network I/O while a lock is held.
#[derive(Clone)]
pub struct FanoutHub {
    connections: Arc<RwLock<HashMap<Uuid, ConnectionSender>>>,
    groups: Arc<RwLock<HashMap<String, HashMap<Uuid, GroupMembership>>>>,
}

impl FanoutHub {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            groups: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register_connection(&self, connection_id: Uuid, sender: ConnectionSender) {
        self.connections.write().await.insert(connection_id, sender);
        debug!(%connection_id, "registered realtime connection");
    }

    /// Removes a connection and its group memberships. Safe to call more than
    /// once for the same id; duplicate disconnect signals are no-ops.
    pub async fn remove_connection(&self, connection_id: Uuid) {
        self.connections.write().await.remove(&connection_id);

        let mut groups = self.groups.write().await;
        groups.retain(|_slug, members| {
            members.remove(&connection_id);
            !members.is_empty()
        });
        debug!(%connection_id, "removed realtime connection");
    }

    pub async fn join_group(&self, connection_id: Uuid, slug: &str, membership: GroupMembership) {
        self.groups
            .write()
            .await
            .entry(slug.to_string())
            .or_default()
            .insert(connection_id, membership);
    }

    pub async fn leave_group(&self, connection_id: Uuid, slug: &str) {
        let mut groups = self.groups.write().await;
        if let Some(members) = groups.get_mut(slug) {
            members.remove(&connection_id);
            if members.is_empty() {
                groups.remove(slug);
            }
        }
    }

    /// Drops a whole group. Called when a post exhausts its budget; further
    /// joins are refused upstream because the post no longer resolves.
    pub async fn close_group(&self, slug: &str) {
        self.groups.write().await.remove(slug);
    }

    pub async fn membership(&self, connection_id: Uuid, slug: &str) -> Option<GroupMembership> {
        self.groups
            .read()
            .await
            .get(slug)
            .and_then(|members| members.get(&connection_id))
            .copied()
    }

    pub async fn group_size(&self, slug: &str) -> usize {
        self.groups
            .read()
            .await
            .get(slug)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    /// Delivers an event to every connection currently in the slug's group.
    pub async fn broadcast(&self, slug: &str, event: ServerEvent) {
        let message_json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!(slug, "failed to serialize event: {}", e);
                return;
            }
        };

        let groups = self.groups.read().await;
        let Some(members) = groups.get(slug) else {
            return;
        };
        let connections = self.connections.read().await;

        for connection_id in members.keys() {
            if let Some(sender) = connections.get(connection_id) {
                if let Err(e) = sender.send(Message::Text(message_json.clone())) {
                    warn!(%connection_id, slug, "failed to queue event: {}", e);
                }
            }
        }
    }

    /// Unicast reply to a single connection, e.g. a fresh active-count read.
    pub async fn send_to_connection(&self, connection_id: Uuid, event: ServerEvent) {
        let message_json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!(%connection_id, "failed to serialize event: {}", e);
                return;
            }
        };

        let connections = self.connections.read().await;
        if let Some(sender) = connections.get(&connection_id) {
            if let Err(e) = sender.send(Message::Text(message_json)) {
                warn!(%connection_id, "failed to queue event: {}", e);
            }
        }
    }

    /// (total connections, groups with members)
    pub async fn stats(&self) -> (usize, usize) {
        let connections = self.connections.read().await;
        let groups = self.groups.read().await;
        (connections.len(), groups.len())
    }
}

impl Default for FanoutHub {
    fn default() -> Self {
        Self::new()
    }
}

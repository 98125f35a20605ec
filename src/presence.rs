use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// What a realtime connection is looking at. In-memory only; a process
/// restart silently resets presence, which is accepted behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub slug: String,
    /// Empty for feed/background observers, which are tracked for cleanup
    /// but never counted.
    pub visitor_id: String,
}

/// Distinct-visitor accounting for one slug. Each visitor maps to the number
/// of its currently-open connections.
#[derive(Debug, Default)]
struct SlugPresence {
    visitors: HashMap<String, usize>,
}

/// Tracks which visitors are currently looking at which post. Mutations for a
/// slug serialize on that slug's own mutex; the outer map lock is only held
/// shared (or briefly exclusive to add/remove a slug), so different slugs do
/// not contend.
#[derive(Clone)]
pub struct PresenceTracker {
    connections: Arc<RwLock<HashMap<Uuid, Vec<PresenceEntry>>>>,
    slugs: Arc<RwLock<HashMap<String, Arc<Mutex<SlugPresence>>>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            slugs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Records that `connection_id` is now looking at `slug`. Returns the
    /// updated active-viewer count only when a non-empty visitor id became
    /// newly distinct for the slug, so the caller knows a broadcast is due.
    /// Joining the same slug twice on one connection is a no-op.
    pub async fn join(&self, connection_id: Uuid, slug: &str, visitor_id: &str) -> Option<usize> {
        {
            let mut connections = self.connections.write().await;
            let entries = connections.entry(connection_id).or_default();
            if entries.iter().any(|e| e.slug == slug) {
                return None;
            }
            entries.push(PresenceEntry {
                slug: slug.to_string(),
                visitor_id: visitor_id.to_string(),
            });
        }

        if visitor_id.is_empty() {
            return None;
        }

        {
            let slugs = self.slugs.read().await;
            if let Some(state) = slugs.get(slug) {
                let mut state = state.lock().await;
                return Self::add_visitor(&mut state, visitor_id);
            }
        }

        let mut slugs = self.slugs.write().await;
        let state = slugs
            .entry(slug.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SlugPresence::default())))
            .clone();
        let mut state = state.lock().await;
        Self::add_visitor(&mut state, visitor_id)
    }

    fn add_visitor(state: &mut SlugPresence, visitor_id: &str) -> Option<usize> {
        let count = state.visitors.entry(visitor_id.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            Some(state.visitors.len())
        } else {
            None
        }
    }

    /// Explicit leave of a single slug. Returns the updated count only when
    /// the visitor's last connection for that slug went away. Unknown
    /// connection or slug is a no-op, so duplicate leaves are harmless.
    pub async fn leave_slug(&self, connection_id: Uuid, slug: &str) -> Option<usize> {
        let entry = {
            let mut connections = self.connections.write().await;
            let entries = connections.get_mut(&connection_id)?;
            let pos = entries.iter().position(|e| e.slug == slug)?;
            let entry = entries.remove(pos);
            if entries.is_empty() {
                connections.remove(&connection_id);
            }
            entry
        };
        self.release(&entry).await
    }

    /// Disconnect cleanup. Returns every slug whose active count changed,
    /// with the new count, for broadcast. Idempotent under duplicate
    /// disconnect signals.
    pub async fn leave_all(&self, connection_id: Uuid) -> Vec<(String, usize)> {
        let entries = self
            .connections
            .write()
            .await
            .remove(&connection_id)
            .unwrap_or_default();

        let mut changed = Vec::new();
        for entry in &entries {
            if let Some(count) = self.release(entry).await {
                changed.push((entry.slug.clone(), count));
            }
        }
        changed
    }

    async fn release(&self, entry: &PresenceEntry) -> Option<usize> {
        if entry.visitor_id.is_empty() {
            return None;
        }

        let mut now_empty = false;
        let result = {
            let slugs = self.slugs.read().await;
            let state = slugs.get(&entry.slug)?;
            let mut state = state.lock().await;
            match state.visitors.get_mut(&entry.visitor_id) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    None
                }
                Some(_) => {
                    state.visitors.remove(&entry.visitor_id);
                    now_empty = state.visitors.is_empty();
                    Some(state.visitors.len())
                }
                // Already cleaned up, e.g. after an exhaustion clear.
                None => None,
            }
        };

        if now_empty {
            let mut slugs = self.slugs.write().await;
            if let Some(state) = slugs.get(&entry.slug) {
                if state.lock().await.visitors.is_empty() {
                    slugs.remove(&entry.slug);
                }
            }
        }

        result
    }

    pub async fn active_count(&self, slug: &str) -> usize {
        let slugs = self.slugs.read().await;
        match slugs.get(slug) {
            Some(state) => state.lock().await.visitors.len(),
            None => 0,
        }
    }

    /// Drops all presence for a slug. Used when a post exhausts its budget
    /// and the group is gone.
    pub async fn clear_slug(&self, slug: &str) {
        self.slugs.write().await.remove(slug);

        let mut connections = self.connections.write().await;
        connections.retain(|_, entries| {
            entries.retain(|e| e.slug != slug);
            !entries.is_empty()
        });
    }

    /// (total tracked connections, slugs with any presence)
    pub async fn stats(&self) -> (usize, usize) {
        let connections = self.connections.read().await;
        let slugs = self.slugs.read().await;
        (connections.len(), slugs.len())
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

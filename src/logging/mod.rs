//! Durable per-session event logging.
//!
//! The event log is the source of truth for crash recovery: agent lifecycle
//! and messaging events live next to the session record in each agent's
//! directory and are replayed on startup to rebuild the tree and inboxes.

mod event_log;

pub use event_log::{read_log, recover_pending, session_context, EventLog, LogEntry};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

/// Shared handle map from session id to its open [`EventLog`].
///
/// The scheduler owns log lifecycles; the multiplexer and tool handlers reach
/// sibling sessions' logs through the registry (evictions log
/// `suspend.result` to the victim, sends log `message.enqueued` to the
/// recipient).
#[derive(Clone, Default)]
pub struct LogRegistry {
    inner: Arc<Mutex<HashMap<Uuid, Arc<EventLog>>>>,
}

impl LogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session_id: Uuid, log: Arc<EventLog>) {
        self.inner.lock().unwrap().insert(session_id, log);
    }

    pub fn get(&self, session_id: Uuid) -> Option<Arc<EventLog>> {
        self.inner.lock().unwrap().get(&session_id).cloned()
    }

    pub fn remove(&self, session_id: Uuid) -> Option<Arc<EventLog>> {
        self.inner.lock().unwrap().remove(&session_id)
    }

    pub fn contains(&self, session_id: Uuid) -> bool {
        self.inner.lock().unwrap().contains_key(&session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_insert_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let registry = LogRegistry::new();
        let sid = Uuid::new_v4();

        assert!(registry.get(sid).is_none());
        assert!(!registry.contains(sid));

        let log = EventLog::open(dir.path().join("events.jsonl"), session_context(sid))
            .await
            .unwrap();
        registry.insert(sid, Arc::new(log));

        assert!(registry.contains(sid));
        assert!(registry.get(sid).is_some());

        registry.remove(sid);
        assert!(!registry.contains(sid));
    }
}

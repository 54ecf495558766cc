//! Session multiplexer: fixed-slot LRU scheduler for provider sessions.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::json;
use uuid::Uuid;

use crate::error::{SubstratError, SubstratResult};
use crate::logging::LogRegistry;
use crate::provider::{AgentProvider, ProviderSession, SharedProviderSession};
use crate::session::model::{Session, SessionState};
use crate::session::store::SessionStore;

/// Manages a fixed number of concurrent [`ProviderSession`] slots.
///
/// Sessions mid-send are held (non-evictable). Idle sessions sit in an LRU
/// queue and get suspended when slots run out.
pub struct SessionMultiplexer {
    store: SessionStore,
    logs: LogRegistry,
    max_slots: usize,
    slots: HashMap<Uuid, SharedProviderSession>,
    /// Released sessions, front = next victim.
    lru: VecDeque<Uuid>,
    /// Acquired, not evictable.
    held: HashSet<Uuid>,
}

impl SessionMultiplexer {
    pub fn new(store: SessionStore, logs: LogRegistry, max_slots: usize) -> Self {
        Self {
            store,
            logs,
            max_slots,
            slots: HashMap::new(),
            lru: VecDeque::new(),
            held: HashSet::new(),
        }
    }

    /// Slot a freshly-created provider session in the held set. Evicts the
    /// LRU released session if the budget is already spent.
    pub async fn put(
        &mut self,
        session_id: Uuid,
        ps: Box<dyn ProviderSession>,
    ) -> SubstratResult<()> {
        self.ensure_slot().await?;
        self.slots
            .insert(session_id, SharedProviderSession::from(tokio::sync::Mutex::new(ps)));
        self.held.insert(session_id);
        Ok(())
    }

    /// Get a live provider session, restoring from suspension if needed.
    ///
    /// If already slotted: touch LRU, mark held, return. If SUSPENDED: evict
    /// LRU if full, restore via the provider, log `session.restored`,
    /// activate, persist. Anything else is a state fault (use `put` for new
    /// sessions).
    pub async fn acquire(
        &mut self,
        session: &mut Session,
        provider: &dyn AgentProvider,
    ) -> SubstratResult<SharedProviderSession> {
        let session_id = session.id;
        if let Some(ps) = self.slots.get(&session_id) {
            let ps = ps.clone();
            self.touch(session_id);
            self.held.insert(session_id);
            return Ok(ps);
        }
        if session.state != SessionState::Suspended {
            return Err(SubstratError::SessionState {
                from: session.state,
                to: SessionState::Active,
            });
        }
        self.ensure_slot().await?;
        let ps = provider.restore(&session.provider_state).await?;
        if let Some(log) = self.logs.get(session_id) {
            log.log(
                "session.restored",
                json!({"provider": session.provider_name, "model": session.model}),
            )
            .await?;
        }
        let ps = SharedProviderSession::from(tokio::sync::Mutex::new(ps));
        self.slots.insert(session_id, ps.clone());
        self.held.insert(session_id);
        session.activate()?;
        self.store.save(session).await?;
        Ok(ps)
    }

    /// Mark a session as evictable. Appends to the LRU tail.
    pub fn release(&mut self, session_id: Uuid) {
        self.held.remove(&session_id);
        if self.slots.contains_key(&session_id) && !self.lru.contains(&session_id) {
            self.lru.push_back(session_id);
        }
    }

    /// Drop a session from its slot and stop it. State persistence is the
    /// caller's responsibility. No-op if not slotted.
    pub async fn remove(&mut self, session_id: Uuid) -> SubstratResult<()> {
        let Some(ps) = self.slots.remove(&session_id) else {
            return Ok(());
        };
        self.held.remove(&session_id);
        self.lru.retain(|id| *id != session_id);
        let result = ps.lock().await.stop().await;
        result
    }

    /// Suspend a slotted session out of its slot (explicit eviction).
    pub async fn evict(&mut self, session_id: Uuid) -> SubstratResult<()> {
        if !self.slots.contains_key(&session_id) {
            return Err(SubstratError::NotFound(format!(
                "session {} not slotted",
                session_id.simple()
            )));
        }
        if self.held.contains(&session_id) {
            return Err(SubstratError::Other(anyhow::anyhow!(
                "session {} is held, cannot evict",
                session_id.simple()
            )));
        }
        self.evict_inner(session_id).await
    }

    /// Whether a session is currently slotted.
    pub fn contains(&self, session_id: Uuid) -> bool {
        self.slots.contains_key(&session_id)
    }

    /// Number of sessions currently in slots.
    pub fn active_count(&self) -> usize {
        self.slots.len()
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    /// Evict the LRU released session if at capacity. Fault if all are held.
    async fn ensure_slot(&mut self) -> SubstratResult<()> {
        if self.slots.len() < self.max_slots {
            return Ok(());
        }
        let Some(victim) = self.lru.front().copied() else {
            return Err(SubstratError::SlotsExhausted {
                max_slots: self.max_slots,
            });
        };
        self.evict_inner(victim).await
    }

    /// Suspend the victim's provider, persist its state blob, log the
    /// suspension, stop the provider.
    async fn evict_inner(&mut self, session_id: Uuid) -> SubstratResult<()> {
        let ps = self
            .slots
            .remove(&session_id)
            .expect("evict target must be slotted");
        self.lru.retain(|id| *id != session_id);
        self.held.remove(&session_id);

        let mut guard = ps.lock().await;
        let state_blob = guard.suspend().await?;
        let state_size = state_blob.len();

        let mut session = self.store.load(session_id).await?;
        session.suspend(state_blob)?;
        self.store.save(&session).await?;

        if let Some(log) = self.logs.get(session_id) {
            log.log("suspend.result", json!({"state_size": state_size}))
                .await?;
        }
        guard.stop().await
    }

    /// Remove from the LRU queue (session is being held).
    fn touch(&mut self, session_id: Uuid) {
        self.lru.retain(|id| *id != session_id);
    }
}

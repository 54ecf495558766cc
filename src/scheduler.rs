//! Turn scheduler: orchestrates session lifecycle and turn execution.
//!
//! Owns the in-memory session cache and the per-session event logs. The
//! multiplexer handles slot management, the store handles persistence,
//! providers handle the actual conversation. This layer ties them together
//! and is the only component that logs `turn.*` events.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{SubstratError, SubstratResult};
use crate::logging::{session_context, EventLog, LogRegistry};
use crate::provider::{AgentProvider, SharedProviderSession};
use crate::session::{Session, SessionMultiplexer, SessionState, SessionStore};

const EVENTS_FILE: &str = "events.jsonl";

/// Work enqueued during a turn and drained after the turn's slot release.
pub type DeferredWork = Pin<Box<dyn Future<Output = SubstratResult<()>> + Send + 'static>>;

/// Cheap-to-clone handle; all clones share the same state.
#[derive(Clone)]
pub struct TurnScheduler {
    providers: Arc<HashMap<String, Arc<dyn AgentProvider>>>,
    store: SessionStore,
    logs: LogRegistry,
    inner: Arc<Mutex<SchedulerInner>>,
    deferred: Arc<StdMutex<VecDeque<DeferredWork>>>,
}

struct SchedulerInner {
    sessions: HashMap<Uuid, Session>,
    mux: SessionMultiplexer,
}

impl TurnScheduler {
    pub fn new(
        providers: HashMap<String, Arc<dyn AgentProvider>>,
        store: SessionStore,
        max_slots: usize,
    ) -> Self {
        let logs = LogRegistry::new();
        let mux = SessionMultiplexer::new(store.clone(), logs.clone(), max_slots);
        Self {
            providers: Arc::new(providers),
            store,
            logs,
            inner: Arc::new(Mutex::new(SchedulerInner {
                sessions: HashMap::new(),
                mux,
            })),
            deferred: Arc::new(StdMutex::new(VecDeque::new())),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn logs(&self) -> &LogRegistry {
        &self.logs
    }

    /// Create a provider session, slot it, persist, and release.
    pub async fn create_session(
        &self,
        provider_name: &str,
        model: &str,
        system_prompt: &str,
    ) -> SubstratResult<Session> {
        self.create_session_with_id(Uuid::new_v4(), provider_name, model, system_prompt)
            .await
    }

    /// Same, with a caller-allocated session id (deferred spawns hand out
    /// the id before the session exists).
    pub async fn create_session_with_id(
        &self,
        session_id: Uuid,
        provider_name: &str,
        model: &str,
        system_prompt: &str,
    ) -> SubstratResult<Session> {
        let provider = self.provider(provider_name)?;
        let mut session = Session::new(provider_name, model).with_id(session_id);

        // Record exists on disk before the first provider call.
        self.store.save(&session).await?;
        let log = EventLog::open(
            self.store.agent_dir(session.id).join(EVENTS_FILE),
            session_context(session.id),
        )
        .await?;
        self.logs.insert(session.id, Arc::new(log));

        let ps = provider.create(model, system_prompt).await?;

        let mut inner = self.inner.lock().await;
        inner.mux.put(session.id, ps).await?;
        session.activate()?;
        self.store.save(&session).await?;
        inner.mux.release(session.id);
        inner.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    /// Run one turn: acquire slot, send prompt, release, drain deferred
    /// work, return the response.
    pub async fn send_turn(&self, session_id: Uuid, prompt: &str) -> SubstratResult<String> {
        let ps = self.begin_turn(session_id, prompt).await?;

        // The guard covers caller cancellation: the slot is released even if
        // this future is dropped mid-send.
        let mut guard = ReleaseGuard {
            inner: self.inner.clone(),
            session_id,
            armed: true,
        };
        let result = collect_response(ps, prompt).await;
        self.inner.lock().await.mux.release(session_id);
        guard.armed = false;

        // Failed turns surface the error and trigger no side effects.
        let response = result?;

        if let Some(log) = self.logs.get(session_id) {
            log.log("turn.complete", json!({"response": response}))
                .await?;
        }
        self.drain_deferred().await;
        Ok(response)
    }

    /// Steps 1-3 of the turn lifecycle: resolve the session (detecting
    /// background eviction), log `turn.start`, acquire the slot.
    async fn begin_turn(
        &self,
        session_id: Uuid,
        prompt: &str,
    ) -> SubstratResult<SharedProviderSession> {
        let mut inner = self.inner.lock().await;

        let mut session = match inner.sessions.get(&session_id) {
            // A cached ACTIVE copy is stale if the mux evicted the session
            // behind our back; reload so the restore path sees the persisted
            // provider_state.
            Some(s) if inner.mux.contains(session_id) || s.state != SessionState::Active => {
                s.clone()
            }
            _ => {
                let s = self.store.load(session_id).await?;
                inner.sessions.insert(session_id, s.clone());
                s
            }
        };
        let provider = self.provider(&session.provider_name)?;

        if let Some(log) = self.logs.get(session_id) {
            log.log("turn.start", json!({"prompt": prompt})).await?;
        }

        let ps = inner.mux.acquire(&mut session, provider.as_ref()).await?;
        inner.sessions.insert(session_id, session);
        Ok(ps)
    }

    /// Remove from the multiplexer, terminate, persist, close the log.
    pub async fn terminate_session(&self, session_id: Uuid) -> SubstratResult<()> {
        let mut inner = self.inner.lock().await;
        let mut session = match inner.sessions.get(&session_id) {
            Some(s) => s.clone(),
            None => self.store.load(session_id).await?,
        };
        inner.mux.remove(session_id).await?;
        session.terminate()?;
        self.store.save(&session).await?;
        inner.sessions.remove(&session_id);
        drop(inner);

        if let Some(log) = self.logs.remove(session_id) {
            log.close().await;
        }
        Ok(())
    }

    /// Explicitly suspend a session out of its slot. No-op if not slotted.
    pub async fn suspend_session(&self, session_id: Uuid) -> SubstratResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.mux.contains(session_id) {
            return Ok(());
        }
        inner.mux.evict(session_id).await?;
        let session = self.store.load(session_id).await?;
        inner.sessions.insert(session_id, session);
        Ok(())
    }

    /// Warm a suspended session back into a slot without sending a turn.
    pub async fn resume_session(&self, session_id: Uuid) -> SubstratResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.mux.contains(session_id) {
            return Ok(());
        }
        // A cached ACTIVE copy is stale here (not slotted): reload.
        let mut session = match inner.sessions.get(&session_id) {
            Some(s) if s.state != SessionState::Active => s.clone(),
            _ => self.store.load(session_id).await?,
        };
        let provider = self.provider(&session.provider_name)?;
        inner.mux.acquire(&mut session, provider.as_ref()).await?;
        inner.mux.release(session_id);
        inner.sessions.insert(session_id, session);
        Ok(())
    }

    /// Delete a terminated session's state from disk.
    pub async fn delete_session(&self, session_id: Uuid) -> SubstratResult<()> {
        let session = match self.session(session_id).await {
            Some(s) => s,
            None => self.store.load(session_id).await?,
        };
        if session.state != SessionState::Terminated {
            return Err(SubstratError::Other(anyhow::anyhow!(
                "session {} is {}, terminate before delete",
                session_id.simple(),
                session.state
            )));
        }
        if let Some(log) = self.logs.remove(session_id) {
            log.close().await;
        }
        self.inner.lock().await.sessions.remove(&session_id);
        tokio::fs::remove_dir_all(self.store.agent_dir(session_id)).await?;
        Ok(())
    }

    /// Re-adopt a session scanned from disk (recovery). Opens its event log
    /// and installs it in the cache without touching the multiplexer.
    pub async fn restore_session(&self, session: Session) -> SubstratResult<()> {
        if !self.logs.contains(session.id) {
            let log = EventLog::open(
                self.store.agent_dir(session.id).join(EVENTS_FILE),
                session_context(session.id),
            )
            .await?;
            self.logs.insert(session.id, Arc::new(log));
        }
        self.inner.lock().await.sessions.insert(session.id, session);
        Ok(())
    }

    /// Append a lifecycle event to a session's log.
    pub async fn log_event(
        &self,
        session_id: Uuid,
        event: &str,
        data: Value,
    ) -> SubstratResult<()> {
        let log = self.logs.get(session_id).ok_or_else(|| {
            SubstratError::NotFound(format!("event log for session {}", session_id.simple()))
        })?;
        log.log(event, data).await
    }

    /// Enqueue work to run after the current turn releases its slot.
    pub fn defer(&self, work: DeferredWork) {
        self.deferred.lock().unwrap().push_back(work);
    }

    /// A clone of the cached session record, if resident.
    pub async fn session(&self, session_id: Uuid) -> Option<Session> {
        self.inner.lock().await.sessions.get(&session_id).cloned()
    }

    /// Cached session records, newest last.
    pub async fn list_sessions(&self) -> Vec<Session> {
        let inner = self.inner.lock().await;
        let mut sessions: Vec<Session> = inner.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub async fn slotted(&self, session_id: Uuid) -> bool {
        self.inner.lock().await.mux.contains(session_id)
    }

    fn provider(&self, name: &str) -> SubstratResult<Arc<dyn AgentProvider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| SubstratError::NotFound(format!("provider {name}")))
    }

    /// FIFO drain; callbacks may enqueue further work, which runs in the
    /// same drain. A failing callback is reported and skipped so one bad
    /// spawn cannot wedge the queue.
    async fn drain_deferred(&self) {
        loop {
            let work = self.deferred.lock().unwrap().pop_front();
            let Some(work) = work else { break };
            if let Err(err) = work.await {
                tracing::warn!(error = %err, "deferred work failed");
            }
        }
    }
}

async fn collect_response(ps: SharedProviderSession, prompt: &str) -> SubstratResult<String> {
    let mut guard = ps.lock().await;
    let mut rx = guard.send(prompt).await?;
    let mut response = String::new();
    while let Some(chunk) = rx.recv().await {
        response.push_str(&chunk?);
    }
    Ok(response)
}

struct ReleaseGuard {
    inner: Arc<Mutex<SchedulerInner>>,
    session_id: Uuid,
    armed: bool,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let inner = self.inner.clone();
        let session_id = self.session_id;
        tokio::spawn(async move {
            inner.lock().await.mux.release(session_id);
        });
    }
}

//! Orchestrator: composition root bridging the agent and session layers.
//!
//! Owns the agent tree, inbox registry, per-agent tool handlers, and the
//! reply ledger. The turn scheduler owns sessions and the multiplexer. The
//! tree is never written to disk directly; it is derived from per-session
//! `agent.created` / `agent.terminated` events on recovery.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::{json, Value};
use uuid::Uuid;

use crate::agent::tools::PendingReply;
use crate::agent::{
    AgentNode, AgentState, Inbox, InboxRegistry, MessageEnvelope, MessageKind, ReplyLedger,
    SharedTree, SpawnCallback, ToolHandler,
};
use crate::config::SubstratConfig;
use crate::error::{SubstratError, SubstratResult};
use crate::logging::{read_log, recover_pending, LogEntry};
use crate::provider::AgentProvider;
use crate::scheduler::TurnScheduler;
use crate::session::{Session, SessionState, SessionStore};

#[derive(Clone)]
pub struct Orchestrator {
    scheduler: TurnScheduler,
    config: Arc<SubstratConfig>,
    tree: SharedTree,
    inboxes: InboxRegistry,
    handlers: Arc<StdMutex<HashMap<Uuid, Arc<ToolHandler>>>>,
    replies: ReplyLedger,
}

/// One session's recovered identity, parsed from its event log.
struct Recovered {
    agent_id: Uuid,
    name: String,
    parent_session_id: Option<Uuid>,
    instructions: String,
    session: Session,
    entries: Vec<LogEntry>,
}

impl Orchestrator {
    pub fn new(
        config: SubstratConfig,
        providers: HashMap<String, Arc<dyn AgentProvider>>,
    ) -> Self {
        let store = SessionStore::new(config.agents_dir());
        let scheduler = TurnScheduler::new(providers, store, config.max_slots);
        Self {
            scheduler,
            config: Arc::new(config),
            tree: Arc::new(StdMutex::new(Default::default())),
            inboxes: Arc::new(StdMutex::new(HashMap::new())),
            handlers: Arc::new(StdMutex::new(HashMap::new())),
            replies: ReplyLedger::new(),
        }
    }

    pub fn scheduler(&self) -> &TurnScheduler {
        &self.scheduler
    }

    pub fn tree(&self) -> &SharedTree {
        &self.tree
    }

    pub fn inboxes(&self) -> &InboxRegistry {
        &self.inboxes
    }

    pub fn config(&self) -> &SubstratConfig {
        &self.config
    }

    /// Create a root agent with a backing session.
    ///
    /// The session is created first; if the tree insert fails (root name
    /// collision) the session is terminated to avoid orphans.
    pub async fn create_root_agent(
        &self,
        name: &str,
        instructions: &str,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> SubstratResult<AgentNode> {
        let provider_name = provider
            .unwrap_or(&self.config.default_provider)
            .to_string();
        let model = model.unwrap_or(&self.config.default_model).to_string();

        let session = self
            .scheduler
            .create_session(&provider_name, &model, instructions)
            .await?;
        let node = AgentNode::new(session.id, name).with_instructions(instructions);

        let add_result = self.tree.lock().unwrap().add(node.clone());
        if let Err(e) = add_result {
            self.scheduler.terminate_session(session.id).await?;
            return Err(e);
        }

        self.scheduler
            .log_event(
                session.id,
                "agent.created",
                json!({
                    "agent_id": node.id.simple().to_string(),
                    "name": node.name,
                    "parent_session_id": Value::Null,
                    "instructions": node.instructions,
                }),
            )
            .await?;

        self.inboxes.lock().unwrap().insert(node.id, Inbox::new());
        self.install_handler(node.id, provider_name, model);
        Ok(node)
    }

    /// Send a turn to the agent's backing session. Manages IDLE -> BUSY ->
    /// IDLE; the scheduler drains deferred spawn work after the slot is
    /// released; a completed turn may be injected as a reply to a pending
    /// sync request.
    pub async fn run_turn(&self, agent_id: Uuid, prompt: &str) -> SubstratResult<String> {
        let session_id = {
            let mut tree = self.tree.lock().unwrap();
            let node = tree.get_mut(agent_id)?;
            node.activate()?;
            node.session_id
        };

        let result = self.scheduler.send_turn(session_id, prompt).await;

        {
            let mut tree = self.tree.lock().unwrap();
            if let Ok(node) = tree.get_mut(agent_id) {
                if node.state == AgentState::Busy {
                    let _ = node.finish();
                }
            }
        }
        let response = result?;

        if let Some(pending) = self.replies.take_next(agent_id) {
            self.inject_reply(agent_id, pending, &response).await?;
        }
        Ok(response)
    }

    /// Terminate a leaf agent and clean up all associated state.
    /// `agent.terminated` goes to the log before the tree entry is removed.
    pub async fn terminate_agent(&self, agent_id: Uuid) -> SubstratResult<()> {
        let session_id = {
            let mut tree = self.tree.lock().unwrap();
            let node = tree.get_mut(agent_id)?;
            if !node.children.is_empty() {
                return Err(SubstratError::Other(anyhow::anyhow!(
                    "agent {} has children; terminate them first",
                    agent_id.simple()
                )));
            }
            node.terminate()?;
            node.session_id
        };

        // A child whose deferred spawn never ran has no log and no session;
        // there is nothing durable to mark.
        match self
            .scheduler
            .log_event(
                session_id,
                "agent.terminated",
                json!({"agent_id": agent_id.simple().to_string()}),
            )
            .await
        {
            Err(SubstratError::NotFound(_)) => {}
            other => other?,
        }
        match self.scheduler.terminate_session(session_id).await {
            Err(SubstratError::NotFound(_)) => {}
            other => other?,
        }

        self.tree.lock().unwrap().remove(agent_id)?;
        self.handlers.lock().unwrap().remove(&agent_id);
        self.inboxes.lock().unwrap().remove(&agent_id);
        self.replies.clear(agent_id);
        Ok(())
    }

    /// The tool handler for an agent.
    pub fn handler(&self, agent_id: Uuid) -> SubstratResult<Arc<ToolHandler>> {
        self.handlers
            .lock()
            .unwrap()
            .get(&agent_id)
            .cloned()
            .ok_or_else(|| {
                SubstratError::NotFound(format!("tool handler for agent {}", agent_id.simple()))
            })
    }

    /// Reconstruct the agent world from session records and event logs.
    /// Called once on a fresh orchestrator at daemon startup.
    pub async fn recover(&self) -> SubstratResult<()> {
        let store = self.scheduler.store().clone();
        let sessions = store.recover().await?;

        let mut index: HashMap<Uuid, Recovered> = HashMap::new();
        for mut session in sessions {
            if session.state == SessionState::Terminated {
                continue;
            }
            let log_path = store.agent_dir(session.id).join("events.jsonl");
            recover_pending(&log_path).await?;
            let entries = match read_log(&log_path).await {
                Ok(entries) => entries,
                Err(SubstratError::CorruptLog(reason)) => {
                    tracing::warn!(
                        session = %session.id.simple(),
                        %reason,
                        "corrupt event log; terminating session"
                    );
                    session.terminate()?;
                    store.save(&session).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut created: Option<Value> = None;
            let mut terminated = false;
            for entry in &entries {
                match entry.event.as_str() {
                    "agent.created" => created = Some(entry.data.clone()),
                    "agent.terminated" => terminated = true,
                    _ => {}
                }
            }
            if terminated {
                continue;
            }
            let agent_id = created.as_ref().and_then(|c| {
                c.get("agent_id")
                    .and_then(Value::as_str)
                    .and_then(|s| Uuid::parse_str(s).ok())
            });
            let (Some(created), Some(agent_id)) = (created, agent_id) else {
                // Crash during creation: the agent was never durably born.
                tracing::warn!(
                    session = %session.id.simple(),
                    "orphan session without agent.created"
                );
                session.terminate()?;
                store.save(&session).await?;
                continue;
            };

            index.insert(
                session.id,
                Recovered {
                    agent_id,
                    name: created
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    parent_session_id: created
                        .get("parent_session_id")
                        .and_then(Value::as_str)
                        .and_then(|s| Uuid::parse_str(s).ok()),
                    instructions: created
                        .get("instructions")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    session,
                    entries,
                },
            );
        }

        let sid_to_aid: HashMap<Uuid, Uuid> =
            index.iter().map(|(sid, r)| (*sid, r.agent_id)).collect();

        // Drop agents whose parent session is unknown.
        let mut remaining: Vec<Recovered> = Vec::new();
        for (_sid, info) in index {
            if let Some(psid) = info.parent_session_id {
                if !sid_to_aid.contains_key(&psid) {
                    tracing::warn!(
                        agent = %info.agent_id.simple(),
                        "parent session not found; terminating"
                    );
                    let mut session = info.session;
                    session.terminate()?;
                    store.save(&session).await?;
                    continue;
                }
            }
            remaining.push(info);
        }
        remaining.sort_by_key(|r| r.session.id);

        // Topological insert: roots first, then children whose parent is
        // already placed.
        let mut placed: HashSet<Uuid> = HashSet::new();
        let mut placed_infos: Vec<Recovered> = Vec::new();
        while !remaining.is_empty() {
            let mut next_round = Vec::new();
            let mut progress = false;
            for info in remaining {
                let parent_agent_id = match info.parent_session_id {
                    None => None,
                    Some(psid) => {
                        let aid = sid_to_aid[&psid];
                        if !placed.contains(&aid) {
                            next_round.push(info);
                            continue;
                        }
                        Some(aid)
                    }
                };
                self.place_recovered(&info, parent_agent_id).await?;
                placed.insert(info.agent_id);
                placed_infos.push(info);
                progress = true;
            }
            if !progress {
                // The rest form a cycle or hang off unresolvable parents.
                for mut info in next_round {
                    tracing::warn!(
                        agent = %info.agent_id.simple(),
                        "unplaceable agent; terminating session"
                    );
                    info.session.terminate()?;
                    store.save(&info.session).await?;
                }
                break;
            }
            remaining = next_round;
        }

        // Rebuild inboxes: everything enqueued but not delivered comes back,
        // without re-logging. Repeated recoveries may redeliver; agents must
        // tolerate duplicates.
        for info in &placed_infos {
            let delivered: HashSet<&str> = info
                .entries
                .iter()
                .filter(|e| e.event == "message.delivered")
                .filter_map(|e| e.data.get("message_id").and_then(Value::as_str))
                .collect();
            let mut inboxes = self.inboxes.lock().unwrap();
            let inbox = inboxes.entry(info.agent_id).or_default();
            for entry in &info.entries {
                if entry.event != "message.enqueued" {
                    continue;
                }
                let Some(mid) = entry.data.get("message_id").and_then(Value::as_str) else {
                    continue;
                };
                if delivered.contains(mid) {
                    continue;
                }
                if let Some(envelope) = MessageEnvelope::from_event_data(&entry.data) {
                    inbox.deliver(envelope);
                }
            }
        }
        Ok(())
    }

    async fn place_recovered(
        &self,
        info: &Recovered,
        parent_agent_id: Option<Uuid>,
    ) -> SubstratResult<()> {
        let mut node = AgentNode::new(info.session.id, info.name.clone())
            .with_id(info.agent_id)
            .with_instructions(info.instructions.clone());
        if let Some(pid) = parent_agent_id {
            node = node.with_parent(pid);
        }
        self.tree.lock().unwrap().add(node)?;
        self.inboxes
            .lock()
            .unwrap()
            .insert(info.agent_id, Inbox::new());

        let provider = if info.session.provider_name.is_empty() {
            self.config.default_provider.clone()
        } else {
            info.session.provider_name.clone()
        };
        let model = if info.session.model.is_empty() {
            self.config.default_model.clone()
        } else {
            info.session.model.clone()
        };
        self.install_handler(info.agent_id, provider, model);
        self.scheduler.restore_session(info.session.clone()).await
    }

    fn install_handler(&self, agent_id: Uuid, provider: String, model: String) {
        let handler = ToolHandler::new(
            self.tree.clone(),
            self.inboxes.clone(),
            self.scheduler.logs().clone(),
            self.scheduler.clone(),
            self.replies.clone(),
            agent_id,
            self.make_spawn_callback(provider, model),
        );
        self.handlers
            .lock()
            .unwrap()
            .insert(agent_id, Arc::new(handler));
    }

    /// Children inherit the parent's provider and model.
    fn make_spawn_callback(&self, provider: String, model: String) -> SpawnCallback {
        let this = self.clone();
        Arc::new(move |child: AgentNode, workspace_subdir: Option<String>| {
            let this = this.clone();
            let provider = provider.clone();
            let model = model.clone();
            Box::pin(async move {
                this.spawn_child(child, workspace_subdir, provider, model)
                    .await
            })
        })
    }

    /// Deferred body of `spawn_agent`: create the backing session under the
    /// pre-allocated id, prepare the workspace, log `agent.created`, install
    /// the handler.
    async fn spawn_child(
        &self,
        child: AgentNode,
        workspace_subdir: Option<String>,
        provider: String,
        model: String,
    ) -> SubstratResult<()> {
        let session = self
            .scheduler
            .create_session_with_id(child.session_id, &provider, &model, &child.instructions)
            .await?;

        if let Some(ws) = child.workspace_id {
            let mut dir = self.config.workspaces_dir().join(ws.simple().to_string());
            if let Some(subdir) = &workspace_subdir {
                dir = dir.join(subdir);
            }
            tokio::fs::create_dir_all(&dir).await?;
        }

        let parent_session = {
            let tree = self.tree.lock().unwrap();
            tree.parent(child.id)?
                .map(|p| p.session_id.simple().to_string())
        };
        self.scheduler
            .log_event(
                session.id,
                "agent.created",
                json!({
                    "agent_id": child.id.simple().to_string(),
                    "name": child.name,
                    "parent_session_id": parent_session,
                    "instructions": child.instructions,
                }),
            )
            .await?;

        self.install_handler(child.id, provider, model);
        Ok(())
    }

    /// Deliver a completed turn's response to the agent that sync-requested
    /// it, as a RESPONSE envelope with `reply_to` linking the request.
    async fn inject_reply(
        &self,
        replier: Uuid,
        pending: PendingReply,
        response: &str,
    ) -> SubstratResult<()> {
        let requester_session = {
            let tree = self.tree.lock().unwrap();
            match tree.get(pending.requester) {
                Ok(node) => node.session_id,
                Err(_) => {
                    tracing::warn!(
                        requester = %pending.requester.simple(),
                        "sync requester gone; dropping reply"
                    );
                    return Ok(());
                }
            }
        };
        let envelope = MessageEnvelope::new(replier)
            .with_recipient(pending.requester)
            .with_kind(MessageKind::Response)
            .with_reply_to(pending.request_id)
            .with_payload(response);
        if let Some(log) = self.scheduler.logs().get(requester_session) {
            log.log("message.enqueued", envelope.to_event_data()).await?;
        }
        self.inboxes
            .lock()
            .unwrap()
            .entry(pending.requester)
            .or_default()
            .deliver(envelope);
        Ok(())
    }
}

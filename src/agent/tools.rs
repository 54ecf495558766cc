//! The agent-facing tool surface.
//!
//! Five tools implemented as methods on [`ToolHandler`], one instance per
//! agent. Every tool returns immediately with a JSON value; no tool blocks
//! on another agent's reply ("sync" is a protocol contract with the model,
//! not a blocking primitive; a blocking tool would keep a multiplexer slot
//! held and deadlock under back-pressure).
//!
//! Recoverable failures (unknown names, invalid routes, sibling name
//! collisions) come back as `{"status": "error", "reason": ...}` values;
//! only I/O and log faults surface as errors.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::{json, Value};
use uuid::Uuid;

use crate::agent::inbox::Inbox;
use crate::agent::message::{is_sentinel, MessageEnvelope, MessageKind};
use crate::agent::node::AgentNode;
use crate::agent::router::{resolve_broadcast, validate_route};
use crate::agent::tree::AgentTree;
use crate::error::SubstratResult;
use crate::logging::LogRegistry;
use crate::scheduler::{DeferredWork, TurnScheduler};

/// The agent tree, shared between the orchestrator and per-agent handlers.
/// Guards are never held across an await.
pub type SharedTree = Arc<StdMutex<AgentTree>>;

/// Per-agent inboxes, keyed by agent id.
pub type InboxRegistry = Arc<StdMutex<HashMap<Uuid, Inbox>>>;

/// Builds the deferred work that creates a spawned child's backing session.
/// The second argument is the requested workspace subdirectory, if any.
pub type SpawnCallback = Arc<dyn Fn(AgentNode, Option<String>) -> DeferredWork + Send + Sync>;

/// Sync requests awaiting a reply: recipient agent -> queue of requesters.
///
/// When the recipient's next turn completes, the daemon pops one entry and
/// injects the turn's response into the requester's inbox as a RESPONSE
/// envelope. In-memory only; a crash drops pending replies (the requester
/// observes a timeout and may resend).
#[derive(Clone, Default)]
pub struct ReplyLedger {
    inner: Arc<StdMutex<HashMap<Uuid, VecDeque<PendingReply>>>>,
}

#[derive(Debug, Clone, Copy)]
pub struct PendingReply {
    pub requester: Uuid,
    pub request_id: Uuid,
}

impl ReplyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, recipient: Uuid, requester: Uuid, request_id: Uuid) {
        self.inner
            .lock()
            .unwrap()
            .entry(recipient)
            .or_default()
            .push_back(PendingReply {
                requester,
                request_id,
            });
    }

    pub fn take_next(&self, recipient: Uuid) -> Option<PendingReply> {
        self.inner
            .lock()
            .unwrap()
            .get_mut(&recipient)?
            .pop_front()
    }

    pub fn clear(&self, agent_id: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        inner.remove(&agent_id);
        for queue in inner.values_mut() {
            queue.retain(|p| p.requester != agent_id);
        }
    }
}

/// Per-agent tool handler. Dependencies injected at construction, caller id
/// baked in.
pub struct ToolHandler {
    tree: SharedTree,
    inboxes: InboxRegistry,
    logs: LogRegistry,
    scheduler: TurnScheduler,
    replies: ReplyLedger,
    caller_id: Uuid,
    spawn_callback: SpawnCallback,
}

impl ToolHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tree: SharedTree,
        inboxes: InboxRegistry,
        logs: LogRegistry,
        scheduler: TurnScheduler,
        replies: ReplyLedger,
        caller_id: Uuid,
        spawn_callback: SpawnCallback,
    ) -> Self {
        Self {
            tree,
            inboxes,
            logs,
            scheduler,
            replies,
            caller_id,
            spawn_callback,
        }
    }

    pub fn caller_id(&self) -> Uuid {
        self.caller_id
    }

    /// Send a message to a reachable agent by name.
    pub async fn send_message(
        &self,
        recipient: &str,
        text: &str,
        sync: bool,
    ) -> SubstratResult<Value> {
        let resolved = {
            let tree = self.tree.lock().unwrap();
            match self.resolve_name(&tree, recipient) {
                Some(target) => match validate_route(&tree, self.caller_id, target.0) {
                    Ok(()) => Ok(target),
                    Err(e) => Err(e.to_string()),
                },
                None => Err(format!("no reachable agent named {recipient:?}")),
            }
        };
        let (target_id, target_session) = match resolved {
            Ok(t) => t,
            Err(reason) => return Ok(error_value(&reason)),
        };

        let envelope = MessageEnvelope::new(self.caller_id)
            .with_recipient(target_id)
            .with_kind(MessageKind::Request)
            .with_payload(text)
            .with_metadata("sync", if sync { "true" } else { "false" });
        let message_id = envelope.id;

        self.deliver(target_id, target_session, envelope).await?;
        if sync {
            self.replies.record(target_id, self.caller_id, message_id);
        }
        Ok(json!({
            "status": "sent",
            "message_id": message_id.simple().to_string(),
            "waiting_for_reply": sync,
        }))
    }

    /// Multicast to all siblings in the team. Replies, if any, arrive as
    /// separate inbound messages later.
    pub async fn broadcast(&self, text: &str) -> SubstratResult<Value> {
        let resolved = {
            let tree = self.tree.lock().unwrap();
            match resolve_broadcast(&tree, self.caller_id) {
                Ok(sibling_ids) => {
                    let mut targets = Vec::new();
                    for sid in sibling_ids {
                        if let Err(e) = validate_route(&tree, self.caller_id, sid) {
                            return Ok(error_value(&e.to_string()));
                        }
                        targets.push((sid, tree.get(sid)?.session_id));
                    }
                    Ok(targets)
                }
                Err(e) => Err(e.to_string()),
            }
        };
        let targets = match resolved {
            Ok(t) => t,
            Err(reason) => return Ok(error_value(&reason)),
        };

        let broadcast_id = Uuid::new_v4();
        let recipient_count = targets.len();
        for (target_id, target_session) in targets {
            let envelope = MessageEnvelope::new(self.caller_id)
                .with_recipient(target_id)
                .with_kind(MessageKind::Multicast)
                .with_payload(text)
                .with_metadata("broadcast_id", broadcast_id.simple().to_string());
            self.deliver(target_id, target_session, envelope).await?;
        }
        Ok(json!({
            "status": "sent",
            "message_id": broadcast_id.simple().to_string(),
            "recipient_count": recipient_count,
        }))
    }

    /// Drain the caller's inbox and return the messages.
    pub async fn check_inbox(&self) -> SubstratResult<Value> {
        let drained = {
            let mut inboxes = self.inboxes.lock().unwrap();
            inboxes
                .get_mut(&self.caller_id)
                .map(|inbox| inbox.collect())
                .unwrap_or_default()
        };

        let caller_session = {
            let tree = self.tree.lock().unwrap();
            tree.get(self.caller_id)?.session_id
        };
        if let Some(log) = self.logs.get(caller_session) {
            for envelope in &drained {
                log.log(
                    "message.delivered",
                    json!({"message_id": envelope.id.simple().to_string()}),
                )
                .await?;
            }
        }

        let messages = {
            let tree = self.tree.lock().unwrap();
            drained
                .iter()
                .map(|m| {
                    json!({
                        "from": sender_display_name(&tree, m.sender),
                        "text": m.payload,
                        "message_id": m.id.simple().to_string(),
                    })
                })
                .collect::<Vec<_>>()
        };
        Ok(json!({"messages": messages}))
    }

    /// Create a child agent. The tree gains the node synchronously; the
    /// backing session is created by deferred work after this turn's slot
    /// is released, so the child never competes for the parent's slot.
    pub async fn spawn_agent(
        &self,
        name: &str,
        instructions: &str,
        role: &str,
        workspace_subdir: Option<&str>,
    ) -> SubstratResult<Value> {
        let mut child = AgentNode::new(Uuid::new_v4(), name)
            .with_parent(self.caller_id)
            .with_instructions(instructions);
        if workspace_subdir.is_some() {
            child = child.with_workspace(Uuid::new_v4());
        }

        {
            let mut tree = self.tree.lock().unwrap();
            if let Err(e) = tree.add(child.clone()) {
                return Ok(error_value(&e.to_string()));
            }
        }
        // Eager inbox so messages sent before the provider starts are queued.
        self.inboxes
            .lock()
            .unwrap()
            .insert(child.id, Inbox::new());

        let work = (self.spawn_callback)(
            child.clone(),
            workspace_subdir.map(str::to_string),
        );
        self.scheduler.defer(work);

        Ok(json!({
            "status": "created",
            "agent_id": child.id.simple().to_string(),
            "name": child.name,
            "role": role,
        }))
    }

    /// View a direct child's state and queued messages.
    pub async fn inspect_agent(&self, name: &str) -> SubstratResult<Value> {
        let child = {
            let tree = self.tree.lock().unwrap();
            tree.children(self.caller_id)?
                .iter()
                .find(|c| c.name == name)
                .map(|c| (c.id, c.state.to_string()))
        };
        let Some((child_id, state)) = child else {
            return Ok(error_value(&format!("no child agent named {name:?}")));
        };

        let recent = {
            let inboxes = self.inboxes.lock().unwrap();
            inboxes
                .get(&child_id)
                .map(|inbox| inbox.peek())
                .unwrap_or_default()
        };
        let messages = {
            let tree = self.tree.lock().unwrap();
            recent
                .iter()
                .map(|m| {
                    json!({
                        "from": sender_display_name(&tree, m.sender),
                        "text": m.payload,
                        "message_id": m.id.simple().to_string(),
                    })
                })
                .collect::<Vec<_>>()
        };
        Ok(json!({"state": state, "recent_messages": messages}))
    }

    /// Search the caller's one-hop neighborhood (parent, children,
    /// siblings) for a name. Returns (agent_id, session_id).
    fn resolve_name(&self, tree: &AgentTree, name: &str) -> Option<(Uuid, Uuid)> {
        let node = tree.get(self.caller_id).ok()?;
        if let Some(parent_id) = node.parent_id {
            if let Ok(parent) = tree.get(parent_id) {
                if parent.name == name {
                    return Some((parent.id, parent.session_id));
                }
            }
        }
        for child in tree.children(self.caller_id).ok()? {
            if child.name == name {
                return Some((child.id, child.session_id));
            }
        }
        for sibling in tree.team(self.caller_id).ok()? {
            if sibling.name == name {
                return Some((sibling.id, sibling.session_id));
            }
        }
        None
    }

    /// Log `message.enqueued` to the recipient's event log, then append to
    /// its inbox. A recipient whose session does not exist yet (deferred
    /// spawn still pending) is delivered without logging; such a child does
    /// not survive recovery anyway.
    async fn deliver(
        &self,
        recipient_id: Uuid,
        recipient_session: Uuid,
        envelope: MessageEnvelope,
    ) -> SubstratResult<()> {
        if let Some(log) = self.logs.get(recipient_session) {
            log.log("message.enqueued", envelope.to_event_data()).await?;
        }
        self.inboxes
            .lock()
            .unwrap()
            .entry(recipient_id)
            .or_default()
            .deliver(envelope);
        Ok(())
    }
}

fn error_value(reason: &str) -> Value {
    json!({"status": "error", "reason": reason})
}

/// Human-readable sender name. Falls back to the uuid for sentinels and
/// departed agents.
fn sender_display_name(tree: &AgentTree, sender_id: Uuid) -> String {
    if is_sentinel(sender_id) {
        return sender_id.simple().to_string();
    }
    match tree.get(sender_id) {
        Ok(node) if !node.name.is_empty() => node.name.clone(),
        _ => sender_id.simple().to_string(),
    }
}

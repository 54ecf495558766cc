//! Agent node data model and state machine.

use uuid::Uuid;

use crate::error::{SubstratError, SubstratResult};
use crate::types::now_iso;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
    Idle,
    Busy,
    Waiting,
    Terminated,
}

impl AgentState {
    pub fn can_transition_to(self, target: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, target),
            (Idle, Busy)
                | (Busy, Idle)
                | (Busy, Waiting)
                | (Waiting, Busy)
                | (Idle | Busy | Waiting, Terminated)
        )
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Idle => write!(f, "IDLE"),
            AgentState::Busy => write!(f, "BUSY"),
            AgentState::Waiting => write!(f, "WAITING"),
            AgentState::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// A single agent in the hierarchy. One-to-one with a backing session.
/// Knows nothing about messages or routing.
#[derive(Debug, Clone)]
pub struct AgentNode {
    pub session_id: Uuid,
    pub id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub children: Vec<Uuid>,
    pub instructions: String,
    pub workspace_id: Option<Uuid>,
    pub state: AgentState,
    pub created_at: String,
}

impl AgentNode {
    pub fn new(session_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            session_id,
            id: Uuid::new_v4(),
            name: name.into(),
            parent_id: None,
            children: Vec::new(),
            instructions: String::new(),
            workspace_id: None,
            state: AgentState::Idle,
            created_at: now_iso(),
        }
    }

    /// Use a persisted id instead of a fresh one (recovery).
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_workspace(mut self, workspace_id: Uuid) -> Self {
        self.workspace_id = Some(workspace_id);
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn transition(&mut self, target: AgentState) -> SubstratResult<()> {
        if !self.state.can_transition_to(target) {
            return Err(SubstratError::AgentState {
                from: self.state,
                to: target,
            });
        }
        self.state = target;
        Ok(())
    }

    /// IDLE/WAITING -> BUSY.
    pub fn activate(&mut self) -> SubstratResult<()> {
        self.transition(AgentState::Busy)
    }

    /// BUSY -> IDLE.
    pub fn finish(&mut self) -> SubstratResult<()> {
        self.transition(AgentState::Idle)
    }

    /// BUSY -> WAITING.
    pub fn wait(&mut self) -> SubstratResult<()> {
        self.transition(AgentState::Waiting)
    }

    /// Any non-terminated -> TERMINATED.
    pub fn terminate(&mut self) -> SubstratResult<()> {
        self.transition(AgentState::Terminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_node_is_idle_root() {
        let node = AgentNode::new(Uuid::new_v4(), "lead");
        assert_eq!(node.state, AgentState::Idle);
        assert!(node.is_root());
        assert!(node.children.is_empty());
        assert!(node.workspace_id.is_none());
    }

    #[test]
    fn builders() {
        let parent = Uuid::new_v4();
        let ws = Uuid::new_v4();
        let node = AgentNode::new(Uuid::new_v4(), "worker")
            .with_parent(parent)
            .with_instructions("do the thing")
            .with_workspace(ws);
        assert_eq!(node.parent_id, Some(parent));
        assert_eq!(node.instructions, "do the thing");
        assert_eq!(node.workspace_id, Some(ws));
        assert!(!node.is_root());
    }

    #[test]
    fn state_machine_happy_path() {
        let mut node = AgentNode::new(Uuid::new_v4(), "a");
        node.activate().unwrap();
        assert_eq!(node.state, AgentState::Busy);
        node.wait().unwrap();
        assert_eq!(node.state, AgentState::Waiting);
        node.activate().unwrap();
        node.finish().unwrap();
        assert_eq!(node.state, AgentState::Idle);
        node.terminate().unwrap();
    }

    #[test]
    fn invalid_transitions_fault() {
        let mut node = AgentNode::new(Uuid::new_v4(), "a");
        // IDLE -> WAITING is not in the table.
        assert!(node.wait().is_err());
        // IDLE -> IDLE neither.
        assert!(node.finish().is_err());

        node.terminate().unwrap();
        assert!(node.activate().is_err());
        assert!(node.terminate().is_err());
    }
}

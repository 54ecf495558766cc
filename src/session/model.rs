//! Session data model and state machine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SubstratError, SubstratResult};
use crate::types::now_iso;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    Created,
    Active,
    Suspended,
    Terminated,
}

impl SessionState {
    /// Check whether transitioning from `self` to `target` is valid.
    /// All transitions not listed are faults.
    pub fn can_transition_to(self, target: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, target),
            (Created, Active)
                | (Active, Suspended)
                | (Suspended, Active)
                | (Created | Active | Suspended, Terminated)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Terminated
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Created => write!(f, "CREATED"),
            SessionState::Active => write!(f, "ACTIVE"),
            SessionState::Suspended => write!(f, "SUSPENDED"),
            SessionState::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// A single provider session. Knows nothing about agents or messages.
///
/// `provider_state` is the opaque blob produced by the provider's `suspend`;
/// it is a fast-restore optimization, never the source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    #[serde(with = "uuid::serde::simple")]
    pub id: Uuid,
    pub state: SessionState,
    pub provider_name: String,
    pub model: String,
    pub created_at: String,
    pub suspended_at: Option<String>,
    #[serde(with = "b64_bytes")]
    pub provider_state: Vec<u8>,
}

impl Session {
    pub fn new(provider_name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Created,
            provider_name: provider_name.into(),
            model: model.into(),
            created_at: now_iso(),
            suspended_at: None,
            provider_state: Vec::new(),
        }
    }

    /// Use a caller-allocated id instead of a fresh one (deferred spawns
    /// allocate the session id before the session exists).
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Transition to a new state. Fault on anything outside the table.
    pub fn transition(&mut self, target: SessionState) -> SubstratResult<()> {
        if !self.state.can_transition_to(target) {
            return Err(SubstratError::SessionState {
                from: self.state,
                to: target,
            });
        }
        if target == SessionState::Suspended {
            self.suspended_at = Some(now_iso());
        }
        self.state = target;
        Ok(())
    }

    /// CREATED/SUSPENDED -> ACTIVE.
    pub fn activate(&mut self) -> SubstratResult<()> {
        self.transition(SessionState::Active)?;
        self.suspended_at = None;
        Ok(())
    }

    /// ACTIVE -> SUSPENDED. Stores the provider's opaque state blob.
    pub fn suspend(&mut self, provider_state: Vec<u8>) -> SubstratResult<()> {
        self.transition(SessionState::Suspended)?;
        self.provider_state = provider_state;
        Ok(())
    }

    /// Any non-terminated -> TERMINATED.
    pub fn terminate(&mut self) -> SubstratResult<()> {
        self.transition(SessionState::Terminated)
    }
}

mod b64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_is_created() {
        let session = Session::new("mock", "test-model");
        assert_eq!(session.state, SessionState::Created);
        assert_eq!(session.provider_name, "mock");
        assert_eq!(session.model, "test-model");
        assert!(session.suspended_at.is_none());
        assert!(session.provider_state.is_empty());
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut session = Session::new("mock", "m");
        session.activate().unwrap();
        assert_eq!(session.state, SessionState::Active);

        session.suspend(b"blob".to_vec()).unwrap();
        assert_eq!(session.state, SessionState::Suspended);
        assert_eq!(session.provider_state, b"blob");
        assert!(session.suspended_at.is_some());

        session.activate().unwrap();
        assert_eq!(session.state, SessionState::Active);
        assert!(session.suspended_at.is_none());

        session.terminate().unwrap();
        assert_eq!(session.state, SessionState::Terminated);
    }

    #[test]
    fn created_can_terminate() {
        let mut session = Session::new("mock", "m");
        session.terminate().unwrap();
        assert!(session.state.is_terminal());
    }

    #[test]
    fn invalid_transitions_fault() {
        let mut session = Session::new("mock", "m");
        // CREATED -> SUSPENDED is not in the table.
        let err = session.suspend(b"x".to_vec()).unwrap_err();
        assert!(matches!(err, SubstratError::SessionState { .. }));

        session.activate().unwrap();
        session.terminate().unwrap();
        // TERMINATED is terminal.
        assert!(session.activate().is_err());
        assert!(session.terminate().is_err());
    }

    #[test]
    fn serializes_with_exact_keys() {
        let session = Session::new("cli-agent", "composer-1");
        let json = serde_json::to_string(&session).unwrap();

        // Keys stream in schema order.
        let positions: Vec<usize> = [
            "\"id\"",
            "\"state\"",
            "\"provider_name\"",
            "\"model\"",
            "\"created_at\"",
            "\"suspended_at\"",
            "\"provider_state\"",
        ]
        .iter()
        .map(|k| json.find(k).unwrap())
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["state"], "CREATED");
        // 32-char lowercase hex, no dashes.
        let id = value["id"].as_str().unwrap();
        assert_eq!(id.len(), 32);
        assert!(id
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn provider_state_roundtrips_as_base64() {
        let mut session = Session::new("mock", "m");
        session.activate().unwrap();
        session.suspend(vec![0, 1, 2, 255]).unwrap();

        let json = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back.provider_state, vec![0, 1, 2, 255]);
        assert_eq!(back.id, session.id);
        assert_eq!(back.state, SessionState::Suspended);
    }
}

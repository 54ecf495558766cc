use thiserror::Error;

use crate::agent::AgentState;
use crate::session::SessionState;

#[derive(Error, Debug)]
pub enum SubstratError {
    #[error("invalid session state transition: {from} -> {to}")]
    SessionState { from: SessionState, to: SessionState },

    #[error("invalid agent state transition: {from} -> {to}")]
    AgentState { from: AgentState, to: AgentState },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("all {max_slots} multiplexer slots held, cannot evict")]
    SlotsExhausted { max_slots: usize },

    #[error("route invalid: {0}")]
    RouteInvalid(String),

    #[error("name conflict: {0}")]
    NameConflict(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("corrupt event log: {0}")]
    CorruptLog(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type SubstratResult<T> = Result<T, SubstratError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formats() {
        let err = SubstratError::SessionState {
            from: SessionState::Created,
            to: SessionState::Suspended,
        };
        assert_eq!(
            err.to_string(),
            "invalid session state transition: CREATED -> SUSPENDED"
        );

        let err = SubstratError::SlotsExhausted { max_slots: 4 };
        assert!(err.to_string().contains('4'));

        let err = SubstratError::NotFound("session abc".into());
        assert_eq!(err.to_string(), "not found: session abc");

        let err = SubstratError::RouteInvalid("grandchild is two hops away".into());
        assert!(err.to_string().starts_with("route invalid"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SubstratError>();
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SubstratError = io_err.into();
        assert!(matches!(err, SubstratError::Io(_)));
    }

    #[test]
    fn json_error_converts() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: SubstratError = json_err.into();
        assert!(matches!(err, SubstratError::Serialization(_)));
    }
}

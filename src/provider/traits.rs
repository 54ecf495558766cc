use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SubstratResult;

/// Streamed response chunks from a single `send`. The sequence is finite and
/// single-consumer; the channel closes when the response is complete.
pub type ChunkReceiver = mpsc::UnboundedReceiver<SubstratResult<String>>;

/// A live conversation handle returned by a provider.
///
/// Providers know nothing about sessions, trees, logs, or messaging; session
/// identity and persistence live entirely outside.
#[async_trait]
pub trait ProviderSession: Send + std::fmt::Debug {
    /// Send a message and stream the response chunks.
    async fn send(&mut self, prompt: &str) -> SubstratResult<ChunkReceiver>;

    /// Serialize session state. Returns an opaque blob for later restore.
    async fn suspend(&mut self) -> SubstratResult<Vec<u8>>;

    /// Terminate the session and release resources.
    async fn stop(&mut self) -> SubstratResult<()>;
}

/// Factory for provider sessions.
///
/// Each backend (CLI agent, bare HTTP LLM, mock) implements this once;
/// sessions are the per-agent conversation handles it produces.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// Provider type identifier (e.g. "cli-agent", "http-llm").
    fn name(&self) -> &str;

    /// Start a new conversation with the given model and instructions.
    async fn create(
        &self,
        model: &str,
        system_prompt: &str,
    ) -> SubstratResult<Box<dyn ProviderSession>>;

    /// Recreate a session from a previously suspended state blob.
    async fn restore(&self, state: &[u8]) -> SubstratResult<Box<dyn ProviderSession>>;
}

/// How provider sessions are held in multiplexer slots: the scheduler clones
/// the handle out of the slot table and drives `send` without borrowing the
/// multiplexer itself.
pub type SharedProviderSession = Arc<tokio::sync::Mutex<Box<dyn ProviderSession>>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_is_object_safe() {
        fn _assert_object_safe(_: &dyn AgentProvider) {}
    }

    #[test]
    fn session_is_object_safe() {
        fn _assert_object_safe(_: &dyn ProviderSession) {}
    }
}

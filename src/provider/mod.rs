//! Provider abstraction and the built-in backends.

mod cli;
mod http;
mod mock;
mod traits;

pub use cli::CliAgentProvider;
pub use http::HttpLlmProvider;
pub use mock::MockProvider;
pub use traits::{AgentProvider, ChunkReceiver, ProviderSession, SharedProviderSession};

//! Agent layer: the tree of agents, one-hop routing, inboxes, and the
//! non-blocking tool surface.

pub mod inbox;
pub mod message;
pub mod node;
pub mod router;
pub mod tools;
pub mod tree;

pub use inbox::Inbox;
pub use message::{is_sentinel, MessageEnvelope, MessageKind, SYSTEM, USER};
pub use node::{AgentNode, AgentState};
pub use tools::{InboxRegistry, ReplyLedger, SharedTree, SpawnCallback, ToolHandler};
pub use tree::AgentTree;

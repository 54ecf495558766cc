//! # substrat
//!
//! Daemon core for orchestrating a hierarchy of language-model agents. Each
//! agent is backed by exactly one provider session (a CLI subprocess or HTTP
//! client) driven turn by turn. The daemon owns all state: a forest of
//! agents, a fixed-size pool of concurrently live provider sessions, a
//! durable per-agent event log, and a message router that lets agents talk
//! to their parent, children, and siblings only.
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`session`] | `Session` state machine, atomic `session.json` store, fixed-slot LRU multiplexer |
//! | [`provider`] | `AgentProvider` / `ProviderSession` abstraction: CLI subprocess, bare HTTP LLM, mock |
//! | [`logging`] | Per-session append-only JSONL event log with pending-file WAL |
//! | [`scheduler`] | Turn lifecycle: acquire slot, send, always-release, drain deferred work |
//! | [`agent`] | Agent tree, one-hop router, inboxes, the five-tool surface |
//! | [`orchestrator`] | Composition root: lifecycle events, deferred spawns, reply injection, recovery |
//! | [`rpc`] | Newline-delimited JSON protocol over the daemon socket |
//! | [`persistence`] | Crash-safe write primitives (atomic replace, dir fsync) |
//! | [`error`] | `SubstratError` with thiserror: session-state, slots-exhausted, route-invalid, ... |
//!
//! ## Durability model
//!
//! Session records are atomic snapshots and a fast-restore optimization;
//! the per-session event log is the source of truth. On startup, recovery
//! flips ACTIVE records to SUSPENDED, replays pending log writes, rebuilds
//! the tree from `agent.created` events, and refills inboxes from
//! `message.enqueued` minus `message.delivered`. Delivery is at-least-once
//! across crashes; in-flight turns are lost.

pub mod agent;
pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod persistence;
pub mod provider;
pub mod rpc;
pub mod scheduler;
pub mod session;
pub mod types;

pub use config::SubstratConfig;
pub use error::{SubstratError, SubstratResult};
pub use orchestrator::Orchestrator;
pub use scheduler::TurnScheduler;

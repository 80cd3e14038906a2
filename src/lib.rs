//! # txbroker - Serializing Transaction Broker
//!
//! txbroker sits between an embedded, untrusted script environment and a local
//! SQLite store. Scripts issue SQL in numbered transactions; the broker runs
//! every command, in submission order, on one dedicated worker thread and
//! answers each one through a caller-supplied sink.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Caller threads (any number)                  │
//! │        initialize / run_stmt / run_commit / run_rollback        │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ enqueue (fails fast when full)
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Bounded Command Queue (FIFO)                   │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ dequeue
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Worker (single thread)                       │
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │  Generation  │  │  Statement   │  │  Result Dispatcher   │   │
//! │  │ Invalidation │─►│   Executor   │─►│  (sink per command)  │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘   │
//! │            Client Registry (owned, never shared)                │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              SQLite (one file per client application)           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Total order**: commands complete in the order they were enqueued
//! 2. **One answer per accepted command**: every command that is processed
//!    yields exactly one sink invocation, success or error
//! 3. **No leaked transactions**: a generation change rolls back and closes
//!    everything the previous generation left open
//! 4. **Visible backpressure**: a full queue is an immediate `Err` for the
//!    caller, never a silent drop
//!
//! ## Module Organization
//!
//! - [`error`]: error enum and payload error codes
//! - [`types`]: identifiers and the command type
//! - [`config`]: broker configuration
//! - [`params`]: bind parameter parsing
//! - [`engine`]: engine traits and the SQLite engine
//! - [`queue`]: bounded command queue
//! - [`registry`]: client registry and generation invalidation
//! - [`executor`]: statement classification and execution
//! - [`dispatch`]: result payloads, formatting and sinks
//! - [`worker`]: the worker loop and thread
//! - [`api`]: the [`Broker`] handle

/// Error types for broker operations.
pub mod error;

/// Identifiers (client, generation, transaction, action) and commands.
pub mod types;

/// Broker configuration and environment overrides.
pub mod config;

/// Bind parameter parsing.
pub mod params;

/// Relational engine adapter.
///
/// The broker talks to storage through the [`engine::Engine`] and
/// [`engine::EngineHandle`] traits; [`engine::SqliteEngine`] implements them
/// over `rusqlite`.
pub mod engine;

/// Bounded FIFO between callers and the worker.
pub mod queue;

/// Per-client session state and generation invalidation.
pub mod registry;

/// Statement execution within a client's transactions.
pub mod executor;

/// Result payloads and delivery to caller sinks.
pub mod dispatch;

/// The single serializing worker.
pub mod worker;

/// Public broker handle.
pub mod api;

#[cfg(test)]
mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::Broker;
pub use config::{BindMode, BrokerConfig, CallbackNames};
pub use dispatch::{Outcome, ResultSink};
pub use engine::{Engine, EngineHandle, Row, SqliteConfig, SqliteEngine};
pub use error::{Error, Result};
pub use types::{ActionIndex, ClientId, Command, CommandKind, Generation, TransactionId};
pub use worker::{StatsSnapshot, WorkerExit};

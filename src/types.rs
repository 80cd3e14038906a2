//! # Domain Types for txbroker
//!
//! This module defines the identifiers and the command type that flow through
//! the broker.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Client ids and generations are both strings on the wire, and transaction ids
//! are plain integers. Wrapping them in single-field structs means a
//! `Generation` can never be passed where a `ClientId` is expected.
//!
//! ## Invariants
//!
//! - [`Command`]s are immutable once enqueued and consumed exactly once
//! - [`ActionIndex::BEGIN`] (0) is the only index that may open a transaction

use std::fmt;

use crate::dispatch::ResultSink;

// =============================================================================
// Client Identification
// =============================================================================

/// Identifier namespace under which transactions and generations are tracked.
///
/// One embedded application maps to one client id, and each client gets its
/// own database file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    /// Creates a client id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this client id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Generation
// =============================================================================

/// Opaque token identifying one session (page load) of a client.
///
/// # Why Opaque?
///
/// The broker only ever compares generations for equality. A change signals
/// that everything the previous session left open should be reclaimed, so no
/// ordering between generations is needed or assumed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Generation(String);

/// Previous generation reported to an Init when there is nothing to clean up.
pub const NO_PREVIOUS_GENERATION: &str = "";

impl Generation {
    /// Creates a generation token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The sentinel reported when a client had no prior generation.
    pub fn none() -> Self {
        Self(NO_PREVIOUS_GENERATION.to_string())
    }

    /// Returns the raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Generation {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Generation {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Transaction Addressing
// =============================================================================

/// Caller-chosen integer scoping a sequence of statements into one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(i64);

impl TransactionId {
    /// Creates a transaction id from its raw value.
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn as_raw(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for TransactionId {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

/// Ordinal position of a statement within its transaction.
///
/// Index 0 begins the transaction; every later statement uses a positive index.
/// The broker does not check that indexes increase, only whether the
/// transaction is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionIndex(u32);

impl ActionIndex {
    /// The index that starts a new transaction.
    pub const BEGIN: ActionIndex = ActionIndex(0);

    /// Creates an action index from its raw value.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// True if this statement opens its transaction.
    pub const fn is_begin(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ActionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ActionIndex {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

// =============================================================================
// Commands
// =============================================================================

/// What a command asks the worker to do.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    /// Announce a (possibly new) generation and learn what to clean up.
    Init,

    /// Abandon a transaction.
    Rollback { transaction_id: TransactionId },

    /// Make a transaction durable.
    Commit { transaction_id: TransactionId },

    /// Run one statement inside a transaction.
    Stmt {
        transaction_id: TransactionId,
        action_index: ActionIndex,
        sql: String,
        /// JSON array text, parsed by the worker before touching the engine.
        bind_params: Option<String>,
    },
}

impl CommandKind {
    /// Short name used in log fields.
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Init => "init",
            CommandKind::Rollback { .. } => "rollback",
            CommandKind::Commit { .. } => "commit",
            CommandKind::Stmt { .. } => "stmt",
        }
    }
}

/// The unit of work submitted to the broker.
///
/// # Lifecycle
///
/// Built by one of the `Broker::run_*` operations, enqueued, then consumed
/// exactly once by the worker. Commands discarded at shutdown are dropped
/// together with their sink, which is never invoked.
pub struct Command {
    pub client_id: ClientId,
    pub generation: Generation,
    pub kind: CommandKind,
    pub sink: Box<dyn ResultSink>,
}

impl Command {
    /// Creates a command.
    pub fn new(
        client_id: impl Into<ClientId>,
        generation: impl Into<Generation>,
        kind: CommandKind,
        sink: Box<dyn ResultSink>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            generation: generation.into(),
            kind,
            sink,
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("client_id", &self.client_id)
            .field("generation", &self.generation)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

//! # Error Handling for txbroker
//!
//! This module defines the error types used throughout the broker. A single
//! error enum ([`Error`]) represents every failure mode, which keeps function
//! signatures short and lets callers match on one type.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations:
//! - `Display` comes from the `#[error(...)]` attributes
//! - `From` conversions come from the `#[from]` attributes, so `?` works on
//!   `rusqlite`, `serde_json` and `std::io` errors
//!
//! ## Two Delivery Paths
//!
//! Errors leave the broker in one of two ways:
//!
//! | Category | Examples | Path |
//! |----------|----------|------|
//! | Capacity | Queue full, broker shut down | Synchronous `Err` from `Broker::run_*` |
//! | Protocol | Duplicate transaction start | Error payload through the result sink |
//! | Parameter | Bind params are not a JSON array | Error payload through the result sink |
//! | Engine | SQL syntax error, constraint violation | Error payload through the result sink |
//!
//! The worker converts the last three into an error payload with
//! [`Error::error_code`]; they never unwind out of the worker loop.

use thiserror::Error;

// =============================================================================
// Payload Error Codes
// =============================================================================

/// Code reported for engine failures and anything unclassified.
pub const CODE_UNKNOWN: i32 = 0;

/// Code reported for malformed command sequencing.
pub const CODE_PROTOCOL: i32 = 1;

/// Code reported for malformed bind parameters.
pub const CODE_PARAMS: i32 = 5;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in broker operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Capacity Errors (reported synchronously to the enqueuing caller)
    // =========================================================================

    /// The command queue already holds `capacity` pending commands.
    ///
    /// # When This Happens
    ///
    /// Producers submit faster than the worker drains. The broker never blocks
    /// the caller and never drops the command silently; the caller decides
    /// whether to retry, drop, or surface the failure upstream.
    #[error("command queue full: {capacity} commands already pending")]
    QueueFull {
        /// Configured queue capacity
        capacity: usize,
    },

    /// The broker has been shut down and accepts no more commands.
    #[error("broker has shut down")]
    ShutDown,

    /// `Broker::start` was called more than once.
    #[error("broker worker already started")]
    AlreadyStarted,

    // =========================================================================
    // Protocol and Parameter Errors (delivered as error payloads)
    // =========================================================================

    /// Malformed command sequencing.
    ///
    /// # When This Happens
    ///
    /// - A statement with action index 0 targets a transaction that is open
    /// - A statement with action index > 0 targets no open transaction
    #[error("{0}")]
    Protocol(String),

    /// Bind parameters could not be parsed into positional values.
    #[error("invalid bind parameters: {0}")]
    Params(String),

    // =========================================================================
    // Engine Errors (delivered as error payloads)
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// Wraps any error from the `rusqlite` crate: syntax errors, constraint
    /// violations, a locked database, a full disk.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The engine ended a transaction the broker still tracks as open.
    ///
    /// # When This Happens
    ///
    /// - `INSERT OR ROLLBACK` (or a similar conflict clause) hit a constraint
    /// - The script sent `COMMIT`, `ROLLBACK` or `END` as a statement
    /// - SQLite rolled back on its own after a disk-full or I/O error
    ///
    /// The transaction stays tracked but refuses further statements until
    /// the caller ends it with Commit or Rollback.
    #[error("transaction {transaction_id} is no longer active in the engine: {reason}")]
    TransactionEnded {
        /// Broker-side transaction id
        transaction_id: i64,
        /// What ended it, as far as the broker can tell
        reason: String,
    },

    /// The SQL text holds no statement once whitespace and comments are removed.
    #[error("empty SQL statement: nothing to execute")]
    EmptyStatement,

    /// The SQL text holds more than one statement.
    #[error("multiple SQL statements in one action; send one statement per action")]
    MultipleStatements,

    /// A payload could not be serialized or deserialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem failure while preparing a client database.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid broker or engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Returns the code carried in the error payload for this error.
    ///
    /// Only the categories delivered through a result sink have a meaningful
    /// code; everything engine-side reports [`CODE_UNKNOWN`].
    pub fn error_code(&self) -> i32 {
        match self {
            Error::Protocol(_) => CODE_PROTOCOL,
            Error::Params(_) => CODE_PARAMS,
            _ => CODE_UNKNOWN,
        }
    }

    /// Message carried in the error payload.
    ///
    /// Engine errors drop the `sqlite error:` prefix; the script side only
    /// sees what SQLite reported.
    pub fn payload_message(&self) -> String {
        match self {
            Error::Sqlite(e) => e.to_string(),
            other => other.to_string(),
        }
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

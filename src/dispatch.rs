//! # Result Callback Dispatcher
//!
//! Every processed command produces exactly one [`Outcome`]. The dispatcher
//! turns it into the string the script side evaluates and hands that string to
//! the command's [`ResultSink`].
//!
//! ## Wire Format
//!
//! ```text
//! __txbStmtResult("g1",3,2,"{\"rows\":[{\"id\":1}],\"rowsAffected\":0}")
//! └──── name ───┘ └─────┬────┘ └──────────── escaped payload ──────────┘
//!                   address
//! ```
//!
//! The payload is serialized to JSON and then escaped again as a JSON string
//! literal. The outer layer is plain text addressed to one pending request;
//! the inner layer is the structured result.
//!
//! | Command | Address |
//! |---------|---------|
//! | Stmt | `(generation, transaction_id, action_index)` |
//! | Commit / Rollback | `(generation, transaction_id)` |
//! | Init | `(previous_generation)` |
//!
//! ## Thread Affinity
//!
//! `deliver` runs on the worker thread. A sink that must run on a UI or
//! script thread is responsible for hopping there itself.

use serde::Serialize;

use crate::config::CallbackNames;
use crate::engine::Row;
use crate::error::Error;
use crate::types::{ActionIndex, Generation, TransactionId};

// =============================================================================
// Result Sink
// =============================================================================

/// Capability to deliver one formatted result to the caller's context.
///
/// # Rust Pattern: `self: Box<Self>`
///
/// Delivery consumes the sink, so the type system guarantees a command is
/// answered at most once. Any `FnOnce(String) + Send` closure is a sink.
pub trait ResultSink: Send {
    /// Delivers the formatted result string.
    fn deliver(self: Box<Self>, formatted: String);
}

impl<F> ResultSink for F
where
    F: FnOnce(String) + Send,
{
    fn deliver(self: Box<Self>, formatted: String) {
        (*self)(formatted)
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// Payload of a successful command.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SuccessPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Row>>,
    pub rows_affected: u64,
}

/// Payload of a failed command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub error: String,
    pub error_code: i32,
}

/// Outcome of one processed command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outcome {
    Success(SuccessPayload),
    Error(ErrorPayload),
}

impl Outcome {
    /// Success without rows, used by Init, Commit, Rollback.
    pub fn empty() -> Self {
        Outcome::Success(SuccessPayload::default())
    }

    /// Success carrying the rows of a read statement.
    pub fn rows(rows: Vec<Row>) -> Self {
        Outcome::Success(SuccessPayload {
            rows: Some(rows),
            rows_affected: 0,
        })
    }

    /// Success of a write statement.
    pub fn affected(rows_affected: u64) -> Self {
        Outcome::Success(SuccessPayload {
            rows: None,
            rows_affected,
        })
    }

    /// Error with an explicit message and code.
    pub fn error(message: impl Into<String>, code: i32) -> Self {
        Outcome::Error(ErrorPayload {
            error: message.into(),
            error_code: code,
        })
    }

    /// True for the success variant.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Serializes the payload to JSON text.
    pub fn to_json(&self) -> String {
        // Rows hold only strings and finite numbers, so this cannot fail.
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"error":{},"errorCode":0}}"#, json_string(&e.to_string()))
        })
    }
}

impl From<Error> for Outcome {
    fn from(err: Error) -> Self {
        Outcome::error(err.payload_message(), err.error_code())
    }
}

// =============================================================================
// Addressing
// =============================================================================

/// Which pending request a result answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Stmt {
        generation: Generation,
        transaction_id: TransactionId,
        action_index: ActionIndex,
    },
    Commit {
        generation: Generation,
        transaction_id: TransactionId,
    },
    Rollback {
        generation: Generation,
        transaction_id: TransactionId,
    },
    Init {
        previous_generation: Generation,
    },
}

// =============================================================================
// Formatting and Delivery
// =============================================================================

/// Formats one result for the script side.
pub fn format_result(names: &CallbackNames, address: &Address, outcome: &Outcome) -> String {
    let payload = json_string(&outcome.to_json());

    match address {
        Address::Stmt {
            generation,
            transaction_id,
            action_index,
        } => format!(
            "{}({},{},{},{})",
            names.stmt,
            json_string(generation.as_str()),
            transaction_id,
            action_index,
            payload
        ),
        Address::Commit {
            generation,
            transaction_id,
        } => format!(
            "{}({},{},{})",
            names.commit,
            json_string(generation.as_str()),
            transaction_id,
            payload
        ),
        Address::Rollback {
            generation,
            transaction_id,
        } => format!(
            "{}({},{},{})",
            names.rollback,
            json_string(generation.as_str()),
            transaction_id,
            payload
        ),
        Address::Init {
            previous_generation,
        } => format!(
            "{}({},{})",
            names.init,
            json_string(previous_generation.as_str()),
            payload
        ),
    }
}

/// Formats a result and hands it to `sink`.
pub fn dispatch(
    names: &CallbackNames,
    sink: Box<dyn ResultSink>,
    address: &Address,
    outcome: &Outcome,
) {
    sink.deliver(format_result(names, address, outcome));
}

/// Escapes `text` as a quoted JSON string literal.
///
/// U+2028 and U+2029 are legal in JSON strings but end a line in older
/// JavaScript parsers, so they are escaped as well.
pub fn json_string(text: &str) -> String {
    serde_json::Value::String(text.to_string())
        .to_string()
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

// =============================================================================
// Tests
// =============================================================================

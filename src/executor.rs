//! # Statement Executor
//!
//! Processes one Stmt command against a client's transaction state.
//!
//! ## Transaction State Machine
//!
//! ```text
//!                 Stmt(action 0)               Commit / Rollback /
//!   ┌────────┐  open + begin   ┌──────┐        generation change
//!   │ Absent │ ──────────────► │ Open │ ───────────────────────► Absent
//!   └────────┘                 └──────┘
//!        │ Stmt(action > 0)       │ Stmt(action 0)
//!        ▼                        ▼
//!   protocol error           protocol error, transaction untouched
//! ```
//!
//! A failing statement leaves its transaction `Open`. Only an explicit
//! Commit/Rollback or an invalidation changes transaction state.
//!
//! SQLite can still end a transaction on its own: `INSERT OR ROLLBACK`, a
//! `COMMIT` sent as a statement, or some I/O errors. Such a transaction stays
//! tracked but is poisoned: every later statement is refused with
//! `Error::TransactionEnded` so nothing runs in autocommit, and the client
//! has to Commit or Rollback to release it.
//!
//! ## Read vs Write
//!
//! Statements are classified by their leading keyword, after whitespace and
//! comments. Row-producing statements run as queries and return their rows;
//! everything else runs as a write and returns the change count.

use tracing::{debug, warn};

use crate::config::BindMode;
use crate::dispatch::Outcome;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::params::parse_bind_params;
use crate::registry::ClientContext;
use crate::types::{ActionIndex, TransactionId};

/// Leading keywords of row-producing statements.
const READ_KEYWORDS: &[&str] = &["SELECT", "WITH", "VALUES", "PRAGMA", "EXPLAIN"];

/// How a statement is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Read,
    Write,
}

/// Classifies `sql` by its leading keyword, case-insensitively.
pub fn classify(sql: &str) -> StatementKind {
    let keyword: String = skip_leading_trivia(sql)
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();

    if READ_KEYWORDS.contains(&keyword.as_str()) {
        StatementKind::Read
    } else {
        StatementKind::Write
    }
}

/// Strips leading whitespace, `-- line` and `/* block */` comments.
fn skip_leading_trivia(mut sql: &str) -> &str {
    loop {
        let trimmed = sql.trim_start();
        if let Some(rest) = trimmed.strip_prefix("--") {
            sql = rest.find('\n').map_or("", |idx| &rest[idx + 1..]);
        } else if let Some(rest) = trimmed.strip_prefix("/*") {
            sql = rest.find("*/").map_or("", |idx| &rest[idx + 2..]);
        } else {
            return trimmed;
        }
    }
}

/// One Stmt command, borrowed from the queued command.
#[derive(Debug, Clone, Copy)]
pub struct StmtRequest<'a> {
    pub transaction_id: TransactionId,
    pub action_index: ActionIndex,
    pub sql: &'a str,
    pub bind_params: Option<&'a str>,
}

/// Runs one statement inside its transaction.
///
/// # Errors
///
/// - `Error::Protocol` for a duplicate start or a missing transaction
/// - `Error::Params` for malformed bind parameters
/// - `Error::EmptyStatement` / `Error::MultipleStatements` unless `sql` holds
///   exactly one statement
/// - `Error::TransactionEnded` when the engine no longer has the transaction
/// - engine errors from open, begin, query or execute
///
/// In every error case the transaction keeps the state it had, except that a
/// start whose `begin` fails never becomes `Open`.
pub fn execute_stmt(
    engine: &mut dyn Engine,
    context: &mut ClientContext,
    request: StmtRequest<'_>,
    bind_mode: BindMode,
) -> Result<Outcome> {
    let StmtRequest {
        transaction_id,
        action_index,
        sql,
        bind_params,
    } = request;

    if action_index.is_begin() {
        if context.is_open(transaction_id) {
            return Err(Error::Protocol(format!(
                "duplicate transaction start: transaction {transaction_id} is already open"
            )));
        }

        let mut handle = engine.open(context.client_id())?;
        if let Err(e) = handle.begin() {
            if let Err(close_err) = handle.close() {
                debug!(error = %close_err, "closing handle after failed begin");
            }
            return Err(e);
        }
        debug!(client = %context.client_id(), transaction = %transaction_id, "transaction opened");
        context.insert(transaction_id, handle);
    } else if !context.is_open(transaction_id) {
        return Err(Error::Protocol(format!(
            "no matching open transaction {transaction_id} for action {action_index}"
        )));
    }

    let binds = parse_bind_params(bind_params, bind_mode)?;
    if skip_leading_trivia(sql).is_empty() {
        return Err(Error::EmptyStatement);
    }

    let client_id = context.client_id().clone();
    let handle = context.handle_mut(transaction_id).ok_or_else(|| {
        Error::Protocol(format!("no matching open transaction {transaction_id}"))
    })?;

    if !handle.in_transaction() {
        return Err(Error::TransactionEnded {
            transaction_id: transaction_id.as_raw(),
            reason: "ended by an earlier statement; commit or roll back to release it".into(),
        });
    }

    let result = match classify(sql) {
        StatementKind::Read => handle.query(sql, &binds).map(Outcome::rows),
        StatementKind::Write => handle.execute(sql, &binds).map(Outcome::affected),
    };

    if !handle.in_transaction() {
        let reason = match &result {
            Ok(_) => "the statement ended it".to_string(),
            Err(e) => format!("ended by failing statement: {}", e.payload_message()),
        };
        warn!(client = %client_id, transaction = %transaction_id, %reason, "engine ended transaction");
        return Err(Error::TransactionEnded {
            transaction_id: transaction_id.as_raw(),
            reason,
        });
    }

    result
}

// =============================================================================
// Tests
// =============================================================================

//! # Client Registry and Generation Invalidation
//!
//! The registry maps each client id to its [`ClientContext`]: the generation
//! the client is currently in, and the transactions it has open.
//!
//! ## Ownership
//!
//! The registry lives on the worker thread and is never shared. It needs no
//! lock because nothing else can reach it.
//!
//! ## Generation Invalidation
//!
//! Every command carries the generation (page load) it was issued from.
//! Before a command is processed, [`ClientRegistry::observe`] compares it with
//! the client's current generation:
//!
//! ```text
//!  current   incoming   action
//!  ───────   ────────   ──────────────────────────────────────────────
//!  none      g1         adopt g1                       → Adopted
//!  g1        g1         nothing                        → Unchanged
//!  g1        g2         rollback+close every handle,   → Replaced { g1 }
//!                       adopt g2
//! ```
//!
//! A reloaded page never sends Commit or Rollback for what it left open, so
//! this is the only point where those engine resources can be reclaimed.
//!
//! ## Invariant
//!
//! Every handle in `open_transactions` was opened under `current_generation`.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::engine::EngineHandle;
use crate::types::{ClientId, Generation, TransactionId};

// =============================================================================
// Client Context
// =============================================================================

/// Per-client session state.
pub struct ClientContext {
    client_id: ClientId,
    current_generation: Option<Generation>,
    open_transactions: HashMap<TransactionId, Box<dyn EngineHandle>>,
}

impl ClientContext {
    fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            current_generation: None,
            open_transactions: HashMap::new(),
        }
    }

    /// The client this context belongs to.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Generation of the client's current session, if any command was seen.
    pub fn current_generation(&self) -> Option<&Generation> {
        self.current_generation.as_ref()
    }

    /// True if `transaction_id` is in the `Open` state.
    pub fn is_open(&self, transaction_id: TransactionId) -> bool {
        self.open_transactions.contains_key(&transaction_id)
    }

    /// Number of open transactions.
    pub fn open_count(&self) -> usize {
        self.open_transactions.len()
    }

    /// Ids of open transactions, sorted.
    pub fn open_transaction_ids(&self) -> Vec<TransactionId> {
        let mut ids: Vec<TransactionId> = self.open_transactions.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Records a freshly begun transaction.
    ///
    /// Callers check [`is_open`](Self::is_open) first; a duplicate start is a
    /// protocol error handled before any handle is opened.
    pub fn insert(&mut self, transaction_id: TransactionId, handle: Box<dyn EngineHandle>) {
        let previous = self.open_transactions.insert(transaction_id, handle);
        debug_assert!(previous.is_none(), "transaction {transaction_id} opened twice");
    }

    /// Mutable access to an open transaction's handle.
    pub fn handle_mut(&mut self, transaction_id: TransactionId) -> Option<&mut Box<dyn EngineHandle>> {
        self.open_transactions.get_mut(&transaction_id)
    }

    /// Removes a transaction, moving it to `Absent`.
    pub fn take(&mut self, transaction_id: TransactionId) -> Option<Box<dyn EngineHandle>> {
        self.open_transactions.remove(&transaction_id)
    }

    /// Rolls back and closes every open transaction. Returns how many.
    fn abandon_all(&mut self) -> usize {
        let mut ids: Vec<TransactionId> = self.open_transactions.keys().copied().collect();
        ids.sort();

        let count = ids.len();
        for transaction_id in ids {
            if let Some(handle) = self.open_transactions.remove(&transaction_id) {
                abandon(&self.client_id, transaction_id, handle);
            }
        }
        count
    }
}

/// Rolls back and closes a handle whose owner is gone.
///
/// Failures are only logged: there is no live command to report them to.
pub fn abandon(client_id: &ClientId, transaction_id: TransactionId, mut handle: Box<dyn EngineHandle>) {
    if let Err(e) = handle.rollback() {
        warn!(client = %client_id, transaction = %transaction_id, error = %e, "rollback of abandoned transaction failed");
    }
    if let Err(e) = handle.close() {
        warn!(client = %client_id, transaction = %transaction_id, error = %e, "close of abandoned transaction failed");
    }
}

// =============================================================================
// Generation Check
// =============================================================================

/// What [`ClientRegistry::observe`] found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationCheck {
    /// First command for this client; the generation was adopted.
    Adopted,

    /// The client is still in the same generation.
    Unchanged,

    /// The client moved to a new generation.
    Replaced {
        /// Generation that was replaced.
        previous: Generation,
        /// Open transactions rolled back and closed.
        reclaimed: usize,
    },
}

impl GenerationCheck {
    /// Previous generation to report to an Init command.
    ///
    /// Only a replacement leaves client-side state to clean up; otherwise
    /// the sentinel is reported.
    pub fn previous_for_init(&self) -> Generation {
        match self {
            GenerationCheck::Replaced { previous, .. } => previous.clone(),
            _ => Generation::none(),
        }
    }
}

// =============================================================================
// Client Registry
// =============================================================================

/// Mapping from client id to client context.
///
/// Contexts are created lazily and never removed; their transaction maps may
/// empty out.
#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, ClientContext>,
}

impl ClientRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs generation invalidation for one incoming command.
    ///
    /// Returns the (possibly new) context together with what happened to it.
    pub fn observe(
        &mut self,
        client_id: &ClientId,
        generation: &Generation,
    ) -> (&mut ClientContext, GenerationCheck) {
        let context = self
            .clients
            .entry(client_id.clone())
            .or_insert_with(|| ClientContext::new(client_id.clone()));

        let check = match context.current_generation.clone() {
            None => {
                debug!(client = %client_id, generation = %generation, "adopting first generation");
                context.current_generation = Some(generation.clone());
                GenerationCheck::Adopted
            }
            Some(current) if current == *generation => GenerationCheck::Unchanged,
            Some(previous) => {
                let reclaimed = context.abandon_all();
                context.current_generation = Some(generation.clone());

                info!(
                    client = %client_id,
                    previous = %previous,
                    current = %generation,
                    reclaimed,
                    "generation changed, reclaimed open transactions"
                );

                GenerationCheck::Replaced {
                    previous,
                    reclaimed,
                }
            }
        };

        (context, check)
    }

    /// Looks up a client's context without creating it.
    pub fn get(&self, client_id: &ClientId) -> Option<&ClientContext> {
        self.clients.get(client_id)
    }

    /// Number of known clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Total open transactions across all clients.
    pub fn open_transaction_count(&self) -> usize {
        self.clients.values().map(ClientContext::open_count).sum()
    }

    /// Rolls back and closes every open transaction of every client.
    pub fn abandon_all(&mut self) -> usize {
        self.clients.values_mut().map(ClientContext::abandon_all).sum()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{call_log, calls, CallLog, Failures, RecordingHandle};

    fn handle(name: &str, log: &CallLog) -> Box<dyn EngineHandle> {
        Box::new(RecordingHandle::new(name, log))
    }

    #[test]
    fn test_first_generation_is_adopted() {
        let mut registry = ClientRegistry::new();
        let client = ClientId::new("app");

        let (context, check) = registry.observe(&client, &Generation::new("g1"));
        assert_eq!(check, GenerationCheck::Adopted);
        assert_eq!(context.current_generation(), Some(&Generation::new("g1")));
        assert_eq!(check.previous_for_init(), Generation::none());

        let (_, check) = registry.observe(&client, &Generation::new("g1"));
        assert_eq!(check, GenerationCheck::Unchanged);
        assert_eq!(registry.client_count(), 1);
    }

    #[test]
    fn test_generation_change_reclaims_handles() {
        let log = call_log();
        let mut registry = ClientRegistry::new();
        let client = ClientId::new("app");

        let (context, _) = registry.observe(&client, &Generation::new("g1"));
        context.insert(TransactionId::new(1), handle("t1", &log));
        context.insert(TransactionId::new(2), handle("t2", &log));
        assert_eq!(registry.open_transaction_count(), 2);

        let (context, check) = registry.observe(&client, &Generation::new("g2"));
        assert_eq!(
            check,
            GenerationCheck::Replaced {
                previous: Generation::new("g1"),
                reclaimed: 2,
            }
        );
        assert_eq!(context.open_count(), 0);
        assert_eq!(check.previous_for_init(), Generation::new("g1"));

        assert_eq!(
            calls(&log),
            vec!["t1:rollback", "t1:close", "t2:rollback", "t2:close"]
        );
    }

    #[test]
    fn test_clients_are_independent() {
        let log = call_log();
        let mut registry = ClientRegistry::new();
        let a = ClientId::new("a");
        let b = ClientId::new("b");

        registry
            .observe(&a, &Generation::new("g1"))
            .0
            .insert(TransactionId::new(1), handle("a1", &log));
        registry
            .observe(&b, &Generation::new("g1"))
            .0
            .insert(TransactionId::new(1), handle("b1", &log));

        registry.observe(&a, &Generation::new("g2"));

        assert_eq!(registry.get(&a).unwrap().open_count(), 0);
        assert!(registry.get(&b).unwrap().is_open(TransactionId::new(1)));
        assert_eq!(calls(&log), vec!["a1:rollback", "a1:close"]);
    }

    #[test]
    fn test_abandon_all_on_shutdown() {
        let log = call_log();
        let mut registry = ClientRegistry::new();
        let client = ClientId::new("app");

        registry
            .observe(&client, &Generation::new("g1"))
            .0
            .insert(TransactionId::new(5), handle("t5", &log));

        assert_eq!(registry.abandon_all(), 1);
        assert_eq!(registry.open_transaction_count(), 0);
        assert_eq!(calls(&log), vec!["t5:rollback", "t5:close"]);
    }

    #[test]
    fn test_failed_cleanup_still_reclaims() {
        let log = call_log();
        let mut registry = ClientRegistry::new();
        let client = ClientId::new("app");
        let broken = Failures {
            rollback: true,
            close: true,
            ..Failures::default()
        };

        let (context, _) = registry.observe(&client, &Generation::new("g1"));
        context.insert(
            TransactionId::new(1),
            Box::new(RecordingHandle::failing("t1", &log, broken)),
        );
        context.insert(TransactionId::new(2), handle("t2", &log));

        let (context, check) = registry.observe(&client, &Generation::new("g2"));
        assert_eq!(
            check,
            GenerationCheck::Replaced {
                previous: Generation::new("g1"),
                reclaimed: 2,
            }
        );
        assert_eq!(context.open_count(), 0);
        assert_eq!(context.current_generation(), Some(&Generation::new("g2")));

        // The failing rollback did not skip the close, nor the next handle.
        assert_eq!(
            calls(&log),
            vec!["t1:rollback", "t1:close", "t2:rollback", "t2:close"]
        );
    }
}

//! # The Serializing Worker
//!
//! One dedicated OS thread takes commands off the queue and processes each one
//! to completion, engine I/O and callback included, before taking the next.
//!
//! ```text
//!   CommandReceiver ──► dequeue ──► observe generation ──► Stmt   ─► executor
//!                          ▲                              Commit ─► finalize
//!                          │                              Rollback ► finalize
//!                          │                              Init   ─► report previous
//!                          │                                   │
//!                          └──────────── dispatch ◄────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **Total order**: commands complete in the order they were enqueued
//! - **Exclusive state**: the registry and every engine handle live on this
//!   thread only
//! - **Fault isolation**: an `Err` or a panic while processing one command
//!   becomes an error payload for that command; the loop keeps going
//!
//! ## Rust Concepts
//!
//! - **`catch_unwind`**: converts a panic into a value so a bug in one command
//!   (or one sink) cannot take the worker thread down
//! - **Drop-based signalling**: the worker holds a `Sender<()>` it never sends
//!   on; when the thread ends for any reason the sender drops and shutdown's
//!   `recv_timeout` wakes up

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::{BindMode, BrokerConfig, CallbackNames};
use crate::dispatch::{dispatch, Address, Outcome, ResultSink};
use crate::engine::Engine;
use crate::error::{Error, Result, CODE_UNKNOWN};
use crate::executor::{execute_stmt, StmtRequest};
use crate::queue::CommandReceiver;
use crate::registry::{ClientContext, ClientRegistry, GenerationCheck};
use crate::types::{ClientId, Command, CommandKind, Generation, TransactionId};

/// Name of the worker thread.
pub const WORKER_THREAD_NAME: &str = "txbroker-worker";

// =============================================================================
// Statistics
// =============================================================================

/// Counters updated by the worker, readable from any thread.
#[derive(Debug, Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    invalidations: AtomicU64,
    reclaimed: AtomicU64,
    open_transactions: AtomicUsize,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Commands processed, successful or not.
    pub processed: u64,
    /// Commands answered with an error payload.
    pub failed: u64,
    /// Commands whose processing panicked.
    pub panicked: u64,
    /// Generation changes observed.
    pub invalidations: u64,
    /// Transactions rolled back by generation changes.
    pub reclaimed: u64,
    /// Transactions open after the last processed command.
    pub open_transactions: usize,
}

impl WorkerStats {
    /// Copies the current counter values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            open_transactions: self.open_transactions.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Owns the engine and the client registry; processes one command at a time.
pub struct Worker {
    engine: Box<dyn Engine>,
    registry: ClientRegistry,
    bind_mode: BindMode,
    callback_names: CallbackNames,
    stats: Arc<WorkerStats>,
}

impl Worker {
    /// Creates a worker around `engine`.
    pub fn new(engine: Box<dyn Engine>, config: &BrokerConfig, stats: Arc<WorkerStats>) -> Self {
        Self {
            engine,
            registry: ClientRegistry::new(),
            bind_mode: config.bind_mode,
            callback_names: config.callback_names.clone(),
            stats,
        }
    }

    /// Read access to the registry.
    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Processes one command and delivers its result.
    ///
    /// Never panics and never returns an error: every failure ends up in the
    /// command's sink.
    pub fn process(&mut self, command: Command) {
        let Command {
            client_id,
            generation,
            kind,
            sink,
        } = command;

        let processed = panic::catch_unwind(AssertUnwindSafe(|| {
            self.handle(&client_id, &generation, &kind)
        }));

        let (address, outcome) = match processed {
            Ok((address, Ok(outcome))) => (address, outcome),
            Ok((address, Err(e))) => {
                debug!(client = %client_id, command = kind.name(), error = %e, "command failed");
                (address, Outcome::from(e))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(client = %client_id, command = kind.name(), panic = %message, "command processing panicked");
                self.stats.panicked.fetch_add(1, Ordering::Relaxed);
                (
                    fallback_address(&generation, &kind),
                    Outcome::error(format!("internal error: {message}"), CODE_UNKNOWN),
                )
            }
        };

        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        if !outcome.is_success() {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.stats
            .open_transactions
            .store(self.registry.open_transaction_count(), Ordering::Relaxed);

        self.deliver(&client_id, sink, &address, &outcome);
    }

    fn deliver(
        &self,
        client_id: &ClientId,
        sink: Box<dyn ResultSink>,
        address: &Address,
        outcome: &Outcome,
    ) {
        let names = &self.callback_names;
        let delivered = panic::catch_unwind(AssertUnwindSafe(move || dispatch(names, sink, address, outcome)));
        if let Err(payload) = delivered {
            warn!(client = %client_id, panic = %panic_message(payload.as_ref()), "result sink panicked");
        }
    }

    /// Runs invalidation, then the command itself.
    fn handle(
        &mut self,
        client_id: &ClientId,
        generation: &Generation,
        kind: &CommandKind,
    ) -> (Address, Result<Outcome>) {
        let (context, check) = self.registry.observe(client_id, generation);

        if let GenerationCheck::Replaced { reclaimed, .. } = &check {
            self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
            self.stats.reclaimed.fetch_add(*reclaimed as u64, Ordering::Relaxed);
        }

        match kind {
            CommandKind::Init => {
                let previous_generation = check.previous_for_init();
                debug!(client = %client_id, previous = %previous_generation, "init");
                (
                    Address::Init {
                        previous_generation,
                    },
                    Ok(Outcome::empty()),
                )
            }
            CommandKind::Commit { transaction_id } => (
                Address::Commit {
                    generation: generation.clone(),
                    transaction_id: *transaction_id,
                },
                finalize(context, *transaction_id, Finalize::Commit),
            ),
            CommandKind::Rollback { transaction_id } => (
                Address::Rollback {
                    generation: generation.clone(),
                    transaction_id: *transaction_id,
                },
                finalize(context, *transaction_id, Finalize::Rollback),
            ),
            CommandKind::Stmt {
                transaction_id,
                action_index,
                sql,
                bind_params,
            } => {
                let request = StmtRequest {
                    transaction_id: *transaction_id,
                    action_index: *action_index,
                    sql,
                    bind_params: bind_params.as_deref(),
                };
                (
                    Address::Stmt {
                        generation: generation.clone(),
                        transaction_id: *transaction_id,
                        action_index: *action_index,
                    },
                    execute_stmt(self.engine.as_mut(), context, request, self.bind_mode),
                )
            }
        }
    }

    /// Consumes commands until the queue is closed.
    ///
    /// Transactions still open when the loop ends are rolled back and closed.
    pub fn run(mut self, receiver: CommandReceiver) {
        info!("worker started");

        while let Some(command) = receiver.dequeue() {
            self.process(command);
        }

        let abandoned = self.registry.abandon_all();
        self.stats.open_transactions.store(0, Ordering::Relaxed);
        info!(abandoned, "worker stopped");
    }
}

// =============================================================================
// Commit / Rollback
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finalize {
    Commit,
    Rollback,
}

/// Ends a transaction and closes its handle.
///
/// An absent transaction counts as already finalized: the caller wants it
/// gone, and it is.
fn finalize(context: &mut ClientContext, transaction_id: TransactionId, how: Finalize) -> Result<Outcome> {
    let Some(mut handle) = context.take(transaction_id) else {
        debug!(
            client = %context.client_id(),
            transaction = %transaction_id,
            action = ?how,
            "no open transaction, nothing to finalize"
        );
        return Ok(Outcome::empty());
    };

    if how == Finalize::Commit && !handle.in_transaction() {
        warn!(client = %context.client_id(), transaction = %transaction_id, "commit of a transaction the engine already ended");
        if let Err(close_err) = handle.close() {
            warn!(error = %close_err, "close of ended transaction failed");
        }
        return Err(Error::TransactionEnded {
            transaction_id: transaction_id.as_raw(),
            reason: "nothing to commit; roll back instead".into(),
        });
    }

    let ended = match how {
        Finalize::Commit => handle.commit(),
        Finalize::Rollback => handle.rollback(),
    };

    if let Err(e) = ended {
        warn!(client = %context.client_id(), transaction = %transaction_id, action = ?how, error = %e, "finalize failed");
        if how == Finalize::Commit {
            if let Err(rollback_err) = handle.rollback() {
                warn!(error = %rollback_err, "rollback after failed commit failed");
            }
        }
        if let Err(close_err) = handle.close() {
            warn!(error = %close_err, "close after failed finalize failed");
        }
        return Err(e);
    }

    if let Err(e) = handle.close() {
        // The transaction already ended; only the connection leaked.
        warn!(client = %context.client_id(), transaction = %transaction_id, error = %e, "close failed");
    }

    debug!(client = %context.client_id(), transaction = %transaction_id, action = ?how, "transaction finalized");
    Ok(Outcome::empty())
}

/// Address used when processing panicked before producing one.
fn fallback_address(generation: &Generation, kind: &CommandKind) -> Address {
    match kind {
        CommandKind::Init => Address::Init {
            previous_generation: Generation::none(),
        },
        CommandKind::Commit { transaction_id } => Address::Commit {
            generation: generation.clone(),
            transaction_id: *transaction_id,
        },
        CommandKind::Rollback { transaction_id } => Address::Rollback {
            generation: generation.clone(),
            transaction_id: *transaction_id,
        },
        CommandKind::Stmt {
            transaction_id,
            action_index,
            ..
        } => Address::Stmt {
            generation: generation.clone(),
            transaction_id: *transaction_id,
            action_index: *action_index,
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Worker Thread
// =============================================================================

/// Handle to the running worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    thread: JoinHandle<()>,
    exited: Receiver<()>,
}

/// How the worker thread ended during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The worker finished within the grace period.
    Finished,
    /// The worker was still busy when the grace period ran out and was detached.
    Abandoned,
}

/// Spawns the worker on a dedicated thread.
pub fn spawn_worker(worker: Worker, receiver: CommandReceiver) -> Result<WorkerHandle> {
    let (exit_tx, exited) = mpsc::channel::<()>();

    let thread = thread::Builder::new()
        .name(WORKER_THREAD_NAME.to_string())
        .spawn(move || {
            let _exit_guard = exit_tx;
            worker.run(receiver);
        })
        .map_err(Error::Io)?;

    Ok(WorkerHandle { thread, exited })
}

impl WorkerHandle {
    /// Waits up to `grace` for the worker to exit.
    ///
    /// The queue must already be closed, or the worker never exits. A worker
    /// still busy after `grace` is detached; its open transactions are left to
    /// the engine's own teardown.
    pub fn join_within(self, grace: Duration) -> WorkerExit {
        match self.exited.recv_timeout(grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.thread.join().is_err() {
                    error!("worker thread panicked");
                }
                WorkerExit::Finished
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(grace_ms = grace.as_millis() as u64, "worker still busy after grace period, detaching");
                WorkerExit::Abandoned
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

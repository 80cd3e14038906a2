//! # Broker API
//!
//! [`Broker`] is the caller-facing side of the transaction broker. It owns the
//! command queue and the worker thread, and exposes the four operations a
//! script host needs:
//!
//! | Operation | Result address |
//! |-----------|----------------|
//! | [`Broker::initialize`] | previous generation |
//! | [`Broker::run_stmt`] | generation, transaction, action |
//! | [`Broker::run_commit`] | generation, transaction |
//! | [`Broker::run_rollback`] | generation, transaction |
//!
//! Each one enqueues a command and returns immediately. The result arrives
//! later, exactly once, through the sink passed with the command. A full or
//! closed queue is reported synchronously as `Err`, never through the sink.
//!
//! ## Lifecycle
//!
//! ```text
//!   Broker::new ──► start ──► ... run_* ... ──► shutdown
//!       │                                          │
//!   commands may be                    pending commands dropped,
//!   queued already                     in-flight one gets a grace period
//! ```
//!
//! ## Async Conveniences
//!
//! The `*_async` methods wrap the same operations with a
//! `tokio::sync::oneshot` sink and await the formatted result. They share the
//! queue, its capacity, and its ordering with the callback-based methods.
//!
//! ## Example
//!
//! ```rust,no_run
//! use txbroker::{Broker, BrokerConfig, SqliteEngine};
//!
//! let engine = SqliteEngine::open_dir("/tmp/txbroker")?;
//! let broker = Broker::open(BrokerConfig::default(), engine)?;
//!
//! broker.initialize("com.example.app", "page-1", |result: String| {
//!     println!("init: {result}");
//! })?;
//! broker.run_stmt("com.example.app", "page-1", 1, 0, "SELECT 1 AS one", None, |result: String| {
//!     println!("stmt: {result}");
//! })?;
//! broker.run_commit("com.example.app", "page-1", 1, |result: String| {
//!     println!("commit: {result}");
//! })?;
//!
//! broker.shutdown();
//! # Ok::<(), txbroker::Error>(())
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::dispatch::ResultSink;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::queue::{command_queue, CommandQueue, CommandReceiver};
use crate::types::{ActionIndex, ClientId, Command, CommandKind, Generation, TransactionId};
use crate::worker::{spawn_worker, StatsSnapshot, Worker, WorkerExit, WorkerHandle, WorkerStats};

// =============================================================================
// Broker
// =============================================================================

/// Owned handle to a transaction broker.
///
/// # Thread Safety
///
/// `Broker` is `Clone`, `Send` and `Sync`. Clones share one queue and one
/// worker; any number of caller threads may submit concurrently.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    config: BrokerConfig,
    queue: CommandQueue,
    /// One lock for start/shutdown transitions, so a shutdown racing a start
    /// always sees the worker it has to join.
    lifecycle: Mutex<Lifecycle>,
    stats: Arc<WorkerStats>,
}

/// Worker state as seen by `start` and `shutdown`.
enum Lifecycle {
    /// Worker and receiver waiting for `start`.
    Unstarted(Worker, CommandReceiver),
    /// Running worker thread, taken by `shutdown`.
    Running(WorkerHandle),
    Stopped,
}

impl Broker {
    /// Creates a broker around `engine` without starting its worker.
    ///
    /// Commands submitted before [`start`](Self::start) wait in the queue
    /// (and count against its capacity).
    ///
    /// # Errors
    ///
    /// `Error::Config` if `config` fails validation.
    pub fn new(config: BrokerConfig, engine: impl Engine + 'static) -> Result<Self> {
        config.validate()?;

        let (queue, receiver) = command_queue(config.queue_capacity);
        let stats = Arc::new(WorkerStats::default());
        let worker = Worker::new(Box::new(engine), &config, Arc::clone(&stats));

        Ok(Self {
            inner: Arc::new(BrokerInner {
                config,
                queue,
                lifecycle: Mutex::new(Lifecycle::Unstarted(worker, receiver)),
                stats,
            }),
        })
    }

    /// Creates and starts a broker.
    pub fn open(config: BrokerConfig, engine: impl Engine + 'static) -> Result<Self> {
        let broker = Self::new(config, engine)?;
        broker.start()?;
        Ok(broker)
    }

    /// Spawns the worker thread.
    ///
    /// # Errors
    ///
    /// - `Error::AlreadyStarted` on a second call
    /// - `Error::ShutDown` after [`shutdown`](Self::shutdown)
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = lock(&self.inner.lifecycle);
        if self.inner.queue.is_closed() {
            return Err(Error::ShutDown);
        }

        match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Unstarted(worker, receiver) => {
                *lifecycle = Lifecycle::Running(spawn_worker(worker, receiver)?);
            }
            Lifecycle::Running(handle) => {
                *lifecycle = Lifecycle::Running(handle);
                return Err(Error::AlreadyStarted);
            }
            Lifecycle::Stopped => return Err(Error::ShutDown),
        }
        drop(lifecycle);

        info!(
            capacity = self.inner.config.queue_capacity,
            pending = self.inner.queue.pending(),
            "broker started"
        );
        Ok(())
    }

    /// Stops the broker.
    ///
    /// New submissions fail with `Error::ShutDown` from here on. Pending
    /// commands are dropped without invoking their sinks. The command being
    /// processed, if any, gets `shutdown_grace` to finish; after that the
    /// worker is detached and its open transactions are abandoned.
    ///
    /// Calling `shutdown` again is a no-op returning `WorkerExit::Finished`.
    pub fn shutdown(&self) -> WorkerExit {
        if self.inner.queue.close() {
            info!(pending = self.inner.queue.pending(), "broker shutting down");
        }

        let previous = std::mem::replace(&mut *lock(&self.inner.lifecycle), Lifecycle::Stopped);
        match previous {
            // Never started: dropping the receiver drops every queued command.
            Lifecycle::Unstarted(worker, receiver) => {
                let discarded = receiver.discard_pending();
                debug!(discarded, "broker shut down before start");
                drop(worker);
                WorkerExit::Finished
            }
            Lifecycle::Running(handle) => {
                let exit = handle.join_within(self.inner.config.shutdown_grace);
                info!(exit = ?exit, "broker stopped");
                exit
            }
            Lifecycle::Stopped => WorkerExit::Finished,
        }
    }

    // =========================================================================
    // Caller-Facing Operations
    // =========================================================================

    /// Announces `generation` for `client_id`.
    ///
    /// The sink receives an init result naming the generation that was
    /// replaced, or the empty sentinel if there was nothing to clean up.
    pub fn initialize(
        &self,
        client_id: impl Into<ClientId>,
        generation: impl Into<Generation>,
        sink: impl ResultSink + 'static,
    ) -> Result<()> {
        self.submit(Command::new(client_id, generation, CommandKind::Init, Box::new(sink)))
    }

    /// Runs one statement of a transaction.
    ///
    /// `action_index` 0 begins the transaction. `bind_params` is JSON array
    /// text, parsed on the worker.
    #[allow(clippy::too_many_arguments)]
    pub fn run_stmt(
        &self,
        client_id: impl Into<ClientId>,
        generation: impl Into<Generation>,
        transaction_id: i64,
        action_index: u32,
        sql: impl Into<String>,
        bind_params: Option<String>,
        sink: impl ResultSink + 'static,
    ) -> Result<()> {
        let kind = CommandKind::Stmt {
            transaction_id: TransactionId::new(transaction_id),
            action_index: ActionIndex::new(action_index),
            sql: sql.into(),
            bind_params,
        };
        self.submit(Command::new(client_id, generation, kind, Box::new(sink)))
    }

    /// Commits a transaction. Committing an absent transaction succeeds.
    pub fn run_commit(
        &self,
        client_id: impl Into<ClientId>,
        generation: impl Into<Generation>,
        transaction_id: i64,
        sink: impl ResultSink + 'static,
    ) -> Result<()> {
        let kind = CommandKind::Commit {
            transaction_id: TransactionId::new(transaction_id),
        };
        self.submit(Command::new(client_id, generation, kind, Box::new(sink)))
    }

    /// Rolls back a transaction. Rolling back an absent transaction succeeds.
    pub fn run_rollback(
        &self,
        client_id: impl Into<ClientId>,
        generation: impl Into<Generation>,
        transaction_id: i64,
        sink: impl ResultSink + 'static,
    ) -> Result<()> {
        let kind = CommandKind::Rollback {
            transaction_id: TransactionId::new(transaction_id),
        };
        self.submit(Command::new(client_id, generation, kind, Box::new(sink)))
    }

    /// Enqueues a prebuilt command.
    ///
    /// # Errors
    ///
    /// - `Error::QueueFull` if `queue_capacity` commands are already pending
    /// - `Error::ShutDown` after [`shutdown`](Self::shutdown)
    pub fn submit(&self, command: Command) -> Result<()> {
        let client = command.client_id.clone();
        let kind = command.kind.name();

        self.inner.queue.enqueue(command).map_err(|e| {
            warn!(client = %client, command = kind, error = %e, "command rejected");
            e
        })
    }

    // =========================================================================
    // Async Conveniences
    // =========================================================================

    /// [`initialize`](Self::initialize), awaiting the formatted result.
    pub async fn initialize_async(
        &self,
        client_id: impl Into<ClientId>,
        generation: impl Into<Generation>,
    ) -> Result<String> {
        let (sink, result) = oneshot_sink();
        self.initialize(client_id, generation, sink)?;
        await_result(result).await
    }

    /// [`run_stmt`](Self::run_stmt), awaiting the formatted result.
    pub async fn stmt_async(
        &self,
        client_id: impl Into<ClientId>,
        generation: impl Into<Generation>,
        transaction_id: i64,
        action_index: u32,
        sql: impl Into<String>,
        bind_params: Option<String>,
    ) -> Result<String> {
        let (sink, result) = oneshot_sink();
        self.run_stmt(client_id, generation, transaction_id, action_index, sql, bind_params, sink)?;
        await_result(result).await
    }

    /// [`run_commit`](Self::run_commit), awaiting the formatted result.
    pub async fn commit_async(
        &self,
        client_id: impl Into<ClientId>,
        generation: impl Into<Generation>,
        transaction_id: i64,
    ) -> Result<String> {
        let (sink, result) = oneshot_sink();
        self.run_commit(client_id, generation, transaction_id, sink)?;
        await_result(result).await
    }

    /// [`run_rollback`](Self::run_rollback), awaiting the formatted result.
    pub async fn rollback_async(
        &self,
        client_id: impl Into<ClientId>,
        generation: impl Into<Generation>,
        transaction_id: i64,
    ) -> Result<String> {
        let (sink, result) = oneshot_sink();
        self.run_rollback(client_id, generation, transaction_id, sink)?;
        await_result(result).await
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// The configuration this broker was built with.
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Commands waiting for the worker.
    pub fn pending(&self) -> usize {
        self.inner.queue.pending()
    }

    /// True once the worker has been started and not yet shut down.
    pub fn is_running(&self) -> bool {
        !self.inner.queue.is_closed() && matches!(*lock(&self.inner.lifecycle), Lifecycle::Running(_))
    }

    /// Worker counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl Drop for BrokerInner {
    fn drop(&mut self) {
        // Last handle gone without shutdown: stop accepting and let the
        // worker drain out on its own.
        self.queue.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn oneshot_sink() -> (impl ResultSink + 'static, oneshot::Receiver<String>) {
    let (tx, rx) = oneshot::channel();
    let sink = move |formatted: String| {
        // The awaiting task may have been cancelled.
        let _ = tx.send(formatted);
    };
    (sink, rx)
}

async fn await_result(result: oneshot::Receiver<String>) -> Result<String> {
    // A dropped sender means the command was discarded at shutdown.
    result.await.map_err(|_| Error::ShutDown)
}

// =============================================================================
// Tests
// =============================================================================

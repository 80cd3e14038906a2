//! # Bounded Command Queue
//!
//! A fixed-capacity FIFO between any number of caller threads and the single
//! worker.
//!
//! ```text
//!   caller ─┐
//!   caller ─┼─ enqueue ─► [ c1 | c2 | ... | cN ] ─► dequeue ─► worker
//!   caller ─┘   (try_send)     capacity N          (recv)
//! ```
//!
//! ## Backpressure
//!
//! `enqueue` never blocks. Past capacity it fails with [`Error::QueueFull`]
//! and the caller decides what to do. Capacity counts commands waiting for the
//! worker; the command the worker is processing no longer occupies a slot.
//!
//! ## Closing
//!
//! [`CommandQueue::close`] drops the only sender. Later enqueues fail with
//! [`Error::ShutDown`], and the receiving side drops whatever was still
//! pending without invoking its sink.
//!
//! ## Rust Concepts
//!
//! - **`sync_channel`**: bounded MPSC channel from the standard library;
//!   `try_send` gives fail-fast semantics for free
//! - **`RwLock<Option<_>>`**: many concurrent enqueuers share the read lock;
//!   `close` takes the write lock once to drop the sender

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Error, Result};
use crate::types::Command;

/// State shared by both halves of the queue.
#[derive(Debug, Default)]
struct QueueState {
    pending: AtomicUsize,
    closed: AtomicBool,
}

/// Producer half, shared by every caller thread.
#[derive(Debug)]
pub struct CommandQueue {
    sender: RwLock<Option<SyncSender<Command>>>,
    capacity: usize,
    state: Arc<QueueState>,
}

/// Consumer half, owned by the worker.
#[derive(Debug)]
pub struct CommandReceiver {
    receiver: Receiver<Command>,
    state: Arc<QueueState>,
}

/// Creates a queue holding at most `capacity` pending commands.
///
/// # Panics
///
/// Panics if `capacity` is zero; `BrokerConfig::validate` rejects that first.
pub fn command_queue(capacity: usize) -> (CommandQueue, CommandReceiver) {
    assert!(capacity > 0, "command queue capacity must be at least 1");

    let (sender, receiver) = mpsc::sync_channel(capacity);
    let state = Arc::new(QueueState::default());

    (
        CommandQueue {
            sender: RwLock::new(Some(sender)),
            capacity,
            state: Arc::clone(&state),
        },
        CommandReceiver { receiver, state },
    )
}

impl CommandQueue {
    /// Appends a command, failing immediately if the queue is full or closed.
    ///
    /// On failure the command (and its sink) is dropped; the error is the
    /// caller's only signal.
    pub fn enqueue(&self, command: Command) -> Result<()> {
        let guard = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        let sender = guard.as_ref().ok_or(Error::ShutDown)?;

        // Count before sending so the worker never decrements below zero.
        self.state.pending.fetch_add(1, Ordering::SeqCst);

        match sender.try_send(command) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.state.pending.fetch_sub(1, Ordering::SeqCst);
                match err {
                    TrySendError::Full(_) => Err(Error::QueueFull {
                        capacity: self.capacity,
                    }),
                    TrySendError::Disconnected(_) => Err(Error::ShutDown),
                }
            }
        }
    }

    /// Stops accepting commands. Returns false if already closed.
    pub fn close(&self) -> bool {
        self.state.closed.store(true, Ordering::SeqCst);
        let mut guard = self.sender.write().unwrap_or_else(PoisonError::into_inner);
        guard.take().is_some()
    }

    /// True once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Number of commands waiting for the worker.
    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }

    /// Maximum number of pending commands.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl CommandReceiver {
    /// Blocks for the oldest pending command.
    ///
    /// Returns `None` once the queue is closed. Commands still buffered at that
    /// point are dropped unprocessed.
    pub fn dequeue(&self) -> Option<Command> {
        let command = self.receiver.recv().ok()?;
        self.state.pending.fetch_sub(1, Ordering::SeqCst);

        if self.state.closed.load(Ordering::SeqCst) {
            drop(command);
            let discarded = 1 + self.discard_pending();
            tracing::debug!(discarded, "dropping commands queued before shutdown");
            return None;
        }

        Some(command)
    }

    /// Drops every buffered command, returning how many were dropped.
    pub fn discard_pending(&self) -> usize {
        let mut discarded = 0;
        while let Ok(command) = self.receiver.try_recv() {
            self.state.pending.fetch_sub(1, Ordering::SeqCst);
            drop(command);
            discarded += 1;
        }
        discarded
    }
}

// =============================================================================
// Tests
// =============================================================================

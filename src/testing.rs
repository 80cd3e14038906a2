//! Engine doubles for unit tests.
//!
//! [`RecordingHandle`] logs every call as `"<name>:<call>"` into a shared
//! [`CallLog`] and can be told to fail individual calls, so tests can check
//! which cleanup steps ran after a failure.

use std::sync::{Arc, Mutex};

use rusqlite::ffi;

use crate::engine::{Engine, EngineHandle, Row};
use crate::error::{Error, Result};
use crate::params::BindValue;
use crate::types::ClientId;

/// Shared, ordered record of handle calls.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Which handle calls fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct Failures {
    pub begin: bool,
    pub commit: bool,
    pub rollback: bool,
    pub close: bool,
}

fn injected(name: &str, call: &str) -> Error {
    Error::Sqlite(rusqlite::Error::SqliteFailure(
        ffi::Error::new(ffi::SQLITE_IOERR),
        Some(format!("{call} failed on {name}")),
    ))
}

pub struct RecordingHandle {
    name: String,
    log: CallLog,
    fail: Failures,
    active: bool,
}

impl RecordingHandle {
    pub fn new(name: impl Into<String>, log: &CallLog) -> Self {
        Self::failing(name, log, Failures::default())
    }

    pub fn failing(name: impl Into<String>, log: &CallLog, fail: Failures) -> Self {
        Self {
            name: name.into(),
            log: Arc::clone(log),
            fail,
            active: false,
        }
    }

    fn record(&self, call: &str) {
        self.log.lock().unwrap().push(format!("{}:{call}", self.name));
    }
}

impl EngineHandle for RecordingHandle {
    fn begin(&mut self) -> Result<()> {
        self.record("begin");
        if self.fail.begin {
            return Err(injected(&self.name, "begin"));
        }
        self.active = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.record("commit");
        if self.fail.commit {
            return Err(injected(&self.name, "commit"));
        }
        self.active = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.record("rollback");
        if self.fail.rollback {
            return Err(injected(&self.name, "rollback"));
        }
        self.active = false;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.active
    }

    fn query(&mut self, _sql: &str, _binds: &[BindValue]) -> Result<Vec<Row>> {
        self.record("query");
        Ok(Vec::new())
    }

    fn execute(&mut self, _sql: &str, _binds: &[BindValue]) -> Result<u64> {
        self.record("execute");
        Ok(0)
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.record("close");
        if self.fail.close {
            return Err(injected(&self.name, "close"));
        }
        Ok(())
    }
}

/// Engine whose handles are [`RecordingHandle`]s named after the client.
pub struct RecordingEngine {
    log: CallLog,
    fail: Failures,
}

impl RecordingEngine {
    pub fn new(log: &CallLog, fail: Failures) -> Self {
        Self {
            log: Arc::clone(log),
            fail,
        }
    }
}

impl Engine for RecordingEngine {
    fn open(&mut self, client: &ClientId) -> Result<Box<dyn EngineHandle>> {
        Ok(Box::new(RecordingHandle::failing(
            client.as_str(),
            &self.log,
            self.fail,
        )))
    }
}

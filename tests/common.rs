#![allow(dead_code)]

use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use serde_json::Value;
use txbroker::engine::{Engine, EngineHandle, Row};
use txbroker::params::BindValue;
use txbroker::{Broker, BrokerConfig, ClientId, SqliteEngine};

/// How long a test waits for a single result before failing.
pub const RESULT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn temp_engine() -> (tempfile::TempDir, SqliteEngine) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let engine = SqliteEngine::open_dir(dir.path()).expect("create engine");
    (dir, engine)
}

/// Started broker over a fresh temp directory.
pub fn started_broker(config: BrokerConfig) -> (tempfile::TempDir, Broker) {
    let (dir, engine) = temp_engine();
    let broker = Broker::open(config, engine).expect("open broker");
    (dir, broker)
}

/// Broker whose worker has not been started yet.
pub fn unstarted_broker(config: BrokerConfig) -> (tempfile::TempDir, Broker) {
    let (dir, engine) = temp_engine();
    let broker = Broker::new(config, engine).expect("create broker");
    (dir, broker)
}

/// Channel collecting formatted results, one sink per command.
pub struct Results {
    tx: Sender<String>,
    rx: Receiver<String>,
}

impl Results {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx }
    }

    pub fn sink(&self) -> impl FnOnce(String) + Send + 'static {
        let tx = self.tx.clone();
        move |formatted: String| {
            let _ = tx.send(formatted);
        }
    }

    /// Sink source that can move to another thread.
    pub fn sinks(&self) -> Sinks {
        Sinks(self.tx.clone())
    }

    pub fn next(&self) -> String {
        self.rx
            .recv_timeout(RESULT_TIMEOUT)
            .expect("result not delivered in time")
    }

    pub fn try_next(&self, wait: Duration) -> Option<String> {
        self.rx.recv_timeout(wait).ok()
    }
}

/// Cloneable, `Send` source of sinks feeding one [`Results`].
#[derive(Clone)]
pub struct Sinks(Sender<String>);

impl Sinks {
    pub fn sink(&self) -> impl FnOnce(String) + Send + 'static {
        let tx = self.0.clone();
        move |formatted: String| {
            let _ = tx.send(formatted);
        }
    }
}

/// A formatted result split back into its parts.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub function: String,
    pub address: Vec<Value>,
    pub payload: Value,
}

impl Decoded {
    pub fn is_success(&self) -> bool {
        self.payload.get("error").is_none()
    }

    pub fn error_message(&self) -> &str {
        self.payload["error"].as_str().unwrap_or("")
    }

    pub fn error_code(&self) -> i64 {
        self.payload["errorCode"].as_i64().expect("error code")
    }

    pub fn rows(&self) -> &Vec<Value> {
        self.payload["rows"].as_array().expect("rows")
    }
}

/// Parses `name(arg, ..., "payload")` where every argument is JSON.
pub fn decode(formatted: &str) -> Decoded {
    let open = formatted.find('(').expect("opening paren");
    assert!(formatted.ends_with(')'), "no closing paren: {formatted}");

    let args: Vec<Value> =
        serde_json::from_str(&format!("[{}]", &formatted[open + 1..formatted.len() - 1]))
            .expect("arguments are JSON");
    let (payload, address) = args.split_last().expect("payload argument");
    let payload: Value =
        serde_json::from_str(payload.as_str().expect("payload is a string")).expect("payload JSON");

    Decoded {
        function: formatted[..open].to_string(),
        address: address.to_vec(),
        payload,
    }
}

pub fn next_decoded(results: &Results) -> Decoded {
    decode(&results.next())
}

// =============================================================================
// Faulty engine
// =============================================================================

/// Statements containing this marker panic inside the engine.
pub const PANIC_MARKER: &str = "/*panic*/";

/// SQLite engine whose handles panic on marked statements.
pub struct FaultyEngine {
    inner: SqliteEngine,
}

impl FaultyEngine {
    pub fn new(inner: SqliteEngine) -> Self {
        Self { inner }
    }
}

impl Engine for FaultyEngine {
    fn open(&mut self, client: &ClientId) -> txbroker::Result<Box<dyn EngineHandle>> {
        Ok(Box::new(FaultyHandle {
            inner: self.inner.open(client)?,
        }))
    }
}

struct FaultyHandle {
    inner: Box<dyn EngineHandle>,
}

impl EngineHandle for FaultyHandle {
    fn begin(&mut self) -> txbroker::Result<()> {
        self.inner.begin()
    }

    fn commit(&mut self) -> txbroker::Result<()> {
        self.inner.commit()
    }

    fn rollback(&mut self) -> txbroker::Result<()> {
        self.inner.rollback()
    }

    fn in_transaction(&self) -> bool {
        self.inner.in_transaction()
    }

    fn query(&mut self, sql: &str, binds: &[BindValue]) -> txbroker::Result<Vec<Row>> {
        if sql.contains(PANIC_MARKER) {
            panic!("engine blew up on query");
        }
        self.inner.query(sql, binds)
    }

    fn execute(&mut self, sql: &str, binds: &[BindValue]) -> txbroker::Result<u64> {
        if sql.contains(PANIC_MARKER) {
            panic!("engine blew up on execute");
        }
        self.inner.execute(sql, binds)
    }

    fn close(self: Box<Self>) -> txbroker::Result<()> {
        self.inner.close()
    }
}

/// Holds the worker inside a sink until released.
pub struct Gate {
    entered: Receiver<()>,
    release: Sender<()>,
}

impl Gate {
    /// Waits until the worker is inside the gated sink.
    pub fn wait_entered(&self) {
        self.entered
            .recv_timeout(RESULT_TIMEOUT)
            .expect("worker never reached the gated sink");
    }

    /// Lets the worker continue.
    pub fn release(&self) {
        let _ = self.release.send(());
    }
}

/// Sink that blocks the worker until [`Gate::release`], then forwards.
pub fn gated_sink(results: &Results) -> (impl FnOnce(String) + Send + 'static, Gate) {
    let (entered_tx, entered) = mpsc::channel::<()>();
    let (release, release_rx) = mpsc::channel::<()>();
    let forward = results.sink();

    let sink = move |formatted: String| {
        let _ = entered_tx.send(());
        let _ = release_rx.recv_timeout(Duration::from_secs(30));
        forward(formatted);
    };

    (sink, Gate { entered, release })
}

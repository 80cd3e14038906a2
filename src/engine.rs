//! # Relational Engine Adapter
//!
//! The broker never talks to SQLite directly. It goes through two traits:
//!
//! - [`Engine`]: opens a fresh handle for a client application
//! - [`EngineHandle`]: one connection carrying at most one transaction
//!
//! [`SqliteEngine`] is the production implementation: one database file per
//! client under a root directory, one `rusqlite::Connection` per open
//! transaction.
//!
//! ## Typed Column Extraction
//!
//! Read statements materialize every row into a [`Row`], an ordered
//! column-name → JSON value map. SQLite storage classes map as:
//!
//! | SQLite  | JSON |
//! |---------|------|
//! | NULL    | `null` |
//! | INTEGER | number |
//! | REAL    | number (`null` for NaN/infinity) |
//! | TEXT    | string |
//! | BLOB    | base64 string |
//!
//! ## Rust Concepts
//!
//! - **Trait objects**: `Box<dyn EngineHandle>` lets the registry hold handles
//!   without knowing the engine type
//! - **`self: Box<Self>`**: `close` consumes the handle, so a closed handle
//!   cannot be used again

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Batch, Connection, Statement};
use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};
use crate::params::BindValue;
use crate::types::ClientId;

/// One materialized result row, columns in select-list order.
pub type Row = Map<String, Value>;

// =============================================================================
// Engine Traits
// =============================================================================

/// Opens database handles for client applications.
///
/// Only the worker thread calls into an engine, so `Send` is enough.
pub trait Engine: Send {
    /// Opens a new handle on `client`'s database.
    fn open(&mut self, client: &ClientId) -> Result<Box<dyn EngineHandle>>;
}

/// A live database handle owned by one open transaction.
pub trait EngineHandle: Send {
    /// Starts a transaction.
    fn begin(&mut self) -> Result<()>;

    /// Marks the transaction successful and ends it.
    fn commit(&mut self) -> Result<()>;

    /// Ends the transaction without applying its writes.
    ///
    /// Succeeds without doing anything if the engine already ended it.
    fn rollback(&mut self) -> Result<()>;

    /// True while the transaction started by [`begin`](Self::begin) is
    /// still active on the engine side.
    fn in_transaction(&self) -> bool;

    /// Runs a row-producing statement and materializes every row.
    fn query(&mut self, sql: &str, binds: &[BindValue]) -> Result<Vec<Row>>;

    /// Runs a statement for its side effects, returning the change count.
    fn execute(&mut self, sql: &str, binds: &[BindValue]) -> Result<u64>;

    /// Releases the handle.
    fn close(self: Box<Self>) -> Result<()>;
}

// =============================================================================
// SQLite Engine
// =============================================================================

/// Default time a statement waits on a lock held by another connection.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Configuration for [`SqliteEngine`].
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Directory holding one database file per client.
    pub root: PathBuf,

    /// How long a statement waits for a lock before failing with `SQLITE_BUSY`.
    pub busy_timeout: Duration,

    /// Put client databases in WAL mode.
    pub journal_mode_wal: bool,
}

impl SqliteConfig {
    /// Default configuration rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            journal_mode_wal: true,
        }
    }
}

/// [`Engine`] backed by per-client SQLite files.
#[derive(Debug)]
pub struct SqliteEngine {
    config: SqliteConfig,
}

impl SqliteEngine {
    /// Creates the engine, creating the root directory if needed.
    pub fn new(config: SqliteConfig) -> Result<Self> {
        fs::create_dir_all(&config.root)?;
        Ok(Self { config })
    }

    /// Shorthand for `SqliteEngine::new(SqliteConfig::new(root))`.
    pub fn open_dir(root: impl AsRef<Path>) -> Result<Self> {
        Self::new(SqliteConfig::new(root.as_ref()))
    }

    /// Path of the database file for `client`.
    ///
    /// Client ids come from untrusted scripts, so anything outside
    /// `[A-Za-z0-9_.-]` is replaced before it touches the filesystem.
    pub fn database_path(&self, client: &ClientId) -> PathBuf {
        self.config
            .root
            .join(format!("{}.sqlite", sanitize_file_stem(client.as_str())))
    }
}

impl Engine for SqliteEngine {
    fn open(&mut self, client: &ClientId) -> Result<Box<dyn EngineHandle>> {
        let conn = Connection::open(self.database_path(client))?;
        conn.busy_timeout(self.config.busy_timeout)?;

        if self.config.journal_mode_wal {
            // Readers on other connections keep going while a transaction writes.
            conn.execute_batch("PRAGMA journal_mode = WAL")?;
            conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        }

        Ok(Box::new(SqliteHandle { conn }))
    }
}

fn sanitize_file_stem(raw: &str) -> String {
    let stem: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if stem.is_empty() {
        "_".to_string()
    } else {
        stem
    }
}

/// One SQLite connection, carrying at most one transaction.
///
/// Transaction state is read back from SQLite (`is_autocommit`) rather than
/// tracked here: statements such as `INSERT OR ROLLBACK` or a literal
/// `COMMIT` can end the transaction behind the handle's back.
struct SqliteHandle {
    conn: Connection,
}

impl SqliteHandle {
    /// Prepares `sql`, which must hold exactly one statement.
    ///
    /// `Connection::prepare` compiles only the first statement and ignores
    /// the rest, so the remainder is checked with a [`Batch`] first.
    fn prepare_single(&self, sql: &str) -> Result<Statement<'_>> {
        let mut batch = Batch::new(&self.conn, sql);
        let stmt = batch.next()?.ok_or(Error::EmptyStatement)?;

        // A trailing statement that fails to compile (it may depend on the
        // first one) is still a trailing statement.
        match batch.next() {
            Ok(None) => Ok(stmt),
            Ok(Some(_)) | Err(_) => Err(Error::MultipleStatements),
        }
    }
}

impl EngineHandle for SqliteHandle {
    fn begin(&mut self) -> Result<()> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        // Nothing left to undo once SQLite has ended the transaction itself.
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    fn query(&mut self, sql: &str, binds: &[BindValue]) -> Result<Vec<Row>> {
        let mut stmt = self.prepare_single(sql)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut rows = stmt.query(params_from_iter(binds.iter()))?;
        let mut out = Vec::new();

        while let Some(row) = rows.next()? {
            let mut record = Row::with_capacity(names.len());
            for (idx, name) in names.iter().enumerate() {
                record.insert(name.clone(), column_value(row.get_ref(idx)?));
            }
            out.push(record);
        }

        Ok(out)
    }

    fn execute(&mut self, sql: &str, binds: &[BindValue]) -> Result<u64> {
        let mut stmt = self.prepare_single(sql)?;
        let changed = stmt.execute(params_from_iter(binds.iter()))?;
        Ok(changed as u64)
    }

    fn close(self: Box<Self>) -> Result<()> {
        let SqliteHandle { conn } = *self;
        if !conn.is_autocommit() {
            conn.execute_batch("ROLLBACK")?;
        }
        conn.close().map_err(|(_, e)| Error::Sqlite(e))
    }
}

/// Converts one SQLite column into its JSON form.
pub fn column_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(BASE64.encode(bytes)),
    }
}

// =============================================================================
// Tests
// =============================================================================

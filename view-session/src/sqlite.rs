//! SQLite-backed sessions.
//!
//! Each session owns one connection. Writes are staged and executed by
//! `flush()` inside a single transaction; reads run immediately.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};
use view_common::{Error, Result};

use crate::session::{FlushMode, Session, SessionFactory};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens [`SqliteSession`]s against one database file.
pub struct SqliteSessionFactory {
    name: String,
    path: PathBuf,
    opened: AtomicU64,
    live: Arc<AtomicUsize>,
}

impl SqliteSessionFactory {
    /// Create a factory for the database at `path`, creating the file and
    /// running `bootstrap` (idempotent DDL) once.
    pub fn open(path: impl AsRef<Path>, bootstrap: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch(bootstrap)?;
        tracing::debug!(path = %path.display(), "SQLite session factory ready");

        Ok(Self {
            name: "sqlite".into(),
            path,
            opened: AtomicU64::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total sessions opened since creation.
    pub fn sessions_opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    /// Sessions currently open.
    pub fn live_sessions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl SessionFactory for SqliteSessionFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn open_session(&self) -> Result<Box<dyn Session>> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let seq = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        self.live.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(SqliteSession {
            id: format!("{}-{}", self.name, seq),
            conn: Some(conn),
            flush_mode: FlushMode::default(),
            pending: Vec::new(),
            live: Arc::clone(&self.live),
        }))
    }
}

struct StagedWrite {
    sql: String,
    params: Vec<Value>,
}

/// A session holding one SQLite connection and a queue of staged writes.
pub struct SqliteSession {
    id: String,
    conn: Option<Connection>,
    flush_mode: FlushMode,
    pending: Vec<StagedWrite>,
    live: Arc<AtomicUsize>,
}

impl SqliteSession {
    /// The underlying connection, for reads.
    pub fn connection(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| Error::Session(format!("session {} is closed", self.id)))
    }

    /// Stage a write for the next flush.
    pub fn stage(&mut self, sql: impl Into<String>, params: Vec<Value>) -> Result<()> {
        self.connection()?;
        self.pending.push(StagedWrite {
            sql: sql.into(),
            params,
        });
        Ok(())
    }

    /// Number of writes waiting for a flush.
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// Run a query and map each row. In [`FlushMode::Auto`] staged writes are
    /// flushed first so the query sees them.
    pub fn query<T, F>(&mut self, sql: &str, params: &[Value], map: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        if self.flush_mode == FlushMode::Auto {
            self.flush()?;
        }

        let conn = self.connection()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), map)?
            .collect::<rusqlite::Result<Vec<T>>>()?;
        Ok(rows)
    }

    /// Rowid of the most recent successful insert on this connection.
    pub fn last_insert_rowid(&self) -> Result<i64> {
        Ok(self.connection()?.last_insert_rowid())
    }
}

impl Session for SqliteSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn flush_mode(&self) -> FlushMode {
        self.flush_mode
    }

    fn set_flush_mode(&mut self, mode: FlushMode) {
        self.flush_mode = mode;
    }

    fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    fn flush(&mut self) -> Result<()> {
        let id = &self.id;
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::Session(format!("session {id} is closed")))?;
        if self.pending.is_empty() {
            return Ok(());
        }

        // Staged writes stay queued until the transaction commits.
        let tx = conn.transaction()?;
        for write in &self.pending {
            tx.execute(&write.sql, params_from_iter(write.params.iter()))?;
        }
        tx.commit()?;

        let count = self.pending.len();
        self.pending.clear();
        tracing::debug!(session = %self.id, writes = count, "Flushed session");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.conn.is_none() {
            return Err(Error::Session(format!("session {} is already closed", self.id)));
        }

        if self.flush_mode != FlushMode::Manual {
            self.flush()?;
        } else if !self.pending.is_empty() {
            tracing::warn!(
                session = %self.id,
                discarded = self.pending.len(),
                "Closing session with unflushed writes"
            );
            self.pending.clear();
        }

        if let Some(conn) = self.conn.take() {
            self.live.fetch_sub(1, Ordering::SeqCst);
            conn.close().map_err(|(_, e)| Error::from(e))?;
        }
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for SqliteSession {
    // Dropping without close releases the connection without flushing.
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            self.live.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(session = %self.id, "Session dropped without close");
        }
    }
}

//! Shared test helpers: a spy connection factory recording every call.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use sqlmap::config::ConnectionStrings;
use sqlmap::db::{BoundCommand, Connection, ConnectionFactory, JsonRow, SessionFactory};
use sqlmap::error::{SqlMapError, SqlMapResult};
use sqlmap::models::{ConnectionConfig, DatabaseType, IsolationLevel};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Calls observed by spy connections, in order.
#[derive(Debug, Default)]
pub struct Calls {
    log: Mutex<Vec<String>>,
    commands: Mutex<Vec<BoundCommand>>,
}

impl Calls {
    fn record(&self, call: impl Into<String>) {
        self.log.lock().unwrap().push(call.into());
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.log().iter().filter(|c| c.as_str() == call).count()
    }

    /// Calls that touched the database, excluding connect and close.
    pub fn io_count(&self) -> usize {
        self.log()
            .iter()
            .filter(|c| !matches!(c.as_str(), "connect" | "close"))
            .count()
    }

    pub fn commands(&self) -> Vec<BoundCommand> {
        self.commands.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpyBehavior {
    pub fail_commit: bool,
    pub fail_rollback: bool,
    /// Latency added to every fetch.
    pub delay: Option<Duration>,
    pub fail_execute: Option<String>,
    pub rows: Vec<JsonRow>,
}

pub struct SpyConnection {
    calls: Arc<Calls>,
    behavior: SpyBehavior,
    db_type: DatabaseType,
    closed: bool,
}

#[async_trait]
impl Connection for SpyConnection {
    fn database_type(&self) -> DatabaseType {
        self.db_type
    }

    async fn begin(&mut self, isolation: Option<IsolationLevel>) -> SqlMapResult<()> {
        match isolation {
            Some(level) => self.calls.record(format!("begin {}", level.as_sql())),
            None => self.calls.record("begin"),
        }
        Ok(())
    }

    async fn commit(&mut self) -> SqlMapResult<()> {
        self.calls.record("commit");
        if self.behavior.fail_commit {
            return Err(SqlMapError::database("commit failed", None, "retry"));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> SqlMapResult<()> {
        self.calls.record("rollback");
        if self.behavior.fail_rollback {
            return Err(SqlMapError::database("rollback failed", None, "reconnect"));
        }
        Ok(())
    }

    async fn fetch_rows(
        &mut self,
        command: &BoundCommand,
        limit: Option<usize>,
    ) -> SqlMapResult<Vec<JsonRow>> {
        self.calls.record("fetch");
        self.calls.commands.lock().unwrap().push(command.clone());
        if let Some(delay) = self.behavior.delay {
            tokio::time::sleep(delay).await;
        }
        let rows = self.behavior.rows.clone();
        Ok(match limit {
            Some(n) => rows.into_iter().take(n).collect(),
            None => rows,
        })
    }

    async fn execute(&mut self, command: &BoundCommand) -> SqlMapResult<u64> {
        self.calls.record("execute");
        self.calls.commands.lock().unwrap().push(command.clone());
        if let Some(message) = &self.behavior.fail_execute {
            return Err(SqlMapError::database(message.clone(), Some("40001".into()), ""));
        }
        Ok(1)
    }

    async fn close(&mut self) -> SqlMapResult<()> {
        if self.closed {
            return Err(SqlMapError::invalid_state("already closed"));
        }
        self.closed = true;
        self.calls.record("close");
        Ok(())
    }

    fn abandon(&mut self) {
        self.calls.record("abandon");
    }
}

pub struct SpyFactory {
    pub calls: Arc<Calls>,
    pub behavior: SpyBehavior,
    pub db_type: DatabaseType,
}

#[async_trait]
impl ConnectionFactory for SpyFactory {
    async fn connect(&self, _config: &ConnectionConfig) -> SqlMapResult<Box<dyn Connection>> {
        self.calls.record("connect");
        Ok(Box::new(SpyConnection {
            calls: self.calls.clone(),
            behavior: self.behavior.clone(),
            db_type: self.db_type,
            closed: false,
        }))
    }

    async fn close(&self) {
        self.calls.record("shutdown");
    }
}

/// Session factory over spy connections, with `Default` and `Archive`
/// connections configured.
pub fn spy_sessions(behavior: SpyBehavior) -> (SessionFactory, Arc<Calls>) {
    spy_sessions_for(DatabaseType::SQLite, behavior)
}

pub fn spy_sessions_for(db_type: DatabaseType, behavior: SpyBehavior) -> (SessionFactory, Arc<Calls>) {
    let calls = Arc::new(Calls::default());
    let connections = ConnectionStrings::from_map(
        [("Default", "sqlite:default.db"), ("Archive", "sqlite:archive.db")],
        "Default",
    )
    .unwrap();
    let factory = SpyFactory {
        calls: calls.clone(),
        behavior,
        db_type,
    };
    (
        SessionFactory::new(connections, Arc::new(factory)).unwrap(),
        calls,
    )
}

/// A single-column row `{ name: value }`.
pub fn row(name: &str, value: serde_json::Value) -> JsonRow {
    let mut row = JsonRow::new();
    row.insert(name.to_string(), value);
    row
}

pub fn count_row(n: i64) -> JsonRow {
    row("N", json!(n))
}

/// Write `contents` to `dir/name` and return the path.
pub fn write_map(dir: &std::path::Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

/// Log output written while a [`capture_logs`] guard is alive.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Capture this thread's log output until the guard is dropped.
pub fn capture_logs() -> (tracing::subscriber::DefaultGuard, LogBuffer) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    (tracing::subscriber::set_default(subscriber), buffer)
}

//! Sessions: one physical connection and at most one open transaction.
//!
//! A session is opened by a [`SessionFactory`](crate::db::SessionFactory),
//! used through `&mut` by one task at a time, and disposed with
//! [`Session::close`]. Closing rolls back a transaction that was never
//! committed, then releases the connection, in that order.

use crate::db::connection::{BoundCommand, Connection};
use crate::db::types::JsonRow;
use crate::error::{SqlMapError, SqlMapResult};
use crate::models::{DatabaseType, IsolationLevel, TransactionState};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Metadata about the open transaction of a session.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    /// Unique transaction identifier
    pub transaction_id: String,
    /// Isolation level requested at begin, if any
    pub isolation: Option<IsolationLevel>,
    /// When the transaction started
    pub started_at: DateTime<Utc>,
}

pub struct Session {
    id: String,
    connection_name: String,
    connection: Option<Box<dyn Connection>>,
    transaction: Option<TransactionInfo>,
    last_outcome: TransactionState,
    closed: bool,
}

impl Session {
    pub(crate) fn new(connection_name: &str, connection: Box<dyn Connection>) -> Self {
        let id = generate_session_id();
        debug!(
            session_id = %id,
            connection = %connection_name,
            db_type = %connection.database_type(),
            "Session opened"
        );
        Self {
            id,
            connection_name: connection_name.to_string(),
            connection: Some(connection),
            transaction: None,
            last_outcome: TransactionState::NoTransaction,
            closed: false,
        }
    }

    /// Identifier used to correlate log lines of this session.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// `Active` while a transaction is open, otherwise the outcome of the
    /// last one (`NoTransaction` if none was ever started).
    pub fn transaction_state(&self) -> TransactionState {
        if self.transaction.is_some() {
            TransactionState::Active
        } else {
            self.last_outcome
        }
    }

    pub fn transaction_info(&self) -> Option<&TransactionInfo> {
        self.transaction.as_ref()
    }

    /// Database type of the underlying connection.
    pub fn database_type(&self) -> SqlMapResult<DatabaseType> {
        self.connection
            .as_ref()
            .map(|c| c.database_type())
            .ok_or_else(|| self.closed_error())
    }

    /// Begin a transaction at the driver's default isolation level.
    pub async fn begin_transaction(&mut self) -> SqlMapResult<()> {
        self.begin(None).await
    }

    pub async fn begin_transaction_with(&mut self, isolation: IsolationLevel) -> SqlMapResult<()> {
        self.begin(Some(isolation)).await
    }

    async fn begin(&mut self, isolation: Option<IsolationLevel>) -> SqlMapResult<()> {
        if let Some(active) = &self.transaction {
            return Err(SqlMapError::invalid_state(format!(
                "Transaction {} is already active on session {}",
                active.transaction_id, self.id
            )));
        }
        let connection = self.connection_mut()?;
        connection.begin(isolation).await?;

        let info = TransactionInfo {
            transaction_id: generate_transaction_id(),
            isolation,
            started_at: Utc::now(),
        };
        info!(
            session_id = %self.id,
            transaction_id = %info.transaction_id,
            connection = %self.connection_name,
            isolation = ?isolation,
            "Transaction started"
        );
        self.transaction = Some(info);
        Ok(())
    }

    /// Commit the open transaction.
    ///
    /// The transaction is cleared even when the commit fails.
    pub async fn commit(&mut self) -> SqlMapResult<()> {
        let info = self.take_transaction("commit")?;
        let result = self.connection_mut()?.commit().await;
        match &result {
            Ok(()) => {
                self.last_outcome = TransactionState::Committed;
                info!(
                    session_id = %self.id,
                    transaction_id = %info.transaction_id,
                    "Transaction committed"
                );
            }
            Err(e) => {
                self.last_outcome = TransactionState::NoTransaction;
                warn!(
                    session_id = %self.id,
                    transaction_id = %info.transaction_id,
                    error = %e,
                    "Transaction commit failed"
                );
            }
        }
        result
    }

    /// Roll back the open transaction.
    ///
    /// The transaction is cleared even when the rollback fails.
    pub async fn rollback(&mut self) -> SqlMapResult<()> {
        let info = self.take_transaction("roll back")?;
        let result = self.connection_mut()?.rollback().await;
        self.last_outcome = TransactionState::RolledBack;
        match &result {
            Ok(()) => info!(
                session_id = %self.id,
                transaction_id = %info.transaction_id,
                "Transaction rolled back"
            ),
            Err(e) => warn!(
                session_id = %self.id,
                transaction_id = %info.transaction_id,
                error = %e,
                "Transaction rollback failed"
            ),
        }
        result
    }

    /// Command handle bound to this session's connection and, when open,
    /// its transaction.
    pub fn command(&mut self) -> SqlMapResult<Command<'_>> {
        let in_transaction = self.transaction.is_some();
        if self.connection.is_none() {
            return Err(self.closed_error());
        }
        let session_id = self.id.as_str();
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| SqlMapError::invalid_state("Session is closed"))?;
        Ok(Command {
            session_id,
            connection,
            in_transaction,
        })
    }

    /// Dispose of the session.
    ///
    /// A dangling transaction is rolled back first, then the connection is
    /// released. If that rollback fails the connection is discarded instead,
    /// since it may still hold the open transaction. Calling `close` again is
    /// a no-op. The first cleanup failure is returned; all are logged.
    pub async fn close(&mut self) -> SqlMapResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let Some(mut connection) = self.connection.take() else {
            return Ok(());
        };

        if let Some(info) = self.transaction.take() {
            warn!(
                session_id = %self.id,
                transaction_id = %info.transaction_id,
                "Rolling back uncommitted transaction on session close"
            );
            self.last_outcome = TransactionState::RolledBack;
            if let Err(e) = connection.rollback().await {
                warn!(
                    session_id = %self.id,
                    transaction_id = %info.transaction_id,
                    error = %e,
                    "Rollback on close failed; discarding connection"
                );
                connection.abandon();
                return Err(e);
            }
        }

        let result = connection.close().await;
        match &result {
            Ok(()) => debug!(session_id = %self.id, "Session closed"),
            Err(e) => warn!(session_id = %self.id, error = %e, "Closing connection failed"),
        }
        result
    }

    fn take_transaction(&mut self, action: &str) -> SqlMapResult<TransactionInfo> {
        if self.closed {
            return Err(self.closed_error());
        }
        self.transaction.take().ok_or_else(|| {
            SqlMapError::invalid_state(format!(
                "Cannot {} on session {}: no transaction is active",
                action, self.id
            ))
        })
    }

    fn connection_mut(&mut self) -> SqlMapResult<&mut Box<dyn Connection>> {
        if self.connection.is_none() {
            return Err(self.closed_error());
        }
        self.connection
            .as_mut()
            .ok_or_else(|| SqlMapError::invalid_state("Session is closed"))
    }

    fn closed_error(&self) -> SqlMapError {
        SqlMapError::invalid_state(format!("Session {} is closed", self.id))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Some(mut connection) = self.connection.take() else {
            return;
        };
        if let Some(info) = self.transaction.take() {
            // No async context to roll back in: the connection must not be reused
            warn!(
                session_id = %self.id,
                transaction_id = %info.transaction_id,
                "Session dropped with an open transaction; discarding connection"
            );
            connection.abandon();
        } else {
            warn!(session_id = %self.id, "Session dropped without close");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("connection_name", &self.connection_name)
            .field("transaction", &self.transaction)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Command handle: the only way statements reach a session's connection.
pub struct Command<'a> {
    session_id: &'a str,
    connection: &'a mut Box<dyn Connection>,
    in_transaction: bool,
}

impl Command<'_> {
    pub fn session_id(&self) -> &str {
        self.session_id
    }

    pub fn database_type(&self) -> DatabaseType {
        self.connection.database_type()
    }

    /// Whether commands run inside the session's open transaction.
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub async fn fetch_rows(
        &mut self,
        command: &BoundCommand,
        limit: Option<usize>,
    ) -> SqlMapResult<Vec<JsonRow>> {
        self.connection.fetch_rows(command, limit).await
    }

    pub async fn execute(&mut self, command: &BoundCommand) -> SqlMapResult<u64> {
        self.connection.execute(command).await
    }
}

/// Generate a unique session ID.
fn generate_session_id() -> String {
    format!("ses_{}", uuid::Uuid::new_v4().simple())
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

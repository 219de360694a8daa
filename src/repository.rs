//! Repository base built on a private statement registry.
//!
//! A [`SqlMapRepository`] owns the statements of one definition file or of
//! several provider keys merged together, and opens a fresh session for
//! every call. Application repositories wrap one and expose domain methods:
//!
//! ```ignore
//! struct OrderRepository {
//!     base: SqlMapRepository,
//! }
//!
//! impl OrderRepository {
//!     async fn get_all(&self) -> SqlMapResult<Vec<Order>> {
//!         self.base.query_many("Order.GetAll", &Params::new()).await
//!     }
//! }
//! ```

use crate::db::{Session, SessionFactory, SqlMapper};
use crate::error::{SqlMapError, SqlMapResult};
use crate::mapping::{SqlMapProvider, StatementRegistry};
use crate::models::{Operation, Params};
use crate::transaction::{SessionFuture, close_quietly, complete};
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Where a repository's statements came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementSource {
    /// One definition file, given directly or resolved from a provider key.
    Single { key: Option<String>, path: PathBuf },
    /// Several provider keys merged into one registry, in key order.
    Multi { keys: Vec<String>, paths: Vec<PathBuf> },
}

#[derive(Debug, Clone)]
pub struct SqlMapRepository {
    sessions: SessionFactory,
    mapper: SqlMapper,
    connection: Option<String>,
    source: StatementSource,
}

impl SqlMapRepository {
    /// Repository over the statements of one definition file.
    pub fn from_file(sessions: SessionFactory, path: impl Into<PathBuf>) -> SqlMapResult<Self> {
        let path = path.into();
        let registry = StatementRegistry::from_file(&path)?;
        Ok(Self::build(
            sessions,
            registry,
            None,
            StatementSource::Single { key: None, path },
        ))
    }

    /// Repository over the file registered for `key` under `connection`.
    ///
    /// `None` means the session factory's default connection, for both the
    /// provider lookup and the calls.
    pub fn from_provider(
        sessions: SessionFactory,
        provider: &SqlMapProvider,
        key: &str,
        connection: Option<&str>,
    ) -> SqlMapResult<Self> {
        let connection = connection
            .unwrap_or_else(|| sessions.default_connection())
            .to_string();
        let path = provider.resolve(key, Some(&connection))?.to_path_buf();
        let registry = StatementRegistry::from_file(&path)?;
        Ok(Self::build(
            sessions,
            registry,
            Some(connection),
            StatementSource::Single {
                key: Some(key.to_string()),
                path,
            },
        ))
    }

    /// Repository over the files of several keys merged into one registry.
    ///
    /// Every missing key is reported in one error.
    pub fn from_provider_keys<S: AsRef<str>>(
        sessions: SessionFactory,
        provider: &SqlMapProvider,
        keys: &[S],
        connection: Option<&str>,
    ) -> SqlMapResult<Self> {
        if keys.is_empty() {
            return Err(SqlMapError::configuration(
                "At least one SQL map key is required",
                "Pass the provider keys this repository needs, e.g. [\"Order\", \"Customer\"]",
            ));
        }
        let connection = connection
            .unwrap_or_else(|| sessions.default_connection())
            .to_string();
        let paths: Vec<PathBuf> = provider
            .resolve_all(keys, Some(&connection))?
            .into_iter()
            .map(PathBuf::from)
            .collect();
        let registry = StatementRegistry::from_files(&paths)?;
        let keys: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
        debug!(
            keys = %keys.join(", "),
            statements = registry.len(),
            "Loaded SQL maps for repository"
        );
        Ok(Self::build(
            sessions,
            registry,
            Some(connection),
            StatementSource::Multi { keys, paths },
        ))
    }

    fn build(
        sessions: SessionFactory,
        registry: StatementRegistry,
        connection: Option<String>,
        source: StatementSource,
    ) -> Self {
        Self {
            sessions,
            mapper: SqlMapper::new(Arc::new(registry)),
            connection,
            source,
        }
    }

    /// Timeout for statements that do not declare their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.mapper = self.mapper.with_default_timeout(timeout);
        self
    }

    pub fn mapper(&self) -> &SqlMapper {
        &self.mapper
    }

    pub fn source(&self) -> &StatementSource {
        &self.source
    }

    pub fn sessions(&self) -> &SessionFactory {
        &self.sessions
    }

    /// Connection calls run on unless overridden with an `_on` method.
    pub fn connection_name(&self) -> &str {
        self.connection
            .as_deref()
            .unwrap_or_else(|| self.sessions.default_connection())
    }

    pub async fn query_many<T: DeserializeOwned>(
        &self,
        statement_id: &str,
        params: &Params,
    ) -> SqlMapResult<Vec<T>> {
        self.query_many_on(None, statement_id, params).await
    }

    /// Like [`query_many`](Self::query_many) on another named connection.
    pub async fn query_many_on<T: DeserializeOwned>(
        &self,
        connection: Option<&str>,
        statement_id: &str,
        params: &Params,
    ) -> SqlMapResult<Vec<T>> {
        self.mapper.resolve(statement_id, Operation::QueryMany)?;
        let mut session = self.open(connection).await?;
        let result = self
            .mapper
            .query_many(&mut session, statement_id, params)
            .await;
        close_quietly(&mut session).await;
        result
    }

    pub async fn query_one<T: DeserializeOwned>(
        &self,
        statement_id: &str,
        params: &Params,
    ) -> SqlMapResult<Option<T>> {
        self.query_one_on(None, statement_id, params).await
    }

    pub async fn query_one_on<T: DeserializeOwned>(
        &self,
        connection: Option<&str>,
        statement_id: &str,
        params: &Params,
    ) -> SqlMapResult<Option<T>> {
        self.mapper.resolve(statement_id, Operation::QueryOne)?;
        let mut session = self.open(connection).await?;
        let result = self
            .mapper
            .query_one(&mut session, statement_id, params)
            .await;
        close_quietly(&mut session).await;
        result
    }

    pub async fn scalar<T: DeserializeOwned>(
        &self,
        statement_id: &str,
        params: &Params,
    ) -> SqlMapResult<T> {
        self.scalar_on(None, statement_id, params).await
    }

    pub async fn scalar_on<T: DeserializeOwned>(
        &self,
        connection: Option<&str>,
        statement_id: &str,
        params: &Params,
    ) -> SqlMapResult<T> {
        self.mapper.resolve(statement_id, Operation::Scalar)?;
        let mut session = self.open(connection).await?;
        let result = self.mapper.scalar(&mut session, statement_id, params).await;
        close_quietly(&mut session).await;
        result
    }

    pub async fn execute(&self, statement_id: &str, params: &Params) -> SqlMapResult<u64> {
        self.execute_on(None, statement_id, params).await
    }

    pub async fn execute_on(
        &self,
        connection: Option<&str>,
        statement_id: &str,
        params: &Params,
    ) -> SqlMapResult<u64> {
        self.mapper.resolve(statement_id, Operation::Execute)?;
        let mut session = self.open(connection).await?;
        let result = self.mapper.execute(&mut session, statement_id, params).await;
        close_quietly(&mut session).await;
        result
    }

    /// Run `op` in one session and transaction: commit on `Ok`, roll back on
    /// `Err`, close the session either way.
    ///
    /// ```ignore
    /// repo.execute_in_transaction(|session, mapper| {
    ///     Box::pin(async move {
    ///         mapper.execute(session, "Order.Insert", &order).await?;
    ///         mapper.execute(session, "Stock.Decrement", &stock).await
    ///     })
    /// })
    /// .await?;
    /// ```
    pub async fn execute_in_transaction<R, F>(&self, op: F) -> SqlMapResult<R>
    where
        F: for<'a> FnOnce(&'a mut Session, &'a SqlMapper) -> SessionFuture<'a, R>,
    {
        self.execute_in_transaction_on(None, op).await
    }

    pub async fn execute_in_transaction_on<R, F>(
        &self,
        connection: Option<&str>,
        op: F,
    ) -> SqlMapResult<R>
    where
        F: for<'a> FnOnce(&'a mut Session, &'a SqlMapper) -> SessionFuture<'a, R>,
    {
        let mut session = self.open(connection).await?;
        if let Err(e) = session.begin_transaction().await {
            close_quietly(&mut session).await;
            return Err(e);
        }
        let result = op(&mut session, &self.mapper).await;
        let result = complete(&mut session, result).await;
        close_quietly(&mut session).await;
        result
    }

    async fn open(&self, connection: Option<&str>) -> SqlMapResult<Session> {
        match connection.or(self.connection.as_deref()) {
            Some(name) => self.sessions.open_named(name).await,
            None => self.sessions.open().await,
        }
    }
}

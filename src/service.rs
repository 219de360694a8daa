//! Explicit DAO contexts over a provider.
//!
//! [`SqlService`] picks a DAO (a provider key) and a connection, and hands
//! back a [`DaoContext`] carrying both. Nothing is stored in ambient state:
//! the context is a value the caller passes around.
//!
//! ```ignore
//! let orders = service.dao_on("Order", "Archive")?;
//! let mut conn = orders.connect().await?;
//! conn.begin().await?;
//! conn.execute("Order.Archive", &params).await?;
//! conn.commit().await?;
//! conn.close().await?;
//! ```

use crate::db::{Session, SessionFactory, SqlMapper};
use crate::error::{SqlMapError, SqlMapResult};
use crate::mapping::{SqlMapProvider, StatementRegistry};
use crate::models::{IsolationLevel, Params};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SqlService {
    sessions: SessionFactory,
    provider: Arc<SqlMapProvider>,
    default_timeout: Option<Duration>,
}

impl SqlService {
    pub fn new(sessions: SessionFactory, provider: impl Into<Arc<SqlMapProvider>>) -> Self {
        let provider = provider.into();
        if provider.default_connection() != sessions.default_connection() {
            warn!(
                provider_default = %provider.default_connection(),
                session_default = %sessions.default_connection(),
                "SQL map provider and session factory use different default connections"
            );
        }
        Self {
            sessions,
            provider,
            default_timeout: None,
        }
    }

    /// Timeout for statements that do not declare their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn sessions(&self) -> &SessionFactory {
        &self.sessions
    }

    pub fn provider(&self) -> &SqlMapProvider {
        &self.provider
    }

    /// DAO context for `key` on the default connection.
    pub fn dao(&self, key: &str) -> SqlMapResult<DaoContext> {
        let connection = self.sessions.default_connection().to_string();
        self.dao_on(key, &connection)
    }

    /// DAO context for `key` on the named connection.
    ///
    /// Fails when the key is not registered for that connection or the
    /// connection has no connection string.
    pub fn dao_on(&self, key: &str, connection: &str) -> SqlMapResult<DaoContext> {
        if key.trim().is_empty() {
            return Err(SqlMapError::configuration(
                "DAO name cannot be empty",
                "Pass a key registered with the provider, e.g. service.dao(\"Order\")",
            ));
        }
        if !self.sessions.has_connection(connection) {
            return Err(SqlMapError::configuration(
                format!("Connection '{}' is not configured", connection),
                format!(
                    "Add a '{}Connection' connection string (available: {})",
                    connection,
                    self.sessions.connection_names().join(", ")
                ),
            ));
        }

        let source = self.provider.resolve(key, Some(connection))?.to_path_buf();
        let registry = StatementRegistry::from_file(&source)?;
        let mut mapper = SqlMapper::new(Arc::new(registry));
        if let Some(timeout) = self.default_timeout {
            mapper = mapper.with_default_timeout(timeout);
        }
        debug!(
            dao = %key,
            connection = %connection,
            source = %source.display(),
            "Switched DAO context"
        );

        Ok(DaoContext {
            key: key.to_string(),
            connection_name: connection.to_string(),
            source,
            mapper,
            sessions: self.sessions.clone(),
        })
    }
}

/// A DAO's statements bound to one connection.
#[derive(Debug, Clone)]
pub struct DaoContext {
    key: String,
    connection_name: String,
    source: PathBuf,
    mapper: SqlMapper,
    sessions: SessionFactory,
}

impl DaoContext {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn mapper(&self) -> &SqlMapper {
        &self.mapper
    }

    /// Open a session on this context's connection.
    pub async fn connect(&self) -> SqlMapResult<MappedSession> {
        let session = self.sessions.open_named(&self.connection_name).await?;
        info!(
            dao = %self.key,
            connection = %self.connection_name,
            session_id = %session.id(),
            "SQL connection created"
        );
        Ok(MappedSession {
            dao: self.key.clone(),
            session,
            mapper: self.mapper.clone(),
        })
    }
}

/// A session paired with a DAO's statements.
#[derive(Debug)]
pub struct MappedSession {
    dao: String,
    session: Session,
    mapper: SqlMapper,
}

impl MappedSession {
    pub fn dao(&self) -> &str {
        &self.dao
    }

    pub fn connection_name(&self) -> &str {
        self.session.connection_name()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn in_transaction(&self) -> bool {
        self.session.in_transaction()
    }

    pub async fn begin(&mut self) -> SqlMapResult<()> {
        self.session.begin_transaction().await
    }

    pub async fn begin_with(&mut self, isolation: IsolationLevel) -> SqlMapResult<()> {
        self.session.begin_transaction_with(isolation).await
    }

    pub async fn commit(&mut self) -> SqlMapResult<()> {
        self.session.commit().await
    }

    pub async fn rollback(&mut self) -> SqlMapResult<()> {
        self.session.rollback().await
    }

    pub async fn close(&mut self) -> SqlMapResult<()> {
        self.session.close().await
    }

    pub async fn query_many<T: DeserializeOwned>(
        &mut self,
        statement_id: &str,
        params: &Params,
    ) -> SqlMapResult<Vec<T>> {
        self.mapper
            .query_many(&mut self.session, statement_id, params)
            .await
    }

    pub async fn query_one<T: DeserializeOwned>(
        &mut self,
        statement_id: &str,
        params: &Params,
    ) -> SqlMapResult<Option<T>> {
        self.mapper
            .query_one(&mut self.session, statement_id, params)
            .await
    }

    pub async fn scalar<T: DeserializeOwned>(
        &mut self,
        statement_id: &str,
        params: &Params,
    ) -> SqlMapResult<T> {
        self.mapper
            .scalar(&mut self.session, statement_id, params)
            .await
    }

    pub async fn execute(&mut self, statement_id: &str, params: &Params) -> SqlMapResult<u64> {
        self.mapper
            .execute(&mut self.session, statement_id, params)
            .await
    }

    pub async fn execute_procedure<T: DeserializeOwned>(
        &mut self,
        statement_id: &str,
        params: &Params,
    ) -> SqlMapResult<Vec<T>> {
        self.mapper
            .execute_procedure(&mut self.session, statement_id, params)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionStrings;

    fn service(provider: SqlMapProvider) -> SqlService {
        let connections = ConnectionStrings::from_map(
            [("Default", "sqlite::memory:"), ("Archive", "sqlite::memory:")],
            "Default",
        )
        .unwrap();
        SqlService::new(SessionFactory::with_pools(connections).unwrap(), provider)
    }

    #[test]
    fn test_dao_requires_registration() {
        let mut provider = SqlMapProvider::new();
        provider.add_file("Order", "SqlMaps/Order.xml", None, None);
        let service = service(provider);

        let err = service.dao_on("Order", "Archive").unwrap_err();
        assert!(err.is_configuration());
        assert!(err.suggestion().unwrap().contains("Some(\"Archive\")"));

        let err = service.dao("").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_dao_requires_connection() {
        let mut provider = SqlMapProvider::new();
        provider.add_file("Order", "SqlMaps/Order.xml", Some("Reporting"), None);
        let err = service(provider).dao_on("Order", "Reporting").unwrap_err();
        assert!(err.to_string().contains("Reporting"));
    }

    #[test]
    fn test_dao_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Order.xml");
        std::fs::write(&path, r#"<sqlMap><select id="Order.Count">SELECT 1</select></sqlMap>"#)
            .unwrap();
        let mut provider = SqlMapProvider::new();
        provider.add_file("Order", &path, Some("Archive"), None);

        let dao = service(provider).dao_on("Order", "Archive").unwrap();
        assert_eq!(dao.key(), "Order");
        assert_eq!(dao.connection_name(), "Archive");
        assert_eq!(dao.source(), path.as_path());
        assert!(dao.mapper().registry().contains("Order.Count"));
    }
}

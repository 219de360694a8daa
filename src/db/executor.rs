//! Statement execution engine.
//!
//! [`SqlMapper`] runs registered statements by id against a [`Session`]:
//! - Kind validation before any I/O
//! - Named placeholder rewriting per backend
//! - Per-statement timeouts and cooperative cancellation
//! - Row materialization into any `DeserializeOwned` type
//!
//! Every execution is logged with its statement id and elapsed time; driver
//! failures come back wrapped in [`SqlMapError::Execution`].

use crate::db::connection::BoundCommand;
use crate::db::placeholders::bind_params;
use crate::db::session::Session;
use crate::db::types::JsonRow;
use crate::error::{SqlMapError, SqlMapResult};
use crate::mapping::StatementRegistry;
use crate::models::{
    DEFAULT_QUERY_TIMEOUT_SECS, DatabaseType, Operation, Params, Statement,
};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Raw outcome of one statement execution.
enum Outcome {
    Rows(Vec<JsonRow>),
    Affected(u64),
}

impl Outcome {
    fn count(&self) -> u64 {
        match self {
            Outcome::Rows(rows) => rows.len() as u64,
            Outcome::Affected(n) => *n,
        }
    }

    fn into_rows(self) -> Vec<JsonRow> {
        match self {
            Outcome::Rows(rows) => rows,
            Outcome::Affected(_) => Vec::new(),
        }
    }
}

/// Executes statements from one registry.
#[derive(Debug, Clone)]
pub struct SqlMapper {
    registry: Arc<StatementRegistry>,
    default_timeout: Duration,
}

impl SqlMapper {
    /// Create a mapper over `registry` with the default statement timeout.
    pub fn new(registry: Arc<StatementRegistry>) -> Self {
        Self {
            registry,
            default_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
        }
    }

    /// Timeout for statements that do not declare their own.
    pub fn with_default_timeout(mut self, default_timeout: Duration) -> Self {
        self.default_timeout = default_timeout;
        self
    }

    pub fn registry(&self) -> &Arc<StatementRegistry> {
        &self.registry
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Look up a statement and check that `operation` may run it.
    pub fn resolve(&self, statement_id: &str, operation: Operation) -> SqlMapResult<Arc<Statement>> {
        let statement = self
            .registry
            .get(statement_id)
            .ok_or_else(|| SqlMapError::statement_not_found(statement_id))?;
        if !operation.accepts(statement.kind) {
            return Err(SqlMapError::type_mismatch(
                statement_id,
                statement.kind,
                operation.expected(),
            ));
        }
        Ok(statement)
    }

    /// Run a Select (or untyped) statement and materialize every row.
    pub async fn query_many<T: DeserializeOwned>(
        &self,
        session: &mut Session,
        statement_id: &str,
        params: &Params,
    ) -> SqlMapResult<Vec<T>> {
        self.rows(session, statement_id, Operation::QueryMany, params, None)
            .await
    }

    pub async fn query_many_cancellable<T: DeserializeOwned>(
        &self,
        session: &mut Session,
        statement_id: &str,
        params: &Params,
        cancel: &CancellationToken,
    ) -> SqlMapResult<Vec<T>> {
        self.rows(session, statement_id, Operation::QueryMany, params, Some(cancel))
            .await
    }

    /// Run a Select (or untyped) statement and materialize the first row.
    ///
    /// Zero rows is `Ok(None)`.
    pub async fn query_one<T: DeserializeOwned>(
        &self,
        session: &mut Session,
        statement_id: &str,
        params: &Params,
    ) -> SqlMapResult<Option<T>> {
        self.first_row(session, statement_id, params, None).await
    }

    pub async fn query_one_cancellable<T: DeserializeOwned>(
        &self,
        session: &mut Session,
        statement_id: &str,
        params: &Params,
        cancel: &CancellationToken,
    ) -> SqlMapResult<Option<T>> {
        self.first_row(session, statement_id, params, Some(cancel))
            .await
    }

    /// First column of the first row, or JSON null when there is none.
    ///
    /// Any statement kind may be used.
    pub async fn scalar<T: DeserializeOwned>(
        &self,
        session: &mut Session,
        statement_id: &str,
        params: &Params,
    ) -> SqlMapResult<T> {
        self.scalar_value(session, statement_id, params, None).await
    }

    pub async fn scalar_cancellable<T: DeserializeOwned>(
        &self,
        session: &mut Session,
        statement_id: &str,
        params: &Params,
        cancel: &CancellationToken,
    ) -> SqlMapResult<T> {
        self.scalar_value(session, statement_id, params, Some(cancel))
            .await
    }

    /// Run any statement and return the affected row count.
    pub async fn execute(
        &self,
        session: &mut Session,
        statement_id: &str,
        params: &Params,
    ) -> SqlMapResult<u64> {
        self.run(session, statement_id, Operation::Execute, params, None, |outcome| {
            Ok(outcome.count())
        })
        .await
    }

    pub async fn execute_cancellable(
        &self,
        session: &mut Session,
        statement_id: &str,
        params: &Params,
        cancel: &CancellationToken,
    ) -> SqlMapResult<u64> {
        self.run(
            session,
            statement_id,
            Operation::Execute,
            params,
            Some(cancel),
            |outcome| Ok(outcome.count()),
        )
        .await
    }

    /// Call a Procedure statement and materialize the rows it returns.
    pub async fn execute_procedure<T: DeserializeOwned>(
        &self,
        session: &mut Session,
        statement_id: &str,
        params: &Params,
    ) -> SqlMapResult<Vec<T>> {
        self.rows(session, statement_id, Operation::Procedure, params, None)
            .await
    }

    pub async fn execute_procedure_cancellable<T: DeserializeOwned>(
        &self,
        session: &mut Session,
        statement_id: &str,
        params: &Params,
        cancel: &CancellationToken,
    ) -> SqlMapResult<Vec<T>> {
        self.rows(session, statement_id, Operation::Procedure, params, Some(cancel))
            .await
    }

    async fn rows<T: DeserializeOwned>(
        &self,
        session: &mut Session,
        statement_id: &str,
        operation: Operation,
        params: &Params,
        cancel: Option<&CancellationToken>,
    ) -> SqlMapResult<Vec<T>> {
        self.run(session, statement_id, operation, params, cancel, |outcome| {
            outcome
                .into_rows()
                .into_iter()
                .map(|row| materialize(JsonValue::Object(row)))
                .collect()
        })
        .await
    }

    async fn first_row<T: DeserializeOwned>(
        &self,
        session: &mut Session,
        statement_id: &str,
        params: &Params,
        cancel: Option<&CancellationToken>,
    ) -> SqlMapResult<Option<T>> {
        self.run(session, statement_id, Operation::QueryOne, params, cancel, |outcome| {
            outcome
                .into_rows()
                .into_iter()
                .next()
                .map(|row| materialize(JsonValue::Object(row)))
                .transpose()
        })
        .await
    }

    async fn scalar_value<T: DeserializeOwned>(
        &self,
        session: &mut Session,
        statement_id: &str,
        params: &Params,
        cancel: Option<&CancellationToken>,
    ) -> SqlMapResult<T> {
        self.run(session, statement_id, Operation::Scalar, params, cancel, |outcome| {
            let value = outcome
                .into_rows()
                .into_iter()
                .next()
                .and_then(|row| row.into_iter().next().map(|(_, v)| v))
                .unwrap_or(JsonValue::Null);
            materialize(value)
        })
        .await
    }

    /// Execute, then convert the outcome with `finish`.
    ///
    /// Elapsed time and the success or failure log cover the conversion too.
    async fn run<R>(
        &self,
        session: &mut Session,
        statement_id: &str,
        operation: Operation,
        params: &Params,
        cancel: Option<&CancellationToken>,
        finish: impl FnOnce(Outcome) -> SqlMapResult<R>,
    ) -> SqlMapResult<R> {
        let statement = self.resolve(statement_id, operation)?;
        let mut command = session.command()?;
        let db_type = command.database_type();

        let prepared = if operation == Operation::Procedure {
            procedure_text(&statement, db_type, params)
        } else {
            Ok(statement.text.clone())
        }
        .and_then(|text| bind_params(statement_id, &text, params, db_type.placeholder_style()));
        let bound = match prepared {
            Ok(bound) => BoundCommand {
                statement_id: statement_id.to_string(),
                sql: bound.sql,
                params: bound.params,
            },
            Err(e) => {
                log_failure(statement_id, operation, 0, &e);
                return Err(e);
            }
        };
        let limit = match operation {
            Operation::QueryOne | Operation::Scalar => Some(1),
            _ => None,
        };
        let statement_timeout = statement.timeout.unwrap_or(self.default_timeout);

        debug!(
            statement_id = %statement_id,
            session_id = %command.session_id(),
            operation = operation.as_str(),
            in_transaction = command.in_transaction(),
            timeout_secs = statement_timeout.as_secs(),
            "Executing statement"
        );

        let start = Instant::now();
        let work = async {
            if operation == Operation::Execute {
                command.execute(&bound).await.map(Outcome::Affected)
            } else {
                command.fetch_rows(&bound, limit).await.map(Outcome::Rows)
            }
        };
        let timed = async {
            timeout(statement_timeout, work).await.unwrap_or_else(|_| {
                Err(SqlMapError::timeout(
                    format!("statement '{}'", statement_id),
                    statement_timeout.as_secs(),
                ))
            })
        };
        let outcome = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(SqlMapError::cancelled(format!("statement '{}'", statement_id))),
                result = timed => result,
            },
            None => timed.await,
        };
        let result = outcome.and_then(|outcome| {
            let rows = outcome.count();
            finish(outcome).map(|value| (rows, value))
        });
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok((rows, value)) => {
                info!(
                    statement_id = %statement_id,
                    operation = operation.as_str(),
                    rows,
                    elapsed_ms,
                    "Statement executed"
                );
                Ok(value)
            }
            Err(e) => {
                log_failure(statement_id, operation, elapsed_ms, &e);
                Err(SqlMapError::execution(statement_id, elapsed_ms, e))
            }
        }
    }
}

fn log_failure(statement_id: &str, operation: Operation, elapsed_ms: u64, error: &SqlMapError) {
    warn!(
        statement_id = %statement_id,
        operation = operation.as_str(),
        elapsed_ms,
        error = %error,
        "Statement failed"
    );
}

/// Deserialize a materialized row (or scalar) into the caller's type.
fn materialize<T: DeserializeOwned>(value: JsonValue) -> SqlMapResult<T> {
    serde_json::from_value(value)
        .map_err(|e| SqlMapError::decode(format!("Cannot map result to the requested type: {}", e)))
}

/// Statement text for procedure-call semantics.
///
/// A bare, possibly schema-qualified, name is expanded into a call with one
/// positional argument per parameter. Anything else runs as written.
fn procedure_text(statement: &Statement, db_type: DatabaseType, params: &Params) -> SqlMapResult<String> {
    if db_type == DatabaseType::SQLite {
        return Err(SqlMapError::execution(
            &statement.id,
            0,
            SqlMapError::unsupported("SQLite does not support stored procedures"),
        ));
    }

    let name = statement.text.trim();
    if !is_routine_name(name) {
        return Ok(statement.text.clone());
    }

    let args: Vec<String> = match db_type {
        DatabaseType::PostgreSQL => (1..=params.len()).map(|i| format!("${}", i)).collect(),
        _ => vec!["?".to_string(); params.len()],
    };
    Ok(match db_type {
        DatabaseType::PostgreSQL => format!("SELECT * FROM {}({})", name, args.join(", ")),
        _ => format!("CALL {}({})", name, args.join(", ")),
    })
}

fn is_routine_name(text: &str) -> bool {
    !text.is_empty()
        && text.split('.').all(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

//! Transaction helpers.
//!
//! Run a unit of work inside one session and one transaction: commit on
//! success, roll back and return the error on failure, always close the
//! session. [`with_retry`] re-runs the whole unit on deadlocks.

use crate::db::{Session, SessionFactory};
use crate::error::SqlMapResult;
use crate::models::IsolationLevel;
use futures_util::future::BoxFuture;
use std::time::Duration;
use tracing::{debug, warn};

/// Unit of work run against a session.
pub type SessionFuture<'a, R> = BoxFuture<'a, SqlMapResult<R>>;

/// Retry policy for [`with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Open a session, begin a transaction and run `op` in it.
pub async fn run_in_transaction<R, F>(
    sessions: &SessionFactory,
    connection: Option<&str>,
    isolation: Option<IsolationLevel>,
    op: F,
) -> SqlMapResult<R>
where
    F: for<'a> FnOnce(&'a mut Session) -> SessionFuture<'a, R>,
{
    let mut session = open(sessions, connection).await?;
    let begun = match isolation {
        Some(level) => session.begin_transaction_with(level).await,
        None => session.begin_transaction().await,
    };
    if let Err(e) = begun {
        close_quietly(&mut session).await;
        return Err(e);
    }

    let result = op(&mut session).await;
    let result = complete(&mut session, result).await;
    close_quietly(&mut session).await;
    result
}

/// Run `ops` one after another in a single transaction.
///
/// The first failure rolls back everything done so far.
pub async fn run_batch<F>(
    sessions: &SessionFactory,
    connection: Option<&str>,
    ops: Vec<F>,
) -> SqlMapResult<()>
where
    F: for<'a> FnOnce(&'a mut Session) -> SessionFuture<'a, ()> + Send + 'static,
{
    let count = ops.len();
    run_in_transaction(sessions, connection, None, move |session| {
        Box::pin(async move {
            for (index, op) in ops.into_iter().enumerate() {
                debug!(step = index + 1, of = count, "Running batch step");
                op(session).await?;
            }
            Ok(())
        })
    })
    .await
}

/// Like [`run_in_transaction`], retrying the whole transaction when it fails
/// on a deadlock or serialization conflict.
pub async fn with_retry<R, F>(
    sessions: &SessionFactory,
    connection: Option<&str>,
    policy: RetryPolicy,
    mut op: F,
) -> SqlMapResult<R>
where
    F: for<'a> FnMut(&'a mut Session) -> SessionFuture<'a, R>,
{
    let mut attempt = 1;
    loop {
        let result = run_in_transaction(sessions, connection, None, |session| op(session)).await;
        match result {
            Err(e) if e.is_deadlock() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transaction conflict; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Commit when `result` is `Ok`, otherwise roll back and keep the original error.
pub(crate) async fn complete<R>(session: &mut Session, result: SqlMapResult<R>) -> SqlMapResult<R> {
    match result {
        Ok(value) => {
            session.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if session.in_transaction() {
                if let Err(rollback_err) = session.rollback().await {
                    warn!(
                        session_id = %session.id(),
                        error = %rollback_err,
                        "Rollback after failure did not complete"
                    );
                }
            }
            Err(e)
        }
    }
}

/// Close a session, logging instead of returning a close failure.
pub(crate) async fn close_quietly(session: &mut Session) {
    if let Err(e) = session.close().await {
        warn!(session_id = %session.id(), error = %e, "Session close failed");
    }
}

async fn open(sessions: &SessionFactory, connection: Option<&str>) -> SqlMapResult<Session> {
    match connection {
        Some(name) => sessions.open_named(name).await,
        None => sessions.open().await,
    }
}

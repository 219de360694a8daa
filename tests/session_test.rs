//! Session lifecycle and executor contract tests against spy connections.

mod common;

use common::{SpyBehavior, capture_logs, count_row, row, spy_sessions, spy_sessions_for, write_map};
use serde_json::json;
use sqlmap::db::SqlMapper;
use sqlmap::error::SqlMapError;
use sqlmap::mapping::StatementRegistry;
use sqlmap::models::{
    DatabaseType, IsolationLevel, Param, Params, Statement, TransactionState,
};
use sqlmap::repository::SqlMapRepository;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn mapper() -> SqlMapper {
    let mut registry = StatementRegistry::new();
    registry
        .load_str(
            "T.xml",
            r#"<sqlMap>
  <select id="T.Count">SELECT COUNT(*) AS N FROM T</select>
  <select id="T.ById">SELECT * FROM T WHERE Id = @Id AND Name = @Name OR Id = @Id</select>
  <insert id="T.Insert">INSERT INTO T (Id, Name) VALUES (@Id, @Name)</insert>
  <update id="T.Rename">UPDATE T SET Name=@Name WHERE Id=@Id</update>
  <procedure id="T.Archive">archive_t</procedure>
</sqlMap>"#,
        )
        .unwrap();
    SqlMapper::new(Arc::new(registry))
}

#[tokio::test]
async fn test_double_begin_is_invalid_state() {
    let (sessions, calls) = spy_sessions(SpyBehavior::default());
    let mut session = sessions.open().await.unwrap();

    session.begin_transaction().await.unwrap();
    let err = session.begin_transaction().await.unwrap_err();
    assert!(matches!(err, SqlMapError::InvalidState { .. }));
    assert_eq!(calls.count("begin"), 1);
    assert_eq!(session.transaction_state(), TransactionState::Active);

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_commit_and_rollback_require_transaction() {
    let (sessions, calls) = spy_sessions(SpyBehavior::default());
    let mut session = sessions.open().await.unwrap();

    assert!(matches!(
        session.commit().await.unwrap_err(),
        SqlMapError::InvalidState { .. }
    ));
    assert!(matches!(
        session.rollback().await.unwrap_err(),
        SqlMapError::InvalidState { .. }
    ));
    assert_eq!(calls.count("commit"), 0);
    assert_eq!(calls.count("rollback"), 0);

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_transaction_state_machine() {
    let (sessions, calls) = spy_sessions(SpyBehavior::default());
    let mut session = sessions.open_named("Archive").await.unwrap();
    assert_eq!(session.transaction_state(), TransactionState::NoTransaction);

    assert!(session.transaction_info().is_none());

    session
        .begin_transaction_with(IsolationLevel::Serializable)
        .await
        .unwrap();
    let info = session.transaction_info().unwrap();
    assert!(info.transaction_id.starts_with("tx_"));
    assert_eq!(info.isolation, Some(IsolationLevel::Serializable));
    session.commit().await.unwrap();
    assert!(session.transaction_info().is_none());
    assert_eq!(session.transaction_state(), TransactionState::Committed);
    assert!(!session.in_transaction());

    session.begin_transaction().await.unwrap();
    session.rollback().await.unwrap();
    assert_eq!(session.transaction_state(), TransactionState::RolledBack);

    session.close().await.unwrap();
    assert_eq!(
        calls.log(),
        vec![
            "connect",
            "begin SERIALIZABLE",
            "commit",
            "begin",
            "rollback",
            "close"
        ]
    );
}

#[tokio::test]
async fn test_close_rolls_back_dangling_transaction_once() {
    let (sessions, calls) = spy_sessions(SpyBehavior::default());
    let mut session = sessions.open().await.unwrap();
    session.begin_transaction().await.unwrap();

    session.close().await.unwrap();
    session.close().await.unwrap();

    assert_eq!(calls.log(), vec!["connect", "begin", "rollback", "close"]);
    assert!(session.is_closed());
    assert_eq!(session.transaction_state(), TransactionState::RolledBack);
}

#[tokio::test]
async fn test_failed_commit_clears_transaction() {
    let (sessions, calls) = spy_sessions(SpyBehavior {
        fail_commit: true,
        ..Default::default()
    });
    let mut session = sessions.open().await.unwrap();
    session.begin_transaction().await.unwrap();

    assert!(session.commit().await.is_err());
    assert!(!session.in_transaction());
    assert!(matches!(
        session.commit().await.unwrap_err(),
        SqlMapError::InvalidState { .. }
    ));

    // Nothing left to roll back on close
    session.close().await.unwrap();
    assert_eq!(calls.count("rollback"), 0);
    assert_eq!(calls.count("close"), 1);
}

#[tokio::test]
async fn test_drop_with_open_transaction_abandons_connection() {
    let (sessions, calls) = spy_sessions(SpyBehavior::default());
    {
        let mut session = sessions.open().await.unwrap();
        session.begin_transaction().await.unwrap();
    }
    assert_eq!(calls.log(), vec!["connect", "begin", "abandon"]);
}

#[tokio::test]
async fn test_failed_rollback_on_close_abandons_connection() {
    let (sessions, calls) = spy_sessions(SpyBehavior {
        fail_rollback: true,
        ..Default::default()
    });
    let mut session = sessions.open().await.unwrap();
    session.begin_transaction().await.unwrap();

    let err = session.close().await.unwrap_err();
    assert!(err.to_string().contains("rollback failed"));
    assert!(session.is_closed());
    assert_eq!(calls.log(), vec!["connect", "begin", "rollback", "abandon"]);

    // Already disposed; neither close nor drop touches the connection again
    session.close().await.unwrap();
    drop(session);
    assert_eq!(calls.count("close"), 0);
    assert_eq!(calls.count("abandon"), 1);
}

#[tokio::test]
async fn test_factory_close_shuts_down_connection_factory() {
    let (sessions, calls) = spy_sessions(SpyBehavior::default());
    let mut session = sessions.open().await.unwrap();
    session.close().await.unwrap();

    sessions.clone().close().await;
    assert_eq!(calls.log(), vec!["connect", "close", "shutdown"]);
}

#[tokio::test]
async fn test_closed_session_rejects_commands() {
    let (sessions, _calls) = spy_sessions(SpyBehavior::default());
    let mut session = sessions.open().await.unwrap();
    session.close().await.unwrap();

    assert!(matches!(
        session.command(),
        Err(SqlMapError::InvalidState { .. })
    ));
    assert!(session.begin_transaction().await.is_err());
}

#[tokio::test]
async fn test_query_many_on_insert_does_no_io() {
    let (sessions, calls) = spy_sessions(SpyBehavior::default());
    let mut session = sessions.open().await.unwrap();

    let err = mapper()
        .query_many::<serde_json::Value>(&mut session, "T.Insert", &Params::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SqlMapError::TypeMismatch { .. }));

    let err = mapper()
        .execute(&mut session, "Missing.Stmt", &Params::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SqlMapError::StatementNotFound { .. }));

    session.close().await.unwrap();
    assert_eq!(calls.io_count(), 0);
}

#[tokio::test]
async fn test_named_parameters_bound_per_backend() {
    let params = Params::new().with("Id", 7).with("Name", "Widget");

    let (sessions, calls) = spy_sessions(SpyBehavior::default());
    let mut session = sessions.open().await.unwrap();
    let affected = mapper()
        .execute(&mut session, "T.Rename", &params)
        .await
        .unwrap();
    session.close().await.unwrap();
    assert_eq!(affected, 1);
    let commands = calls.commands();
    let command = &commands[0];
    assert_eq!(command.sql, "UPDATE T SET Name=? WHERE Id=?");
    assert_eq!(command.params, vec![Param::from("Widget"), Param::from(7)]);

    let (sessions, calls) = spy_sessions_for(DatabaseType::PostgreSQL, SpyBehavior::default());
    let mut session = sessions.open().await.unwrap();
    mapper()
        .query_many::<serde_json::Value>(&mut session, "T.ById", &params)
        .await
        .unwrap();
    session.close().await.unwrap();
    let commands = calls.commands();
    let command = &commands[0];
    assert_eq!(
        command.sql,
        "SELECT * FROM T WHERE Id = $1 AND Name = $2 OR Id = $1"
    );
    assert_eq!(command.params.len(), 2);
}

#[tokio::test]
async fn test_missing_parameter_is_reported_before_io() {
    let (sessions, calls) = spy_sessions(SpyBehavior::default());
    let mut session = sessions.open().await.unwrap();
    let err = mapper()
        .execute(&mut session, "T.Rename", &Params::new().with("Id", 1))
        .await
        .unwrap_err();
    session.close().await.unwrap();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("Name"));
    assert_eq!(calls.io_count(), 0);
}

#[tokio::test]
async fn test_binding_failure_is_logged_like_execution_failure() {
    let (sessions, _calls) = spy_sessions(SpyBehavior::default());
    let (_guard, logs) = capture_logs();
    let mut session = sessions.open().await.unwrap();
    mapper()
        .execute(&mut session, "T.Rename", &Params::new().with("Id", 1))
        .await
        .unwrap_err();
    session.close().await.unwrap();

    let logs = logs.contents();
    assert!(logs.contains("Statement failed"));
    assert!(logs.contains("statement_id=T.Rename"));
    assert!(!logs.contains("Executing statement"));
}

#[tokio::test]
async fn test_materialization_failure_is_timed_and_logged_as_failure() {
    let (sessions, _calls) = spy_sessions(SpyBehavior {
        rows: vec![row("N", json!("not a number"))],
        delay: Some(std::time::Duration::from_millis(20)),
        ..Default::default()
    });
    let (_guard, logs) = capture_logs();
    let mut session = sessions.open().await.unwrap();
    let err = mapper()
        .scalar::<i64>(&mut session, "T.Count", &Params::new())
        .await
        .unwrap_err();
    session.close().await.unwrap();

    match err {
        SqlMapError::Execution {
            statement_id,
            elapsed_ms,
            source,
        } => {
            assert_eq!(statement_id, "T.Count");
            assert!(elapsed_ms >= 20, "elapsed_ms = {elapsed_ms}");
            assert!(matches!(*source, SqlMapError::Decode { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    let logs = logs.contents();
    assert!(logs.contains("Statement failed"));
    assert!(!logs.contains("Statement executed"));
}

#[tokio::test]
async fn test_query_one_and_scalar() {
    let (sessions, calls) = spy_sessions(SpyBehavior {
        rows: vec![count_row(3), count_row(4)],
        ..Default::default()
    });
    let mut session = sessions.open().await.unwrap();
    let mapper = mapper();

    let n: i64 = mapper
        .scalar(&mut session, "T.Count", &Params::new())
        .await
        .unwrap();
    assert_eq!(n, 3);

    #[derive(serde::Deserialize)]
    struct CountRow {
        #[serde(rename = "N")]
        n: i64,
    }
    let first: Option<CountRow> = mapper
        .query_one(&mut session, "T.Count", &Params::new())
        .await
        .unwrap();
    assert_eq!(first.map(|r| r.n), Some(3));

    let all: Vec<CountRow> = mapper
        .query_many(&mut session, "T.Count", &Params::new())
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    session.close().await.unwrap();
    assert_eq!(calls.count("fetch"), 3);
}

#[tokio::test]
async fn test_zero_rows() {
    let (sessions, _calls) = spy_sessions(SpyBehavior::default());
    let mut session = sessions.open().await.unwrap();
    let mapper = mapper();

    let none: Option<serde_json::Value> = mapper
        .query_one(&mut session, "T.Count", &Params::new())
        .await
        .unwrap();
    assert!(none.is_none());

    let empty: Vec<serde_json::Value> = mapper
        .query_many(&mut session, "T.Count", &Params::new())
        .await
        .unwrap();
    assert!(empty.is_empty());

    let scalar: Option<i64> = mapper
        .scalar(&mut session, "T.Count", &Params::new())
        .await
        .unwrap();
    assert_eq!(scalar, None);

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_execution_failure_is_wrapped() {
    let (sessions, _calls) = spy_sessions(SpyBehavior {
        fail_execute: Some("no such table: T".to_string()),
        ..Default::default()
    });
    let mut session = sessions.open().await.unwrap();
    let err = mapper()
        .execute(
            &mut session,
            "T.Insert",
            &Params::new().with("Id", 1).with("Name", "a"),
        )
        .await
        .unwrap_err();
    session.close().await.unwrap();

    assert_eq!(err.statement_id(), Some("T.Insert"));
    assert!(err.to_string().contains("no such table: T"));
    assert!(matches!(err, SqlMapError::Execution { .. }));
}

#[tokio::test]
async fn test_cancelled_before_execution() {
    let (sessions, _calls) = spy_sessions(SpyBehavior::default());
    let mut session = sessions.open().await.unwrap();
    let token = CancellationToken::new();
    token.cancel();

    let err = mapper()
        .query_many_cancellable::<serde_json::Value>(
            &mut session,
            "T.Count",
            &Params::new(),
            &token,
        )
        .await
        .unwrap_err();
    session.close().await.unwrap();
    match err {
        SqlMapError::Execution { source, .. } => {
            assert!(matches!(*source, SqlMapError::Cancelled { .. }))
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_procedure_call_text() {
    let (sessions, calls) = spy_sessions_for(DatabaseType::MySQL, SpyBehavior::default());
    let mut session = sessions.open().await.unwrap();
    mapper()
        .execute_procedure::<serde_json::Value>(
            &mut session,
            "T.Archive",
            &Params::new().with("Year", 2024),
        )
        .await
        .unwrap();
    session.close().await.unwrap();
    assert_eq!(calls.commands()[0].sql, "CALL archive_t(?)");

    let (sessions, _calls) = spy_sessions(SpyBehavior::default());
    let mut session = sessions.open().await.unwrap();
    let err = mapper()
        .execute_procedure::<serde_json::Value>(&mut session, "T.Count", &Params::new())
        .await
        .unwrap_err();
    session.close().await.unwrap();
    assert!(matches!(err, SqlMapError::TypeMismatch { .. }));
}

#[tokio::test]
async fn test_statement_timeout_applies() {
    let mut registry = StatementRegistry::new();
    registry
        .register(Statement::select("Slow", "SELECT 1").with_timeout(std::time::Duration::from_secs(5)))
        .unwrap();
    let mapper = SqlMapper::new(Arc::new(registry));
    assert_eq!(
        mapper
            .resolve("Slow", sqlmap::models::Operation::QueryMany)
            .unwrap()
            .timeout,
        Some(std::time::Duration::from_secs(5))
    );
}

#[tokio::test]
async fn test_repository_never_connects_on_type_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_map(
        dir.path(),
        "T.xml",
        r#"<sqlMap><insert id="T.Insert">INSERT INTO T (Id) VALUES (@Id)</insert></sqlMap>"#,
    );
    let (sessions, calls) = spy_sessions(SpyBehavior::default());
    let repo = SqlMapRepository::from_file(sessions, &path).unwrap();

    let err = repo
        .query_many::<serde_json::Value>("T.Insert", &Params::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SqlMapError::TypeMismatch { .. }));

    let err = repo
        .query_one::<serde_json::Value>("Missing.Stmt", &Params::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SqlMapError::StatementNotFound { .. }));
    assert!(calls.log().is_empty());
}

#[tokio::test]
async fn test_repository_transaction_commits_or_rolls_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_map(
        dir.path(),
        "T.xml",
        r#"<sqlMap><insert id="T.Insert">INSERT INTO T (Id) VALUES (@Id)</insert></sqlMap>"#,
    );
    let (sessions, calls) = spy_sessions(SpyBehavior::default());
    let repo = SqlMapRepository::from_file(sessions, &path).unwrap();

    let affected = repo
        .execute_in_transaction(|session, mapper| {
            Box::pin(async move {
                let params = Params::new().with("Id", 1);
                let a = mapper.execute(session, "T.Insert", &params).await?;
                let b = mapper.execute(session, "T.Insert", &params).await?;
                Ok(a + b)
            })
        })
        .await
        .unwrap();
    assert_eq!(affected, 2);
    assert_eq!(
        calls.log(),
        vec!["connect", "begin", "execute", "execute", "commit", "close"]
    );

    let (sessions, calls) = spy_sessions(SpyBehavior::default());
    let repo = SqlMapRepository::from_file(sessions, &path).unwrap();
    let err = repo
        .execute_in_transaction_on(Some("Archive"), |session, mapper| {
            Box::pin(async move {
                mapper
                    .execute(session, "T.Insert", &Params::new().with("Id", 1))
                    .await?;
                mapper.execute(session, "Missing.Stmt", &Params::new()).await
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SqlMapError::StatementNotFound { .. }));
    assert_eq!(
        calls.log(),
        vec!["connect", "begin", "execute", "rollback", "close"]
    );
}

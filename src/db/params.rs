//! Parameter binding utilities for database queries.
//!
//! This module provides functions to bind [`Param`] values to database-specific
//! query objects.

use crate::models::Param;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &'q Param,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match param {
        Param::Null => query.bind(None::<String>),
        Param::Bool(v) => query.bind(*v),
        Param::Int(v) => query.bind(*v),
        Param::Float(v) => query.bind(*v),
        Param::String(v) => query.bind(v.as_str()),
        Param::Bytes(v) => query.bind(v.as_slice()),
        Param::Json(v) => query.bind(Json(v)),
    }
}

/// Bind a parameter to a PostgreSQL query.
pub(crate) fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q Param,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        Param::Null => query.bind(None::<String>),
        Param::Bool(v) => query.bind(*v),
        Param::Int(v) => query.bind(*v),
        Param::Float(v) => query.bind(*v),
        Param::String(v) => query.bind(v.as_str()),
        Param::Bytes(v) => query.bind(v.as_slice()),
        Param::Json(v) => query.bind(Json(v)),
    }
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q Param,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        Param::Null => query.bind(None::<String>),
        Param::Bool(v) => query.bind(*v),
        Param::Int(v) => query.bind(*v),
        Param::Float(v) => query.bind(*v),
        Param::String(v) => query.bind(v.as_str()),
        Param::Bytes(v) => query.bind(v.as_slice()),
        // SQLite doesn't have native JSON type, store as string
        Param::Json(v) => query.bind(v.to_string()),
    }
}

//! MySQL backend built on sqlx.
//!
//! Each [`MySqlSession`] owns exactly one server connection, so session
//! variables set by the pool (`FOREIGN_KEY_CHECKS`,
//! `information_schema_stats_expiry`) stay in effect between calls.
//! Statements on one session are serialized by an async mutex.

use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{Connection as _, Executor as _, Row as _, ValueRef as _};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

use crate::backend::{Backend, BackendError, Connection, Row, Value};
use crate::config::ConnectOptions;

/// [`Backend`] that opens sqlx MySQL connections.
#[derive(Debug, Clone, Default)]
pub struct MySqlBackend {
    _private: (),
}

impl MySqlBackend {
    /// Create the backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn connect_options(options: &ConnectOptions) -> MySqlConnectOptions {
    let opts = MySqlConnectOptions::new()
        .host(&options.host)
        .port(options.port)
        .username(&options.user)
        .password(&options.password);
    match &options.database {
        Some(database) => opts.database(database),
        None => opts,
    }
}

#[async_trait::async_trait]
impl Backend for MySqlBackend {
    type Connection = MySqlSession;

    async fn connect(&self, options: &ConnectOptions) -> Result<MySqlSession, BackendError> {
        let conn = MySqlConnection::connect_with(&connect_options(options))
            .await
            .map_err(|e| BackendError::Connect(e.to_string()))?;
        tracing::trace!(
            host = %options.host,
            database = options.database.as_deref().unwrap_or(""),
            "mysql session opened"
        );
        Ok(MySqlSession {
            conn: Mutex::new(Some(conn)),
            multi_statements: options.multi_statements,
        })
    }
}

/// One MySQL server session.
pub struct MySqlSession {
    conn: Mutex<Option<MySqlConnection>>,
    multi_statements: bool,
}

impl std::fmt::Debug for MySqlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlSession")
            .field("multi_statements", &self.multi_statements)
            .finish_non_exhaustive()
    }
}

impl MySqlSession {
    /// Lock the underlying sqlx connection for direct use.
    ///
    /// Other calls on this session wait until the guard is dropped.
    pub async fn raw(&self) -> Result<MappedMutexGuard<'_, MySqlConnection>, BackendError> {
        MutexGuard::try_map(self.conn.lock().await, Option::as_mut)
            .map_err(|_| BackendError::Closed)
    }
}

#[async_trait::async_trait]
impl Connection for MySqlSession {
    async fn execute(&self, sql: &str) -> Result<u64, BackendError> {
        let mut guard = self.raw().await?;
        let conn: &mut MySqlConnection = &mut guard;
        // Multi-statement text needs the text protocol; everything else goes
        // through an unnamed prepared statement, which the server limits to
        // one statement.
        let result = if self.multi_statements {
            conn.execute(sqlx::raw_sql(sql)).await
        } else {
            conn.execute(sqlx::query(sql).persistent(false)).await
        };
        result
            .map(|done| done.rows_affected())
            .map_err(|e| statement_error(sql, e))
    }

    async fn query(&self, sql: &str) -> Result<Vec<Row>, BackendError> {
        let mut guard = self.raw().await?;
        let conn: &mut MySqlConnection = &mut guard;
        let rows = if self.multi_statements {
            conn.fetch_all(sqlx::raw_sql(sql)).await
        } else {
            conn.fetch_all(sqlx::query(sql).persistent(false)).await
        }
        .map_err(|e| statement_error(sql, e))?;
        rows.iter().map(convert_row).collect()
    }

    async fn close(&self) -> Result<(), BackendError> {
        let conn = self.conn.lock().await.take();
        match conn {
            Some(conn) => conn
                .close()
                .await
                .map_err(|e| BackendError::Other(Box::new(e))),
            None => Ok(()),
        }
    }
}

fn statement_error(sql: &str, err: sqlx::Error) -> BackendError {
    match err {
        sqlx::Error::Database(db) => BackendError::statement(sql, db.message()),
        other => BackendError::Other(Box::new(other)),
    }
}

/// Read every column into a [`Value`], trying the narrowest matching type.
fn convert_row(row: &MySqlRow) -> Result<Row, BackendError> {
    let decode = |e: sqlx::Error| BackendError::Decode(e.to_string());
    let mut values = Vec::with_capacity(row.len());
    for idx in 0..row.len() {
        if row.try_get_raw(idx).map_err(decode)?.is_null() {
            values.push(Value::Null);
        } else if let Ok(v) = row.try_get::<i64, _>(idx) {
            values.push(Value::Int(v));
        } else if let Ok(v) = row.try_get::<u64, _>(idx) {
            values.push(Value::UInt(v));
        } else if let Ok(v) = row.try_get::<String, _>(idx) {
            values.push(Value::Text(v));
        } else {
            // information_schema reports some names as binary strings.
            let bytes = row.try_get::<Vec<u8>, _>(idx).map_err(decode)?;
            values.push(Value::Text(String::from_utf8_lossy(&bytes).into_owned()));
        }
    }
    Ok(Row::new(values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_options_carry_database() {
        let opts = ConnectOptions::new()
            .host("127.0.0.1")
            .port(3307)
            .database("test_0011223344556677");
        let mysql = connect_options(&opts);
        assert_eq!(mysql.get_host(), "127.0.0.1");
        assert_eq!(mysql.get_port(), 3307);
        assert_eq!(mysql.get_database(), Some("test_0011223344556677"));
    }

    #[test]
    fn test_connect_options_without_database() {
        let mysql = connect_options(&ConnectOptions::new());
        assert_eq!(mysql.get_database(), None);
    }

    fn closed_session(multi_statements: bool) -> MySqlSession {
        MySqlSession {
            conn: Mutex::new(None),
            multi_statements,
        }
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_session_futures_are_send() {
        let session = closed_session(false);
        assert_send(&session.execute("SELECT 1"));
        assert_send(&session.query("SELECT 1"));
        assert_send(&session.close());
    }

    #[tokio::test]
    async fn test_closed_session_rejects_statements() {
        for multi_statements in [false, true] {
            let session = closed_session(multi_statements);
            assert!(matches!(
                session.execute("SELECT 1").await,
                Err(BackendError::Closed)
            ));
            assert!(matches!(
                session.query("SELECT 1").await,
                Err(BackendError::Closed)
            ));
            assert!(session.close().await.is_ok());
        }
    }
}

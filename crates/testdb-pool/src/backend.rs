//! Database engine collaborator.
//!
//! The pool never speaks a wire protocol itself. Everything it needs from the
//! engine (open a session, run a statement, read rows, close) goes through the
//! [`Backend`] and [`Connection`] traits defined here. The `mysql` feature
//! provides a sqlx-backed implementation; `testdb-testing` provides an
//! in-memory one.

use std::fmt;
use std::future::Future;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectOptions;

/// Errors reported by a [`Backend`] or [`Connection`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// Opening a session failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The server rejected a statement.
    #[error("statement failed: {message} (sql: {sql})")]
    Statement {
        /// Statement text that failed.
        sql: String,
        /// Server-provided message.
        message: String,
    },

    /// A row value could not be read as the requested type.
    #[error("decode error: {0}")]
    Decode(String),

    /// The session was already closed.
    #[error("connection closed")]
    Closed,

    /// The round trip was abandoned because its cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Any other driver error.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl BackendError {
    /// Build a [`BackendError::Statement`].
    pub fn statement(sql: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Statement {
            sql: sql.into(),
            message: message.into(),
        }
    }

    /// Check if this error came from a cancelled round trip.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A single column value read from a result row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// Signed integer.
    Int(i64),
    /// Unsigned integer (`BIGINT UNSIGNED` and friends).
    UInt(u64),
    /// Character data.
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

/// A result row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    /// Create a row from its column values.
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value at `idx`.
    pub fn value(&self, idx: usize) -> Result<&Value, BackendError> {
        self.values
            .get(idx)
            .ok_or_else(|| BackendError::Decode(format!("column index {idx} out of range")))
    }

    /// Read column `idx` as a signed integer.
    ///
    /// Unsigned values that fit and numeric text are accepted, since servers
    /// report session variables with varying types.
    pub fn get_i64(&self, idx: usize) -> Result<i64, BackendError> {
        match self.value(idx)? {
            Value::Int(v) => Ok(*v),
            Value::UInt(v) => i64::try_from(*v)
                .map_err(|_| BackendError::Decode(format!("value {v} does not fit in i64"))),
            Value::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| BackendError::Decode(format!("'{s}' is not an integer"))),
            Value::Null => Err(BackendError::Decode(format!("column {idx} is NULL"))),
        }
    }

    /// Read column `idx` as text, failing on `NULL`.
    pub fn get_string(&self, idx: usize) -> Result<String, BackendError> {
        self.get_opt_string(idx)?
            .ok_or_else(|| BackendError::Decode(format!("column {idx} is NULL")))
    }

    /// Read column `idx` as optional text.
    pub fn get_opt_string(&self, idx: usize) -> Result<Option<String>, BackendError> {
        match self.value(idx)? {
            Value::Null => Ok(None),
            other => Ok(Some(other.to_string())),
        }
    }
}

/// One server session.
///
/// Methods take `&self`: the pool shares the administrative session between
/// concurrent create/drop calls, and implementations are expected to
/// serialize statements internally. Session state (`SET` variables, the
/// current database) must persist across calls on the same value.
#[async_trait::async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Execute a statement and return the affected row count.
    ///
    /// Multiple `;`-separated statements are only accepted when the session
    /// was opened with [`ConnectOptions::multi_statements`] enabled.
    async fn execute(&self, sql: &str) -> Result<u64, BackendError>;

    /// Run a query and collect its rows.
    async fn query(&self, sql: &str) -> Result<Vec<Row>, BackendError>;

    /// Close the session. Closing twice is a no-op; statements on a closed
    /// session fail with [`BackendError::Closed`].
    async fn close(&self) -> Result<(), BackendError>;

    /// Run a query expected to produce exactly one row.
    async fn query_one(&self, sql: &str) -> Result<Row, BackendError> {
        self.query(sql)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Decode(format!("query returned no rows: {sql}")))
    }
}

/// Factory for [`Connection`]s.
#[async_trait::async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Session type produced by this backend.
    type Connection: Connection;

    /// Open a new session.
    async fn connect(&self, options: &ConnectOptions) -> Result<Self::Connection, BackendError>;
}

/// Drive `fut` unless `cancel` fires first.
///
/// Cancellation is checked before polling the round trip, so an already
/// cancelled token never starts any work.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(BackendError::Cancelled),
        res = fut => res,
    }
}

/// Quote a MySQL identifier with backticks, doubling embedded backticks.
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("users"), "`users`");
        assert_eq!(quote_identifier("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_row_get_i64_variants() {
        let row = Row::new(vec![
            Value::Int(-3),
            Value::UInt(7),
            Value::Text(" 42 ".into()),
            Value::Null,
            Value::UInt(u64::MAX),
        ]);
        assert_eq!(row.get_i64(0).unwrap(), -3);
        assert_eq!(row.get_i64(1).unwrap(), 7);
        assert_eq!(row.get_i64(2).unwrap(), 42);
        assert!(row.get_i64(3).is_err());
        assert!(row.get_i64(4).is_err());
        assert!(row.get_i64(5).is_err());
    }

    #[test]
    fn test_row_strings() {
        let row = Row::new(vec![Value::Text("test_ab".into()), Value::Null, Value::Int(5)]);
        assert_eq!(row.get_string(0).unwrap(), "test_ab");
        assert_eq!(row.get_opt_string(1).unwrap(), None);
        assert!(row.get_string(1).is_err());
        assert_eq!(row.get_string(2).unwrap(), "5");
        assert_eq!(row.len(), 3);
    }

    #[test]
    fn test_cancellable_passes_through() {
        let token = CancellationToken::new();
        let res = tokio_test::block_on(cancellable(&token, async { Ok::<_, BackendError>(5) }));
        assert_eq!(assert_ok!(res), 5);
    }

    #[test]
    fn test_cancellable_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let res = tokio_test::block_on(cancellable(&token, async { Ok::<_, BackendError>(5) }));
        assert!(assert_err!(res).is_cancelled());
    }

    #[tokio::test]
    async fn test_cancellable_cancelled_midway() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            child.cancel();
        });
        let res = cancellable(&token, async {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok::<_, BackendError>(())
        })
        .await;
        assert!(res.unwrap_err().is_cancelled());
    }
}

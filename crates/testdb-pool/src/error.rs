//! Pool error types.

use std::fmt;

use thiserror::Error;

use crate::backend::BackendError;

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// Pool is closed.
    #[error("pool is closed")]
    PoolClosed,

    /// Opening a session failed.
    #[error("failed to connect: {0}")]
    Connect(#[source] BackendError),

    /// The `CREATE DATABASE` statement failed.
    #[error("failed to create database: {0}")]
    CreateFailed(#[source] BackendError),

    /// Applying the schema script to a fresh database failed.
    #[error("failed to initialize database {database}: {source}")]
    InitializeFailed {
        /// Database that was being initialized.
        database: String,
        /// Underlying failure.
        #[source]
        source: BackendError,
    },

    /// Truncating a reused database failed; the database was discarded.
    #[error("failed to reset database {database}: {source}")]
    ResetFailed {
        /// Database that was being reset.
        database: String,
        /// Underlying failure.
        #[source]
        source: BackendError,
    },

    /// Dropping a database during close failed.
    #[error("failed to drop database {database}: {source}")]
    DropFailed {
        /// Database that was being dropped.
        database: String,
        /// Underlying failure.
        #[source]
        source: BackendError,
    },

    /// Closing a session during close failed.
    #[error("failed to close connection{}: {source}", fmt_database(.database))]
    CloseFailed {
        /// Database the session was bound to; `None` for the admin session.
        database: Option<String>,
        /// Underlying failure.
        #[source]
        source: BackendError,
    },

    /// One or more cleanup steps failed during [`Pool::close`](crate::Pool::close).
    #[error("{0}")]
    Close(CloseErrors),

    /// The OS random number generator failed.
    #[error("random name generation failed: {0}")]
    Random(#[source] getrandom::Error),

    /// Pool configuration error.
    #[error("pool configuration error: {0}")]
    Configuration(String),
}

fn fmt_database(database: &Option<String>) -> String {
    match database {
        Some(name) => format!(" to {name}"),
        None => " (admin)".to_owned(),
    }
}

impl PoolError {
    /// Check if this error was caused by a cancelled round trip.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.backend_error().is_some_and(BackendError::is_cancelled)
    }

    /// Underlying backend error, if this error wraps one.
    #[must_use]
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            Self::Connect(e) | Self::CreateFailed(e) => Some(e),
            Self::InitializeFailed { source, .. }
            | Self::ResetFailed { source, .. }
            | Self::DropFailed { source, .. }
            | Self::CloseFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Every failure collected while closing a pool.
#[derive(Debug, Default)]
pub struct CloseErrors {
    errors: Vec<PoolError>,
}

impl CloseErrors {
    pub(crate) fn push(&mut self, err: PoolError) {
        self.errors.push(err);
    }

    /// Number of failures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Whether nothing failed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Iterate over the failures in the order they happened.
    pub fn iter(&self) -> impl Iterator<Item = &PoolError> {
        self.errors.iter()
    }

    /// Consume into the individual failures.
    #[must_use]
    pub fn into_vec(self) -> Vec<PoolError> {
        self.errors
    }

    pub(crate) fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(PoolError::Close(self))
        }
    }
}

impl fmt::Display for CloseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_errors_display_joins_all() {
        let mut errors = CloseErrors::default();
        errors.push(PoolError::DropFailed {
            database: "test_01".into(),
            source: BackendError::Closed,
        });
        errors.push(PoolError::CloseFailed {
            database: None,
            source: BackendError::Connect("reset by peer".into()),
        });
        assert_eq!(errors.len(), 2);

        let msg = errors.into_result().err().map(|e| e.to_string());
        assert_eq!(
            msg.as_deref(),
            Some(
                "failed to drop database test_01: connection closed; \
                 failed to close connection (admin): connect failed: reset by peer"
            )
        );
    }

    #[test]
    fn test_empty_close_errors_is_ok() {
        assert!(CloseErrors::default().into_result().is_ok());
    }

    #[test]
    fn test_is_cancelled() {
        let err = PoolError::ResetFailed {
            database: "test_02".into(),
            source: BackendError::Cancelled,
        };
        assert!(err.is_cancelled());
        assert!(!PoolError::PoolClosed.is_cancelled());
        assert!(!PoolError::CreateFailed(BackendError::Closed).is_cancelled());
    }

    #[test]
    fn test_random_error_keeps_source() {
        use std::error::Error as _;

        let err = PoolError::Random(getrandom::Error::UNSUPPORTED);
        assert!(err.source().is_some());
        assert!(err.to_string().starts_with("random name generation failed: "));
    }

    #[test]
    fn test_close_failed_message_names_database() {
        let err = PoolError::CloseFailed {
            database: Some("test_03".into()),
            source: BackendError::Closed,
        };
        assert_eq!(
            err.to_string(),
            "failed to close connection to test_03: connection closed"
        );
    }
}

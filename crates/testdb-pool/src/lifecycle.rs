//! Database lifecycle operations.
//!
//! Stateless procedures the pool runs against the server: create a uniquely
//! named database, apply the schema script, truncate a used database back to
//! empty, and drop a database. None of them touch pool state.
//!
//! Every round trip issued on behalf of [`Pool::get`](crate::Pool::get) is
//! wrapped in [`cancellable`] so a fired token aborts it promptly.

use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, BackendError, Connection, cancellable, quote_identifier};
use crate::config::ConnectOptions;
use crate::error::PoolError;

/// Number of random bytes in a generated database name.
pub const NAME_RANDOM_BYTES: usize = 8;

const SELECT_CURRENT_DATABASE: &str = "SELECT DATABASE()";
const SELECT_STATS_EXPIRY: &str = "SELECT @@information_schema_stats_expiry";
const DISABLE_STATS_CACHE: &str = "SET information_schema_stats_expiry = 0";
const DISABLE_FOREIGN_KEY_CHECKS: &str = "SET FOREIGN_KEY_CHECKS = 0";
const ENABLE_FOREIGN_KEY_CHECKS: &str = "SET FOREIGN_KEY_CHECKS = 1";

/// Tables that may hold rows or have advanced their auto-increment counter.
/// Untouched tables are skipped.
const DIRTY_TABLES_QUERY: &str = "SELECT `table_name` FROM `information_schema`.`tables` \
     WHERE `table_schema` = DATABASE() AND (`table_rows` > 0 OR `auto_increment` > 1)";

/// Generate a database name: `prefix` followed by 16 hex characters drawn
/// from the OS random number generator.
pub fn generate_name(prefix: &str) -> Result<String, PoolError> {
    let mut buf = [0u8; NAME_RANDOM_BYTES];
    getrandom::getrandom(&mut buf).map_err(PoolError::Random)?;
    Ok(format!("{prefix}{}", hex::encode(buf)))
}

/// Create a new, empty database through the administrative session.
///
/// Returns the generated name. Nothing needs cleaning up on failure.
pub async fn create_database<C: Connection>(
    admin: &C,
    prefix: &str,
    cancel: &CancellationToken,
) -> Result<String, PoolError> {
    let name = generate_name(prefix)?;
    let sql = format!("CREATE DATABASE {}", quote_identifier(&name));
    cancellable(cancel, admin.execute(&sql))
        .await
        .map_err(PoolError::CreateFailed)?;
    tracing::debug!(database = %name, "database created");
    Ok(name)
}

/// Apply `ddl` to the database `name` over a scratch session.
///
/// The scratch session has multi-statement execution enabled so the whole
/// script runs as one batch, and is closed before returning. An empty script
/// skips the session entirely.
pub async fn initialize_database<B: Backend>(
    backend: &B,
    options: &ConnectOptions,
    name: &str,
    ddl: &str,
    cancel: &CancellationToken,
) -> Result<(), PoolError> {
    if ddl.trim().is_empty() {
        return Ok(());
    }

    let init_failed = |source: BackendError| PoolError::InitializeFailed {
        database: name.to_owned(),
        source,
    };

    let scratch_options = options.with_database(name).multi_statements(true);
    let scratch = cancellable(cancel, backend.connect(&scratch_options))
        .await
        .map_err(init_failed)?;

    let applied = cancellable(cancel, scratch.execute(ddl)).await;
    let closed = scratch.close().await;
    finish(applied, closed).map_err(init_failed)?;

    tracing::debug!(database = %name, "schema applied");
    Ok(())
}

/// Open the long-lived session handed out with a pooled database.
pub async fn open_database<B: Backend>(
    backend: &B,
    options: &ConnectOptions,
    name: &str,
    cancel: &CancellationToken,
) -> Result<B::Connection, PoolError> {
    cancellable(cancel, backend.connect(&options.with_database(name)))
        .await
        .map_err(|source| PoolError::InitializeFailed {
            database: name.to_owned(),
            source,
        })
}

/// Truncate every table that may hold data, leaving the schema in place.
///
/// Foreign-key checks are switched off for the truncation sequence and
/// switched back on afterwards even if a truncation failed. The first error
/// is reported; a restoration error only surfaces when everything before it
/// succeeded.
pub async fn reset_database<C: Connection>(
    conn: &C,
    cancel: &CancellationToken,
) -> Result<(), BackendError> {
    let tables = list_dirty_tables(conn, cancel).await?;
    if tables.is_empty() {
        return Ok(());
    }

    cancellable(cancel, conn.execute(DISABLE_FOREIGN_KEY_CHECKS)).await?;
    let truncated = truncate_tables(conn, &tables, cancel).await;
    let restored = cancellable(cancel, conn.execute(ENABLE_FOREIGN_KEY_CHECKS)).await;
    finish(truncated, restored)?;

    tracing::debug!(tables = tables.len(), "database reset");
    Ok(())
}

async fn truncate_tables<C: Connection>(
    conn: &C,
    tables: &[String],
    cancel: &CancellationToken,
) -> Result<(), BackendError> {
    for table in tables {
        let sql = format!("TRUNCATE TABLE {}", quote_identifier(table));
        cancellable(cancel, conn.execute(&sql)).await?;
    }
    Ok(())
}

/// List tables in the current database with a non-zero row estimate or an
/// advanced auto-increment counter.
///
/// Row estimates in `information_schema` are cached server-side, so the
/// session's `information_schema_stats_expiry` is forced to 0 for the query
/// and restored afterwards, whether or not the query succeeded.
pub async fn list_dirty_tables<C: Connection>(
    conn: &C,
    cancel: &CancellationToken,
) -> Result<Vec<String>, BackendError> {
    let expiry = cancellable(cancel, conn.query_one(SELECT_STATS_EXPIRY))
        .await?
        .get_i64(0)?;

    cancellable(cancel, conn.execute(DISABLE_STATS_CACHE)).await?;
    let tables: Result<Vec<String>, BackendError> =
        cancellable(cancel, conn.query(DIRTY_TABLES_QUERY))
            .await
            .and_then(|rows| rows.iter().map(|row| row.get_string(0)).collect());
    let restore = format!("SET information_schema_stats_expiry = {expiry}");
    let restored = cancellable(cancel, conn.execute(&restore)).await;
    finish(tables, restored)
}

/// Drop the database the session is currently bound to.
///
/// The name is read from the live session, so this must run before the
/// session is closed. Returns the dropped name.
pub async fn drop_database<C: Connection>(conn: &C) -> Result<String, BackendError> {
    let name = conn
        .query_one(SELECT_CURRENT_DATABASE)
        .await?
        .get_opt_string(0)?
        .ok_or_else(|| BackendError::Decode("session has no database selected".into()))?;
    drop_database_named(conn, &name).await?;
    Ok(name)
}

/// Drop the database `name` through any session, typically the admin one.
pub async fn drop_database_named<C: Connection>(
    conn: &C,
    name: &str,
) -> Result<(), BackendError> {
    conn.execute(&format!("DROP DATABASE {}", quote_identifier(name)))
        .await?;
    tracing::debug!(database = %name, "database dropped");
    Ok(())
}

/// Combine a main result with a deferred cleanup result: the main error wins,
/// the cleanup error is reported only when the main step succeeded.
fn finish<T, U>(
    main: Result<T, BackendError>,
    cleanup: Result<U, BackendError>,
) -> Result<T, BackendError> {
    let value = main?;
    cleanup?;
    Ok(value)
}

//! Test database pool implementation.
//!
//! The pool hands out whole databases, not connections. A database is either
//! checked out by a caller, sitting in the free list, or dropped by
//! [`Pool::close`]. All in-memory bookkeeping lives behind one mutex that is
//! never held across a server round trip.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, BackendError, Connection, cancellable};
use crate::config::{ConnectOptions, PoolConfig};
use crate::error::{CloseErrors, PoolError, Result};
use crate::lifecycle;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// A pool of throwaway databases for tests.
///
/// [`get`](Pool::get) returns a database from the free list after truncating
/// it, or creates a new one and applies the schema script when the free list
/// is empty. [`put`](Pool::put) returns a database for reuse.
/// [`close`](Pool::close) drops every database the pool ever created.
///
/// `Pool` is cheap to clone; clones share the same state.
///
/// # Example
///
/// ```rust,ignore
/// use testdb_pool::{ConnectOptions, Pool};
/// use testdb_pool::mysql::MySqlBackend;
///
/// let pool = Pool::builder(MySqlBackend::new())
///     .connect_options(ConnectOptions::from_env().unwrap())
///     .ddl("CREATE TABLE foo (id INT PRIMARY KEY)")
///     .build()?;
///
/// let db = pool.get().await?;
/// db.execute("INSERT INTO foo (id) VALUES (1)").await?;
/// pool.put(db);
///
/// pool.close().await?;
/// ```
pub struct Pool<B: Backend> {
    inner: Arc<PoolInner<B>>,
}

struct PoolInner<B: Backend> {
    id: u64,
    backend: B,
    config: PoolConfig,

    /// Closed flag, free list and every database ever created.
    state: Mutex<PoolState<B::Connection>>,

    /// Administrative session, opened on first create.
    ///
    /// An async mutex so concurrent first use opens it only once.
    admin: tokio::sync::Mutex<Option<Arc<B::Connection>>>,

    created_at: Instant,
    metrics: Mutex<PoolMetricsInner>,
}

struct PoolState<C> {
    closed: bool,
    /// Returned databases, reused last-in first-out.
    free: Vec<TestDatabase<C>>,
    all: Vec<Arc<DatabaseEntry<C>>>,
}

struct DatabaseEntry<C> {
    pool_id: u64,
    name: String,
    conn: C,
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
struct PoolMetricsInner {
    databases_created: u64,
    databases_dropped: u64,
    checkouts_successful: u64,
    checkouts_failed: u64,
    resets_performed: u64,
    resets_failed: u64,
}

impl<B: Backend> Pool<B> {
    /// Create a new pool builder.
    #[must_use]
    pub fn builder(backend: B) -> PoolBuilder<B> {
        PoolBuilder::new(backend)
    }

    /// Create a pool. No server round trip happens until the first
    /// [`get`](Pool::get).
    pub fn new(backend: B, config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            backend,
            config,
            state: Mutex::new(PoolState {
                closed: false,
                free: Vec::new(),
                all: Vec::new(),
            }),
            admin: tokio::sync::Mutex::new(None),
            created_at: Instant::now(),
            metrics: Mutex::new(PoolMetricsInner::default()),
        });

        tracing::info!(
            pool = inner.id,
            host = %inner.config.connect.host,
            port = inner.config.connect.port,
            "test database pool created"
        );

        Ok(Self { inner })
    }

    /// Get a database from the pool.
    ///
    /// Equivalent to [`get_with_cancel`](Pool::get_with_cancel) with a token
    /// that never fires. Dropping the returned future also abandons the
    /// operation.
    pub async fn get(&self) -> Result<TestDatabase<B::Connection>> {
        self.get_with_cancel(&CancellationToken::new()).await
    }

    /// Get a database from the pool, aborting server round trips once
    /// `cancel` fires.
    ///
    /// If the free list is non-empty, the most recently returned database is
    /// reset and handed out. A reset failure discards that database (it is
    /// still dropped on close) and returns [`PoolError::ResetFailed`]; call
    /// `get` again for a replacement. Otherwise a new database is created and
    /// initialized. Concurrent callers may each create a database at the
    /// same time.
    pub async fn get_with_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<TestDatabase<B::Connection>> {
        let result = self.checkout(cancel).await;
        let mut metrics = self.inner.metrics.lock();
        match result {
            Ok(_) => metrics.checkouts_successful += 1,
            Err(_) => metrics.checkouts_failed += 1,
        }
        result
    }

    async fn checkout(&self, cancel: &CancellationToken) -> Result<TestDatabase<B::Connection>> {
        let reused = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(PoolError::PoolClosed);
            }
            state.free.pop()
        };

        match reused {
            Some(db) => self.reuse(db, cancel).await,
            None => self.create(cancel).await,
        }
    }

    async fn reuse(
        &self,
        db: TestDatabase<B::Connection>,
        cancel: &CancellationToken,
    ) -> Result<TestDatabase<B::Connection>> {
        tracing::trace!(database = %db.name(), "resetting database for reuse");

        match lifecycle::reset_database(db.connection(), cancel).await {
            Ok(()) => {
                self.inner.metrics.lock().resets_performed += 1;
                // Close took the entry while the reset was in flight and owns
                // dropping it.
                if self.is_closed() {
                    tracing::debug!(
                        database = %db.name(),
                        "pool closed during reset, not handing out database"
                    );
                    return Err(PoolError::PoolClosed);
                }
                Ok(db)
            }
            Err(source) => {
                self.inner.metrics.lock().resets_failed += 1;
                tracing::warn!(
                    database = %db.name(),
                    error = %source,
                    "reset failed, discarding database"
                );
                Err(PoolError::ResetFailed {
                    database: db.name().to_owned(),
                    source,
                })
            }
        }
    }

    async fn create(&self, cancel: &CancellationToken) -> Result<TestDatabase<B::Connection>> {
        let admin = self.admin_connection(cancel).await?;
        let config = &self.inner.config;
        let name = lifecycle::create_database(&*admin, &config.name_prefix, cancel).await?;

        let conn = match self.initialize(&name, cancel).await {
            Ok(conn) => conn,
            Err(err) => {
                // Not recorded yet, so close would never see it.
                if let Err(e) = self.drop_unrecorded(&admin, &name).await {
                    tracing::warn!(
                        database = %name,
                        error = %e,
                        "failed to drop database after initialization failure"
                    );
                }
                return Err(err);
            }
        };

        let db = TestDatabase::new(self.inner.id, name, conn);
        let recorded = {
            let mut state = self.inner.state.lock();
            if state.closed {
                false
            } else {
                state.all.push(Arc::clone(&db.entry));
                true
            }
        };

        if !recorded {
            tracing::debug!(
                database = %db.name(),
                "pool closed during creation, dropping database"
            );
            let entry = db.entry;
            if let Err(e) = lifecycle::drop_database(&entry.conn).await {
                tracing::warn!(database = %entry.name, error = %e, "failed to drop database");
            }
            if let Err(e) = entry.conn.close().await {
                tracing::warn!(database = %entry.name, error = %e, "failed to close connection");
            }
            return Err(PoolError::PoolClosed);
        }

        self.inner.metrics.lock().databases_created += 1;
        tracing::debug!(database = %db.name(), "database ready");
        Ok(db)
    }

    async fn initialize(&self, name: &str, cancel: &CancellationToken) -> Result<B::Connection> {
        let config = &self.inner.config;
        lifecycle::initialize_database(
            &self.inner.backend,
            &config.connect,
            name,
            &config.ddl,
            cancel,
        )
        .await?;
        lifecycle::open_database(&self.inner.backend, &config.connect, name, cancel).await
    }

    /// Drop a database that never made it into the pool's bookkeeping.
    ///
    /// Close may have shut the shared admin session in the meantime; a
    /// one-off session is opened for the drop in that case.
    async fn drop_unrecorded(
        &self,
        admin: &B::Connection,
        name: &str,
    ) -> std::result::Result<(), BackendError> {
        match lifecycle::drop_database_named(admin, name).await {
            Err(BackendError::Closed) if self.is_closed() => {
                let options = admin_options(&self.inner.config.connect);
                let conn = self.inner.backend.connect(&options).await?;
                let dropped = lifecycle::drop_database_named(&conn, name).await;
                let closed = conn.close().await;
                dropped.and(closed)
            }
            other => other,
        }
    }

    /// Administrative session with no database selected, opened once.
    async fn admin_connection(&self, cancel: &CancellationToken) -> Result<Arc<B::Connection>> {
        let mut admin = cancellable(cancel, async {
            Ok::<_, BackendError>(self.inner.admin.lock().await)
        })
        .await
        .map_err(PoolError::Connect)?;

        if let Some(conn) = admin.as_ref() {
            return Ok(Arc::clone(conn));
        }
        // Close may already have taken the old session; never open a new one.
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        let options = admin_options(&self.inner.config.connect);
        let conn = cancellable(cancel, self.inner.backend.connect(&options))
            .await
            .map_err(PoolError::Connect)?;
        tracing::debug!(pool = self.inner.id, "administrative connection opened");

        let conn = Arc::new(conn);
        *admin = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Return a database to the pool.
    ///
    /// No server work happens here; the database is reset on its next
    /// checkout. On a closed pool, or for a database that belongs to a
    /// different pool, this is a no-op.
    pub fn put(&self, db: TestDatabase<B::Connection>) {
        if db.entry.pool_id != self.inner.id {
            tracing::warn!(
                database = %db.name(),
                "database returned to a pool that did not create it"
            );
            return;
        }

        let mut state = self.inner.state.lock();
        if state.closed {
            tracing::trace!(database = %db.name(), "pool closed, not reusing returned database");
            return;
        }
        tracing::trace!(database = %db.name(), "database returned to pool");
        state.free.push(db);
    }

    /// Get a database wrapped in a guard that returns it to the pool when
    /// dropped.
    pub async fn acquire(&self) -> Result<PooledDatabase<B>> {
        let db = self.get().await?;
        Ok(PooledDatabase {
            db,
            pool: self.clone(),
            detached: false,
        })
    }

    /// Close the pool, dropping every database it created.
    ///
    /// Checked-out databases are dropped too; they must not be used
    /// afterwards. Every drop and close is attempted even when earlier ones
    /// fail, and all failures come back together as [`PoolError::Close`].
    /// Calling `close` again, even concurrently, returns `Ok(())`.
    pub async fn close(&self) -> Result<()> {
        let all = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.free.clear();
            std::mem::take(&mut state.all)
        };

        let total = all.len();
        let mut errors = CloseErrors::default();
        for entry in all {
            match lifecycle::drop_database(&entry.conn).await {
                Ok(_) => self.inner.metrics.lock().databases_dropped += 1,
                Err(source) => {
                    tracing::warn!(
                        database = %entry.name,
                        error = %source,
                        "failed to drop database"
                    );
                    errors.push(PoolError::DropFailed {
                        database: entry.name.clone(),
                        source,
                    });
                }
            }
            if let Err(source) = entry.conn.close().await {
                errors.push(PoolError::CloseFailed {
                    database: Some(entry.name.clone()),
                    source,
                });
            }
        }

        let admin = self.inner.admin.lock().await.take();
        if let Some(admin) = admin {
            if let Err(source) = admin.close().await {
                errors.push(PoolError::CloseFailed {
                    database: None,
                    source,
                });
            }
        }

        tracing::info!(
            pool = self.inner.id,
            databases = total,
            failures = errors.len(),
            "test database pool closed"
        );
        errors.into_result()
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            free: state.free.len(),
            checked_out: state.all.len().saturating_sub(state.free.len()),
            total: state.all.len(),
            closed: state.closed,
        }
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.metrics.lock();
        PoolMetrics {
            databases_created: inner.databases_created,
            databases_dropped: inner.databases_dropped,
            checkouts_successful: inner.checkouts_successful,
            checkouts_failed: inner.checkouts_failed,
            resets_performed: inner.resets_performed,
            resets_failed: inner.resets_failed,
            uptime: self.inner.created_at.elapsed(),
        }
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get the backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }
}

fn admin_options(template: &ConnectOptions) -> ConnectOptions {
    template.without_database().multi_statements(true)
}

impl<B: Backend> Clone for Pool<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> fmt::Debug for Pool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

impl<B: Backend> Drop for PoolInner<B> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.closed && !state.all.is_empty() {
            tracing::warn!(
                pool = self.id,
                databases = state.all.len(),
                "pool dropped without close, databases were not dropped"
            );
        }
    }
}

/// Builder for creating a pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::builder(backend)
///     .connect_options(ConnectOptions::new().host("127.0.0.1").user("root"))
///     .ddl("CREATE TABLE foo (id INT PRIMARY KEY)")
///     .build()?;
/// ```
pub struct PoolBuilder<B: Backend> {
    backend: B,
    config: PoolConfig,
}

impl<B: Backend> PoolBuilder<B> {
    /// Create a new pool builder with default settings.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            config: PoolConfig::default(),
        }
    }

    /// Replace the whole pool configuration.
    #[must_use]
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the server connection template.
    #[must_use]
    pub fn connect_options(mut self, options: ConnectOptions) -> Self {
        self.config.connect = options;
        self
    }

    /// Set the schema script.
    #[must_use]
    pub fn ddl(mut self, ddl: impl Into<Arc<str>>) -> Self {
        self.config.ddl = ddl.into();
        self
    }

    /// Set the database name prefix.
    #[must_use]
    pub fn name_prefix(mut self, prefix: impl Into<Arc<str>>) -> Self {
        self.config.name_prefix = prefix.into();
        self
    }

    /// Build the pool.
    pub fn build(self) -> Result<Pool<B>> {
        Pool::new(self.backend, self.config)
    }
}

/// A database checked out of a [`Pool`].
///
/// Dereferences to its session, so statements can be run directly. The
/// session stays bound to this database; switching it to another database
/// with `USE` would make [`Pool::close`] drop the wrong one.
pub struct TestDatabase<C> {
    entry: Arc<DatabaseEntry<C>>,
}

impl<C> TestDatabase<C> {
    fn new(pool_id: u64, name: String, conn: C) -> Self {
        Self {
            entry: Arc::new(DatabaseEntry {
                pool_id,
                name,
                conn,
            }),
        }
    }

    /// Name of the database.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// Session bound to the database.
    #[must_use]
    pub fn connection(&self) -> &C {
        &self.entry.conn
    }

    fn share(&self) -> Self {
        Self {
            entry: Arc::clone(&self.entry),
        }
    }
}

impl<C> Deref for TestDatabase<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.entry.conn
    }
}

impl<C> fmt::Debug for TestDatabase<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDatabase")
            .field("name", &self.entry.name)
            .finish_non_exhaustive()
    }
}

/// A database that returns itself to its pool when dropped.
///
/// Use [`detach()`](PooledDatabase::detach) to take ownership instead.
pub struct PooledDatabase<B: Backend> {
    db: TestDatabase<B::Connection>,
    pool: Pool<B>,
    detached: bool,
}

impl<B: Backend> PooledDatabase<B> {
    /// Detach the database from the guard.
    ///
    /// It is not returned to the pool when the guard goes away, but it is
    /// still dropped when the pool closes.
    #[must_use]
    pub fn detach(mut self) -> TestDatabase<B::Connection> {
        self.detached = true;
        self.db.share()
    }
}

impl<B: Backend> Deref for PooledDatabase<B> {
    type Target = TestDatabase<B::Connection>;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

impl<B: Backend> Drop for PooledDatabase<B> {
    fn drop(&mut self) {
        if !self.detached {
            self.pool.put(self.db.share());
        }
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Databases waiting in the free list.
    pub free: usize,
    /// Databases handed out and not yet returned (including discarded ones).
    pub checked_out: usize,
    /// Every database created and not yet dropped.
    pub total: usize,
    /// Whether [`Pool::close`] has been called.
    pub closed: bool,
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Databases created since pool start.
    pub databases_created: u64,
    /// Databases dropped by close.
    pub databases_dropped: u64,
    /// Successful checkouts.
    pub checkouts_successful: u64,
    /// Failed checkouts (closed pool, create/init/reset failures).
    pub checkouts_failed: u64,
    /// Resets performed on reused databases.
    pub resets_performed: u64,
    /// Resets that failed and discarded their database.
    pub resets_failed: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Share of checkouts served from the free list (0.0 to 1.0).
    #[must_use]
    pub fn reuse_rate(&self) -> f64 {
        if self.checkouts_successful == 0 {
            return 0.0;
        }
        self.resets_performed as f64 / self.checkouts_successful as f64
    }

    /// Calculate checkout success rate (0.0 to 1.0).
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(successful: u64, failed: u64, resets: u64) -> PoolMetrics {
        PoolMetrics {
            databases_created: successful - resets,
            databases_dropped: 0,
            checkouts_successful: successful,
            checkouts_failed: failed,
            resets_performed: resets,
            resets_failed: 0,
            uptime: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_pool_metrics_rates() {
        let m = metrics(8, 2, 6);
        assert!((m.checkout_success_rate() - 0.8).abs() < f64::EPSILON);
        assert!((m.reuse_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_metrics_rates_empty() {
        let m = metrics(0, 0, 0);
        assert!((m.checkout_success_rate() - 1.0).abs() < f64::EPSILON);
        assert!(m.reuse_rate().abs() < f64::EPSILON);
    }

    #[test]
    fn test_admin_options_clear_database() {
        let template = ConnectOptions::new().database("app");
        let opts = admin_options(&template);
        assert!(opts.database.is_none());
        assert!(opts.multi_statements);
    }
}

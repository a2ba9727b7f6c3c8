//! # testdb-pool
//!
//! A pool of throwaway MySQL databases for test suites.
//!
//! Every database handed out is isolated, has the caller's schema applied,
//! and is empty. Returned databases are truncated and reused instead of being
//! recreated, and closing the pool drops every database it ever created.
//!
//! ## Features
//!
//! - Unique random database names (`test_<16 hex chars>`)
//! - Schema script applied once per database, in one multi-statement batch
//! - Cheap reuse: only tables that hold rows or advanced their
//!   auto-increment counter are truncated, with foreign-key checks disabled
//! - Best-effort teardown that reports every failure it hit
//! - Cancellation of in-flight server round trips via `CancellationToken`
//! - Backend-agnostic core; the `mysql` feature provides a sqlx backend
//!
//! ## Example
//!
//! ```rust,ignore
//! use testdb_pool::{ConnectOptions, Connection, Pool};
//! use testdb_pool::mysql::MySqlBackend;
//!
//! let pool = Pool::builder(MySqlBackend::new())
//!     .connect_options(ConnectOptions::from_env().expect("MYSQLPOOL_HOST"))
//!     .ddl("CREATE TABLE parent (id INT PRIMARY KEY);\
//!           CREATE TABLE child (id INT PRIMARY KEY, parent_id INT, \
//!           FOREIGN KEY (parent_id) REFERENCES parent(id));")
//!     .build()?;
//!
//! let db = pool.get().await?;
//! db.execute("INSERT INTO parent (id) VALUES (1)").await?;
//! pool.put(db);
//!
//! // Same database, truncated.
//! let db = pool.get().await?;
//! let count = db.query_one("SELECT COUNT(*) FROM parent").await?.get_i64(0)?;
//! assert_eq!(count, 0);
//! pool.put(db);
//!
//! pool.close().await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod backend;
pub mod config;
pub mod error;
pub mod lifecycle;
#[cfg(feature = "mysql")]
pub mod mysql;
pub mod pool;

// Backend collaborator
pub use backend::{Backend, BackendError, Connection, Row, Value};

// Configuration
pub use config::{ConnectOptions, PoolConfig};

// Error types
pub use error::{CloseErrors, PoolError, Result};

// Pool types
pub use pool::{Pool, PoolBuilder, PoolMetrics, PoolStatus, PooledDatabase, TestDatabase};

pub use tokio_util::sync::CancellationToken;

//! # testdb-testing
//!
//! Test infrastructure for the test database pool.
//!
//! This crate provides an in-memory MySQL engine for fast, deterministic
//! pool tests, plus testcontainers support for running the same scenarios
//! against a real server.
//!
//! ## Features
//!
//! - In-memory engine implementing the pool's `Backend` trait (no Docker)
//! - Failure injection, latency and a statement log on the engine
//! - MySQL container image via testcontainers
//! - Schema fixtures and data helpers
//!
//! ## Mock Engine Example
//!
//! ```rust,ignore
//! use testdb_pool::Pool;
//! use testdb_testing::{MockEngine, fixtures::PARENT_CHILD_DDL};
//!
//! #[tokio::test]
//! async fn test_reuse() {
//!     let engine = MockEngine::new();
//!     let pool = Pool::builder(engine.clone())
//!         .ddl(PARENT_CHILD_DDL)
//!         .build()
//!         .unwrap();
//!
//!     let db = pool.get().await.unwrap();
//!     assert!(engine.has_database(db.name()));
//!     pool.close().await.unwrap();
//!     assert!(engine.databases().is_empty());
//! }
//! ```
//!
//! ## Container Example
//!
//! ```rust,ignore
//! use testcontainers::runners::AsyncRunner;
//! use testdb_testing::MySqlContainer;
//!
//! #[tokio::test]
//! async fn test_with_real_server() {
//!     let image = MySqlContainer::default();
//!     let container = image.clone().start().await.unwrap();
//!     let port = container.get_host_port_ipv4(3306).await.unwrap();
//!     let options = image.connect_options("127.0.0.1", port);
//!     // Build a pool with `options`...
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod container;
pub mod fixtures;
pub mod mock_engine;

pub use container::MySqlContainer;
pub use mock_engine::{DEFAULT_STATS_EXPIRY, MockConnection, MockEngine, SessionSnapshot};

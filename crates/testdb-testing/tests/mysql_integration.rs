//! Live MySQL integration tests.
//!
//! These tests require a running MySQL 8 server. They are ignored by default
//! and can be run with:
//!
//! ```bash
//! # Set connection details via environment variables
//! export MYSQLPOOL_HOST=127.0.0.1
//! export MYSQLPOOL_PORT=3306
//! export MYSQLPOOL_USER=root
//! export MYSQLPOOL_PASS=secret
//!
//! # Run integration tests
//! cargo test -p testdb-testing --test mysql_integration -- --ignored
//! ```
//!
//! The container test starts its own server and only needs Docker:
//! ```bash
//! cargo test -p testdb-testing --test mysql_integration container -- --ignored
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashSet;

use testcontainers::runners::AsyncRunner;
use testdb_pool::mysql::{MySqlBackend, MySqlSession};
use testdb_pool::{Backend, ConnectOptions, Connection, Pool, PoolError};
use testdb_testing::MySqlContainer;
use testdb_testing::container::MYSQL_PORT;
use testdb_testing::fixtures::{PARENT_CHILD_DDL, count_rows, insert_family, insert_rows};

/// Helper to get test configuration from environment variables.
fn get_test_options() -> ConnectOptions {
    ConnectOptions::from_env().expect("MYSQLPOOL_HOST must be set")
}

fn mysql_pool(options: ConnectOptions) -> Pool<MySqlBackend> {
    Pool::builder(MySqlBackend::new())
        .connect_options(options)
        .ddl(PARENT_CHILD_DDL)
        .build()
        .unwrap()
}

async fn database_exists(options: &ConnectOptions, name: &str) -> bool {
    let conn: MySqlSession = MySqlBackend::new()
        .connect(&options.without_database())
        .await
        .unwrap();
    let rows = conn
        .query(&format!("SHOW DATABASES LIKE '{name}'"))
        .await
        .unwrap();
    conn.close().await.unwrap();
    !rows.is_empty()
}

// =============================================================================
// Pool lifecycle
// =============================================================================

#[tokio::test]
#[ignore = "Requires MySQL"]
async fn test_get_put_reset_close() {
    let options = get_test_options();
    let pool = mysql_pool(options.clone());

    let db = pool.get().await.unwrap();
    let name = db.name().to_owned();
    insert_family(&*db).await.unwrap();
    insert_rows(&*db, "parent", 3).await.unwrap();
    pool.put(db);

    let db = pool.get().await.unwrap();
    assert_eq!(db.name(), name);
    assert_eq!(count_rows(&*db, "parent").await.unwrap(), 0);
    assert_eq!(count_rows(&*db, "child").await.unwrap(), 0);

    // Auto-increment restarted at 1.
    db.execute("INSERT INTO parent (name) VALUES ('again')")
        .await
        .unwrap();
    let id = db
        .query_one("SELECT MAX(id) FROM parent")
        .await
        .unwrap()
        .get_i64(0)
        .unwrap();
    assert_eq!(id, 1);

    // Session settings are back to normal.
    let checks = db
        .query_one("SELECT @@FOREIGN_KEY_CHECKS")
        .await
        .unwrap()
        .get_i64(0)
        .unwrap();
    assert_eq!(checks, 1);
    pool.put(db);

    pool.close().await.unwrap();
    assert!(!database_exists(&options, &name).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "Requires MySQL"]
async fn test_parallel_gets() {
    let options = get_test_options();
    let pool = mysql_pool(options.clone());

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get().await })
        })
        .collect();

    let mut names = HashSet::new();
    for handle in handles {
        let db = handle.await.unwrap().unwrap();
        names.insert(db.name().to_owned());
        pool.put(db);
    }
    assert_eq!(names.len(), 10);

    pool.close().await.unwrap();
    for name in &names {
        assert!(!database_exists(&options, name).await);
    }
}

#[tokio::test]
#[ignore = "Requires MySQL"]
async fn test_close_twice_and_get_after_close() {
    let pool = mysql_pool(get_test_options());
    let _db = pool.get().await.unwrap();

    pool.close().await.unwrap();
    pool.close().await.unwrap();
    assert!(matches!(pool.get().await, Err(PoolError::PoolClosed)));
}

#[tokio::test]
#[ignore = "Requires MySQL"]
async fn test_bad_ddl_leaves_no_database() {
    let options = get_test_options();
    let pool = Pool::builder(MySqlBackend::new())
        .connect_options(options.clone())
        .ddl("CREATE TABLE ok (id INT PRIMARY KEY); CREATE TABLE broken (")
        .build()
        .unwrap();

    let err = pool.get().await.unwrap_err();
    let PoolError::InitializeFailed { database, .. } = &err else {
        panic!("expected InitializeFailed, got {err:?}");
    };
    assert!(!database_exists(&options, database).await);

    pool.close().await.unwrap();
}

#[tokio::test]
#[ignore = "Requires MySQL"]
async fn test_single_statement_session_rejects_batches() {
    let pool = mysql_pool(get_test_options());
    let db = pool.get().await.unwrap();

    let res = db
        .execute("INSERT INTO parent (name) VALUES ('a'); INSERT INTO parent (name) VALUES ('b')")
        .await;
    assert!(res.is_err());

    pool.put(db);
    pool.close().await.unwrap();
}

// =============================================================================
// Container
// =============================================================================

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_container_pool_round_trip() {
    let image = MySqlContainer::default();
    let container = image.clone().start().await.unwrap();
    let port = container.get_host_port_ipv4(MYSQL_PORT).await.unwrap();
    let options = image.connect_options("127.0.0.1", port);

    let pool = mysql_pool(options.clone());
    let db = pool.get().await.unwrap();
    let name = db.name().to_owned();
    insert_family(&*db).await.unwrap();
    pool.put(db);

    let db = pool.get().await.unwrap();
    assert_eq!(count_rows(&*db, "child").await.unwrap(), 0);
    pool.put(db);

    pool.close().await.unwrap();
    assert!(!database_exists(&options, &name).await);
}

//! Mock Engine Fidelity Tests
//!
//! These tests pin down the server behaviors the pool relies on, so the
//! in-memory engine fails the same way a real MySQL server would.
//!
//! ```bash
//! cargo test -p testdb-testing --test mock_fidelity
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::{Duration, Instant};

use tokio_test::{assert_err, assert_ok};

use testdb_pool::{Backend, BackendError, ConnectOptions, Connection};
use testdb_testing::fixtures::{PARENT_CHILD_DDL, count_rows, insert_family};
use testdb_testing::{DEFAULT_STATS_EXPIRY, MockConnection, MockEngine};

const DIRTY_TABLES: &str = "SELECT `table_name` FROM `information_schema`.`tables` \
     WHERE `table_schema` = DATABASE() AND (`table_rows` > 0 OR `auto_increment` > 1)";

async fn admin(engine: &MockEngine) -> MockConnection {
    engine
        .connect(&ConnectOptions::new().multi_statements(true))
        .await
        .unwrap()
}

/// Create `name` with the parent/child schema and open a session on it.
async fn database(engine: &MockEngine, name: &str) -> MockConnection {
    let admin = admin(engine).await;
    admin
        .execute(&format!("CREATE DATABASE `{name}`"))
        .await
        .unwrap();
    admin.close().await.unwrap();

    let opts = ConnectOptions::new().database(name).multi_statements(true);
    let conn = engine.connect(&opts).await.unwrap();
    conn.execute(PARENT_CHILD_DDL).await.unwrap();
    conn
}

async fn dirty_tables(conn: &MockConnection) -> Vec<String> {
    conn.query(DIRTY_TABLES)
        .await
        .unwrap()
        .iter()
        .map(|row| row.get_string(0).unwrap())
        .collect()
}

// =============================================================================
// Databases and sessions
// =============================================================================

#[tokio::test]
async fn test_create_and_drop_database() {
    let engine = MockEngine::new();
    let conn = admin(&engine).await;

    conn.execute("CREATE DATABASE `test_a`").await.unwrap();
    assert!(engine.has_database("test_a"));
    assert!(conn.execute("CREATE DATABASE test_a").await.is_err());

    conn.execute("DROP DATABASE `test_a`").await.unwrap();
    assert!(!engine.has_database("test_a"));
    assert!(conn.execute("DROP DATABASE test_a").await.is_err());
    conn.execute("DROP DATABASE IF EXISTS test_a").await.unwrap();
}

#[tokio::test]
async fn test_connect_to_unknown_database() {
    let engine = MockEngine::new();
    let err = engine
        .connect(&ConnectOptions::new().database("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Connect(_)));
    assert_eq!(engine.open_connections(), 0);
}

#[tokio::test]
async fn test_select_database_follows_session() {
    let engine = MockEngine::new();
    let conn = database(&engine, "test_sel").await;

    let row = conn.query_one("SELECT DATABASE()").await.unwrap();
    assert_eq!(row.get_opt_string(0).unwrap().as_deref(), Some("test_sel"));

    conn.execute("DROP DATABASE `test_sel`").await.unwrap();
    let row = conn.query_one("SELECT DATABASE()").await.unwrap();
    assert_eq!(row.get_opt_string(0).unwrap(), None);
}

#[tokio::test]
async fn test_show_databases_like() {
    let engine = MockEngine::new();
    let conn = admin(&engine).await;
    for name in ["test_01", "test_02", "other"] {
        conn.execute(&format!("CREATE DATABASE {name}")).await.unwrap();
    }

    let rows = conn.query("SHOW DATABASES LIKE 'test\\_%'").await.unwrap();
    let names: Vec<_> = rows.iter().map(|r| r.get_string(0).unwrap()).collect();
    assert_eq!(names, vec!["test_01", "test_02"]);
    assert_eq!(conn.query("SHOW DATABASES").await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_closed_session_rejects_statements() {
    let engine = MockEngine::new();
    let conn = admin(&engine).await;
    assert_eq!(engine.open_connections(), 1);

    conn.close().await.unwrap();
    conn.close().await.unwrap();
    assert_eq!(engine.open_connections(), 0);
    assert!(conn.session().closed);
    assert!(matches!(
        conn.execute("SELECT DATABASE()").await,
        Err(BackendError::Closed)
    ));
}

#[tokio::test]
async fn test_multi_statements_need_flag() {
    let engine = MockEngine::new();
    admin(&engine)
        .await
        .execute("CREATE DATABASE test_m")
        .await
        .unwrap();

    let single = engine
        .connect(&ConnectOptions::new().database("test_m"))
        .await
        .unwrap();
    assert!(single.execute(PARENT_CHILD_DDL).await.is_err());
    // Nothing from the rejected batch was applied.
    assert!(single.execute("CREATE TABLE parent (id INT)").await.is_ok());
}

// =============================================================================
// Tables and foreign keys
// =============================================================================

#[tokio::test]
async fn test_insert_and_count() {
    let engine = MockEngine::new();
    let conn = database(&engine, "test_ins").await;

    let affected = conn
        .execute("INSERT INTO parent (name) VALUES ('a'), ('b, c'), ('(d)')")
        .await
        .unwrap();
    assert_eq!(affected, 3);
    assert_eq!(count_rows(&conn, "parent").await.unwrap(), 3);
    assert_eq!(engine.table_rows("test_ins", "parent"), Some(3));
    assert_eq!(engine.auto_increment("test_ins", "parent"), Some(4));
    assert_eq!(engine.auto_increment("test_ins", "audit"), None);
}

#[tokio::test]
async fn test_child_insert_needs_parent() {
    let engine = MockEngine::new();
    let conn = database(&engine, "test_fk").await;

    assert!(conn.execute("INSERT INTO child (parent_id) VALUES (1)").await.is_err());

    conn.execute("SET FOREIGN_KEY_CHECKS = 0").await.unwrap();
    conn.execute("INSERT INTO child (parent_id) VALUES (1)").await.unwrap();
    assert!(!conn.session().foreign_key_checks);
}

#[tokio::test]
async fn test_truncate_referenced_table() {
    let engine = MockEngine::new();
    let conn = database(&engine, "test_tr").await;
    insert_family(&conn).await.unwrap();

    let err = conn.execute("TRUNCATE TABLE `parent`").await.unwrap_err();
    assert!(err.to_string().contains("foreign key constraint"));
    // The referencing side can always be truncated.
    conn.execute("TRUNCATE TABLE `child`").await.unwrap();

    conn.execute("SET FOREIGN_KEY_CHECKS = 0").await.unwrap();
    conn.execute("TRUNCATE TABLE `parent`").await.unwrap();
    assert_eq!(engine.table_rows("test_tr", "parent"), Some(0));
    assert_eq!(engine.auto_increment("test_tr", "parent"), Some(1));
}

#[tokio::test]
async fn test_unknown_table() {
    let engine = MockEngine::new();
    let conn = database(&engine, "test_unk").await;
    let err = conn.execute("TRUNCATE TABLE nope").await.unwrap_err();
    assert!(err.to_string().contains("doesn't exist"));
}

#[tokio::test]
async fn test_no_database_selected() {
    let engine = MockEngine::new();
    let conn = admin(&engine).await;
    let err = conn.execute("CREATE TABLE t (id INT)").await.unwrap_err();
    assert!(err.to_string().contains("No database selected"));
}

// =============================================================================
// information_schema statistics
// =============================================================================

#[tokio::test]
async fn test_stats_cache_is_stale_by_default() {
    let engine = MockEngine::new();
    let conn = database(&engine, "test_stats").await;
    insert_family(&conn).await.unwrap();

    let expiry = conn
        .query_one("SELECT @@information_schema_stats_expiry")
        .await
        .unwrap()
        .get_i64(0)
        .unwrap();
    assert_eq!(expiry, DEFAULT_STATS_EXPIRY as i64);
    assert!(dirty_tables(&conn).await.is_empty());

    conn.execute("SET information_schema_stats_expiry = 0")
        .await
        .unwrap();
    assert_eq!(dirty_tables(&conn).await, vec!["child", "parent"]);
}

#[tokio::test]
async fn test_stats_cache_remembers_last_refresh() {
    let engine = MockEngine::new();
    let conn = database(&engine, "test_cache").await;

    conn.execute("SET information_schema_stats_expiry = 0")
        .await
        .unwrap();
    conn.execute("INSERT INTO parent (name) VALUES ('x')")
        .await
        .unwrap();
    assert_eq!(dirty_tables(&conn).await, vec!["parent"]);

    conn.execute(&format!(
        "SET information_schema_stats_expiry = {DEFAULT_STATS_EXPIRY}"
    ))
    .await
    .unwrap();
    conn.execute("SET FOREIGN_KEY_CHECKS = 0").await.unwrap();
    conn.execute("TRUNCATE TABLE parent").await.unwrap();
    // Cached figures still show the old rows.
    assert_eq!(dirty_tables(&conn).await, vec!["parent"]);
}

// =============================================================================
// Test controls
// =============================================================================

#[tokio::test]
async fn test_failure_injection_counts_down() {
    let engine = MockEngine::new();
    let conn = admin(&engine).await;
    engine.fail_matching_times("^CREATE DATABASE", 2).unwrap();

    assert_err!(conn.execute("CREATE DATABASE a").await);
    assert_err!(conn.execute("create database b").await);
    assert_ok!(conn.execute("CREATE DATABASE c").await);
    assert_eq!(engine.databases(), vec!["c"]);
}

#[tokio::test]
async fn test_failure_injection_message_and_clear() {
    let engine = MockEngine::new();
    let conn = admin(&engine).await;
    engine
        .fail_with_message("DROP", "Lock wait timeout exceeded")
        .unwrap();
    conn.execute("CREATE DATABASE a").await.unwrap();

    let err = conn.execute("DROP DATABASE a").await.unwrap_err();
    assert!(err.to_string().contains("Lock wait timeout exceeded"));

    engine.clear_failures();
    conn.execute("DROP DATABASE a").await.unwrap();
}

#[tokio::test]
async fn test_connect_failure_injection() {
    let engine = MockEngine::new();
    engine.fail_matching("^CONNECT $").unwrap();
    let err = engine.connect(&ConnectOptions::new()).await.unwrap_err();
    assert!(matches!(err, BackendError::Connect(_)));
    assert_eq!(engine.connections_opened(), 0);
}

#[tokio::test]
async fn test_statement_log() {
    let engine = MockEngine::new();
    let conn = admin(&engine).await;
    conn.execute("CREATE DATABASE a; CREATE DATABASE b")
        .await
        .unwrap();

    assert_eq!(
        engine.statements(),
        vec!["CREATE DATABASE a", "CREATE DATABASE b"]
    );
    engine.clear_statements();
    assert!(engine.statements().is_empty());
}

#[tokio::test]
async fn test_latency() {
    let engine = MockEngine::new();
    engine.set_latency(Duration::from_millis(30));

    let start = Instant::now();
    let conn = admin(&engine).await;
    conn.execute("CREATE DATABASE a").await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(60));
}

//! Test database pool example.
//!
//! Hands out databases to parallel workers, reuses them, and prints pool
//! status and metrics before tearing everything down.
//!
//! # Running
//!
//! ```bash
//! export MYSQLPOOL_HOST=127.0.0.1
//! export MYSQLPOOL_USER=root
//! export MYSQLPOOL_PASS=secret
//!
//! cargo run -p testdb-pool --features mysql --example mysql_pool
//! ```

// Allow common patterns in example code
#![allow(clippy::unwrap_used, clippy::expect_used)]

use testdb_pool::mysql::MySqlBackend;
use testdb_pool::{ConnectOptions, Connection, Pool};

const DDL: &str = "CREATE TABLE users (id INT AUTO_INCREMENT PRIMARY KEY, name VARCHAR(64));\
                   CREATE TABLE posts (id INT AUTO_INCREMENT PRIMARY KEY, user_id INT, \
                   FOREIGN KEY (user_id) REFERENCES users(id));";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let options = ConnectOptions::from_env().expect("MYSQLPOOL_HOST must be set");
    let pool = Pool::builder(MySqlBackend::new())
        .connect_options(options)
        .ddl(DDL)
        .build()?;

    println!("=== Test Database Pool Example ===\n");

    // 1. Parallel checkouts each get their own database.
    let mut handles = Vec::new();
    for worker in 0..4 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let db = pool.get().await?;
            db.execute("INSERT INTO users (name) VALUES ('alice')").await?;
            println!("  worker {worker} -> {}", db.name());
            pool.put(db);
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
        }));
    }
    for handle in handles {
        handle.await?.map_err(|e| e as Box<dyn std::error::Error>)?;
    }

    // 2. A returned database comes back empty.
    {
        let db = pool.acquire().await?;
        let count = db.query_one("SELECT COUNT(*) FROM users").await?.get_i64(0)?;
        println!("\nReused {} with {count} rows in users", db.name());
    }

    let status = pool.status();
    println!(
        "\nStatus: {} total, {} free, {} checked out",
        status.total, status.free, status.checked_out
    );
    let metrics = pool.metrics();
    println!(
        "Metrics: {} created, {} resets, reuse rate {:.0}%",
        metrics.databases_created,
        metrics.resets_performed,
        metrics.reuse_rate() * 100.0
    );

    pool.close().await?;
    println!("\nAll databases dropped.");
    Ok(())
}

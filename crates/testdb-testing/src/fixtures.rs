//! Test fixture utilities.
//!
//! Schema scripts and data helpers shared by the pool tests, against both
//! the mock engine and a real server.

use testdb_pool::{BackendError, Connection};

/// Single table with no keys beyond a plain primary key.
pub const SIMPLE_DDL: &str = "CREATE TABLE foo (id INT PRIMARY KEY, note VARCHAR(64))";

/// Parent/child pair joined by a foreign key, both with auto-increment ids.
///
/// Truncating `parent` is refused by the server while foreign-key checks are
/// on, which is what a reset has to work around.
pub const PARENT_CHILD_DDL: &str = "\
CREATE TABLE parent (id INT AUTO_INCREMENT PRIMARY KEY, name VARCHAR(64));
CREATE TABLE child (
    id INT AUTO_INCREMENT PRIMARY KEY,
    parent_id INT NOT NULL,
    FOREIGN KEY (parent_id) REFERENCES parent(id)
);
CREATE TABLE audit (id INT PRIMARY KEY);";

/// Builder for a schema script made of several `CREATE TABLE` statements.
#[derive(Debug, Clone, Default)]
pub struct SchemaFixture {
    /// Table definitions, one statement each.
    pub tables: Vec<String>,
}

impl SchemaFixture {
    /// Create an empty fixture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table with an auto-increment primary key.
    #[must_use]
    pub fn with_table(mut self, table: &str) -> Self {
        self.tables.push(format!(
            "CREATE TABLE {table} (id INT AUTO_INCREMENT PRIMARY KEY, payload VARCHAR(64))"
        ));
        self
    }

    /// Add a table whose `parent_id` column references `parent(id)`.
    #[must_use]
    pub fn with_child_table(mut self, table: &str, parent: &str) -> Self {
        self.tables.push(format!(
            "CREATE TABLE {table} (id INT AUTO_INCREMENT PRIMARY KEY, parent_id INT NOT NULL, \
             FOREIGN KEY (parent_id) REFERENCES {parent}(id))"
        ));
        self
    }

    /// Render the multi-statement script.
    #[must_use]
    pub fn ddl(&self) -> String {
        self.tables.iter().map(|t| format!("{t};")).collect::<Vec<_>>().join("\n")
    }
}

/// Insert `count` rows into an auto-increment table created by
/// [`SchemaFixture::with_table`] or [`PARENT_CHILD_DDL`]'s `parent`.
pub async fn insert_rows<C: Connection>(
    conn: &C,
    table: &str,
    count: usize,
) -> Result<u64, BackendError> {
    if count == 0 {
        return Ok(0);
    }
    let values = (0..count)
        .map(|i| format!("('row-{i}')"))
        .collect::<Vec<_>>()
        .join(", ");
    let column = if table == "parent" { "name" } else { "payload" };
    conn.execute(&format!("INSERT INTO {table} ({column}) VALUES {values}"))
        .await
}

/// Row count of `table` on the connection's current database.
pub async fn count_rows<C: Connection>(conn: &C, table: &str) -> Result<i64, BackendError> {
    conn.query_one(&format!("SELECT COUNT(*) FROM {table}"))
        .await?
        .get_i64(0)
}

/// Insert one parent and one child row referencing it.
pub async fn insert_family<C: Connection>(conn: &C) -> Result<(), BackendError> {
    conn.execute("INSERT INTO parent (name) VALUES ('p')").await?;
    conn.execute("INSERT INTO child (parent_id) VALUES (1)").await?;
    Ok(())
}

//! In-memory MySQL engine for unit testing.
//!
//! This module provides a [`Backend`] that keeps databases and tables in
//! memory and interprets the small SQL dialect the pool issues, plus enough
//! DML for tests to dirty a database. No server or Docker is required.
//!
//! ## Features
//!
//! - `CREATE`/`DROP DATABASE`, `CREATE TABLE` with `AUTO_INCREMENT` and
//!   `FOREIGN KEY ... REFERENCES` detection, `INSERT`, `DELETE`, `TRUNCATE`
//! - Session variables: `FOREIGN_KEY_CHECKS` and
//!   `information_schema_stats_expiry`
//! - `information_schema.tables` row estimates served from a stale cache
//!   unless the session's stats expiry is 0, as on a real server
//! - Multi-statement text rejected on sessions opened without it
//! - Failure injection by regex, per-call latency, statement log
//!
//! ## Example
//!
//! ```rust,ignore
//! use testdb_pool::Pool;
//! use testdb_testing::MockEngine;
//!
//! let engine = MockEngine::new();
//! let pool = Pool::builder(engine.clone())
//!     .ddl("CREATE TABLE foo (id INT PRIMARY KEY)")
//!     .build()?;
//!
//! let db = pool.get().await?;
//! assert!(engine.has_database(db.name()));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use testdb_pool::{Backend, BackendError, ConnectOptions, Connection, Row, Value};

/// MySQL's default `information_schema_stats_expiry` (one day).
pub const DEFAULT_STATS_EXPIRY: u64 = 86_400;

const DEFAULT_FAILURE_MESSAGE: &str = "injected failure";

/// Backtick-quoted or bare identifier.
const IDENT: &str = r"(`(?:[^`]|``)+`|[A-Za-z0-9_$]+)";

#[allow(clippy::expect_used)]
fn statement_regex(pattern: &str) -> Regex {
    Regex::new(&format!("(?is)^{pattern}$")).expect("statement patterns are valid")
}

static CREATE_DATABASE: Lazy<Regex> = Lazy::new(|| {
    statement_regex(&format!(r"CREATE\s+DATABASE\s+(?:IF\s+NOT\s+EXISTS\s+)?{IDENT}"))
});
static DROP_DATABASE: Lazy<Regex> =
    Lazy::new(|| statement_regex(&format!(r"DROP\s+DATABASE\s+(IF\s+EXISTS\s+)?{IDENT}")));
static USE_DATABASE: Lazy<Regex> = Lazy::new(|| statement_regex(&format!(r"USE\s+{IDENT}")));
static CREATE_TABLE: Lazy<Regex> = Lazy::new(|| {
    statement_regex(&format!(
        r"CREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?{IDENT}\s*\((.*)\)[^()]*"
    ))
});
static INSERT: Lazy<Regex> = Lazy::new(|| {
    statement_regex(&format!(
        r"INSERT\s+INTO\s+{IDENT}\s*(?:\([^)]*\)\s*)?VALUES\s*(.+)"
    ))
});
static DELETE_ALL: Lazy<Regex> =
    Lazy::new(|| statement_regex(&format!(r"DELETE\s+FROM\s+{IDENT}")));
static TRUNCATE: Lazy<Regex> =
    Lazy::new(|| statement_regex(&format!(r"TRUNCATE\s+(?:TABLE\s+)?{IDENT}")));
static COUNT_ROWS: Lazy<Regex> =
    Lazy::new(|| statement_regex(&format!(r"SELECT\s+COUNT\(\*\)\s+FROM\s+{IDENT}")));
static SELECT_DATABASE: Lazy<Regex> = Lazy::new(|| statement_regex(r"SELECT\s+DATABASE\(\)"));
static SELECT_STATS_EXPIRY: Lazy<Regex> =
    Lazy::new(|| statement_regex(r"SELECT\s+@@(?:SESSION\.)?information_schema_stats_expiry"));
static SET_STATS_EXPIRY: Lazy<Regex> = Lazy::new(|| {
    statement_regex(r"SET\s+(?:SESSION\s+)?information_schema_stats_expiry\s*=\s*(\d+)")
});
static SET_FOREIGN_KEY_CHECKS: Lazy<Regex> =
    Lazy::new(|| statement_regex(r"SET\s+(?:SESSION\s+)?FOREIGN_KEY_CHECKS\s*=\s*([01])"));
static SHOW_DATABASES: Lazy<Regex> =
    Lazy::new(|| statement_regex(r"SHOW\s+DATABASES(?:\s+LIKE\s+'([^']*)')?"));
static DIRTY_TABLES: Lazy<Regex> = Lazy::new(|| {
    statement_regex(r"SELECT\s+.*\s+FROM\s+`?information_schema`?\s*\.\s*`?tables`?\s+.*")
});

#[allow(clippy::expect_used)]
static REFERENCES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)REFERENCES\s+{IDENT}")).expect("references pattern is valid")
});
#[allow(clippy::expect_used)]
static AUTO_INCREMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bAUTO_INCREMENT\b").expect("auto_increment pattern is valid"));

fn unquote(ident: &str) -> String {
    match ident.strip_prefix('`').and_then(|s| s.strip_suffix('`')) {
        Some(inner) => inner.replace("``", "`"),
        None => ident.to_owned(),
    }
}

/// Split on `;` outside single-quoted strings, dropping empty statements.
fn split_statements(sql: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut in_quote = false;
    let mut start = 0;
    for (i, c) in sql.char_indices() {
        match c {
            '\'' => in_quote = !in_quote,
            ';' if !in_quote => {
                statements.push(&sql[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    statements.push(&sql[start..]);
    statements
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Count the parenthesized row tuples in a `VALUES` list.
fn count_value_tuples(values: &str) -> u64 {
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut tuples = 0;
    for c in values.chars() {
        match c {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => {
                if depth == 0 {
                    tuples += 1;
                }
                depth += 1;
            }
            ')' if !in_quote => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    tuples
}

fn like_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            '\\' => {
                let escaped = chars.next()?;
                re.push_str(&regex::escape(&escaped.to_string()));
            }
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

#[derive(Debug, Default)]
struct MockTable {
    rows: u64,
    auto_increment: Option<u64>,
    /// Tables this one has foreign keys into.
    references: Vec<String>,
    /// Statistics last seen by `information_schema`.
    cached_rows: u64,
    cached_auto_increment: Option<u64>,
}

#[derive(Debug, Default)]
struct MockDatabase {
    tables: BTreeMap<String, MockTable>,
}

struct FailureRule {
    pattern: Regex,
    message: String,
    remaining: Option<usize>,
}

#[derive(Default)]
struct EngineState {
    databases: BTreeMap<String, MockDatabase>,
    failures: Vec<FailureRule>,
    latency: Duration,
    log: Vec<String>,
    open_connections: usize,
    connections_opened: usize,
}

#[derive(Debug, Default)]
struct Outcome {
    affected: u64,
    rows: Vec<Row>,
}

impl Outcome {
    fn affected(affected: u64) -> Self {
        Self {
            affected,
            rows: Vec::new(),
        }
    }

    fn rows(rows: Vec<Row>) -> Self {
        Self { affected: 0, rows }
    }

    fn single(value: Value) -> Self {
        Self::rows(vec![Row::new(vec![value])])
    }
}

fn error(sql: &str, message: impl Into<String>) -> BackendError {
    BackendError::statement(sql, message)
}

impl EngineState {
    /// Consume a matching failure rule, if any.
    fn take_failure(&mut self, subject: &str) -> Option<String> {
        let idx = self
            .failures
            .iter()
            .position(|rule| rule.pattern.is_match(subject))?;
        let rule = &mut self.failures[idx];
        let message = rule.message.clone();
        let exhausted = match rule.remaining.as_mut() {
            Some(remaining) => {
                *remaining -= 1;
                *remaining == 0
            }
            None => false,
        };
        if exhausted {
            self.failures.remove(idx);
        }
        Some(message)
    }

    fn current_database(
        &mut self,
        session: &Session,
        sql: &str,
    ) -> Result<(String, &mut MockDatabase), BackendError> {
        let name = session
            .database
            .clone()
            .ok_or_else(|| error(sql, "No database selected"))?;
        match self.databases.get_mut(&name) {
            Some(db) => Ok((name, db)),
            None => Err(error(sql, format!("Unknown database '{name}'"))),
        }
    }

    fn apply(&mut self, session: &mut Session, sql: &str) -> Result<Outcome, BackendError> {
        if let Some(caps) = CREATE_DATABASE.captures(sql) {
            let name = unquote(&caps[1]);
            if self.databases.contains_key(&name) {
                return Err(error(
                    sql,
                    format!("Can't create database '{name}'; database exists"),
                ));
            }
            self.databases.insert(name, MockDatabase::default());
            return Ok(Outcome::affected(1));
        }

        if let Some(caps) = DROP_DATABASE.captures(sql) {
            let if_exists = caps.get(1).is_some();
            let name = unquote(&caps[2]);
            if self.databases.remove(&name).is_none() && !if_exists {
                return Err(error(
                    sql,
                    format!("Can't drop database '{name}'; database doesn't exist"),
                ));
            }
            if session.database.as_deref() == Some(name.as_str()) {
                session.database = None;
            }
            return Ok(Outcome::affected(0));
        }

        if let Some(caps) = USE_DATABASE.captures(sql) {
            let name = unquote(&caps[1]);
            if !self.databases.contains_key(&name) {
                return Err(error(sql, format!("Unknown database '{name}'")));
            }
            session.database = Some(name);
            return Ok(Outcome::default());
        }

        if SELECT_DATABASE.is_match(sql) {
            let value = session.database.clone().map_or(Value::Null, Value::Text);
            return Ok(Outcome::single(value));
        }

        if SELECT_STATS_EXPIRY.is_match(sql) {
            return Ok(Outcome::single(Value::UInt(session.stats_expiry)));
        }

        if let Some(caps) = SET_STATS_EXPIRY.captures(sql) {
            session.stats_expiry = caps[1]
                .parse()
                .map_err(|_| error(sql, "Incorrect argument type"))?;
            return Ok(Outcome::default());
        }

        if let Some(caps) = SET_FOREIGN_KEY_CHECKS.captures(sql) {
            session.foreign_key_checks = &caps[1] == "1";
            return Ok(Outcome::default());
        }

        if let Some(caps) = SHOW_DATABASES.captures(sql) {
            let filter = match caps.get(1) {
                Some(pattern) => Some(
                    like_regex(pattern.as_str()).ok_or_else(|| error(sql, "bad LIKE pattern"))?,
                ),
                None => None,
            };
            let rows = self
                .databases
                .keys()
                .filter(|name| filter.as_ref().is_none_or(|re| re.is_match(name)))
                .map(|name| Row::new(vec![Value::Text(name.clone())]))
                .collect();
            return Ok(Outcome::rows(rows));
        }

        if DIRTY_TABLES.is_match(sql) {
            let fresh = session.stats_expiry == 0;
            let (_, db) = self.current_database(session, sql)?;
            let mut rows = Vec::new();
            for (name, table) in &mut db.tables {
                if fresh {
                    table.cached_rows = table.rows;
                    table.cached_auto_increment = table.auto_increment;
                }
                if table.cached_rows > 0 || table.cached_auto_increment.is_some_and(|n| n > 1) {
                    rows.push(Row::new(vec![Value::Text(name.clone())]));
                }
            }
            return Ok(Outcome::rows(rows));
        }

        if let Some(caps) = CREATE_TABLE.captures(sql) {
            let name = unquote(&caps[1]);
            let body = &caps[2];
            let (db_name, db) = self.current_database(session, sql)?;
            if db.tables.contains_key(&name) {
                return Err(error(sql, format!("Table '{name}' already exists")));
            }
            let references: Vec<String> = REFERENCES
                .captures_iter(body)
                .map(|c| unquote(&c[1]))
                .collect();
            if let Some(missing) = references
                .iter()
                .find(|r| **r != name && !db.tables.contains_key(*r))
            {
                return Err(error(
                    sql,
                    format!("Failed to open the referenced table '{missing}' in {db_name}"),
                ));
            }
            let auto_increment = AUTO_INCREMENT.is_match(body).then_some(1);
            db.tables.insert(
                name,
                MockTable {
                    auto_increment,
                    cached_auto_increment: auto_increment,
                    references,
                    ..MockTable::default()
                },
            );
            return Ok(Outcome::default());
        }

        if let Some(caps) = INSERT.captures(sql) {
            let name = unquote(&caps[1]);
            let inserted = count_value_tuples(&caps[2]);
            let checks = session.foreign_key_checks;
            let (db_name, db) = self.current_database(session, sql)?;
            let parents_empty = db
                .tables
                .get(&name)
                .ok_or_else(|| error(sql, format!("Table '{db_name}.{name}' doesn't exist")))?
                .references
                .iter()
                .any(|parent| {
                    *parent != name && db.tables.get(parent).is_none_or(|t| t.rows == 0)
                });
            if checks && parents_empty {
                return Err(error(
                    sql,
                    "Cannot add or update a child row: a foreign key constraint fails",
                ));
            }
            if let Some(table) = db.tables.get_mut(&name) {
                table.rows += inserted;
                if let Some(next) = table.auto_increment.as_mut() {
                    *next += inserted;
                }
            }
            return Ok(Outcome::affected(inserted));
        }

        if let Some(caps) = DELETE_ALL.captures(sql) {
            let name = unquote(&caps[1]);
            let (db_name, db) = self.current_database(session, sql)?;
            let table = db
                .tables
                .get_mut(&name)
                .ok_or_else(|| error(sql, format!("Table '{db_name}.{name}' doesn't exist")))?;
            let deleted = std::mem::take(&mut table.rows);
            return Ok(Outcome::affected(deleted));
        }

        if let Some(caps) = TRUNCATE.captures(sql) {
            let name = unquote(&caps[1]);
            let checks = session.foreign_key_checks;
            let (db_name, db) = self.current_database(session, sql)?;
            if !db.tables.contains_key(&name) {
                return Err(error(sql, format!("Table '{db_name}.{name}' doesn't exist")));
            }
            let referencing = db
                .tables
                .iter()
                .find(|(child, t)| **child != name && t.references.contains(&name));
            if let (true, Some((child, _))) = (checks, referencing) {
                return Err(error(
                    sql,
                    format!(
                        "Cannot truncate a table referenced in a foreign key constraint \
                         (`{db_name}`.`{child}`)"
                    ),
                ));
            }
            if let Some(table) = db.tables.get_mut(&name) {
                table.rows = 0;
                if table.auto_increment.is_some() {
                    table.auto_increment = Some(1);
                }
            }
            return Ok(Outcome::default());
        }

        if let Some(caps) = COUNT_ROWS.captures(sql) {
            let name = unquote(&caps[1]);
            let (db_name, db) = self.current_database(session, sql)?;
            let table = db
                .tables
                .get(&name)
                .ok_or_else(|| error(sql, format!("Table '{db_name}.{name}' doesn't exist")))?;
            return Ok(Outcome::single(Value::Int(table.rows as i64)));
        }

        Err(error(sql, "statement not supported by mock engine"))
    }
}

/// In-memory MySQL stand-in implementing [`Backend`].
///
/// Clones share the same engine, so a test can keep one clone for
/// inspection while the pool owns another.
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<Mutex<EngineState>>,
}

impl fmt::Debug for MockEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockEngine")
            .field("databases", &state.databases.len())
            .field("open_connections", &state.open_connections)
            .finish_non_exhaustive()
    }
}

impl MockEngine {
    /// Create an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every statement matching `pattern` (case-insensitive regex).
    ///
    /// Connects are matched as `CONNECT <database>` and closes as
    /// `CLOSE <database>`, naming the database the session was opened on
    /// (empty for sessions opened without one).
    pub fn fail_matching(&self, pattern: &str) -> Result<(), regex::Error> {
        self.add_failure(pattern, DEFAULT_FAILURE_MESSAGE, None)
    }

    /// Fail the next `times` statements matching `pattern`.
    pub fn fail_matching_times(&self, pattern: &str, times: usize) -> Result<(), regex::Error> {
        self.add_failure(pattern, DEFAULT_FAILURE_MESSAGE, Some(times))
    }

    /// Fail statements matching `pattern` with a custom server message.
    pub fn fail_with_message(
        &self,
        pattern: &str,
        message: impl Into<String>,
    ) -> Result<(), regex::Error> {
        self.add_failure(pattern, message, None)
    }

    fn add_failure(
        &self,
        pattern: &str,
        message: impl Into<String>,
        remaining: Option<usize>,
    ) -> Result<(), regex::Error> {
        if remaining == Some(0) {
            return Ok(());
        }
        let pattern = Regex::new(&format!("(?i){pattern}"))?;
        self.state.lock().failures.push(FailureRule {
            pattern,
            message: message.into(),
            remaining,
        });
        Ok(())
    }

    /// Remove all failure rules.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Delay every connect and statement by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Every statement executed so far, in order, across all sessions.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Forget the statement log.
    pub fn clear_statements(&self) {
        self.state.lock().log.clear();
    }

    /// Names of all existing databases, sorted.
    #[must_use]
    pub fn databases(&self) -> Vec<String> {
        self.state.lock().databases.keys().cloned().collect()
    }

    /// Whether `name` exists.
    #[must_use]
    pub fn has_database(&self, name: &str) -> bool {
        self.state.lock().databases.contains_key(name)
    }

    /// Actual row count of `database.table`.
    #[must_use]
    pub fn table_rows(&self, database: &str, table: &str) -> Option<u64> {
        let state = self.state.lock();
        Some(state.databases.get(database)?.tables.get(table)?.rows)
    }

    /// Next auto-increment value of `database.table`, if it has one.
    #[must_use]
    pub fn auto_increment(&self, database: &str, table: &str) -> Option<u64> {
        let state = self.state.lock();
        state.databases.get(database)?.tables.get(table)?.auto_increment
    }

    /// Sessions opened and not yet closed.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.state.lock().open_connections
    }

    /// Sessions opened since the engine was created.
    #[must_use]
    pub fn connections_opened(&self) -> usize {
        self.state.lock().connections_opened
    }

    async fn delay(&self) {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait::async_trait]
impl Backend for MockEngine {
    type Connection = MockConnection;

    async fn connect(&self, options: &ConnectOptions) -> Result<MockConnection, BackendError> {
        self.delay().await;

        let mut state = self.state.lock();
        let target = options.database.as_deref().unwrap_or("");
        if let Some(message) = state.take_failure(&format!("CONNECT {target}")) {
            return Err(BackendError::Connect(message));
        }
        if let Some(database) = &options.database {
            if !state.databases.contains_key(database) {
                return Err(BackendError::Connect(format!("Unknown database '{database}'")));
            }
        }
        state.open_connections += 1;
        state.connections_opened += 1;
        let id = state.connections_opened as u64;
        drop(state);

        tracing::trace!(id, database = target, "mock session opened");
        Ok(MockConnection {
            engine: self.clone(),
            id,
            opened_on: options.database.clone(),
            session: Mutex::new(Session {
                database: options.database.clone(),
                foreign_key_checks: true,
                stats_expiry: DEFAULT_STATS_EXPIRY,
                multi_statements: options.multi_statements,
                closed: false,
            }),
        })
    }
}

#[derive(Debug, Clone)]
struct Session {
    database: Option<String>,
    foreign_key_checks: bool,
    stats_expiry: u64,
    multi_statements: bool,
    closed: bool,
}

/// Session-level state of a [`MockConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Currently selected database.
    pub database: Option<String>,
    /// `FOREIGN_KEY_CHECKS`.
    pub foreign_key_checks: bool,
    /// `information_schema_stats_expiry`.
    pub stats_expiry: u64,
    /// Whether the session was closed.
    pub closed: bool,
}

/// A session on a [`MockEngine`].
pub struct MockConnection {
    engine: MockEngine,
    id: u64,
    opened_on: Option<String>,
    session: Mutex<Session>,
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnection")
            .field("id", &self.id)
            .field("session", &*self.session.lock())
            .finish()
    }
}

impl MockConnection {
    /// Engine-wide session number.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current session variables.
    #[must_use]
    pub fn session(&self) -> SessionSnapshot {
        let session = self.session.lock();
        SessionSnapshot {
            database: session.database.clone(),
            foreign_key_checks: session.foreign_key_checks,
            stats_expiry: session.stats_expiry,
            closed: session.closed,
        }
    }

    fn run(&self, sql: &str) -> Result<Outcome, BackendError> {
        // Lock order: session, then engine.
        let mut session = self.session.lock();
        if session.closed {
            return Err(BackendError::Closed);
        }

        let statements = split_statements(sql);
        if statements.is_empty() {
            return Err(error(sql, "Query was empty"));
        }
        if statements.len() > 1 && !session.multi_statements {
            return Err(error(
                sql,
                "You have an error in your SQL syntax; multiple statements are not enabled",
            ));
        }

        let mut state = self.engine.state.lock();
        let mut outcome = Outcome::default();
        for statement in statements {
            state.log.push(statement.to_owned());
            if let Some(message) = state.take_failure(statement) {
                return Err(error(statement, message));
            }
            let next = state.apply(&mut session, statement)?;
            outcome.affected += next.affected;
            outcome.rows = next.rows;
        }
        Ok(outcome)
    }
}

#[async_trait::async_trait]
impl Connection for MockConnection {
    async fn execute(&self, sql: &str) -> Result<u64, BackendError> {
        self.engine.delay().await;
        Ok(self.run(sql)?.affected)
    }

    async fn query(&self, sql: &str) -> Result<Vec<Row>, BackendError> {
        self.engine.delay().await;
        Ok(self.run(sql)?.rows)
    }

    async fn close(&self) -> Result<(), BackendError> {
        let mut session = self.session.lock();
        if session.closed {
            return Ok(());
        }
        session.closed = true;

        let mut state = self.engine.state.lock();
        state.open_connections = state.open_connections.saturating_sub(1);
        let subject = format!("CLOSE {}", self.opened_on.as_deref().unwrap_or(""));
        match state.take_failure(&subject) {
            Some(message) => Err(BackendError::Other(message.into())),
            None => Ok(()),
        }
    }
}

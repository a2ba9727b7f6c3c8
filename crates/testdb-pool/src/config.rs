//! Pool configuration.

use std::fmt;
use std::sync::Arc;

use crate::error::PoolError;

/// Default MySQL port.
pub const DEFAULT_PORT: u16 = 3306;

/// Default prefix for generated database names.
pub const DEFAULT_NAME_PREFIX: &str = "test_";

/// MySQL identifiers are limited to 64 characters; generated names append
/// 16 hex characters to the prefix.
pub const MAX_NAME_PREFIX_LEN: usize = 48;

/// Environment variables read by [`ConnectOptions::from_env`].
pub mod env {
    /// Server host. Required.
    pub const HOST: &str = "MYSQLPOOL_HOST";
    /// Server port.
    pub const PORT: &str = "MYSQLPOOL_PORT";
    /// Login user.
    pub const USER: &str = "MYSQLPOOL_USER";
    /// Login password.
    pub const PASSWORD: &str = "MYSQLPOOL_PASS";
}

/// Connection settings for the database server.
///
/// The pool uses this as a template: the administrative session clears
/// [`database`](Self::database), and each pooled database gets a copy with
/// its own name filled in.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Login password.
    pub password: String,
    /// Database selected after login, if any.
    pub database: Option<String>,
    /// Whether one `execute` call may contain several statements.
    pub multi_statements: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: DEFAULT_PORT,
            user: "root".into(),
            password: String::new(),
            database: None,
            multi_statements: false,
        }
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("multi_statements", &self.multi_statements)
            .finish()
    }
}

impl ConnectOptions {
    /// Create options with default values (`root@localhost:3306`).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read options from `MYSQLPOOL_*` environment variables.
    ///
    /// Returns `None` when `MYSQLPOOL_HOST` is unset or empty, which lets
    /// integration tests skip cleanly on machines without a server.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let host = std::env::var(env::HOST).ok().filter(|h| !h.is_empty())?;
        let port = std::env::var(env::PORT)
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        Some(Self {
            host,
            port,
            user: std::env::var(env::USER).unwrap_or_default(),
            password: std::env::var(env::PASSWORD).unwrap_or_default(),
            ..Self::default()
        })
    }

    /// Set the host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the login user.
    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the login password.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Select a database after login.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Enable or disable multi-statement execution.
    #[must_use]
    pub fn multi_statements(mut self, enabled: bool) -> Self {
        self.multi_statements = enabled;
        self
    }

    /// Copy of these options bound to `database`.
    #[must_use]
    pub fn with_database(&self, database: &str) -> Self {
        Self {
            database: Some(database.to_owned()),
            ..self.clone()
        }
    }

    /// Copy of these options with no database selected.
    #[must_use]
    pub fn without_database(&self) -> Self {
        Self {
            database: None,
            ..self.clone()
        }
    }
}

/// Configuration for a [`Pool`](crate::Pool).
///
/// This struct is marked `#[non_exhaustive]`; construct it with
/// [`PoolConfig::new`] and the builder methods.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Server connection template.
    pub connect: ConnectOptions,

    /// Schema script applied to every freshly created database.
    ///
    /// Executed as a single multi-statement batch.
    pub ddl: Arc<str>,

    /// Literal prefix for generated database names.
    pub name_prefix: Arc<str>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect: ConnectOptions::default(),
            ddl: Arc::from(""),
            name_prefix: Arc::from(DEFAULT_NAME_PREFIX),
        }
    }
}

impl PoolConfig {
    /// Create a pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server connection template.
    #[must_use]
    pub fn connect_options(mut self, options: ConnectOptions) -> Self {
        self.connect = options;
        self
    }

    /// Set the schema script.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use testdb_pool::PoolConfig;
    ///
    /// let config = PoolConfig::new().ddl(
    ///     "CREATE TABLE parent (id INT PRIMARY KEY);\
    ///      CREATE TABLE child (id INT PRIMARY KEY, parent_id INT, \
    ///      FOREIGN KEY (parent_id) REFERENCES parent(id));",
    /// );
    /// assert!(config.ddl.starts_with("CREATE TABLE parent"));
    /// ```
    #[must_use]
    pub fn ddl(mut self, ddl: impl Into<Arc<str>>) -> Self {
        self.ddl = ddl.into();
        self
    }

    /// Set the database name prefix.
    #[must_use]
    pub fn name_prefix(mut self, prefix: impl Into<Arc<str>>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.name_prefix.is_empty() {
            return Err(PoolError::Configuration(
                "name_prefix must not be empty".into(),
            ));
        }
        if self.name_prefix.len() > MAX_NAME_PREFIX_LEN {
            return Err(PoolError::Configuration(format!(
                "name_prefix must be at most {MAX_NAME_PREFIX_LEN} bytes"
            )));
        }
        if !self
            .name_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        {
            return Err(PoolError::Configuration(
                "name_prefix may only contain ASCII letters, digits, '_' and '$'".into(),
            ));
        }
        if self.connect.host.is_empty() {
            return Err(PoolError::Configuration("host must not be empty".into()));
        }
        Ok(())
    }
}

//! MySQL container support via testcontainers.

use testcontainers::Image;
use testcontainers::core::{ContainerPort, WaitFor};
use testdb_pool::ConnectOptions;

/// Port MySQL listens on inside the container.
pub const MYSQL_PORT: u16 = 3306;

/// MySQL container image.
///
/// Uses the official `mysql` image. The server only becomes reachable after
/// its initialization restart, which is signalled by the X Plugin banner.
#[derive(Debug, Clone)]
pub struct MySqlContainer {
    /// Root password.
    pub password: String,
    /// Container tag (version).
    pub tag: String,
}

impl Default for MySqlContainer {
    fn default() -> Self {
        Self {
            password: "Password123!".to_string(),
            tag: "8.4".to_string(),
        }
    }
}

impl MySqlContainer {
    /// Create a new MySQL container configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the root password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Set the container tag (MySQL version).
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Connection options for a started container mapped to `host:port`.
    #[must_use]
    pub fn connect_options(&self, host: impl Into<String>, port: u16) -> ConnectOptions {
        ConnectOptions::new()
            .host(host)
            .port(port)
            .user("root")
            .password(self.password.clone())
    }
}

impl Image for MySqlContainer {
    fn name(&self) -> &str {
        "mysql"
    }

    fn tag(&self) -> &str {
        &self.tag
    }

    fn ready_conditions(&self) -> Vec<WaitFor> {
        vec![WaitFor::message_on_stderr(
            "X Plugin ready for connections. Bind-address:",
        )]
    }

    fn env_vars(
        &self,
    ) -> impl IntoIterator<
        Item = (
            impl Into<std::borrow::Cow<'_, str>>,
            impl Into<std::borrow::Cow<'_, str>>,
        ),
    > {
        vec![("MYSQL_ROOT_PASSWORD", self.password.as_str())]
    }

    fn expose_ports(&self) -> &[ContainerPort] {
        &[ContainerPort::Tcp(MYSQL_PORT)]
    }
}

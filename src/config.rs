//! Server configuration.
//!
//! ```text
//! wicket.toml
//!     → ServerConfig::load (read + deserialize, every field defaulted)
//!     → ServerConfig::validate (semantic checks)
//!     → Server::new (immutable for the server's lifetime)
//! ```
//!
//! The bind address, port, server name and aliases double as the primary
//! virtual host's descriptor.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use http::Version;
use serde::{Deserialize, Serialize};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation failed: {}", .0.join(", "))]
    Validation(Vec<String>),
}

/// Root configuration for a [`Server`](crate::Server).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the listener binds to.
    pub bind_address: IpAddr,

    /// Port the listener binds to.
    pub port: u16,

    /// Name of the primary virtual host. Also `SERVER_NAME` for CGI scripts
    /// when the request carries no `Host` header.
    pub server_name: String,

    /// Extra host names (exact or glob) answered by the primary host.
    pub server_aliases: Vec<String>,

    /// Value of the `Server` response header.
    pub server_software: String,

    /// Highest protocol version the server speaks: `"1.0"` or `"1.1"`.
    pub http_version: String,

    /// Whether the server is willing to keep connections open.
    pub keep_alive: bool,

    /// How long a connection may sit idle waiting for the next request.
    pub request_timeout_ms: u64,

    /// Granularity of the idle wait; the stop flag is checked once per tick.
    pub poll_interval_ms: u64,

    pub max_header_bytes: usize,

    pub max_body_bytes: usize,

    /// Put fault detail into 500 response bodies. Off in production.
    pub expose_error_detail: bool,

    /// Scratch directory for subprocess output sinks. `None` = OS temp dir.
    pub temp_dir: Option<PathBuf>,

    pub cgi: CgiConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([0, 0, 0, 0]),
            port: 8080,
            server_name: "localhost".to_owned(),
            server_aliases: Vec::new(),
            server_software: concat!("wicket/", env!("CARGO_PKG_VERSION")).to_owned(),
            http_version: "1.1".to_owned(),
            keep_alive: true,
            request_timeout_ms: 30_000,
            poll_interval_ms: 500,
            max_header_bytes: 16 * 1024,
            max_body_bytes: 8 * 1024 * 1024,
            expose_error_detail: false,
            temp_dir: None,
            cgi: CgiConfig::default(),
        }
    }
}

/// Subprocess delegation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CgiConfig {
    /// Fixed command line of the runner process (program followed by args).
    pub runner: Vec<String>,

    /// Interpreter appended to the runner command line, e.g. `/usr/bin/python3`.
    pub interpreter: Option<String>,

    /// `PATH` handed to scripts.
    pub path_env: String,
}

impl Default for CgiConfig {
    fn default() -> Self {
        Self {
            runner: vec!["wicket-cgi-runner".to_owned()],
            interpreter: None,
            path_env: "/usr/local/bin:/usr/bin:/bin".to_owned(),
        }
    }
}

impl ServerConfig {
    /// Loads and validates configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic checks serde cannot express. Collects every problem rather
    /// than stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.server_name.trim().is_empty() {
            errors.push("server_name must not be empty".to_owned());
        }
        if self.parsed_http_version().is_none() {
            errors.push(format!("unknown http_version `{}`", self.http_version));
        }
        if self.poll_interval_ms == 0 {
            errors.push("poll_interval_ms must be greater than zero".to_owned());
        }
        if self.request_timeout_ms < self.poll_interval_ms {
            errors.push("request_timeout_ms must be at least poll_interval_ms".to_owned());
        }
        if self.max_header_bytes == 0 {
            errors.push("max_header_bytes must be greater than zero".to_owned());
        }
        if self.cgi.runner.first().is_none_or(|program| program.is_empty()) {
            errors.push("cgi.runner must name a program".to_owned());
        }

        if errors.is_empty() { Ok(()) } else { Err(ConfigError::Validation(errors)) }
    }

    pub(crate) fn parsed_http_version(&self) -> Option<Version> {
        match self.http_version.as_str() {
            "1.0" => Some(Version::HTTP_10),
            "1.1" => Some(Version::HTTP_11),
            _ => None,
        }
    }

    /// Protocol version written on status lines. Falls back to 1.1 for a
    /// config that skipped validation.
    pub fn version(&self) -> Version {
        self.parsed_http_version().unwrap_or(Version::HTTP_11)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

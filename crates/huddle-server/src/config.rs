//! Server configuration.
//!
//! Configuration is layered:
//! - The first TOML file found among `$HUDDLE_CONFIG`, `huddle.toml`,
//!   `/etc/huddle/huddle.toml` and `~/.config/huddle/huddle.toml`
//! - Environment variables (`HUDDLE_PORT`, `HUDDLE_LIMITS__MAX_ROOMS`, ...)
//! - Built-in defaults for anything left unset

use anyhow::{bail, Context, Result};
use config::{ConfigError, Environment, Source};
use huddle_core::{GatewayConfig, MembershipConfig};
use huddle_protocol::FrameCodec;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

type FileSource = ::config::File<::config::FileSourceFile, ::config::FileFormat>;

const ENV_PREFIX: &str = "HUDDLE";
const CONFIG_PATHS: [&str; 3] = [
    "huddle.toml",
    "/etc/huddle/huddle.toml",
    "~/.config/huddle/huddle.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Peer identity.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of live connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum number of rooms.
    #[serde(default = "default_max_rooms")]
    pub max_rooms: usize,

    /// Maximum rooms one connection may join.
    #[serde(default = "default_max_rooms_per_connection")]
    pub max_rooms_per_connection: usize,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Maximum chat message length in bytes.
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,

    /// Outbound events buffered per connection.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

/// Identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Header carrying the user id set by an upstream proxy.
    #[serde(default = "default_user_header")]
    pub user_header: String,

    /// Reject connections without a user id.
    #[serde(default)]
    pub require_user: bool,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_rooms() -> usize {
    10_000
}

fn default_max_rooms_per_connection() -> usize {
    100
}

fn default_max_frame_size() -> usize {
    64 * 1024
}

fn default_max_message_length() -> usize {
    16 * 1024
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_user_header() -> String {
    "x-user-id".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_rooms: default_max_rooms(),
            max_rooms_per_connection: default_max_rooms_per_connection(),
            max_frame_size: default_max_frame_size(),
            max_message_length: default_max_message_length(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            user_header: default_user_header(),
            require_user: false,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, then the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or if
    /// the result fails validation.
    pub fn load() -> Result<Self> {
        let file = Self::find_file();
        let config = match &file {
            Some(path) => Self::from_sources(
                Some(FileSource::from(path.as_path()).required(true)),
                environment(),
            )
            .with_context(|| format!("Failed to load config file: {}", path.display()))?,
            None => Self::from_sources(None::<FileSource>, environment())
                .context("Failed to load config from environment")?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Path of the config file to use, if any exists.
    fn find_file() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("HUDDLE_CONFIG") {
            return Some(PathBuf::from(shellexpand::tilde(&path).as_ref()));
        }

        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    fn from_sources<S>(file: Option<S>, env: Environment) -> Result<Self, ConfigError>
    where
        S: Source + Send + Sync + 'static,
    {
        let mut builder = ::config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(file);
        }
        builder.add_source(env).build()?.try_deserialize()
    }

    /// Reject limits the gateway cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        for (name, value) in [
            ("limits.max_connections", limits.max_connections),
            ("limits.max_rooms", limits.max_rooms),
            ("limits.max_rooms_per_connection", limits.max_rooms_per_connection),
            ("limits.max_frame_size", limits.max_frame_size),
            ("limits.max_message_length", limits.max_message_length),
            ("limits.outbound_buffer", limits.outbound_buffer),
        ] {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }

        if !self.transport.websocket_path.starts_with('/') {
            bail!(
                "transport.websocket_path must start with '/': {}",
                self.transport.websocket_path
            );
        }
        if self.auth.user_header.trim().is_empty() {
            bail!("auth.user_header must not be empty");
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Gateway settings derived from the limits.
    #[must_use]
    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            membership: MembershipConfig {
                max_rooms: self.limits.max_rooms,
                max_rooms_per_connection: self.limits.max_rooms_per_connection,
            },
            outbound_capacity: self.limits.outbound_buffer,
            max_message_length: self.limits.max_message_length,
        }
    }

    /// Frame codec honoring the frame size limit.
    #[must_use]
    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.limits.max_frame_size)
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

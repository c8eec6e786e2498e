//! Server configuration: TOML file + CLI overrides.

use crate::engine::{DestinationPolicy, EngineConfig};
use htunnel_core::{TunnelError, TunnelResult, DEFAULT_DRAIN_LIMIT};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub policy: PolicySection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// HTTP path the tunnel endpoint is mounted at.
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Seconds without any request before a session is reaped.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default = "default_gc_interval")]
    pub gc_interval: u64,
    /// Largest accepted request body, in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            path: default_path(),
            max_sessions: default_max_sessions(),
            idle_timeout: default_idle_timeout(),
            gc_interval: default_gc_interval(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// `[engine]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// Upper bound of one readiness wait, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_drain_limit")]
    pub drain_limit: usize,
    /// Largest payload read from a stream per iteration.
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            drain_limit: default_drain_limit(),
            read_chunk: default_read_chunk(),
            connect_timeout: default_connect_timeout(),
            write_timeout: default_write_timeout(),
        }
    }
}

/// `[policy]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicySection {
    #[serde(default = "default_allowed_destinations")]
    pub allowed_destinations: Vec<String>,
    /// Streams one session may track at once.
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            allowed_destinations: default_allowed_destinations(),
            max_streams: default_max_streams(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_path() -> String {
    "/tunnel".to_string()
}
fn default_max_sessions() -> usize {
    100
}
fn default_idle_timeout() -> u64 {
    3600
}
fn default_gc_interval() -> u64 {
    60
}
fn default_max_body_bytes() -> usize {
    8 * 1024 * 1024
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_drain_limit() -> usize {
    DEFAULT_DRAIN_LIMIT
}
fn default_read_chunk() -> usize {
    // 65000 bytes once base64-encoded
    48750
}
fn default_connect_timeout() -> u64 {
    8
}
fn default_write_timeout() -> u64 {
    10
}
fn default_allowed_destinations() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_max_streams() -> usize {
    256
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub max_sessions: Option<usize>,
    pub idle_timeout: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub path: String,
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub gc_interval: Duration,
    pub max_body: usize,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), CliOverrides::default())
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> TunnelResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| TunnelError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let config = Self::resolve(file_config, cli);
        config.validate()?;
        Ok(config)
    }

    fn resolve(file: ConfigFile, cli: CliOverrides) -> Self {
        let poll_interval_ms = cli.poll_interval_ms.unwrap_or(file.engine.poll_interval_ms);
        Self {
            bind: cli.bind.unwrap_or(file.server.bind),
            port: cli.port.unwrap_or(file.server.port),
            path: cli.path.unwrap_or(file.server.path),
            max_sessions: cli.max_sessions.unwrap_or(file.server.max_sessions),
            idle_timeout: Duration::from_secs(cli.idle_timeout.unwrap_or(file.server.idle_timeout)),
            gc_interval: Duration::from_secs(file.server.gc_interval),
            max_body: file.server.max_body_bytes,
            engine: EngineConfig {
                poll_interval: Duration::from_millis(poll_interval_ms),
                drain_limit: file.engine.drain_limit,
                read_chunk: file.engine.read_chunk,
                connect_timeout: Duration::from_secs(file.engine.connect_timeout),
                write_timeout: Duration::from_secs(file.engine.write_timeout),
                policy: DestinationPolicy {
                    allowed_destinations: file.policy.allowed_destinations,
                    max_streams: file.policy.max_streams,
                },
            },
        }
    }

    fn validate(&self) -> TunnelResult<()> {
        if !self.path.starts_with('/') {
            return Err(TunnelError::Config(format!(
                "endpoint path must start with '/': {}",
                self.path
            )));
        }
        if self.engine.drain_limit == 0 || self.engine.read_chunk == 0 || self.max_body == 0 {
            return Err(TunnelError::Config(
                "drain_limit, read_chunk and max_body_bytes must be positive".to_string(),
            ));
        }
        if self.engine.poll_interval.is_zero() || self.gc_interval.is_zero() {
            return Err(TunnelError::Config(
                "poll and gc intervals must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// `bind:port` string for the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

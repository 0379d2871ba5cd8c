//! Configuration system for the Peerlink relay server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/peerlink-relay/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;
use std::time::Duration;

use crate::session::SessionConfig;

/// Errors that can occur when loading relay configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A resolved value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure for the relay.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayConfigFile {
    server: ServerFileConfig,
    session: SessionFileConfig,
}

/// `[server]` section of the relay config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    host: Option<String>,
    port: Option<u16>,
    static_dir: Option<PathBuf>,
}

/// `[session]` section of the relay config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    max_frame_size: Option<usize>,
    queue_capacity: Option<usize>,
    ping_interval_secs: Option<u64>,
    pong_wait_secs: Option<u64>,
    write_wait_secs: Option<u64>,
    relay_signaling: Option<bool>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the relay server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Peerlink relay server")]
pub struct RelayCliArgs {
    /// Interface to listen on.
    #[arg(long, env = "RELAY_HOST")]
    pub host: Option<String>,

    /// Port to listen on.
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Directory served for any path other than `/ws` and `/api/health`.
    #[arg(long, env = "STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    /// Path to config file (default: `~/.config/peerlink-relay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Largest inbound frame in bytes; larger frames close the session.
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Outbound queue capacity per session.
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Seconds between keepalive pings.
    #[arg(long)]
    pub ping_interval_secs: Option<u64>,

    /// Seconds to wait for a pong before closing the session.
    #[arg(long)]
    pub pong_wait_secs: Option<u64>,

    /// Seconds allowed for a single write.
    #[arg(long)]
    pub write_wait_secs: Option<u64>,

    /// Forward presence and signaling envelopes (`true` or `false`).
    #[arg(long)]
    pub relay_signaling: Option<bool>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "RELAY_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Interface to bind (e.g., `0.0.0.0`).
    pub host: String,
    /// Port to bind.
    pub port: u16,
    /// Root of the static file tree.
    pub static_dir: PathBuf,
    /// Per-session limits and admission policy.
    pub session: SessionConfig,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            static_dir: PathBuf::from("./static"),
            session: SessionConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if the resolved timings or sizes are invalid.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.validate()?;
        Ok(config)
    }

    /// `host:port` string suitable for binding a listener.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolve a `RelayConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &RelayCliArgs, file: &RelayConfigFile) -> Self {
        let defaults = Self::default();
        let session = &file.session;
        let secs = |cli: Option<u64>, file: Option<u64>, default: Duration| {
            cli.or(file).map_or(default, Duration::from_secs)
        };

        Self {
            host: cli
                .host
                .clone()
                .or_else(|| file.server.host.clone())
                .unwrap_or(defaults.host),
            port: cli.port.or(file.server.port).unwrap_or(defaults.port),
            static_dir: cli
                .static_dir
                .clone()
                .or_else(|| file.server.static_dir.clone())
                .unwrap_or(defaults.static_dir),
            session: SessionConfig {
                max_frame_size: cli
                    .max_frame_size
                    .or(session.max_frame_size)
                    .unwrap_or(defaults.session.max_frame_size),
                queue_capacity: cli
                    .queue_capacity
                    .or(session.queue_capacity)
                    .unwrap_or(defaults.session.queue_capacity),
                ping_interval: secs(
                    cli.ping_interval_secs,
                    session.ping_interval_secs,
                    defaults.session.ping_interval,
                ),
                pong_wait: secs(
                    cli.pong_wait_secs,
                    session.pong_wait_secs,
                    defaults.session.pong_wait,
                ),
                write_wait: secs(
                    cli.write_wait_secs,
                    session.write_wait_secs,
                    defaults.session.write_wait,
                ),
                relay_signaling: cli
                    .relay_signaling
                    .or(session.relay_signaling)
                    .unwrap_or(defaults.session.relay_signaling),
            },
            log_level: cli.log_level.clone(),
        }
    }

    /// Checks that the resolved values can run a session.
    fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;
        if session.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".into()));
        }
        if session.max_frame_size == 0 {
            return Err(ConfigError::Invalid("max_frame_size must be at least 1".into()));
        }
        if session.ping_interval.is_zero() || session.ping_interval >= session.pong_wait {
            return Err(ConfigError::Invalid(format!(
                "ping interval ({:?}) must be non-zero and shorter than pong wait ({:?})",
                session.ping_interval, session.pong_wait
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file for the relay.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<RelayConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(RelayConfigFile::default());
        };
        config_dir.join("peerlink-relay").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}

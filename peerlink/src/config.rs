//! Configuration system for the Peerlink client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/peerlink/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::client::ClientOptions;

/// Errors that can occur when loading configuration.
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

    /// The relay URL is not a `ws://` or `wss://` URL.
    #[error("invalid relay url {url:?}: {reason}")]
    InvalidRelayUrl {
        /// The rejected value.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A resolved value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    p2p: P2pFileConfig,
    log: LogFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    relay_url: Option<String>,
    connect_timeout_secs: Option<u64>,
    reconnect_delay_secs: Option<u64>,
}

/// `[p2p]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct P2pFileConfig {
    enabled: Option<bool>,
    stun_servers: Option<Vec<String>>,
}

/// `[log]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct LogFileConfig {
    max_entries: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay server WebSocket URL.
    pub relay_url: String,
    /// Whether to negotiate direct channels with discovered peers.
    pub p2p: bool,
    /// STUN servers offered to the WebRTC stack.
    pub stun_servers: Vec<String>,
    /// Timeout for a single relay connection attempt.
    pub connect_timeout: Duration,
    /// Delay before reconnecting after the relay connection drops.
    pub reconnect_delay: Duration,
    /// Number of entries kept in the message log.
    pub max_log_entries: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080/ws".to_string(),
            p2p: false,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(3),
            max_log_entries: 500,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path
    /// (`~/.config/peerlink/config.toml`) is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if the resolved relay URL or log size is invalid.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.validate()?;
        Ok(config)
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            relay_url: cli
                .relay_url
                .clone()
                .or_else(|| file.network.relay_url.clone())
                .unwrap_or(defaults.relay_url),
            p2p: cli.p2p.or(file.p2p.enabled).unwrap_or(defaults.p2p),
            stun_servers: if cli.stun.is_empty() {
                file.p2p
                    .stun_servers
                    .clone()
                    .unwrap_or(defaults.stun_servers)
            } else {
                cli.stun.clone()
            },
            connect_timeout: cli
                .connect_timeout_secs
                .or(file.network.connect_timeout_secs)
                .map_or(defaults.connect_timeout, Duration::from_secs),
            reconnect_delay: cli
                .reconnect_delay_secs
                .or(file.network.reconnect_delay_secs)
                .map_or(defaults.reconnect_delay, Duration::from_secs),
            max_log_entries: file.log.max_entries.unwrap_or(defaults.max_log_entries),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidRelayUrl {
            url: self.relay_url.clone(),
            reason,
        };
        let url = url::Url::parse(&self.relay_url).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(invalid(format!("unsupported scheme {:?}", url.scheme())));
        }
        if self.max_log_entries == 0 {
            return Err(ConfigError::Invalid("log max_entries must be at least 1".into()));
        }
        Ok(())
    }

    /// Runtime options for [`Client`](crate::client::Client).
    #[must_use]
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            relay_url: self.relay_url.clone(),
            p2p: self.p2p,
            connect_timeout: self.connect_timeout,
            reconnect_delay: self.reconnect_delay,
            max_log_entries: self.max_log_entries,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Relay chat with direct peer channels")]
pub struct CliArgs {
    /// WebSocket URL of the relay server.
    #[arg(long, env = "PEERLINK_RELAY_URL")]
    pub relay_url: Option<String>,

    /// Negotiate direct channels with discovered peers (`--p2p` or
    /// `--p2p=false`).
    #[arg(long, env = "PEERLINK_P2P", num_args = 0..=1, default_missing_value = "true")]
    pub p2p: Option<bool>,

    /// STUN server URL; repeat for several.
    #[arg(long = "stun")]
    pub stun: Vec<String>,

    /// Path to config file (default: `~/.config/peerlink/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Seconds allowed for a single relay connection attempt.
    #[arg(long)]
    pub connect_timeout_secs: Option<u64>,

    /// Seconds to wait before reconnecting to the relay.
    #[arg(long)]
    pub reconnect_delay_secs: Option<u64>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "PEERLINK_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/peerlink.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("peerlink").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}

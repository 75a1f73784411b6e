//! Configuration system for the relaywire client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/relaywire/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::supervisor::{Backoff, DEFAULT_MAX_QUEUED_FRAMES, SupervisorConfig};
use crate::transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_TRANSFER_SIZE};
use crate::transport::ws::DEFAULT_CONNECT_TIMEOUT;

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

    /// A value is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Offending key.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    reconnect: ReconnectFileConfig,
    transfer: TransferFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    relay_url: Option<String>,
    username: Option<String>,
    connect_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    base_delay_ms: Option<u64>,
    cap_secs: Option<u64>,
    max_queued_frames: Option<usize>,
}

/// `[transfer]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TransferFileConfig {
    chunk_size: Option<usize>,
    max_transfer_size: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Reconnect behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Backoff delay unit.
    pub base_delay: Duration,
    /// Longest delay between attempts.
    pub cap: Duration,
    /// Frames held while reconnecting.
    pub max_queued_frames: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        let backoff = Backoff::default();
        Self {
            base_delay: backoff.base,
            cap: backoff.cap,
            max_queued_frames: DEFAULT_MAX_QUEUED_FRAMES,
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay server WebSocket URL.
    pub relay_url: Option<String>,
    /// Username to announce.
    pub username: Option<String>,
    /// Timeout for the WebSocket handshake.
    pub connect_timeout: Duration,
    /// Capacity of the CLI's command and output channels.
    pub channel_capacity: usize,
    /// Reconnect settings.
    pub reconnect: ReconnectConfig,
    /// Bytes per outgoing chunk.
    pub chunk_size: usize,
    /// Largest incoming transfer accepted.
    pub max_transfer_size: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: None,
            username: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            channel_capacity: 256,
            reconnect: ReconnectConfig::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_transfer_size: DEFAULT_MAX_TRANSFER_SIZE,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/relaywire/config.toml`) is
    /// tried and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// or a resolved value is out of range.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.validate()?;
        Ok(config)
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            relay_url: cli
                .relay_url
                .clone()
                .or_else(|| file.network.relay_url.clone()),
            username: cli
                .username
                .clone()
                .or_else(|| file.network.username.clone()),
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            channel_capacity: file
                .network
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            reconnect: ReconnectConfig {
                base_delay: file
                    .reconnect
                    .base_delay_ms
                    .map_or(defaults.reconnect.base_delay, Duration::from_millis),
                cap: file
                    .reconnect
                    .cap_secs
                    .map_or(defaults.reconnect.cap, Duration::from_secs),
                max_queued_frames: file
                    .reconnect
                    .max_queued_frames
                    .unwrap_or(defaults.reconnect.max_queued_frames),
            },
            chunk_size: cli
                .chunk_size
                .or(file.transfer.chunk_size)
                .unwrap_or(defaults.chunk_size),
            max_transfer_size: file
                .transfer
                .max_transfer_size
                .unwrap_or(defaults.max_transfer_size),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        // Leave room for the frame header around a full chunk.
        let max_chunk = relaywire_proto::codec::MAX_FRAME_SIZE / 2;
        if self.chunk_size == 0 || self.chunk_size > max_chunk {
            return Err(ConfigError::Invalid {
                field: "transfer.chunk_size",
                reason: format!("must be between 1 and {max_chunk}"),
            });
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "network.channel_capacity",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.reconnect.base_delay.is_zero() || self.reconnect.cap < self.reconnect.base_delay {
            return Err(ConfigError::Invalid {
                field: "reconnect",
                reason: "base delay must be non-zero and no larger than the cap".to_string(),
            });
        }
        Ok(())
    }

    /// Build a [`SupervisorConfig`], if a username is configured.
    #[must_use]
    pub fn to_supervisor_config(&self) -> Option<SupervisorConfig> {
        let username = self.username.clone().filter(|u| !u.trim().is_empty())?;
        Some(SupervisorConfig {
            username,
            backoff: Backoff {
                base: self.reconnect.base_delay,
                cap: self.reconnect.cap,
            },
            max_queued_frames: self.reconnect.max_queued_frames,
            chunk_size: self.chunk_size,
            max_transfer_size: self.max_transfer_size,
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Encrypted chat over a relaywire relay")]
pub struct CliArgs {
    /// WebSocket URL of the relay server.
    #[arg(long, env = "RELAY_URL")]
    pub relay_url: Option<String>,

    /// Username to announce on the relay.
    #[arg(short, long, env = "RELAYWIRE_USER")]
    pub username: Option<String>,

    /// Path to config file (default: `~/.config/relaywire/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Bytes per outgoing transfer chunk.
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "RELAYWIRE_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/relaywire.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and a missing
/// file is treated as empty config.
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
        config_dir.join("relaywire").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.channel_capacity, 256);
        assert_eq!(config.reconnect.base_delay, Duration::from_secs(1));
        assert_eq!(config.reconnect.cap, Duration::from_secs(30));
        assert_eq!(config.reconnect.max_queued_frames, 256);
        assert_eq!(config.chunk_size, 8192);
        assert_eq!(config.max_transfer_size, 256 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_parsing_full() {
        let toml_str = r#"
[network]
relay_url = "ws://example.com:9000/ws"
username = "alice"
connect_timeout_secs = 30
channel_capacity = 512

[reconnect]
base_delay_ms = 250
cap_secs = 10
max_queued_frames = 32

[transfer]
chunk_size = 4096
max_transfer_size = 1048576
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let config = ClientConfig::resolve(&CliArgs::default(), &file);

        assert_eq!(
            config.relay_url.as_deref(),
            Some("ws://example.com:9000/ws")
        );
        assert_eq!(config.username.as_deref(), Some("alice"));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.channel_capacity, 512);
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(250));
        assert_eq!(config.reconnect.cap, Duration::from_secs(10));
        assert_eq!(config.reconnect.max_queued_frames, 32);
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.max_transfer_size, 1_048_576);
    }

    #[test]
    fn toml_parsing_partial() {
        let toml_str = r#"
[network]
relay_url = "ws://custom:9000/ws"
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let config = ClientConfig::resolve(&CliArgs::default(), &file);

        assert_eq!(config.relay_url.as_deref(), Some("ws://custom:9000/ws"));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect, ReconnectConfig::default());
    }

    #[test]
    fn cli_overrides_file() {
        let toml_str = r#"
[network]
relay_url = "ws://file:9000/ws"
username = "file-user"

[transfer]
chunk_size = 1024
"#;
        let file: ConfigFile = toml::from_str(toml_str).unwrap();
        let cli = CliArgs {
            relay_url: Some("ws://cli:9000/ws".to_string()),
            chunk_size: Some(2048),
            ..Default::default()
        };
        let config = ClientConfig::resolve(&cli, &file);

        assert_eq!(config.relay_url.as_deref(), Some("ws://cli:9000/ws"));
        assert_eq!(config.username.as_deref(), Some("file-user"));
        assert_eq!(config.chunk_size, 2048);
    }

    #[test]
    fn unknown_sections_are_ignored() {
        let file: Result<ConfigFile, _> = toml::from_str("[ui]\ntheme = \"dark\"\n");
        assert!(file.is_ok());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let zero_chunk = ClientConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            zero_chunk.validate(),
            Err(ConfigError::Invalid { field: "transfer.chunk_size", .. })
        ));

        let inverted = ClientConfig {
            reconnect: ReconnectConfig {
                base_delay: Duration::from_secs(60),
                cap: Duration::from_secs(1),
                max_queued_frames: 1,
            },
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn explicit_missing_config_file_returns_error() {
        let result = load_config_file(Some(std::path::Path::new("/nonexistent/config.toml")));
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }

    #[test]
    fn missing_default_config_file_returns_defaults() {
        assert!(load_config_file(None).is_ok());
    }

    #[test]
    fn to_supervisor_config_requires_username() {
        assert!(ClientConfig::default().to_supervisor_config().is_none());

        let blank = ClientConfig {
            username: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(blank.to_supervisor_config().is_none());

        let config = ClientConfig {
            username: Some("alice".to_string()),
            chunk_size: 1000,
            ..Default::default()
        };
        let sup = config.to_supervisor_config().unwrap();
        assert_eq!(sup.username, "alice");
        assert_eq!(sup.chunk_size, 1000);
        assert_eq!(sup.backoff, Backoff::default());
        assert_eq!(sup.max_queued_frames, 256);
    }
}

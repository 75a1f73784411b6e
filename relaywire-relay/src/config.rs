//! Relay configuration.
//!
//! Priority, highest first: CLI arguments, environment variables (through
//! clap's `env`), the TOML file (`~/.config/relaywire-relay/config.toml`),
//! compiled defaults.

use std::path::{Path, PathBuf};

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
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayConfigFile {
    server: ServerFileConfig,
}

/// `[server]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
}

/// CLI arguments for the relay.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "relaywire fan-out relay")]
pub struct RelayCliArgs {
    /// Address to bind to.
    #[arg(short, long, env = "RELAY_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/relaywire-relay/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "RELAY_LOG")]
    pub log_level: String,
}

/// Fully resolved relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind the server to (e.g. `0.0.0.0:9000`).
    pub bind_addr: String,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Merge CLI args, env vars and the TOML file.
    ///
    /// An explicit `--config` must exist; the default path may be missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a config file cannot be read or parsed.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    fn resolve(cli: &RelayCliArgs, file: &RelayConfigFile) -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            log_level: cli.log_level.clone(),
        }
    }
}

fn load_config_file(explicit_path: Option<&Path>) -> Result<RelayConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(RelayConfigFile::default());
    };
    let path = config_dir.join("relaywire-relay").join("config.toml");
    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RelayConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let file: RelayConfigFile = toml::from_str("").unwrap();
        let config = RelayConfig::resolve(&RelayCliArgs::default(), &file);
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
    }

    #[test]
    fn file_sets_bind_addr() {
        let file: RelayConfigFile = toml::from_str("[server]\nbind_addr = \"127.0.0.1:8080\"\n").unwrap();
        let config = RelayConfig::resolve(&RelayCliArgs::default(), &file);
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
    }

    #[test]
    fn cli_overrides_file() {
        let file: RelayConfigFile = toml::from_str("[server]\nbind_addr = \"127.0.0.1:8080\"\n").unwrap();
        let cli = RelayCliArgs {
            bind: Some("0.0.0.0:3000".to_string()),
            ..Default::default()
        };
        assert_eq!(RelayConfig::resolve(&cli, &file).bind_addr, "0.0.0.0:3000");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let result = load_config_file(Some(Path::new("/nonexistent/relay.toml")));
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }
}

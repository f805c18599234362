// Gateway configuration file.
//
// `~/.tether/gateway.toml`, one section per tunable concern. The anchor
// signing key never lives here.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dirty::NeighborExpansionPolicy;
use crate::gateway::retry::RetryPolicy;
use crate::gateway::targeting::TargetingPolicy;
use crate::relocate::{ContextRelocationConfig, FuzzyRelocationConfig};

/// Root directory for tether state: `~/.tether/`.
pub fn tether_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".tether"))
}

/// Path to the gateway config file: `~/.tether/gateway.toml`.
pub fn gateway_config_path() -> Option<PathBuf> {
    tether_dir().map(|d| d.join("gateway.toml"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub retry: RetryPolicy,
    pub targeting: TargetingPolicy,
    pub neighbors: NeighborExpansionPolicy,
    pub fuzzy: FuzzyRelocationConfig,
    pub context: ContextRelocationConfig,
}

impl GatewayConfig {
    /// Load from `~/.tether/gateway.toml`. Returns defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        gateway_config_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }

    /// Save to `~/.tether/gateway.toml`.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = gateway_config_path().ok_or_else(|| {
            ConfigError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "could not determine home directory",
            ))
        })?;
        self.save_to(&path)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Parse(e) => Some(e),
            Self::Serialize(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::types::RelocatePolicy;
    use crate::relocate::RelocationLevel;

    #[test]
    fn defaults_match_policies() {
        let config = GatewayConfig::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.relocation_level, RelocationLevel::Strict);
        assert_eq!(config.neighbors.neighbor_expand_k, 1);
        assert_eq!(config.fuzzy.similarity_threshold, 0.7);
        assert_eq!(config.context.context_window, 16);
    }

    #[test]
    fn round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("gateway.toml");

        let mut config = GatewayConfig::default();
        config.retry.max_retries = 9;
        config.retry.relocation_level = RelocationLevel::Aggressive;
        config.targeting.relocate_policy = RelocatePolicy::Document;
        config.neighbors.max_adaptive_k = Some(4);
        config.save_to(&path).unwrap();

        let loaded = GatewayConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "[retry]\nmax_retries = 5\nrelocation_level = 2\n\n[neighbors]\nlist_depth_bonus = 1\n")
            .unwrap();

        let config = GatewayConfig::load_from(&path).unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.relocation_level, RelocationLevel::Lenient);
        assert_eq!(config.retry.backoff_base_ms, 100);
        assert_eq!(config.neighbors.list_depth_bonus, Some(1));
        assert_eq!(config.targeting, TargetingPolicy::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "[retry]\nmax_retry = 5\n").unwrap();
        assert!(matches!(GatewayConfig::load_from(&path), Err(ConfigError::Parse(_))));

        std::fs::write(&path, "anchor_key = \"secret\"\n").unwrap();
        assert!(matches!(GatewayConfig::load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn invalid_relocation_level_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "[retry]\nrelocation_level = 4\n").unwrap();
        assert!(matches!(GatewayConfig::load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = GatewayConfig::load_from(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}

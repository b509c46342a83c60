//! Configuration file parsing for `ranklane.toml`.
//!
//! Searches the current directory then its ancestors. When no file is found
//! the defaults describe a single-rank VM with one compute lane per CPU.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "ranklane.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid toml in '{path}': {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Rank of this process within the world.
    pub rank: u16,
    /// Number of ranks taking part.
    pub world_size: u16,
    /// Compute lanes to start; `0` means one per available CPU.
    pub compute_streams: usize,
    /// Peer ranks that get a dedicated network lane.
    pub network_peers: Vec<u16>,
    /// How long a blocking receive waits for its token.
    pub rpc_timeout_ms: u64,
    /// How long shutdown waits for admitted work before abandoning it.
    pub shutdown_grace_ms: u64,
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            compute_streams: 0,
            network_peers: Vec::new(),
            rpc_timeout_ms: 30_000,
            shutdown_grace_ms: 10_000,
            log_filter: "info".to_string(),
        }
    }
}

impl VmConfig {
    /// Load config from `ranklane.toml`, searching the current dir then
    /// parents. Returns `Default` when no file is found.
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self::find_and_load()?
            .map(|(_path, cfg)| cfg)
            .unwrap_or_default())
    }

    /// Load config and return the path of the file that was used.
    pub fn load_with_path() -> Result<Option<(PathBuf, Self)>, ConfigError> {
        Self::find_and_load()
    }

    /// Load config from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse(content, Path::new("<inline>"))
    }

    fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn find_and_load() -> Result<Option<(PathBuf, Self)>, ConfigError> {
        let Ok(mut dir) = std::env::current_dir() else {
            return Ok(None);
        };
        loop {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.is_file() {
                let cfg = Self::load_from(&config_path)?;
                return Ok(Some((config_path, cfg)));
            }
            if !dir.pop() {
                return Ok(None);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.world_size == 0 {
            return Err(ConfigError::Invalid("world_size must be at least 1".into()));
        }
        if self.rank >= self.world_size {
            return Err(ConfigError::Invalid(format!(
                "rank {} is outside a world of {}",
                self.rank, self.world_size
            )));
        }
        let mut seen = Vec::with_capacity(self.network_peers.len());
        for &peer in &self.network_peers {
            if peer >= self.world_size {
                return Err(ConfigError::Invalid(format!(
                    "network peer {} is outside a world of {}",
                    peer, self.world_size
                )));
            }
            if peer == self.rank {
                return Err(ConfigError::Invalid(format!(
                    "rank {} cannot be its own network peer",
                    peer
                )));
            }
            if seen.contains(&peer) {
                return Err(ConfigError::Invalid(format!(
                    "network peer {} listed twice",
                    peer
                )));
            }
            seen.push(peer);
        }
        Ok(())
    }

    /// Effective number of compute lanes.
    pub fn compute_stream_count(&self) -> usize {
        if self.compute_streams == 0 {
            num_cpus::get().max(1)
        } else {
            self.compute_streams
        }
    }

    /// All ranks except this one; handy for filling `network_peers`.
    pub fn all_peers(&self) -> Vec<u16> {
        (0..self.world_size).filter(|r| *r != self.rank).collect()
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Render as a `ranklane.toml` document.
    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_single_rank() {
        let cfg = VmConfig::default();
        assert_eq!(cfg.world_size, 1);
        assert!(cfg.network_peers.is_empty());
        assert!(cfg.compute_stream_count() >= 1);
        cfg.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg = VmConfig::from_toml_str(
            r#"
rank = 1
world_size = 3
compute_streams = 2
network_peers = [0, 2]
"#,
        )
        .unwrap();
        assert_eq!(cfg.rank, 1);
        assert_eq!(cfg.compute_stream_count(), 2);
        assert_eq!(cfg.network_peers, vec![0, 2]);
        assert_eq!(cfg.rpc_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.all_peers(), vec![0, 2]);
    }

    #[test]
    fn rejects_bad_topology() {
        let err = VmConfig::from_toml_str("rank = 2\nworld_size = 2\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = VmConfig::from_toml_str("world_size = 2\nnetwork_peers = [0]\n").unwrap_err();
        assert!(err.to_string().contains("own network peer"));

        let err = VmConfig::from_toml_str("world_size = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn parse_errors_name_the_source() {
        let err = VmConfig::from_toml_str("rank = \"zero\"").unwrap_err();
        assert!(err.to_string().contains("<inline>"));
    }

    #[test]
    fn load_from_reads_file_and_round_trips() {
        let mut path = std::env::temp_dir();
        path.push(format!("ranklane-config-{}.toml", std::process::id()));
        let cfg = VmConfig {
            world_size: 4,
            network_peers: vec![1, 3],
            ..VmConfig::default()
        };
        std::fs::write(&path, cfg.to_toml_string()).unwrap();
        let loaded = VmConfig::load_from(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn load_from_missing_file_is_io_error() {
        let err = VmConfig::load_from(Path::new("/nonexistent/ranklane.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}

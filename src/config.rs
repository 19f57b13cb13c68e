use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

use crate::error::HearthError;

/// Process configuration for the supervisor.
///
/// Loaded once at startup; everything that changes at runtime (cluster
/// membership, installed addons, snapshot metadata) lives in the persisted
/// JSON state files under `data_dir` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_host")]
    pub api_host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Public port peers use for the cluster wire protocol.
    #[serde(default = "default_cluster_port")]
    pub cluster_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Human-readable node name; the cluster slug is derived from it.
    #[serde(default = "default_node_name")]
    pub node_name: String,
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
    #[serde(default)]
    pub cluster: ClusterSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Slave heartbeat cadence towards the master.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Master-side rolling session secret regeneration cadence.
    #[serde(default = "default_master_key_rotation")]
    pub master_key_rotation_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_true")]
    pub console: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            api_host: default_host(),
            api_port: default_api_port(),
            cluster_port: default_cluster_port(),
            data_dir: default_data_dir(),
            node_name: default_node_name(),
            time_zone: default_time_zone(),
            cluster: ClusterSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            master_key_rotation_secs: default_master_key_rotation(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
            console: default_true(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8123
}

fn default_cluster_port() -> u16 {
    9123
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("hearth"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/hearth"))
}

fn default_node_name() -> String {
    "Hearth".to_string()
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_master_key_rotation() -> u64 {
    3600
}

fn default_request_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_true() -> bool {
    true
}

impl SupervisorConfig {
    pub fn load() -> Result<Self, HearthError> {
        // Try loading from different locations in order
        let config_paths = [
            PathBuf::from("hearth.yml"),
            dirs::config_dir()
                .map(|p| p.join("hearth/hearth.yml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/hearth/hearth.yml"),
        ];

        for path in &config_paths {
            if path.exists() {
                return Self::load_from_file(path);
            }
        }

        Ok(Self::default())
    }

    pub fn load_from_file(path: &PathBuf) -> Result<Self, HearthError> {
        let content = fs::read_to_string(path)
            .map_err(|e| HearthError::config(format!("Failed to read config file: {}", e)))?;

        serde_yaml::from_str(&content)
            .map_err(|e| HearthError::config(format!("Failed to parse config file: {}", e)))
    }

    pub fn save(&self, path: &PathBuf) -> Result<(), HearthError> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| HearthError::config(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| HearthError::config(format!("Failed to create config directory: {}", e)))?;
        }

        // Write atomically using a temporary file
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, yaml)
            .map_err(|e| HearthError::config(format!("Failed to write config: {}", e)))?;

        fs::rename(&temp_path, path)
            .map_err(|e| HearthError::config(format!("Failed to save config: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.api_port, 8123);
        assert_eq!(config.cluster.heartbeat_interval_secs, 30);
        assert!(config.logging.console);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hearth.yml");

        let mut config = SupervisorConfig::default();
        config.cluster_port = 9999;
        config.save(&path).unwrap();

        let reloaded = SupervisorConfig::load_from_file(&path).unwrap();
        assert_eq!(reloaded.cluster_port, 9999);
    }

    #[test]
    fn test_partial_file_is_default_filled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hearth.yml");
        std::fs::write(&path, "api_port: 9000\n").unwrap();

        let config = SupervisorConfig::load_from_file(&path).unwrap();
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.cluster_port, 9123);
    }
}

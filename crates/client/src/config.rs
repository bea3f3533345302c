use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for the conversion client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the remote conversion service
    pub server_url: String,
    /// Directory where task state JSON files are stored
    pub task_state_dir: PathBuf,
    /// Interval in seconds between reconciliation passes in watch mode
    pub reconcile_interval_secs: u64,
    /// Deadline in seconds for submission and task-list requests
    pub request_timeout_secs: u64,
    /// Byte-size tolerance for fuzzy matching during reconciliation
    pub fuzzy_size_tolerance: u64,
    /// Manual retry budget assigned to new tasks
    pub default_max_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ClientConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            task_state_dir: PathBuf::from("/tmp/convq-tasks"),
            reconcile_interval_secs: 30,
            request_timeout_secs: 60,
            fuzzy_size_tolerance: 1024,
            default_max_retries: 3,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // Try JSON first, then TOML
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    let file_config: ClientConfig = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                    config = file_config;
                } else {
                    let file_config: ClientConfig = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                    config = file_config;
                }
            }
        }

        Ok(config)
    }
}

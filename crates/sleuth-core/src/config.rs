use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SleuthError};

/// Top-level Sleuth configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Base directory for local state (run records, secret store).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            graph: GraphConfig::default(),
            vault: VaultConfig::default(),
            queue: QueueConfig::default(),
            pipeline: PipelineConfig::default(),
            data_dir: default_data_dir(),
        }
    }
}

/// Connection settings for the property graph store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Base URI of the graph store's HTTP endpoint.
    #[serde(default = "default_graph_uri")]
    pub uri: String,
    #[serde(default = "default_graph_user")]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_graph_database")]
    pub database: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            uri: default_graph_uri(),
            user: default_graph_user(),
            password: None,
            database: default_graph_database(),
        }
    }
}

/// Master-key material for the secret vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Base64-encoded 32-byte master key, or a `${ENV_VAR}` reference.
    #[serde(default)]
    pub master_key: Option<String>,
    /// Version tag recorded alongside every secret.
    #[serde(default = "default_key_version")]
    pub key_version: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            master_key: None,
            key_version: default_key_version(),
        }
    }
}

/// Worker pool settings for the run queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

/// Transform pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Queued graph writes auto-flush once this many are pending.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_threshold: default_flush_threshold(),
        }
    }
}

fn default_graph_uri() -> String {
    "http://localhost:7474".to_string()
}

fn default_graph_user() -> String {
    "neo4j".to_string()
}

fn default_graph_database() -> String {
    "neo4j".to_string()
}

fn default_key_version() -> String {
    "V1".to_string()
}

fn default_workers() -> usize {
    2
}

fn default_flush_threshold() -> usize {
    100
}

fn default_data_dir() -> String {
    "~/.sleuth".to_string()
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| SleuthError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| SleuthError::Configuration(e.to_string()))
    }

    /// Resolve the data directory (expand ~).
    pub fn data_dir(&self) -> PathBuf {
        if let Some(rest) = self.data_dir.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(&self.data_dir)
    }

    /// Path of the SQLite database holding run records and secrets.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("sleuth.db")
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for nc in chars.by_ref() {
                if nc == '}' {
                    break;
                }
                var_name.push(nc);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

//! Server configuration for phaseline-server
//!
//! Loads and parses `phaseline.toml`. Every section is optional; missing keys
//! fall back to their defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use super::WeightsConfig;

#[derive(Debug, Error)]
pub enum ServerConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    ParseError(toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Server identification and bind address
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfoConfig {
    /// Server name for identification (displayed to clients)
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Allowed CORS origins; empty allows any origin
    pub cors_origins: Vec<String>,
}

impl Default for ServerInfoConfig {
    fn default() -> Self {
        Self {
            name: "phaseline-server".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            cors_origins: Vec::new(),
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// SQLite file at `database.path`
    Sqlite,
    /// Process memory, lost on exit
    Memory,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: StorageBackend,
    /// SQLite database file path
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            path: "phaseline.db".to_string(),
        }
    }
}

/// Phase driver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retry budget when neither workflow nor template sets one
    pub default_max_iterations: u32,
    /// Per-subscriber channel capacity of the event bus
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: 3,
            event_buffer: 100,
        }
    }
}

/// Session broadcaster settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds between background `session_update` snapshots
    pub tick_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
        }
    }
}

impl SessionConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}

/// Custom workflow definitions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowsConfig {
    /// Directory of YAML workflow files; custom workflows are written back here
    pub dir: Option<String>,
}

/// Agent command run once per phase attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec!["-p".to_string()],
            working_dir: None,
        }
    }
}

/// Project registry and handle cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectsConfig {
    /// YAML file listing known projects
    pub registry: Option<String>,
    pub cache_capacity: usize,
}

impl Default for ProjectsConfig {
    fn default() -> Self {
        Self {
            registry: None,
            cache_capacity: 8,
        }
    }
}

/// Complete server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerInfoConfig,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub session: SessionConfig,
    pub weights: WeightsConfig,
    pub workflows: WorkflowsConfig,
    pub agent: AgentConfig,
    pub projects: ProjectsConfig,
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ServerConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(ServerConfigError::ReadError)?;
        Self::from_str(&content)
    }

    /// Load configuration from TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ServerConfigError> {
        let config: Self = toml::from_str(content).map_err(ServerConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default location or environment
    ///
    /// Searches for config in:
    /// 1. CONFIG_PATH environment variable
    /// 2. ./config/phaseline.toml
    /// 3. ./phaseline.toml
    pub fn load() -> Result<Self, ServerConfigError> {
        if let Ok(config_path) = std::env::var("CONFIG_PATH") {
            return Self::from_file(config_path);
        }

        let paths = [
            PathBuf::from("config/phaseline.toml"),
            PathBuf::from("./phaseline.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::from_file(path);
            }
        }

        Err(ServerConfigError::InvalidConfig(
            "Configuration file not found. Set CONFIG_PATH or place phaseline.toml in config/"
                .to_string(),
        ))
    }

    fn validate(&self) -> Result<(), ServerConfigError> {
        if self.engine.default_max_iterations == 0 {
            return Err(ServerConfigError::InvalidConfig(
                "engine.default_max_iterations must be at least 1".to_string(),
            ));
        }
        if self.engine.event_buffer == 0 {
            return Err(ServerConfigError::InvalidConfig(
                "engine.event_buffer must be at least 1".to_string(),
            ));
        }
        if self.projects.cache_capacity == 0 {
            return Err(ServerConfigError::InvalidConfig(
                "projects.cache_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply HOST and PORT environment overrides
    pub fn apply_env_overrides(&mut self) -> Result<(), ServerConfigError> {
        if let Ok(host) = std::env::var("HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("PORT") {
            self.server.port = port.parse().map_err(|_| {
                ServerConfigError::InvalidConfig(format!("PORT must be a valid u16, got {}", port))
            })?;
        }
        Ok(())
    }

    /// Get database URL from configuration
    pub fn database_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.database.path)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskWeight;

    #[test]
    fn test_config_parsing() {
        let toml_content = r#"
[server]
name = "ci-orchestrator"
port = 9090

[database]
backend = "memory"

[engine]
default_max_iterations = 5

[session]
tick_interval_secs = 2

[weights]
small = "quick-fix"

[agent]
program = "/usr/local/bin/agent"
args = ["--phase"]

[projects]
cache_capacity = 2
"#;

        let config = ServerConfig::from_str(toml_content).unwrap();
        assert_eq!(config.server.name, "ci-orchestrator");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.database.backend, StorageBackend::Memory);
        assert_eq!(config.engine.default_max_iterations, 5);
        assert_eq!(config.engine.event_buffer, 100);
        assert_eq!(config.session.tick_interval(), Duration::from_secs(2));
        assert_eq!(config.weights.workflow_for(TaskWeight::Small), "quick-fix");
        assert_eq!(config.agent.args, vec!["--phase".to_string()]);
        assert_eq!(config.projects.cache_capacity, 2);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ServerConfig::from_str("").unwrap();
        assert_eq!(config.database.backend, StorageBackend::Sqlite);
        assert_eq!(config.database_url(), "sqlite://phaseline.db?mode=rwc");
        assert_eq!(config.bind_address(), "127.0.0.1:8080");
    }

    #[test]
    fn test_rejects_zero_budget() {
        let err = ServerConfig::from_str("[engine]\ndefault_max_iterations = 0").unwrap_err();
        assert!(matches!(err, ServerConfigError::InvalidConfig(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("phaseline.toml");
        std::fs::write(&path, "[server]\nport = 7000\n").unwrap();
        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.server.port, 7000);
    }
}

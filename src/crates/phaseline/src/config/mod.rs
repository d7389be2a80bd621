//! Configuration module
//!
//! Provides the TOML server configuration and the weight-to-workflow mapping.

pub mod server;
pub mod weights;

pub use server::{
    AgentConfig, DatabaseConfig, EngineConfig, ProjectsConfig, ServerConfig, ServerConfigError,
    ServerInfoConfig, SessionConfig, StorageBackend, WorkflowsConfig,
};
pub use weights::WeightsConfig;

//! Shared configuration and HTTP wire types for goplay

pub mod api;
pub mod config;
pub mod error;
pub mod limits;

pub use api::*;
pub use config::{AppConfig, SandboxConfig, ServerConfig, ToolchainConfig};
pub use error::{ConfigError, ConfigResult};
pub use limits::ResourceLimits;

//! Configuration management for goplay

use crate::error::{ConfigError, ConfigResult};
use crate::limits::ResourceLimits;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Sandbox configuration
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// External toolchain configuration
    #[serde(default)]
    pub toolchain: ToolchainConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory holding the front-end (`index.html` and assets)
    pub web_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            web_dir: PathBuf::from("./web"),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Sandbox configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Parent directory for per-execution workspaces
    pub workspace_root: PathBuf,
    /// Size of the execution slot pool
    pub max_concurrent: usize,
    /// How long a request may wait for a free slot before being rejected
    #[serde(with = "humantime_serde")]
    pub admission_timeout: Duration,
    /// Delegated cgroup v2 directory for per-execution cgroups; `None` uses the service's own
    pub cgroup_parent: Option<PathBuf>,
    pub limits: ResourceLimits,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("goplay"),
            max_concurrent: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            admission_timeout: Duration::from_secs(2),
            cgroup_parent: None,
            limits: ResourceLimits::default(),
        }
    }
}

/// Toolchain binaries and the flags a submission may pass to them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub go_binary: PathBuf,
    pub tinygo_binary: PathBuf,
    pub gofmt_binary: PathBuf,
    /// Flags accepted for `run`
    pub run_flags: Vec<String>,
    /// Flags accepted for `compile-wasm`
    pub wasm_flags: Vec<String>,
    /// tinygo target used when the submission does not pick one
    pub default_wasm_target: String,
    /// PATH handed to the toolchain; `None` inherits the service's PATH
    pub path: Option<String>,
    /// Shared build cache; `None` keeps the cache inside each workspace
    pub gocache: Option<PathBuf>,
    pub gopath: Option<PathBuf>,
    /// Extra environment for every invocation
    pub env: BTreeMap<String, String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            go_binary: PathBuf::from("go"),
            tinygo_binary: PathBuf::from("tinygo"),
            gofmt_binary: PathBuf::from("gofmt"),
            run_flags: Vec::new(),
            wasm_flags: [
                "-target=wasm",
                "-target=wasi",
                "-opt=0",
                "-opt=1",
                "-opt=2",
                "-opt=s",
                "-opt=z",
                "-no-debug",
                "-panic=trap",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            default_wasm_target: "wasm".to_string(),
            path: None,
            gocache: None,
            gopath: None,
            env: [("GOTOOLCHAIN", "local"), ("GOPROXY", "off"), ("CGO_ENABLED", "0")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file, then apply environment overrides.
    ///
    /// A missing file is an error when a path is given explicitly.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `GOPLAY_*` overrides. `PORT` is honoured for container platforms.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("GOPLAY_HOST") {
            self.server.host = host;
        }
        for key in ["PORT", "GOPLAY_PORT"] {
            if let Some(value) = lookup(key) {
                self.server.port = parse_env(key, &value)?;
            }
        }
        if let Some(value) = lookup("GOPLAY_MAX_CONCURRENT") {
            self.sandbox.max_concurrent = parse_env("GOPLAY_MAX_CONCURRENT", &value)?;
        }
        if let Some(dir) = lookup("GOPLAY_WORKSPACE_ROOT") {
            self.sandbox.workspace_root = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Reject configurations the sandbox cannot honour
    pub fn validate(&self) -> ConfigResult<()> {
        let sandbox = &self.sandbox;
        let limits = &sandbox.limits;

        if sandbox.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.max_concurrent must be at least 1".to_string(),
            ));
        }
        if limits.max_source_bytes == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_source_bytes must be positive".to_string(),
            ));
        }
        for (name, deadline) in [
            ("run_deadline", limits.run_deadline),
            ("compile_deadline", limits.compile_deadline),
            ("format_deadline", limits.format_deadline),
        ] {
            if deadline.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "limits.{} must be non-zero",
                    name
                )));
            }
        }
        if limits.max_stream_output_bytes > limits.max_combined_output_bytes {
            return Err(ConfigError::Invalid(format!(
                "limits.max_stream_output_bytes ({}) exceeds limits.max_combined_output_bytes ({})",
                limits.max_stream_output_bytes, limits.max_combined_output_bytes
            )));
        }
        if !self
            .toolchain
            .wasm_flags
            .iter()
            .any(|f| *f == format!("-target={}", self.toolchain.default_wasm_target))
        {
            return Err(ConfigError::Invalid(format!(
                "toolchain.default_wasm_target '{}' is not in toolchain.wasm_flags",
                self.toolchain.default_wasm_target
            )));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

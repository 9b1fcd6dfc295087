//! CLI command implementations

use anyhow::{Context, Result};
use goplay_common::{AppConfig, ResourceLimits};
use goplay_sandbox::{SandboxError, SandboxService, Submission, Target};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// `serve` flags that take precedence over the file and the environment
#[derive(Debug, Default, Clone)]
pub struct ServeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_concurrent: Option<usize>,
    pub workspace_root: Option<PathBuf>,
    /// `strict`, `default` or `permissive`
    pub limits: Option<String>,
}

impl ServeOverrides {
    fn apply(self, config: &mut AppConfig) -> Result<()> {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(max_concurrent) = self.max_concurrent {
            config.sandbox.max_concurrent = max_concurrent;
        }
        if let Some(root) = self.workspace_root {
            config.sandbox.workspace_root = root;
        }
        if let Some(preset) = self.limits {
            config.sandbox.limits = match preset.as_str() {
                "strict" => ResourceLimits::strict(),
                "default" => ResourceLimits::default(),
                "permissive" => ResourceLimits::permissive(),
                other => anyhow::bail!("Unknown limits preset '{}'", other),
            };
        }
        Ok(())
    }
}

fn load_config(path: Option<&Path>, overrides: ServeOverrides) -> Result<AppConfig> {
    let mut config = AppConfig::load(path).context("Failed to load configuration")?;
    overrides.apply(&mut config)?;
    config
        .validate()
        .context("Invalid configuration after command line overrides")?;
    Ok(config)
}

/// Execute the serve command
pub async fn execute_serve(config_path: Option<&Path>, overrides: ServeOverrides) -> Result<()> {
    let config = load_config(config_path, overrides)?;
    info!("Starting goplay on {}", config.server.bind_addr());
    goplay_server::run_server(config).await
}

/// Execute one submission; returns the process exit code to use
pub async fn execute_exec(
    config_path: Option<&Path>,
    file: &Path,
    target: &str,
    flags: Vec<String>,
    output: &Path,
) -> Result<i32> {
    let config = load_config(config_path, ServeOverrides::default())?;
    let target: Target = target.parse()?;
    let source = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let service = SandboxService::from_app_config(&config);
    debug!("Executing {} as {}", file.display(), target);

    match service.execute(Submission::new(source, target).with_flags(flags)).await {
        Ok(result) => {
            std::io::stdout().write_all(&result.stdout)?;
            std::io::stderr().write_all(&result.stderr)?;
            if let Some(artifact) = &result.artifact {
                tokio::fs::write(output, artifact)
                    .await
                    .with_context(|| format!("Failed to write {}", output.display()))?;
                eprintln!("wrote {} ({} bytes)", output.display(), artifact.len());
            }
            Ok(0)
        }
        Err(SandboxError::UntrustedProgram(result)) => {
            std::io::stdout().write_all(&result.stdout)?;
            std::io::stderr().write_all(&result.stderr)?;
            Ok(result.exit_code.filter(|code| *code != 0).unwrap_or(1))
        }
        Err(e) => {
            if let Some(result) = e.result() {
                std::io::stdout().write_all(&result.stdout)?;
            }
            eprintln!("✗ {}: {}", e.kind(), e.user_message());
            Ok(2)
        }
    }
}

/// Execute the config command
pub fn execute_config(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path, ServeOverrides::default())?;
    print!("{}", config.to_toml_string()?);
    Ok(())
}

//! Command lines for the external Go toolchain

use crate::error::ValidationError;
use crate::runner::CommandSpec;
use crate::types::{Submission, Target};
use crate::workspace::{Workspace, SOURCE_FILE};
use goplay_common::ToolchainConfig;

/// Artifact written by `compile-wasm`
pub const WASM_ARTIFACT: &str = "out.wasm";

const TARGET_FLAG: &str = "-target=";
const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Builds the command for each target from the toolchain configuration
#[derive(Debug, Clone)]
pub struct Toolchain {
    config: ToolchainConfig,
    path: String,
}

impl Toolchain {
    pub fn new(config: ToolchainConfig) -> Self {
        let path = config
            .path
            .clone()
            .or_else(|| std::env::var("PATH").ok())
            .unwrap_or_else(|| FALLBACK_PATH.to_string());
        Self { config, path }
    }

    pub fn config(&self) -> &ToolchainConfig {
        &self.config
    }

    /// Check the submission's flags against the allow-list for its target
    pub fn validate_flags(&self, submission: &Submission) -> Result<(), ValidationError> {
        let target = submission.target();
        let allowed: &[String] = match target {
            Target::Run => &self.config.run_flags,
            Target::CompileWasm => &self.config.wasm_flags,
            Target::Format => &[],
        };

        for flag in submission.flags() {
            if !allowed.iter().any(|a| a == flag) {
                return Err(ValidationError::FlagNotAllowed {
                    flag: flag.clone(),
                    target,
                });
            }
        }

        let targets: Vec<&String> = submission
            .flags()
            .iter()
            .filter(|f| f.starts_with(TARGET_FLAG))
            .collect();
        if targets.len() > 1 {
            return Err(ValidationError::ConflictingFlags(
                targets
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(" "),
            ));
        }
        Ok(())
    }

    /// Resolve the full command for `submission` inside `workspace`
    pub fn command_for(
        &self,
        submission: &Submission,
        workspace: &Workspace,
    ) -> Result<CommandSpec, ValidationError> {
        self.validate_flags(submission)?;
        let flags = submission.flags().iter().cloned();

        let command = match submission.target() {
            Target::Run => CommandSpec::new(&self.config.go_binary)
                .arg("run")
                .args(flags)
                .arg(SOURCE_FILE),
            Target::CompileWasm => {
                let mut command = CommandSpec::new(&self.config.tinygo_binary)
                    .args(["build", "-o", WASM_ARTIFACT]);
                if !submission.flags().iter().any(|f| f.starts_with(TARGET_FLAG)) {
                    command = command.arg(format!(
                        "{}{}",
                        TARGET_FLAG, self.config.default_wasm_target
                    ));
                }
                command.args(flags).arg(SOURCE_FILE).artifact(WASM_ARTIFACT)
            }
            Target::Format => CommandSpec::new(&self.config.gofmt_binary).arg(SOURCE_FILE),
        };

        Ok(self.with_environment(command, workspace))
    }

    fn with_environment(&self, command: CommandSpec, workspace: &Workspace) -> CommandSpec {
        let dir = workspace.path();
        let gocache = self
            .config
            .gocache
            .clone()
            .unwrap_or_else(|| dir.join(".cache").join("go-build"));
        let gopath = self
            .config
            .gopath
            .clone()
            .unwrap_or_else(|| dir.join(".gopath"));
        let home = dir.display().to_string();

        let mut command = command
            .env("PATH", &self.path)
            .env("HOME", &home)
            .env("TMPDIR", &home)
            .env("GOCACHE", gocache.display().to_string())
            .env("GOPATH", gopath.display().to_string());
        for (key, value) in &self.config.env {
            command = command.env(key, value);
        }
        command
    }
}

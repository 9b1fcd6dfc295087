mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "goplay")]
#[command(about = "Sandboxed Go playground: run, compile to wasm and format untrusted Go code")]
#[command(version)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "GOPLAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the HTTP API (default if no subcommand provided)
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Number of concurrent executions
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Directory under which workspaces are created
        #[arg(long)]
        workspace_root: Option<PathBuf>,

        /// Replace the configured limits with a preset
        #[arg(long, value_parser = ["strict", "default", "permissive"])]
        limits: Option<String>,
    },
    /// Run one Go file through the sandbox and print the outcome
    Exec {
        /// Go source file
        file: PathBuf,

        /// What to do with it
        #[arg(short, long, default_value = "run", value_parser = ["run", "compile-wasm", "format"])]
        target: String,

        /// Extra toolchain flag; repeatable, checked against the allow-list
        #[arg(short, long = "flag", allow_hyphen_values = true)]
        flags: Vec<String>,

        /// Where to write the artifact of compile-wasm
        #[arg(short, long, default_value = "out.wasm")]
        output: PathBuf,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_guard = init_tracing(cli.verbose, cli.log_file.as_deref())?;

    let code = match cli.command {
        Some(Commands::Serve {
            host,
            port,
            max_concurrent,
            workspace_root,
            limits,
        }) => {
            let overrides = commands::ServeOverrides {
                host,
                port,
                max_concurrent,
                workspace_root,
                limits,
            };
            commands::execute_serve(cli.config.as_deref(), overrides).await?;
            0
        }
        Some(Commands::Exec {
            file,
            target,
            flags,
            output,
        }) => {
            commands::execute_exec(cli.config.as_deref(), &file, &target, flags, &output).await?
        }
        Some(Commands::Config) => {
            commands::execute_config(cli.config.as_deref())?;
            0
        }
        None => {
            // Default to serve
            commands::execute_serve(cli.config.as_deref(), commands::ServeOverrides::default())
                .await?;
            0
        }
    };

    if code != 0 {
        // flush the log file before exiting with the program's code
        drop(log_guard);
        std::process::exit(code);
    }
    Ok(())
}

/// Console logging on stderr, plus a file when `log_file` is set.
///
/// The returned guard flushes the file writer; keep it alive for the whole run.
fn init_tracing(
    verbose: bool,
    log_file: Option<&std::path::Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "goplay={},goplay_server={},goplay_sandbox={},goplay_common={},tower_http={}",
            log_level, log_level, log_level, log_level, log_level
        ))
    });

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("--log-file needs a file name: {}", path.display()))?;
            let file_appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true),
        )
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}

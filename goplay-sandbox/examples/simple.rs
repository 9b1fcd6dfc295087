//! Simple sandbox example - run, compile and format a Go program
//!
//! Needs `go`, `tinygo` and `gofmt` on PATH.

use goplay_common::AppConfig;
use goplay_sandbox::{SandboxError, SandboxService, Submission, Target};

const HELLO: &str = r#"package main

import "fmt"

func main() {
	fmt.Println("Hello from the sandbox!")
}
"#;

const SPIN: &str = r#"package main

func main() {
	for {
	}
}
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let service = SandboxService::from_app_config(&AppConfig::default());

    println!("=== Sandbox Service Example ===\n");
    println!("Runner: {}\n", service.runner_name());

    println!("Example 1: go run");
    execute_and_print(&service, Submission::new(HELLO, Target::Run)).await;

    println!("\nExample 2: compile to wasm");
    execute_and_print(&service, Submission::new(HELLO, Target::CompileWasm)).await;

    println!("\nExample 3: gofmt");
    execute_and_print(&service, Submission::new("package main\nfunc main(){}", Target::Format))
        .await;

    println!("\nExample 4: infinite loop hits the deadline");
    execute_and_print(&service, Submission::new(SPIN, Target::Run)).await;

    println!("\nExample 5: syntax error");
    execute_and_print(&service, Submission::new("package main\nfunc main( {", Target::Run)).await;

    Ok(())
}

async fn execute_and_print(service: &SandboxService, submission: Submission) {
    match service.execute(submission).await {
        Ok(result) => {
            print!("  stdout: {}", result.stdout_lossy());
            if let Some(artifact) = &result.artifact {
                println!("  artifact: {} bytes", artifact.len());
            }
            println!(
                "  Result: status={} exit_code={:?} duration={}ms",
                result.status,
                result.exit_code,
                result.duration_ms()
            );
        }
        Err(SandboxError::UntrustedProgram(result)) => {
            println!("  program failed: {}", result.diagnostics().trim_end());
        }
        Err(e) => {
            println!("  Error ({}): {}", e.status_code(), e.user_message());
        }
    }
}

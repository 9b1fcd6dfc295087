//! Integration tests for the sandbox service against a fake toolchain
//!
//! These tests verify that:
//! - Rejected submissions allocate nothing
//! - Every outcome returns its slot and removes its workspace
//! - Deadlines and output caps stop runaway programs
//! - The slot pool is never oversubscribed

use assert_matches::assert_matches;
use goplay_sandbox::{
    CancellationToken, ExitStatus, SandboxError, Submission, Target, ValidationError,
};
use goplay_tests::common::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn run(source: impl Into<String>) -> Submission {
    Submission::new(source, Target::Run)
}

#[tokio::test]
async fn test_oversized_submission_creates_no_workspace() {
    setup_test_logging();
    let root = tempfile::tempdir().unwrap();
    let config = test_sandbox_config(root.path(), 2);
    let service = fake_service(&config);

    let source = "#".repeat(config.limits.max_source_bytes + 1);
    let err = service.execute(run(source)).await.unwrap_err();

    assert_matches!(
        err,
        SandboxError::Validation(ValidationError::SourceTooLarge { .. })
    );
    assert_eq!(err.status_code(), 413);
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    assert_eq!(service.governor().in_use(), 0);
}

#[tokio::test]
async fn test_hello_program_runs() {
    setup_test_logging();
    let root = tempfile::tempdir().unwrap();
    let service = fake_service(&test_sandbox_config(root.path(), 2));

    let result = service.execute(run("echo hi")).await.unwrap();

    assert_eq!(result.status, ExitStatus::Ok);
    assert_eq!(result.exit_code, Some(0));
    assert!(result.stdout_lossy().contains("hi"));
}

#[tokio::test]
async fn test_real_go_hello() {
    setup_test_logging();
    fake_toolchain();
    if !real_go_available() {
        eprintln!("skipping: go is not on PATH");
        return;
    }

    let root = tempfile::tempdir().unwrap();
    let mut config = test_sandbox_config(root.path(), 1);
    config.limits.run_deadline = Duration::from_secs(120);
    config.limits.max_cpu_secs = Some(300);

    // reuse the host build cache so the standard library is not rebuilt
    let gocache = std::process::Command::new("go")
        .args(["env", "GOCACHE"])
        .output()
        .ok()
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
        .filter(|s| !s.is_empty());
    let toolchain = goplay_common::ToolchainConfig {
        gocache: gocache.map(Into::into),
        ..Default::default()
    };
    let service = goplay_sandbox::SandboxService::new(&config, toolchain);

    let source = "package main\n\nimport \"fmt\"\n\nfunc main() {\n\tfmt.Println(\"hi\")\n\tprint(\"builtin\\n\")\n}\n";
    let result = service.execute(run(source)).await.unwrap();

    assert_eq!(result.status, ExitStatus::Ok);
    assert!(result.stdout_lossy().contains("hi"));
    // the builtin print writes to stderr
    assert!(result.stderr_lossy().contains("builtin"));
    assert!(!result.stdout_lossy().contains("builtin"));
}

#[tokio::test]
async fn test_syntax_error_is_program_failure() {
    setup_test_logging();
    let root = tempfile::tempdir().unwrap();
    let service = fake_service(&test_sandbox_config(root.path(), 2));

    let source = "echo './main.go:3:1: syntax error: unexpected }' >&2; exit 1";
    let err = service.execute(run(source)).await.unwrap_err();

    let result = err.result().unwrap();
    assert_eq!(result.status, ExitStatus::NonzeroExit);
    assert_eq!(result.exit_code, Some(1));
    assert_matches!(err, SandboxError::UntrustedProgram(_));
    assert!(err.user_message().contains("syntax error"));
    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn test_infinite_loop_times_out_within_deadline() {
    setup_test_logging();
    let root = tempfile::tempdir().unwrap();
    let mut config = test_sandbox_config(root.path(), 2);
    config.limits.run_deadline = Duration::from_millis(500);
    let service = fake_service(&config);

    let started = Instant::now();
    let err = service
        .execute(run("while :; do :; done"))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_matches!(err, SandboxError::Timeout { deadline, .. } if deadline == Duration::from_millis(500));
    assert_eq!(err.result().unwrap().status, ExitStatus::Timeout);
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
}

#[tokio::test]
async fn test_output_flood_is_capped() {
    setup_test_logging();
    let root = tempfile::tempdir().unwrap();
    let config = test_sandbox_config(root.path(), 2);
    let cap = config.limits.max_stream_output_bytes;
    let service = fake_service(&config);

    let err = service.execute(run("yes flood")).await.unwrap_err();

    assert_matches!(err, SandboxError::OutputLimit { .. });
    let result = err.result().unwrap();
    assert_eq!(result.status, ExitStatus::OutputTooLarge);
    assert!(result.stdout.len() <= cap);
    assert!(result.stdout.len() + result.stderr.len() <= config.limits.max_combined_output_bytes);
}

#[tokio::test]
async fn test_every_outcome_releases_slot_and_workspace() {
    setup_test_logging();
    let root = tempfile::tempdir().unwrap();
    let mut config = test_sandbox_config(root.path(), 2);
    config.limits.run_deadline = Duration::from_millis(300);
    let service = fake_service(&config);

    let sources = [
        "echo ok",
        "exit 7",
        "while :; do :; done",
        "yes flood",
        "sleep 30 &",
    ];
    for source in sources {
        let before = service.governor().in_use();
        let _ = service.execute(run(source)).await;

        assert_eq!(service.governor().in_use(), before, "slot leaked by {:?}", source);
        assert!(
            service.workspaces().live_workspaces().unwrap().is_empty(),
            "workspace leaked by {:?}",
            source
        );
    }
}

#[tokio::test]
async fn test_pool_plus_one_rejects_exactly_one() {
    setup_test_logging();
    let root = tempfile::tempdir().unwrap();
    let markers = tempfile::tempdir().unwrap();
    let pool = 3;
    let mut config = test_sandbox_config(root.path(), pool);
    config.admission_timeout = Duration::from_millis(50);
    let service = Arc::new(fake_service(&config));

    let dir = markers.path().display().to_string();
    let source = format!(
        "touch {dir}/active.$$; ls {dir} | grep -c active >> {dir}/counts; sleep 1; rm {dir}/active.$$",
        dir = dir
    );

    let tasks: Vec<_> = (0..pool + 1)
        .map(|_| {
            let service = service.clone();
            let source = source.clone();
            tokio::spawn(async move { service.execute(run(source)).await })
        })
        .collect();

    let mut ok = 0;
    let mut busy = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(SandboxError::Capacity { capacity }) => {
                assert_eq!(capacity, pool);
                busy += 1;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(busy, 1);
    assert_eq!(ok, pool);

    let counts = std::fs::read_to_string(markers.path().join("counts")).unwrap();
    let peak = counts
        .lines()
        .map(|line| line.trim().parse::<usize>().unwrap())
        .max()
        .unwrap();
    assert!(peak <= pool, "peak concurrency {} exceeds pool {}", peak, pool);
    assert_eq!(service.governor().in_use(), 0);
}

#[tokio::test]
async fn test_capacity_rejection_touches_no_workspace() {
    setup_test_logging();
    let root = tempfile::tempdir().unwrap();
    let mut config = test_sandbox_config(root.path(), 1);
    config.admission_timeout = Duration::from_millis(50);
    let service = Arc::new(fake_service(&config));

    let running = {
        let service = service.clone();
        tokio::spawn(async move { service.execute(run("sleep 1")).await })
    };
    assert!(wait_until(Duration::from_secs(2), || service.governor().in_use() == 1).await);

    let before = service.workspaces().live_workspaces().unwrap();
    assert_eq!(before.len(), 1);
    let entries = std::fs::read_dir(root.path()).unwrap().count();

    let err = service.execute(run("echo hi")).await.unwrap_err();
    assert_matches!(err, SandboxError::Capacity { capacity: 1 });

    assert_eq!(service.workspaces().live_workspaces().unwrap(), before);
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), entries);

    assert!(running.await.unwrap().is_ok());
    assert!(service.workspaces().live_workspaces().unwrap().is_empty());
}

/// Live processes whose command line is `sleep <arg>`
fn sleepers(arg: &str) -> usize {
    let wanted = format!("sleep\0{}\0", arg).into_bytes();
    std::fs::read_dir("/proc")
        .unwrap()
        .flatten()
        .filter_map(|entry| std::fs::read(entry.path().join("cmdline")).ok())
        .filter(|cmdline| cmdline.ends_with(&wanted))
        .count()
}

#[tokio::test]
async fn test_new_session_is_killed_before_slot_release() {
    setup_test_logging();
    let setsid = std::process::Command::new("setsid")
        .arg("true")
        .status()
        .is_ok_and(|status| status.success());
    if !setsid {
        eprintln!("skipping: setsid is not installed");
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let service = fake_service(&test_sandbox_config(root.path(), 1));

    let result = service
        .execute(run("setsid sleep 33.71 & echo hi; sleep 0.2"))
        .await
        .unwrap();

    assert_eq!(result.stdout_lossy(), "hi\n");
    assert_eq!(service.governor().in_use(), 0);
    assert_eq!(sleepers("33.71"), 0);
}

#[tokio::test]
async fn test_missing_toolchain_is_internal_error() {
    setup_test_logging();
    let root = tempfile::tempdir().unwrap();
    let service = fake_service_with(&test_sandbox_config(root.path(), 1), |toolchain| {
        toolchain.go_binary = "/nonexistent/go/bin/go".into();
    });

    let err = service.execute(run("echo hi")).await.unwrap_err();

    assert_matches!(err, SandboxError::Internal(_));
    assert_eq!(err.status_code(), 500);
    assert!(!err.user_message().contains("/nonexistent"));
    assert!(service.workspaces().live_workspaces().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancellation_kills_and_cleans_up() {
    setup_test_logging();
    let root = tempfile::tempdir().unwrap();
    let service = fake_service(&test_sandbox_config(root.path(), 1));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = service
        .execute_with_cancel(run("sleep 30"), cancel)
        .await
        .unwrap_err();

    assert_matches!(err, SandboxError::Internal(_));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(service.governor().in_use(), 0);
    assert!(service.workspaces().live_workspaces().unwrap().is_empty());
}

#[tokio::test]
async fn test_compile_returns_wasm() {
    setup_test_logging();
    let root = tempfile::tempdir().unwrap();
    let service = fake_service(&test_sandbox_config(root.path(), 1));

    let result = service
        .execute(Submission::new("package main", Target::CompileWasm))
        .await
        .unwrap();
    assert_eq!(result.artifact.as_deref(), Some(FAKE_WASM));

    let err = service
        .execute(Submission::new("package main\nCOMPILE_ERROR", Target::CompileWasm))
        .await
        .unwrap_err();
    assert_matches!(err, SandboxError::UntrustedProgram(_));
    assert!(err.user_message().contains("undefined: COMPILE_ERROR"));
}

#[tokio::test]
async fn test_format_goes_through_sandbox() {
    setup_test_logging();
    let root = tempfile::tempdir().unwrap();
    let service = fake_service(&test_sandbox_config(root.path(), 1));

    let result = service
        .execute(Submission::new("package   main\n", Target::Format))
        .await
        .unwrap();
    assert_eq!(result.stdout_lossy(), "package main\n");

    let err = service
        .execute(Submission::new("package main\nFORMAT_ERROR\n", Target::Format))
        .await
        .unwrap_err();
    assert_matches!(err, SandboxError::UntrustedProgram(_));
    assert!(err.user_message().contains("expected declaration"));
}

#[tokio::test]
async fn test_disallowed_flag_is_rejected_before_running() {
    setup_test_logging();
    let root = tempfile::tempdir().unwrap();
    let service = fake_service(&test_sandbox_config(root.path(), 1));

    let submission = Submission::new("package main", Target::CompileWasm)
        .with_flags(["-target=wasm", "-ldflags=-X main.x=1"]);
    let err = service.execute(submission).await.unwrap_err();

    assert_matches!(
        err,
        SandboxError::Validation(ValidationError::FlagNotAllowed { .. })
    );
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_stale_sweep_removes_only_leftovers() {
    setup_test_logging();
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("goplay-crashed")).unwrap();
    std::fs::create_dir(root.path().join("someone-else")).unwrap();
    let service = fake_service(&test_sandbox_config(root.path(), 1));

    // leftovers younger than the grace period stay
    assert_eq!(service.sweep_stale_workspaces().unwrap(), 0);
    assert_eq!(
        service
            .workspaces()
            .sweep_stale(Duration::ZERO)
            .unwrap(),
        1
    );
    assert!(root.path().join("someone-else").exists());
}

//! End-to-end tests through the host sandbox runtime.
//!
//! These spawn real `/bin/sh` processes inside throwaway volumes.

#![cfg(unix)]

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use palisade::{
    Action, ActionKind, AgenticExecutor, AutoApprove, Config, ExecutionLimits, ExecutionStatus,
    FailureKind, SafetyLevel,
};

/// Scheduling slack on top of a run's hard deadline.
const DEADLINE_SLACK_MS: u128 = 500;

fn executor(root: &tempfile::TempDir, configure: impl FnOnce(&mut Config)) -> AgenticExecutor {
    let mut config = Config::default();
    config.sandbox.volume_root = Some(root.path().to_path_buf());
    config.sandbox.warm_pool = 1;
    config.sandbox.isolate_network = palisade::network_isolation_supported();
    configure(&mut config);
    let executor = AgenticExecutor::builder()
        .config(config)
        .approval(AutoApprove)
        .build()
        .expect("build executor");
    executor
        .start_session("agent", Some(SafetyLevel::Moderate))
        .expect("start session");
    executor
}

fn shell(payload: &str) -> Action {
    Action::new("agent", ActionKind::Shell, payload)
}

#[tokio::test]
async fn test_shell_output_is_captured() {
    let root = tempfile::tempdir().unwrap();
    let executor = executor(&root, |_| {});

    let result = executor.propose(shell("echo hello")).await.unwrap();

    assert!(result.is_success(), "{result:?}");
    assert_eq!(result.stdout, "hello\n");
    assert!(!result.truncated);
    assert!(result.sandbox_id.is_some());
}

#[tokio::test]
async fn test_files_do_not_survive_between_actions() {
    let root = tempfile::tempdir().unwrap();
    let executor = executor(&root, |_| {});

    let write = Action::builder("agent", ActionKind::FileWrite, "notes.txt")
        .content("scratch")
        .build();
    assert!(executor.propose(write).await.unwrap().is_success());

    let result = executor.propose(shell("cat notes.txt")).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_ne!(result.exit_code, Some(0), "the volume was wiped on release");
}

#[tokio::test]
async fn test_timeout_kills_the_process() {
    let root = tempfile::tempdir().unwrap();
    let executor = executor(&root, |config| {
        config.sandbox.limits.timeout = Duration::from_millis(200);
        config.sandbox.limits.grace = Duration::from_millis(100);
    });

    let result = executor.propose(shell("sleep 5")).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::TimedOut);
    assert_eq!(result.failure, Some(FailureKind::ExecutionTimeout));
    assert!(result.wall_clock_ms < 5_000);
}

#[tokio::test]
async fn test_ignored_sigterm_still_ends_by_the_hard_deadline() {
    let root = tempfile::tempdir().unwrap();
    let limits = ExecutionLimits {
        timeout: Duration::from_millis(200),
        grace: Duration::from_millis(100),
        ..ExecutionLimits::default()
    };
    let executor = executor(&root, |config| config.sandbox.limits = limits);

    let result = executor
        .propose(shell("trap '' TERM; sleep 5"))
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::TimedOut);
    assert!(
        u128::from(result.wall_clock_ms) <= limits.hard_deadline().as_millis() + DEADLINE_SLACK_MS,
        "ran for {} ms",
        result.wall_clock_ms
    );
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_shell_runs_outside_the_host_network_namespace() {
    if !palisade::network_isolation_supported() {
        eprintln!("user namespaces unavailable; skipping");
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let executor = executor(&root, |_| {});
    let host = std::fs::read_link("/proc/self/ns/net").unwrap();

    let result = executor
        .propose(shell("readlink /proc/self/ns/net; echo \"proxy=$http_proxy\""))
        .await
        .unwrap();

    assert!(result.is_success(), "{result:?}");
    let mut lines = result.stdout.lines();
    assert_ne!(lines.next(), Some(host.to_string_lossy().as_ref()));
    assert_eq!(lines.next(), Some("proxy="), "shell actions get no proxy");
}

#[tokio::test]
async fn test_output_is_truncated_at_the_cap() {
    let root = tempfile::tempdir().unwrap();
    let executor = executor(&root, |config| {
        config.sandbox.limits.max_output_bytes = 16;
    });

    let result = executor.propose(shell("seq 1 2000")).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert!(result.truncated);
    assert!(result.stdout.len() <= 16);
}

#[tokio::test]
async fn test_cancel_kills_running_process() {
    let root = tempfile::tempdir().unwrap();
    let executor = executor(&root, |_| {});
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        })
    };
    let result = executor
        .propose_with_cancel(shell("sleep 5"), cancel)
        .await
        .unwrap();
    canceller.await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert!(result.wall_clock_ms < 5_000);
}

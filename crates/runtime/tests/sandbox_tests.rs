//! Sandbox executor scenarios: static policy rejection, dynamic limit
//! enforcement, and clean execution.
//!
//! Tests that spawn a real interpreter probe for `python3` first and
//! skip quietly when the host has none; the static-policy scenarios
//! never need one.

use std::time::Duration;

use datalyst_runtime::config::SandboxConfig;
use datalyst_runtime::sandbox::{ExecutionStatus, SandboxExecutor};
use datalyst_runtime::types::UserId;

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn executor(dir: &std::path::Path, timeout: Duration) -> SandboxExecutor {
    let mut config = SandboxConfig::default();
    config.work_root = dir.to_path_buf();
    config.timeout = timeout;
    SandboxExecutor::new(config)
}

#[tokio::test]
async fn forbidden_import_is_rejected_statically() {
    let dir = tempfile::tempdir().unwrap();
    let executor = executor(dir.path(), Duration::from_secs(5));
    let record = executor
        .execute(
            UserId::new(),
            None,
            "python",
            "import os\nos.listdir('/')",
            None,
        )
        .await;

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(!record.security_ok);
    assert!(record.error.as_deref().unwrap_or("").contains("os"));
    // No child process ran: nothing was measured.
    assert_eq!(record.output, "");
    assert_eq!(record.memory_peak_mb, 0);
}

#[tokio::test]
async fn unsupported_language_fails_without_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let executor = executor(dir.path(), Duration::from_secs(5));
    let record = executor
        .execute(UserId::new(), None, "ruby", "puts 1", None)
        .await;
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.error.as_deref().unwrap_or("").contains("ruby"));
}

#[tokio::test]
async fn records_are_owner_scoped() {
    let dir = tempfile::tempdir().unwrap();
    let executor = executor(dir.path(), Duration::from_secs(5));
    let owner = UserId::new();
    let record = executor
        .execute(owner, None, "python", "import os", None)
        .await;

    assert!(executor.get(record.id, owner).is_some());
    assert!(executor.get(record.id, UserId::new()).is_none());
    assert_eq!(executor.list(owner, 10).len(), 1);
}

#[tokio::test]
async fn busy_loop_is_killed_at_the_wall_clock_limit() {
    if !python_available() {
        eprintln!("skipping: python3 not available");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let executor = executor(dir.path(), Duration::from_secs(1));
    let record = executor
        .execute(UserId::new(), None, "python", "while True: pass\n", None)
        .await;

    assert_eq!(record.status, ExecutionStatus::Timeout);
    assert!(record.security_ok, "an unbounded loop is not a policy breach");
    assert_eq!(record.output, "");
    assert!(
        record.wall_ms >= 1000 && record.wall_ms < 2000,
        "wall_ms = {}",
        record.wall_ms
    );
    assert!(record.finished_at.is_some());
}

#[tokio::test]
async fn clean_code_completes_with_captured_output() {
    if !python_available() {
        eprintln!("skipping: python3 not available");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let executor = executor(dir.path(), Duration::from_secs(10));
    let record = executor
        .execute(
            UserId::new(),
            None,
            "python",
            "total = sum(range(10))\nprint('total =', total)\n",
            None,
        )
        .await;

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert!(record.security_ok);
    assert!(record.output.contains("total = 45"));
    assert!(record.error.is_none());
}

#[tokio::test]
async fn runaway_stdout_is_killed_at_the_output_limit() {
    if !python_available() {
        eprintln!("skipping: python3 not available");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let mut config = SandboxConfig::default();
    config.work_root = dir.path().to_path_buf();
    config.timeout = Duration::from_secs(20);
    config.max_output_bytes = 64 * 1024;
    let executor = SandboxExecutor::new(config);

    let record = executor
        .execute(
            UserId::new(),
            None,
            "python",
            "while True:\n    print('x' * 1024)\n",
            None,
        )
        .await;

    assert_eq!(record.status, ExecutionStatus::OutputExceeded);
    // Only bytes accumulated before termination survive, capped.
    assert!(record.output.len() <= 64 * 1024);
}

#[tokio::test]
async fn failing_script_surfaces_stderr() {
    if !python_available() {
        eprintln!("skipping: python3 not available");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let executor = executor(dir.path(), Duration::from_secs(10));
    let record = executor
        .execute(
            UserId::new(),
            None,
            "python",
            "raise ValueError('wrong column')\n",
            None,
        )
        .await;

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record
        .error
        .as_deref()
        .unwrap_or("")
        .contains("wrong column"));
}

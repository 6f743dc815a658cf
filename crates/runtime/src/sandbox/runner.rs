//! Resource-limited child process runner
//!
//! Spawns the interpreter over a script file and supervises it on a
//! polling cadence of at most 100 ms, enforcing three dynamic limits:
//! wall clock, resident memory, and accumulated stdout bytes. Any limit
//! breach kills the child preemptively; output captured before the kill
//! is preserved.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::types::SandboxError;

/// Dynamic limits for one execution.
#[derive(Debug, Clone)]
pub struct RunLimits {
    pub timeout: Duration,
    pub max_memory_mb: u64,
    pub max_output_bytes: u64,
    pub poll_interval: Duration,
}

/// What the supervised child produced.
#[derive(Debug)]
pub struct RunOutcome {
    pub exit_ok: bool,
    pub stdout: String,
    pub stderr: String,
    pub wall_ms: u64,
    pub memory_peak_mb: u64,
    pub cpu_peak_percent: f32,
    /// The limit that killed the child, when one did.
    pub limit_breach: Option<SandboxError>,
}

/// Drain a child stream into a shared buffer without a size cutoff; the
/// supervisor enforces the output limit and kills the child instead.
fn spawn_reader<R>(mut reader: R, buffer: Arc<Mutex<Vec<u8>>>) -> tokio::task::JoinHandle<()>
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.lock().extend_from_slice(&chunk[..n]),
            }
        }
    })
}

/// Run `interpreter script` under the given limits.
pub async fn run_limited(
    interpreter: &str,
    script: &Path,
    work_dir: &Path,
    limits: &RunLimits,
) -> Result<RunOutcome, SandboxError> {
    let started = Instant::now();

    let mut child = Command::new(interpreter)
        .arg(script)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SandboxError::SpawnFailed(format!("{}: {}", interpreter, e)))?;

    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));
    let stdout_task = child
        .stdout
        .take()
        .map(|out| spawn_reader(out, Arc::clone(&stdout_buf)));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| spawn_reader(err, Arc::clone(&stderr_buf)));

    let pid = child.id();
    let mut system = System::new();
    let mut memory_peak_bytes: u64 = 0;
    let mut cpu_peak: f32 = 0.0;
    let mut limit_breach: Option<SandboxError> = None;
    let mut exit_ok = false;

    let poll = limits.poll_interval.min(Duration::from_millis(100));
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                exit_ok = status.success();
                break;
            }
            Ok(None) => {}
            Err(e) => {
                limit_breach = Some(SandboxError::SpawnFailed(format!(
                    "supervision failed: {}",
                    e
                )));
                let _ = child.start_kill();
                break;
            }
        }

        let elapsed = started.elapsed();
        if elapsed > limits.timeout {
            limit_breach = Some(SandboxError::Timeout {
                elapsed_ms: elapsed.as_millis() as u64,
                limit_ms: limits.timeout.as_millis() as u64,
            });
            let _ = child.start_kill();
            break;
        }

        if let Some(pid) = pid {
            let spid = Pid::from_u32(pid);
            system.refresh_process_specifics(spid, ProcessRefreshKind::new().with_memory().with_cpu());
            if let Some(process) = system.process(spid) {
                memory_peak_bytes = memory_peak_bytes.max(process.memory());
                cpu_peak = cpu_peak.max(process.cpu_usage());
                let peak_mb = memory_peak_bytes / (1024 * 1024);
                if peak_mb > limits.max_memory_mb {
                    limit_breach = Some(SandboxError::MemoryExceeded {
                        peak_mb,
                        limit_mb: limits.max_memory_mb,
                    });
                    let _ = child.start_kill();
                    break;
                }
            }
        }

        let stdout_bytes = stdout_buf.lock().len() as u64;
        if stdout_bytes > limits.max_output_bytes {
            limit_breach = Some(SandboxError::OutputExceeded {
                bytes: stdout_bytes,
                limit: limits.max_output_bytes,
            });
            let _ = child.start_kill();
            break;
        }

        tokio::time::sleep(poll).await;
    }

    // Make sure the child is fully reaped on every path.
    let _ = child.wait().await;
    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    let wall_ms = started.elapsed().as_millis() as u64;
    let stdout_bytes = {
        let buf = stdout_buf.lock();
        // A breach may land between polls; keep only bytes within the cap.
        let keep = buf.len().min(limits.max_output_bytes as usize);
        buf[..keep].to_vec()
    };
    let stderr_bytes = stderr_buf.lock().clone();

    Ok(RunOutcome {
        exit_ok: exit_ok && limit_breach.is_none(),
        stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
        wall_ms,
        memory_peak_mb: memory_peak_bytes / (1024 * 1024),
        cpu_peak_percent: cpu_peak,
        limit_breach,
    })
}

//! Sandboxed code executor
//!
//! Two layers: a static policy screen ([`policy`]) that rejects unsafe
//! code before any process exists, and a dynamic runner ([`runner`])
//! that supervises the interpreter under wall/memory/output limits.
//! Every outcome is represented in an [`ExecutionRecord`]; execution
//! never raises into the caller's task.

pub mod policy;
pub mod runner;

pub use policy::PolicyReport;
pub use runner::{RunLimits, RunOutcome};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::SandboxConfig;
use crate::types::{ExecutionId, SandboxError, SessionId, UserId};

/// Lifecycle of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    MemoryExceeded,
    OutputExceeded,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }
}

/// Immutable-once-terminal record of a sandbox execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub owner: UserId,
    pub session: Option<SessionId>,
    pub language: String,
    pub code: String,
    pub status: ExecutionStatus,
    pub output: String,
    pub error: Option<String>,
    pub wall_ms: u64,
    pub memory_peak_mb: u64,
    pub cpu_peak_percent: f32,
    /// Whether the static policy screen passed.
    pub security_ok: bool,
    pub warnings: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Secure evaluator for LLM-emitted analysis code.
pub struct SandboxExecutor {
    config: SandboxConfig,
    records: DashMap<ExecutionId, ExecutionRecord>,
    pool: Semaphore,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        let pool = Semaphore::new(config.pool_size);
        Self {
            config,
            records: DashMap::new(),
            pool,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Execute `code` under the static policy and dynamic limits.
    ///
    /// All failure modes land in the returned record; the method itself
    /// only fails if the record cannot even be created.
    pub async fn execute(
        &self,
        owner: UserId,
        session: Option<SessionId>,
        language: &str,
        code: &str,
        timeout_override: Option<Duration>,
    ) -> ExecutionRecord {
        let mut record = ExecutionRecord {
            id: ExecutionId::new(),
            owner,
            session,
            language: language.to_string(),
            code: code.to_string(),
            status: ExecutionStatus::Pending,
            output: String::new(),
            error: None,
            wall_ms: 0,
            memory_peak_mb: 0,
            cpu_peak_percent: 0.0,
            security_ok: false,
            warnings: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        };

        if !language.eq_ignore_ascii_case("python") {
            record.status = ExecutionStatus::Failed;
            record.error = Some(SandboxError::UnsupportedLanguage(language.to_string()).to_string());
            record.finished_at = Some(Utc::now());
            self.records.insert(record.id, record.clone());
            return record;
        }

        // Static policy screen: fail before a child process exists.
        let report = match policy::check(code) {
            Ok(report) => report,
            Err(policy_err) => {
                record.status = ExecutionStatus::Failed;
                record.security_ok = false;
                record.warnings.push(policy_err.to_string());
                record.error = Some(policy_err.to_string());
                record.finished_at = Some(Utc::now());
                tracing::warn!(execution = %record.id, error = %policy_err, "static policy rejection");
                self.records.insert(record.id, record.clone());
                return record;
            }
        };
        record.security_ok = true;
        record.warnings = report.warnings;

        let permit = match self.pool.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                record.status = ExecutionStatus::Failed;
                record.error = Some("execution pool closed".to_string());
                record.finished_at = Some(Utc::now());
                self.records.insert(record.id, record.clone());
                return record;
            }
        };

        record.status = ExecutionStatus::Running;
        self.records.insert(record.id, record.clone());

        let outcome = self.run_in_workdir(code, timeout_override).await;
        drop(permit);

        match outcome {
            Ok(outcome) => {
                record.output = outcome.stdout;
                record.wall_ms = outcome.wall_ms;
                record.memory_peak_mb = outcome.memory_peak_mb;
                record.cpu_peak_percent = outcome.cpu_peak_percent;
                match outcome.limit_breach {
                    Some(breach) => {
                        record.status = match breach {
                            SandboxError::Timeout { .. } => ExecutionStatus::Timeout,
                            SandboxError::MemoryExceeded { .. } => ExecutionStatus::MemoryExceeded,
                            SandboxError::OutputExceeded { .. } => ExecutionStatus::OutputExceeded,
                            _ => ExecutionStatus::Failed,
                        };
                        record.error = Some(breach.to_string());
                    }
                    None if outcome.exit_ok => {
                        record.status = ExecutionStatus::Completed;
                    }
                    None => {
                        record.status = ExecutionStatus::Failed;
                        record.error = Some(if outcome.stderr.is_empty() {
                            "interpreter exited with a failure status".to_string()
                        } else {
                            outcome.stderr
                        });
                    }
                }
            }
            Err(e) => {
                record.status = ExecutionStatus::Failed;
                record.error = Some(e.to_string());
            }
        }
        record.finished_at = Some(Utc::now());
        self.records.insert(record.id, record.clone());
        tracing::info!(
            execution = %record.id,
            status = ?record.status,
            wall_ms = record.wall_ms,
            "sandbox execution finished"
        );
        record
    }

    /// Write the script into a dedicated work dir and run it. The work
    /// dir (and the temp file with it) is removed unconditionally when
    /// the guard drops.
    async fn run_in_workdir(
        &self,
        code: &str,
        timeout_override: Option<Duration>,
    ) -> Result<RunOutcome, SandboxError> {
        tokio::fs::create_dir_all(&self.config.work_root)
            .await
            .map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;
        let work_dir = tempfile::Builder::new()
            .prefix("exec-")
            .tempdir_in(&self.config.work_root)
            .map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;

        let script_path = work_dir.path().join("script.py");
        {
            let mut file = std::fs::File::create(&script_path)
                .map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;
            file.write_all(code.as_bytes())
                .map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;
        }

        let limits = RunLimits {
            timeout: timeout_override.unwrap_or(self.config.timeout),
            max_memory_mb: self.config.max_memory_mb,
            max_output_bytes: self.config.max_output_bytes,
            poll_interval: self.config.poll_interval,
        };
        runner::run_limited(&self.config.interpreter, &script_path, work_dir.path(), &limits).await
    }

    /// Fetch a record, enforcing ownership.
    pub fn get(&self, id: ExecutionId, owner: UserId) -> Option<ExecutionRecord> {
        self.records
            .get(&id)
            .filter(|r| r.owner == owner)
            .map(|r| r.clone())
    }

    /// Most recent executions for one user.
    pub fn list(&self, owner: UserId, limit: usize) -> Vec<ExecutionRecord> {
        let mut records: Vec<ExecutionRecord> = self
            .records
            .iter()
            .filter(|r| r.owner == owner)
            .map(|r| r.clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        records
    }

    /// Drop terminal records older than `age`. Used by maintenance.
    pub fn cleanup_older_than(&self, age: Duration) -> usize {
        let cutoff = match chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        {
            Some(cutoff) => cutoff,
            None => return 0,
        };
        let stale: Vec<ExecutionId> = self
            .records
            .iter()
            .filter(|r| r.status.is_terminal() && r.created_at < cutoff)
            .map(|r| r.id)
            .collect();
        let count = stale.len();
        for id in stale {
            self.records.remove(&id);
        }
        count
    }
}

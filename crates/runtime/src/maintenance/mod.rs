//! Background maintenance supervisor
//!
//! Two cooperating long-lived workers: a monitor sampling process and
//! system resources on a short cadence, and a cleanup pass reclaiming
//! stale state on a long one. Threshold breaches trigger reclamation
//! early; alerts fan out to registered handlers and a failing handler
//! never interrupts either loop.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio::sync::watch;

use crate::accounting::TokenAccountant;
use crate::audit::AuditLog;
use crate::config::MaintenanceConfig;
use crate::sandbox::SandboxExecutor;
use crate::session::SessionStore;
use crate::storage::{BlobStore, KvStore};
use crate::vector::VectorStore;

/// Prefix under which all cache entries live in the KV store.
const CACHE_PREFIX: &str = "datalyst:cache:";

/// What kind of condition an alert reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighMemory,
    HighCpu,
    LowDisk,
    HealthCheckFailed,
}

/// One alert fanned out to handlers.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Receives alerts. Implementations must not block for long.
pub trait AlertHandler: Send + Sync {
    fn on_alert(&self, alert: &Alert);
}

/// Result of one health check pass.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub cache_ok: bool,
    pub media_readable: bool,
    pub session_rows: usize,
    pub audit_rows: usize,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.cache_ok && self.media_readable
    }
}

/// What one cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CleanupReport {
    pub sessions_removed: usize,
    pub audit_events_swept: usize,
    pub notes_purged: usize,
    pub images_removed: usize,
    pub executions_removed: usize,
    pub cache_cleared: bool,
}

/// Counters accumulated over the supervisor's lifetime.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceStats {
    pub monitor_ticks: u64,
    pub cleanup_runs: u64,
    pub alerts_emitted: u64,
    pub ledgers_reset: u64,
    pub last_cleanup: Option<CleanupReport>,
    pub last_cleanup_at: Option<DateTime<Utc>>,
    pub last_health: Option<HealthReport>,
}

/// Periodic monitors performing cleanup, health checks, and adaptive
/// resource reclamation.
pub struct MaintenanceSupervisor {
    config: MaintenanceConfig,
    kv: Arc<dyn KvStore>,
    blobs: Arc<dyn BlobStore>,
    sessions: Arc<SessionStore>,
    vectors: Arc<VectorStore>,
    sandbox: Arc<SandboxExecutor>,
    audit: Arc<AuditLog>,
    accountant: Arc<TokenAccountant>,
    handlers: RwLock<Vec<Arc<dyn AlertHandler>>>,
    stats: Mutex<MaintenanceStats>,
    shutdown: watch::Sender<bool>,
    /// Filesystem path whose disk backs the media root, when local.
    /// Remote blob stores leave this unset and skip the disk check.
    media_root: Option<std::path::PathBuf>,
}

impl MaintenanceSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MaintenanceConfig,
        kv: Arc<dyn KvStore>,
        blobs: Arc<dyn BlobStore>,
        sessions: Arc<SessionStore>,
        vectors: Arc<VectorStore>,
        sandbox: Arc<SandboxExecutor>,
        audit: Arc<AuditLog>,
        accountant: Arc<TokenAccountant>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            kv,
            blobs,
            sessions,
            vectors,
            sandbox,
            audit,
            accountant,
            handlers: RwLock::new(Vec::new()),
            stats: Mutex::new(MaintenanceStats::default()),
            shutdown,
            media_root: None,
        }
    }

    pub fn with_media_root(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.media_root = Some(path.into());
        self
    }

    pub fn register_alert_handler(&self, handler: Arc<dyn AlertHandler>) {
        self.handlers.write().push(handler);
    }

    /// Spawn the monitor and cleanup workers.
    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        let mut monitor_shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.monitor_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_health: Option<std::time::Instant> = None;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.monitor_tick(&mut last_health).await;
                    }
                    _ = monitor_shutdown.changed() => break,
                }
            }
            tracing::info!("monitor worker stopped");
        });

        let cleaner = Arc::clone(self);
        let mut cleanup_shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleaner.config.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so startup does
            // not race a full cleanup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = cleaner.run_cleanup().await;
                        tracing::info!(?report, "scheduled cleanup completed");
                    }
                    _ = cleanup_shutdown.changed() => break,
                }
            }
            tracing::info!("cleanup worker stopped");
        });

        tracing::info!(
            monitor_interval = ?self.config.monitor_interval,
            cleanup_interval = ?self.config.cleanup_interval,
            "maintenance supervisor started"
        );
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn stats(&self) -> MaintenanceStats {
        self.stats.lock().clone()
    }

    /// Trigger a cleanup pass outside the schedule.
    pub async fn run_cleanup_now(&self) -> CleanupReport {
        self.run_cleanup().await
    }

    async fn monitor_tick(&self, last_health: &mut Option<std::time::Instant>) {
        self.stats.lock().monitor_ticks += 1;

        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu();

        let total = system.total_memory().max(1);
        let mem_frac = system.used_memory() as f64 / total as f64;
        let cpu_frac = system.global_cpu_info().cpu_usage() as f64 / 100.0;

        if mem_frac > self.config.memory_purge_threshold {
            let purged = self.kv.delete_prefix(CACHE_PREFIX).await.unwrap_or(0);
            self.emit(Alert {
                kind: AlertKind::HighMemory,
                message: format!(
                    "memory at {:.0}%, purged {} cache entries",
                    mem_frac * 100.0,
                    purged
                ),
                at: Utc::now(),
            });
        }
        if mem_frac > self.config.memory_reclaim_threshold {
            // Reclamation pass: drop everything droppable right now.
            let expired = self.kv.purge_expired().await.unwrap_or(0);
            tracing::warn!(
                expired,
                "memory above reclaim threshold, forced reclamation pass"
            );
        }
        if cpu_frac > 0.95 {
            self.emit(Alert {
                kind: AlertKind::HighCpu,
                message: format!("cpu at {:.0}%", cpu_frac * 100.0),
                at: Utc::now(),
            });
        }

        if let Some(disk_frac) = disk_usage_fraction(self.media_root.as_deref()) {
            if disk_frac > self.config.disk_cleanup_threshold {
                self.emit(Alert {
                    kind: AlertKind::LowDisk,
                    message: format!("disk at {:.0}%, running cleanup", disk_frac * 100.0),
                    at: Utc::now(),
                });
                let report = self.run_cleanup().await;
                tracing::warn!(?report, "disk-pressure cleanup completed");
            }
        }

        // Month-boundary ledger resets piggyback on the monitor cadence.
        let reset = self.accountant.reset_expired();
        if reset > 0 {
            self.stats.lock().ledgers_reset += reset as u64;
        }

        let due = last_health.map_or(true, |at| at.elapsed() >= self.config.health_check_interval);
        if due {
            let report = self.health_check().await;
            if !report.is_healthy() {
                self.emit(Alert {
                    kind: AlertKind::HealthCheckFailed,
                    message: format!(
                        "health check failed (cache_ok={}, media_readable={})",
                        report.cache_ok, report.media_readable
                    ),
                    at: Utc::now(),
                });
            }
            self.stats.lock().last_health = Some(report);
            *last_health = Some(std::time::Instant::now());
        }
    }

    /// Cache round-trip, media readability, and table row counts.
    pub async fn health_check(&self) -> HealthReport {
        let probe_key = format!("{}healthcheck", CACHE_PREFIX);
        let cache_ok = match self
            .kv
            .set(&probe_key, "ok", Some(Duration::from_secs(60)))
            .await
        {
            Ok(()) => matches!(self.kv.get(&probe_key).await, Ok(Some(v)) if v == "ok"),
            Err(_) => false,
        };

        HealthReport {
            cache_ok,
            media_readable: self.blobs.is_readable().await,
            session_rows: self.sessions.total_sessions(),
            audit_rows: self.audit.len(),
            checked_at: Utc::now(),
        }
    }

    async fn run_cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        report.sessions_removed = self
            .sessions
            .cleanup_idle(days(self.config.session_max_idle_days))
            .await;
        report.audit_events_swept = self.audit.sweep_expired();
        report.notes_purged = self
            .vectors
            .purge_older_than(days(self.config.note_max_age_days))
            .await
            .unwrap_or(0);
        report.executions_removed = self
            .sandbox
            .cleanup_older_than(days(self.config.execution_max_age_days));

        match self
            .blobs
            .list_older_than("images", days(self.config.image_max_age_days))
            .await
        {
            Ok(stale) => {
                for path in stale {
                    if self.blobs.delete(&path).await.unwrap_or(false) {
                        report.images_removed += 1;
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "image sweep failed"),
        }

        let cached_bytes = self.kv.total_bytes().await.unwrap_or(0);
        if cached_bytes > self.config.cache_max_bytes {
            let _ = self.kv.delete_prefix(CACHE_PREFIX).await;
            report.cache_cleared = true;
        }
        let _ = self.kv.purge_expired().await;

        let mut stats = self.stats.lock();
        stats.cleanup_runs += 1;
        stats.last_cleanup = Some(report);
        stats.last_cleanup_at = Some(Utc::now());
        report
    }

    fn emit(&self, alert: Alert) {
        self.stats.lock().alerts_emitted += 1;
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            // A panicking handler must not take the loop down with it.
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler.on_alert(&alert)
            }));
            if result.is_err() {
                tracing::error!(kind = ?alert.kind, "alert handler panicked");
            }
        }
    }
}

fn days(n: u32) -> Duration {
    Duration::from_secs(u64::from(n) * 24 * 60 * 60)
}

/// Used fraction of the disk holding `path`, judged by longest mount
/// point prefix. `None` when it cannot be determined.
fn disk_usage_fraction(path: Option<&Path>) -> Option<f64> {
    let path = path?;
    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(usize, f64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if path.starts_with(mount) {
            let total = disk.total_space();
            if total == 0 {
                continue;
            }
            let used = total.saturating_sub(disk.available_space());
            let frac = used as f64 / total as f64;
            let depth = mount.components().count();
            if best.map_or(true, |(d, _)| depth > d) {
                best = Some((depth, frac));
            }
        }
    }
    best.map(|(_, frac)| frac)
}

//! Pass scheduler: runs passes back to back, separated by a fixed sleep.
//!
//! Passes never overlap. The sleep is interrupted by shutdown; a pass that is
//! already running is allowed to finish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use ldap_configmap_core::sync_engine::SyncEngine;

/// Tracks aggregate statistics across passes.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub total_passes: AtomicU64,
    pub total_errors: AtomicU64,
    pub consecutive_errors: AtomicU64,
}

pub struct Scheduler {
    sync_engine: Arc<SyncEngine>,
    interval: Duration,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(sync_engine: Arc<SyncEngine>, interval: Duration) -> Self {
        Self {
            sync_engine,
            interval,
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        Arc::clone(&self.stats)
    }

    /// Main scheduler loop. Returns once `shutdown` flips to `true` or its
    /// sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.run_pass().await;

            debug!(interval_secs = self.interval.as_secs(), "sleeping until next pass");
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("scheduler stopped");
    }

    async fn run_pass(&self) {
        let pass = self.stats.total_passes.fetch_add(1, Ordering::SeqCst) + 1;
        match self.sync_engine.run_pass().await {
            Ok(report) => {
                self.stats.consecutive_errors.store(0, Ordering::SeqCst);
                info!(
                    pass,
                    published = report.published(),
                    "pass completed successfully"
                );
            }
            Err(e) => {
                let errors = self.stats.total_errors.fetch_add(1, Ordering::SeqCst) + 1;
                let consecutive = self.stats.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                error!(
                    pass,
                    error = %e,
                    total_errors = errors,
                    consecutive_errors = consecutive,
                    "pass failed, retrying after interval"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ldap_configmap_core::config::AppConfig;
    use ldap_configmap_core::directory::MemoryDirectory;
    use ldap_configmap_core::store::MemoryStore;
    use ldap_configmap_core::sync_engine::PassPlan;
    use ldap_configmap_core::{ProjectionRegistry, SyncMetrics};

    fn engine(dir: &MemoryDirectory) -> Arc<SyncEngine> {
        let config: AppConfig = toml::from_str(
            r#"
[ldap]
url = "ldap://ldap.test"
user_base_dn = "ou=People,dc=test"

[store]
namespace = "identity"
"#,
        )
        .unwrap();
        let plan = PassPlan::from_config(&config, &ProjectionRegistry::with_builtin()).unwrap();
        Arc::new(SyncEngine::new(
            plan,
            Arc::new(dir.clone()),
            Arc::new(MemoryStore::new("identity")),
            Arc::new(SyncMetrics::new()),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_passes_repeat_after_interval() {
        let dir = MemoryDirectory::new();
        let scheduler = Scheduler::new(engine(&dir), Duration::from_secs(60));
        let stats = scheduler.stats();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));

        tokio::time::sleep(Duration::from_secs(150)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(stats.total_passes.load(Ordering::SeqCst), 3);
        assert_eq!(dir.connects(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_passes_are_counted() {
        let dir = MemoryDirectory::new();
        dir.set_unreachable(true);
        let scheduler = Scheduler::new(engine(&dir), Duration::from_secs(60));
        let stats = scheduler.stats();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));

        tokio::time::sleep(Duration::from_secs(90)).await;
        drop(tx);
        handle.await.unwrap();

        assert_eq!(stats.total_errors.load(Ordering::SeqCst), 2);
        assert_eq!(stats.consecutive_errors.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_before_first_pass() {
        let dir = MemoryDirectory::new();
        let (_tx, rx) = watch::channel(true);
        Scheduler::new(engine(&dir), Duration::from_secs(60))
            .run(rx)
            .await;
        assert_eq!(dir.connects(), 0);
    }
}

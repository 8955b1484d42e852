//! Background execution of reclamation runs

use anyhow::Result;
use reclaim_lib::{
    health::HealthRegistry,
    inventory::{HostConfigurer, InventoryReader, VmLimiter},
    tracker::RunGuard,
    Clock, ReclamationController, ReclamationThresholds, RunTracker, TokioClock,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Builds a controller per run and drives it on a background task
#[derive(Clone)]
pub struct RunLauncher {
    hosts: Arc<dyn HostConfigurer>,
    inventory: Arc<dyn InventoryReader>,
    limiter: Arc<dyn VmLimiter>,
    clock: Arc<dyn Clock>,
    thresholds: ReclamationThresholds,
    cluster: String,
    tracker: RunTracker,
    health_registry: HealthRegistry,
    active: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RunLauncher {
    pub fn new<F>(
        fleet: Arc<F>,
        thresholds: ReclamationThresholds,
        cluster: impl Into<String>,
        tracker: RunTracker,
        health_registry: HealthRegistry,
    ) -> Self
    where
        F: HostConfigurer + InventoryReader + VmLimiter + 'static,
    {
        Self {
            hosts: fleet.clone(),
            inventory: fleet.clone(),
            limiter: fleet,
            clock: Arc::new(TokioClock),
            thresholds,
            cluster: cluster.into(),
            tracker,
            health_registry,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Replace the wait source, e.g. with a virtual clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn tracker(&self) -> &RunTracker {
        &self.tracker
    }

    /// Start a run holding `guard`; the guard is released when the run ends
    pub async fn launch(&self, guard: RunGuard) -> Result<()> {
        let mut controller = ReclamationController::builder()
            .host_configurer(self.hosts.clone())
            .inventory(self.inventory.clone())
            .limiter(self.limiter.clone())
            .clock(self.clock.clone())
            .thresholds(self.thresholds.clone())
            .cancel_token(guard.cancel_token())
            .cluster(self.cluster.clone())
            .tracker(self.tracker.clone())
            .build()?;
        let health_registry = self.health_registry.clone();

        info!(cluster = %self.cluster, "Launching reclamation run");
        let handle = tokio::spawn(async move {
            let result = controller.run().await;
            health_registry.record_run(result.as_ref().map(|_| ())).await;
            drop(guard);
        });
        *self.active.lock().await = Some(handle);
        Ok(())
    }

    /// Wait for the most recently launched run to finish
    pub async fn join(&self) {
        let handle = self.active.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Reclamation run task failed");
            }
        }
    }

    /// Cancel the active run and wait up to `grace` for it to release its VM.
    /// Returns false if the run was still going when the grace period ran out.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        if !self.tracker.request_cancel() {
            return true;
        }
        info!("Waiting for the in-flight run to release its VM");
        tokio::time::timeout(grace, self.join()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reclaim_lib::health::ComponentStatus;
    use reclaim_lib::inventory::{
        async_trait, CollaboratorError, FleetOp, InMemoryFleet, VmFixture,
    };
    use reclaim_lib::{Phase, RunRecord, VirtualClock};

    /// Clock whose waits never finish on their own
    struct StalledClock;

    #[async_trait]
    impl Clock for StalledClock {
        async fn sleep(&self, _duration: Duration) {
            std::future::pending::<()>().await;
        }
    }

    fn launcher(fleet: Arc<InMemoryFleet>, health_registry: HealthRegistry) -> RunLauncher {
        RunLauncher::new(
            fleet,
            ReclamationThresholds::default(),
            "test",
            RunTracker::new(),
            health_registry,
        )
        .with_clock(Arc::new(VirtualClock::new()))
    }

    #[tokio::test]
    async fn test_launch_runs_to_completion_and_releases_tracker() {
        let fleet = InMemoryFleet::new().with_host("esx-01").with_vm(
            VmFixture::new("web-01", 4096)
                .sample(3000, 1000)
                .sample(2000, 1200),
        );
        let launcher = launcher(Arc::new(fleet), HealthRegistry::new());
        let guard = launcher.tracker().try_begin().unwrap();

        launcher.launch(guard).await.unwrap();
        launcher.join().await;

        assert!(!launcher.tracker().is_active());
        assert_eq!(launcher.tracker().current().await.phase, Phase::Done);
        assert!(matches!(
            launcher.tracker().last().await,
            Some(RunRecord::Completed(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_run_degrades_health() {
        let fleet = Arc::new(InMemoryFleet::new().with_host("esx-01"));
        fleet.fail(
            FleetOp::ListHosts,
            "",
            CollaboratorError::Transport("connection refused".to_string()),
        );
        let health_registry = HealthRegistry::new();
        let launcher = launcher(fleet, health_registry.clone());
        let guard = launcher.tracker().try_begin().unwrap();

        launcher.launch(guard).await.unwrap();
        launcher.join().await;

        assert_eq!(health_registry.health().await.status, ComponentStatus::Degraded);
        assert!(!launcher.tracker().is_active());
        assert!(matches!(
            launcher.tracker().last().await,
            Some(RunRecord::Failed(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_run_and_waits_for_release() {
        let fleet = Arc::new(
            InMemoryFleet::new()
                .with_host("esx-01")
                .with_vm(VmFixture::new("web-01", 4096).sample(3000, 1000)),
        );
        let launcher = launcher(fleet.clone(), HealthRegistry::new())
            .with_clock(Arc::new(StalledClock));
        let guard = launcher.tracker().try_begin().unwrap();

        launcher.launch(guard).await.unwrap();
        while launcher.tracker().current().await.watching.is_none() {
            tokio::task::yield_now().await;
        }
        assert_eq!(fleet.memory_limit("web-01"), Some(1750));

        assert!(launcher.shutdown(Duration::from_secs(5)).await);

        assert!(!launcher.tracker().is_active());
        assert_eq!(fleet.memory_limit("web-01"), None);
        match launcher.tracker().last().await {
            Some(RunRecord::Failed(failure)) => {
                assert_eq!(failure.phase, Phase::CappingOutliers);
                assert_eq!(failure.vm.as_deref(), Some("web-01"));
            }
            other => panic!("expected a failed run, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_without_run_returns_immediately() {
        let launcher = launcher(Arc::new(InMemoryFleet::new()), HealthRegistry::new());
        assert!(launcher.shutdown(Duration::from_millis(10)).await);
    }
}

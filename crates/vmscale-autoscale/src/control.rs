//! Control loop: drives both deciders on a fixed interval.
//!
//! Each tick is independent: scale-in first, then scale-out for whatever
//! demand is still queued. Nothing is carried between ticks.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use vmscale_core::ResourceDemand;
use vmscale_state::{ResourcePool, VmId, epoch_secs};

use crate::provision::ProvisionRequest;
use crate::scale_in::ScaleInDecider;
use crate::scale_out::ScaleOutDecider;

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub started_at: u64,
    pub marked_for_death: Vec<VmId>,
    /// Queued demand fed to scale-out, if any was read.
    pub demand: Option<ResourceDemand>,
    pub provisioned: Option<ProvisionRequest>,
}

#[derive(Clone)]
pub struct ControlLoop {
    pool: Arc<dyn ResourcePool>,
    scale_in: ScaleInDecider,
    scale_out: ScaleOutDecider,
}

impl ControlLoop {
    pub fn new(
        pool: Arc<dyn ResourcePool>,
        scale_in: ScaleInDecider,
        scale_out: ScaleOutDecider,
    ) -> Self {
        Self {
            pool,
            scale_in,
            scale_out,
        }
    }

    /// Run one scale-in and scale-out cycle.
    pub fn tick(&self) -> CycleReport {
        let mut report = CycleReport {
            started_at: epoch_secs(),
            marked_for_death: self.scale_in.decide_scale_in(),
            ..Default::default()
        };

        let demand = match self.pool.pending_demand() {
            Ok(demand) => demand,
            Err(e) => {
                warn!(error = %e, "could not read pending demand");
                return report;
            }
        };
        report.demand = Some(demand);
        if !demand.is_positive() {
            debug!("no pending demand");
            return report;
        }

        match self.scale_out.decide_scale_out(demand.cores, demand.ram) {
            Ok(provisioned) => report.provisioned = provisioned,
            Err(e) => warn!(error = %e, "scale-out rejected demand"),
        }
        report
    }

    /// Tick every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "control loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    // Deciders block on the store and possibly on the lock.
                    let this = self.clone();
                    match tokio::task::spawn_blocking(move || this.tick()).await {
                        Ok(report) => debug!(
                            marked = report.marked_for_death.len(),
                            provisioned = report.provisioned.is_some(),
                            "cycle finished"
                        ),
                        Err(e) => error!(error = %e, "cycle panicked"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("control loop shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::MemorySink;
    use crate::testing::*;
    use vmscale_state::{JobState, StateStore, VmState};

    fn control_loop(store: &StateStore, sink: Arc<MemorySink>) -> ControlLoop {
        let pool: Arc<dyn ResourcePool> = Arc::new(store.clone());
        let config = Arc::new(test_config());
        let exclusive = test_exclusive(store);
        ControlLoop::new(
            pool.clone(),
            ScaleInDecider::new(pool.clone(), exclusive.clone(), config.clone()),
            ScaleOutDecider::new(pool, exclusive, config, sink),
        )
    }

    #[test]
    fn tick_without_work_does_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        let sink = Arc::new(MemorySink::new());

        let report = control_loop(&store, sink.clone()).tick();
        assert!(report.marked_for_death.is_empty());
        assert_eq!(report.demand, Some(ResourceDemand::default()));
        assert!(report.provisioned.is_none());
        assert!(sink.requests().is_empty());
    }

    #[test]
    fn tick_provisions_for_queued_jobs() {
        let store = StateStore::open_in_memory().unwrap();
        let sink = Arc::new(MemorySink::new());
        put_job(&store, "q1", 2, 4, JobState::Queued, None, epoch_secs());
        put_job(&store, "q2", 2, 4, JobState::Queued, None, epoch_secs());

        let report = control_loop(&store, sink.clone()).tick();
        assert_eq!(report.demand, Some(ResourceDemand::new(4.0, 8.0)));
        let request = report.provisioned.unwrap();
        assert_eq!(sink.requests(), vec![request]);

        // Next tick sees the NEW vm covering the demand.
        let report = control_loop(&store, sink.clone()).tick();
        assert!(report.provisioned.is_none());
        assert_eq!(sink.requests().len(), 1);
    }

    #[test]
    fn tick_scales_in_stale_vms() {
        let store = StateStore::open_in_memory().unwrap();
        let sink = Arc::new(MemorySink::new());
        put_vm(&store, "small-a", VmState::Ready, epoch_secs() - 3600);

        let report = control_loop(&store, sink).tick();
        assert_eq!(report.marked_for_death, vec!["small-a"]);
    }

    #[test]
    fn report_serializes() {
        let report = CycleReport {
            started_at: 1,
            marked_for_death: vec!["small-a".to_string()],
            demand: Some(ResourceDemand::new(1.0, 2.0)),
            provisioned: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["marked_for_death"][0], "small-a");
        assert_eq!(json["demand"]["ram"], 2.0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = StateStore::open_in_memory().unwrap();
        let sink = Arc::new(MemorySink::new());
        put_job(&store, "q1", 4, 8, JobState::Queued, None, epoch_secs());

        let control = control_loop(&store, sink.clone());
        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(async move {
            control.run(Duration::from_millis(20), rx).await;
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(sink.requests().len(), 1);
    }
}

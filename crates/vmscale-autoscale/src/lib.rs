//! vmscale-autoscale: capacity-driven scaling of a worker VM pool.
//!
//! Two entry points, both stateless between calls:
//!
//! - [`ScaleInDecider::decide_scale_in`] marks idle, underutilized, or
//!   expired READY VMs for death.
//! - [`ScaleOutDecider::decide_scale_out`] requests one VM of the
//!   best-fitting template for outstanding demand.
//!
//! # Scaling Algorithm
//!
//! ```text
//! scale-in  (per READY vm):
//!     age > template.max_age                          → expired, always marked
//!     stale and no running jobs                       → idle, always marked
//!     stale and cores% <= 50% and ram% <= 50%         → underutilized,
//!                                                       1 of every N marked
//!
//! scale-out:
//!     adjusted = demand - in-flight capacity
//!     skip if adjusted <= 0, in-flight >= cap, or adjusted < floor
//!     template = min |ram/core - adjusted ram/core|, then min remainder
//! ```
//!
//! Writes happen only under the cluster-wide decision lock from
//! `vmscale-state`. Collaborator failures skip the cycle rather than
//! propagate; [`ControlLoop`] drives both deciders periodically.

pub mod best_fit;
pub mod control;
pub mod error;
pub mod provision;
pub mod scale_in;
pub mod scale_out;

pub use best_fit::{TemplateFit, best_fit};
pub use control::{ControlLoop, CycleReport};
pub use error::{ScaleError, ScaleResult};
pub use provision::{MemorySink, ProvisionRequest, ProvisionSink};
pub use scale_in::{Candidate, CandidateKind, ScaleInDecider};
pub use scale_out::ScaleOutDecider;

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use vmscale_core::{ResourceDemand, ScalePolicy, ScalerConfig, TemplateCatalog, VmTemplate};
    use vmscale_state::*;

    use crate::provision::{ProvisionRequest, ProvisionSink};

    /// Catalog of `small` (4 cores, 8 GiB, 2h) and `large` (8, 16, 24h).
    pub fn test_config() -> ScalerConfig {
        ScalerConfig {
            policy: ScalePolicy::default(),
            catalog: TemplateCatalog::new([
                VmTemplate {
                    name: "small".to_string(),
                    cores: 4,
                    ram: 8,
                    max_age_seconds: 2 * 3600,
                    profile: "standard-4".to_string(),
                },
                VmTemplate {
                    name: "large".to_string(),
                    cores: 8,
                    ram: 16,
                    max_age_seconds: 24 * 3600,
                    profile: "standard-8".to_string(),
                },
            ]),
        }
    }

    pub fn test_exclusive(store: &StateStore) -> Exclusive {
        Exclusive::new(Arc::new(store.clone()), "test", Duration::from_secs(60))
    }

    /// A 4-core, 8 GiB vm whose template is the ID prefix before `-`.
    pub fn put_vm(store: &StateStore, vm_id: &str, state: VmState, created_at: u64) {
        let template = vm_id.split('-').next().unwrap_or(vm_id);
        store
            .put_vm(&Vm {
                vm_id: vm_id.to_string(),
                template: template.to_string(),
                cores: 4,
                ram: 8,
                state,
                created_at,
                state_date: created_at,
            })
            .unwrap();
    }

    pub fn put_job(
        store: &StateStore,
        job_id: &str,
        cores: u32,
        ram: u32,
        state: JobState,
        vm_id: Option<&str>,
        state_date: u64,
    ) {
        store
            .put_job(&Job {
                job_id: job_id.to_string(),
                cores,
                ram,
                state,
                vm_id: vm_id.map(str::to_string),
                state_date,
            })
            .unwrap();
    }

    /// Pool whose backing store is down.
    pub struct FailingPool;

    impl ResourcePool for FailingPool {
        fn query_vms(&self, _states: &[VmState]) -> StateResult<Vec<Vm>> {
            Err(StateError::Transaction("store offline".to_string()))
        }

        fn query_running_jobs_for_vm(&self, _vm_id: &str) -> StateResult<Vec<Job>> {
            Err(StateError::Transaction("store offline".to_string()))
        }

        fn last_job_activity(&self, _vm_id: &str) -> StateResult<Option<u64>> {
            Err(StateError::Transaction("store offline".to_string()))
        }

        fn pending_demand(&self) -> StateResult<ResourceDemand> {
            Err(StateError::Transaction("store offline".to_string()))
        }

        fn batch_update_vm_states(
            &self,
            _vm_ids: &[VmId],
            _new_state: VmState,
        ) -> StateResult<bool> {
            Err(StateError::Transaction("store offline".to_string()))
        }

        fn create_vm(&self, _vm: &Vm) -> StateResult<bool> {
            Err(StateError::Transaction("store offline".to_string()))
        }
    }

    /// Lock service whose backend cannot be reached.
    pub struct BrokenMutex;

    impl MutexService for BrokenMutex {
        fn try_enter(&self, _name: &str, _holder: &str, _ttl: Duration) -> LockResult<bool> {
            Err(LockError::Backend("lock store offline".to_string()))
        }

        fn exit(&self, _name: &str, _holder: &str) -> LockResult<()> {
            Err(LockError::Backend("lock store offline".to_string()))
        }
    }

    pub struct RejectingSink;

    impl ProvisionSink for RejectingSink {
        fn submit(&self, _request: &ProvisionRequest) -> anyhow::Result<()> {
            anyhow::bail!("cloud api unavailable")
        }
    }
}

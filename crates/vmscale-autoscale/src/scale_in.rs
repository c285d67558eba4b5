//! Scale-in: retire idle, underutilized, or expired VMs.
//!
//! Reads READY VMs and their running jobs from the pool without holding
//! the decision lock, then marks the chosen set MARKED_FOR_DEATH in one
//! guarded batch while holding it. Jobs already running on a marked VM
//! keep running; the dispatcher just stops placing new ones there.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use vmscale_core::{DrainOrder, ScalerConfig};
use vmscale_state::{Exclusive, ResourcePool, Vm, VmId, VmState, epoch_secs};

use crate::error::ScaleResult;

/// Why a VM qualified for scale-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    /// No running jobs and inactive past the staleness deadline.
    Idle,
    /// Running jobs, but at or under the utilization threshold and stale.
    Underutilized,
    /// Older than its template's max age.
    Expired,
}

/// One VM that may be scaled in.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub vm_id: VmId,
    pub kind: CandidateKind,
    /// Larger of the core and RAM utilization fractions.
    pub utilization: f64,
}

/// Picks READY VMs to decommission.
#[derive(Clone)]
pub struct ScaleInDecider {
    pool: Arc<dyn ResourcePool>,
    exclusive: Exclusive,
    config: Arc<ScalerConfig>,
}

impl ScaleInDecider {
    pub fn new(
        pool: Arc<dyn ResourcePool>,
        exclusive: Exclusive,
        config: Arc<ScalerConfig>,
    ) -> Self {
        Self {
            pool,
            exclusive,
            config,
        }
    }

    /// Mark eligible VMs MARKED_FOR_DEATH and return their IDs.
    ///
    /// Never fails: pool or lock trouble yields an empty list and the next
    /// cycle tries again.
    pub fn decide_scale_in(&self) -> Vec<VmId> {
        self.decide_scale_in_at(epoch_secs())
    }

    /// `decide_scale_in` against an explicit clock.
    pub fn decide_scale_in_at(&self, now: u64) -> Vec<VmId> {
        match self.try_scale_in(now) {
            Ok(marked) => marked,
            Err(e) => {
                warn!(error = %e, "scale-in skipped this cycle");
                Vec::new()
            }
        }
    }

    fn try_scale_in(&self, now: u64) -> ScaleResult<Vec<VmId>> {
        let selected = self.select(now)?;
        if selected.is_empty() {
            return Ok(selected);
        }

        let policy = &self.config.policy;
        let Some(_lock) = self
            .exclusive
            .scoped_acquire(&policy.lock_name, policy.lock_wait)?
        else {
            debug!(lock = %policy.lock_name, "another decision in progress, scale-in skipped");
            return Ok(Vec::new());
        };

        // The update only applies if every VM is still READY.
        if !self.pool.batch_update_vm_states(&selected, VmState::MarkedForDeath)? {
            info!(count = selected.len(), "pool changed since read, scale-in skipped");
            return Ok(Vec::new());
        }

        info!(count = selected.len(), vms = ?selected, "vms marked for death");
        Ok(selected)
    }

    /// Read phase only: the VM IDs a decision would mark right now.
    pub fn select(&self, now: u64) -> ScaleResult<Vec<VmId>> {
        let candidates = self.candidates(now)?;
        let policy = &self.config.policy;

        let (mut busy, always): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|c| c.kind == CandidateKind::Underutilized);

        match policy.busy_drain_order {
            DrainOrder::LeastUtilized => busy.sort_by(|a, b| {
                match a.utilization.total_cmp(&b.utilization) {
                    Ordering::Equal => a.vm_id.cmp(&b.vm_id),
                    other => other,
                }
            }),
            DrainOrder::VmId => busy.sort_by(|a, b| a.vm_id.cmp(&b.vm_id)),
        }

        // Only one in `busy_drain_stride` partially used VMs goes per cycle.
        let stride = policy.busy_drain_stride.max(1) as usize;
        let mut selected: Vec<VmId> = always.into_iter().map(|c| c.vm_id).collect();
        selected.extend(busy.into_iter().step_by(stride).map(|c| c.vm_id));
        Ok(selected)
    }

    /// Every READY VM that qualifies, in VM ID order.
    pub fn candidates(&self, now: u64) -> ScaleResult<Vec<Candidate>> {
        let vms = self.pool.query_vms(&[VmState::Ready])?;
        let mut candidates = Vec::new();
        for vm in &vms {
            if let Some(candidate) = self.evaluate(vm, now)? {
                debug!(
                    vm_id = %vm.vm_id,
                    kind = ?candidate.kind,
                    utilization = candidate.utilization,
                    "scale-in candidate"
                );
                candidates.push(candidate);
            }
        }
        Ok(candidates)
    }

    fn evaluate(&self, vm: &Vm, now: u64) -> ScaleResult<Option<Candidate>> {
        let policy = &self.config.policy;
        let running = self.pool.query_running_jobs_for_vm(&vm.vm_id)?;

        let used_cores: u64 = running.iter().map(|j| u64::from(j.cores)).sum();
        let used_ram: u64 = running.iter().map(|j| u64::from(j.ram)).sum();
        let core_util = used_cores as f64 / f64::from(vm.cores.max(1));
        let ram_util = used_ram as f64 / f64::from(vm.ram.max(1));
        let utilization = core_util.max(ram_util);

        let candidate = |kind| {
            Some(Candidate {
                vm_id: vm.vm_id.clone(),
                kind,
                utilization,
            })
        };

        // A max age of zero disables age-based retirement.
        let expired = self
            .config
            .catalog
            .get(&vm.template)
            .is_some_and(|t| {
                t.max_age_seconds > 0 && now.saturating_sub(vm.created_at) > t.max_age_seconds
            });
        if expired {
            return Ok(candidate(CandidateKind::Expired));
        }

        let last_activity = self
            .pool
            .last_job_activity(&vm.vm_id)?
            .unwrap_or(vm.created_at);
        if now.saturating_sub(last_activity) <= policy.staleness.as_secs() {
            return Ok(None);
        }

        if running.is_empty() {
            return Ok(candidate(CandidateKind::Idle));
        }

        let threshold = policy.utilization_threshold;
        if core_util <= threshold && ram_util <= threshold {
            return Ok(candidate(CandidateKind::Underutilized));
        }
        Ok(None)
    }
}

//! The resource pool as seen by the deciders.
//!
//! Deciders only talk to this trait, so the authoritative store can be
//! swapped (or faked in tests). [`StateStore`] is the shipped implementation.

use vmscale_core::ResourceDemand;

use crate::error::StateResult;
use crate::store::StateStore;
use crate::types::*;

/// Authoritative VM and job records.
pub trait ResourcePool: Send + Sync {
    /// VMs whose state is one of `states`.
    fn query_vms(&self, states: &[VmState]) -> StateResult<Vec<Vm>>;

    /// Jobs currently RUNNING on `vm_id`.
    fn query_running_jobs_for_vm(&self, vm_id: &str) -> StateResult<Vec<Job>>;

    /// Latest `state_date` across every job ever placed on `vm_id`.
    fn last_job_activity(&self, vm_id: &str) -> StateResult<Option<u64>>;

    /// Cores and RAM wanted by jobs still waiting in the queue.
    fn pending_demand(&self) -> StateResult<ResourceDemand>;

    /// Atomically move all `vm_ids` to `new_state`. Returns false, having
    /// changed nothing, when any of them cannot make that transition.
    fn batch_update_vm_states(&self, vm_ids: &[VmId], new_state: VmState) -> StateResult<bool>;

    /// Record a NEW VM. Returns false when the ID is already taken; a VM in
    /// any other state is an error.
    fn create_vm(&self, vm: &Vm) -> StateResult<bool>;
}

impl ResourcePool for StateStore {
    fn query_vms(&self, states: &[VmState]) -> StateResult<Vec<Vm>> {
        self.list_vms_in(states)
    }

    fn query_running_jobs_for_vm(&self, vm_id: &str) -> StateResult<Vec<Job>> {
        Ok(self
            .list_jobs_for_vm(vm_id)?
            .into_iter()
            .filter(|job| job.state == JobState::Running)
            .collect())
    }

    fn last_job_activity(&self, vm_id: &str) -> StateResult<Option<u64>> {
        Ok(self
            .list_jobs_for_vm(vm_id)?
            .iter()
            .map(|job| job.state_date)
            .max())
    }

    fn pending_demand(&self) -> StateResult<ResourceDemand> {
        self.queued_demand()
    }

    fn batch_update_vm_states(&self, vm_ids: &[VmId], new_state: VmState) -> StateResult<bool> {
        StateStore::batch_update_vm_states(self, vm_ids, new_state, epoch_secs())
    }

    fn create_vm(&self, vm: &Vm) -> StateResult<bool> {
        StateStore::create_vm(self, vm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{test_job, test_vm};

    #[test]
    fn running_jobs_exclude_other_states_and_vms() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_vm(&test_vm("a", VmState::Ready)).unwrap();
        store.put_vm(&test_vm("b", VmState::Ready)).unwrap();
        store
            .put_job(&test_job("j1", JobState::Running, Some("a")))
            .unwrap();
        store
            .put_job(&test_job("j2", JobState::Failed, Some("a")))
            .unwrap();
        store
            .put_job(&test_job("j3", JobState::Running, Some("b")))
            .unwrap();

        let pool: &dyn ResourcePool = &store;
        let running = pool.query_running_jobs_for_vm("a").unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].job_id, "j1");
    }

    #[test]
    fn last_activity_is_latest_state_date() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_vm(&test_vm("a", VmState::Ready)).unwrap();
        let pool: &dyn ResourcePool = &store;
        assert_eq!(pool.last_job_activity("a").unwrap(), None);

        let mut old = test_job("j1", JobState::Finished, Some("a"));
        old.state_date = 1200;
        let mut recent = test_job("j2", JobState::Failed, Some("a"));
        recent.state_date = 1800;
        store.put_job(&old).unwrap();
        store.put_job(&recent).unwrap();

        assert_eq!(pool.last_job_activity("a").unwrap(), Some(1800));
    }

    #[test]
    fn trait_create_and_batch_update() {
        let store = StateStore::open_in_memory().unwrap();
        let pool: &dyn ResourcePool = &store;

        assert!(pool.create_vm(&test_vm("a", VmState::New)).unwrap());
        assert!(pool.create_vm(&test_vm("b", VmState::Ready)).is_err());
        assert!(
            pool.batch_update_vm_states(&["a".to_string()], VmState::Provision)
                .unwrap()
        );
        assert!(pool.query_vms(&[VmState::New]).unwrap().is_empty());
        assert_eq!(pool.query_vms(&[VmState::Provision]).unwrap().len(), 1);
    }
}

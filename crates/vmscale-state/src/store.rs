//! StateStore: redb-backed state persistence for vmscale.
//!
//! Provides typed operations over VMs and jobs. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).
//!
//! redb serializes write transactions, so every multi-record update here
//! (batch state changes, job placement checks) is atomic.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use vmscale_core::ResourceDemand;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}
pub(crate) use map_err;

/// A VM must have capacity in both dimensions.
fn check_capacity(vm: &Vm) -> StateResult<()> {
    if vm.cores == 0 || vm.ram == 0 {
        return Err(StateError::Invariant(format!(
            "vm {} needs cores > 0 and ram > 0, got {} cores, {} GiB",
            vm.vm_id, vm.cores, vm.ram
        )));
    }
    Ok(())
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(VMS).map_err(map_err!(Table))?;
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.open_table(LOCKS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── VMs ────────────────────────────────────────────────────────

    /// Insert or overwrite a VM record without transition checks.
    ///
    /// Used by the reconciler that mirrors cloud state into the store.
    pub fn put_vm(&self, vm: &Vm) -> StateResult<()> {
        check_capacity(vm)?;
        let value = serde_json::to_vec(vm).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(VMS).map_err(map_err!(Table))?;
            table
                .insert(vm.vm_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert a NEW VM record unless one with the same ID exists.
    /// Returns false when the ID was already taken.
    ///
    /// Records in any other state go through [`StateStore::put_vm`].
    pub fn create_vm(&self, vm: &Vm) -> StateResult<bool> {
        if vm.state != VmState::New {
            return Err(StateError::Invariant(format!(
                "vm {} must be created NEW, not {:?}",
                vm.vm_id, vm.state
            )));
        }
        check_capacity(vm)?;
        let value = serde_json::to_vec(vm).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let created;
        {
            let mut table = txn.open_table(VMS).map_err(map_err!(Table))?;
            let exists = table
                .get(vm.vm_id.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if !exists {
                table
                    .insert(vm.vm_id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            created = !exists;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(vm_id = %vm.vm_id, created, "vm create");
        Ok(created)
    }

    /// Get a VM by ID.
    pub fn get_vm(&self, vm_id: &str) -> StateResult<Option<Vm>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(VMS).map_err(map_err!(Table))?;
        match table.get(vm_id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all VMs, ordered by ID.
    pub fn list_vms(&self) -> StateResult<Vec<Vm>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(VMS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// List VMs whose state is one of `states`, ordered by ID.
    pub fn list_vms_in(&self, states: &[VmState]) -> StateResult<Vec<Vm>> {
        Ok(self
            .list_vms()?
            .into_iter()
            .filter(|vm| states.contains(&vm.state))
            .collect())
    }

    /// Move one VM to `new_state`, enforcing the lifecycle rules.
    ///
    /// TERMINATED is refused while a RUNNING job still references the VM.
    pub fn set_vm_state(&self, vm_id: &str, new_state: VmState, now: u64) -> StateResult<Vm> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut vms = txn.open_table(VMS).map_err(map_err!(Table))?;
            let mut vm: Vm = match vms.get(vm_id).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => return Err(StateError::NotFound(vm_id.to_string())),
            };
            if !vm.state.can_transition_to(new_state) {
                return Err(StateError::InvalidTransition {
                    vm_id: vm_id.to_string(),
                    from: vm.state,
                    to: new_state,
                });
            }
            if new_state == VmState::Terminated {
                let jobs = txn.open_table(JOBS).map_err(map_err!(Table))?;
                for entry in jobs.iter().map_err(map_err!(Read))? {
                    let (_, value) = entry.map_err(map_err!(Read))?;
                    let job: Job = decode(value.value())?;
                    if job.state == JobState::Running && job.vm_id.as_deref() == Some(vm_id) {
                        return Err(StateError::Invariant(format!(
                            "vm {vm_id} still runs job {}",
                            job.job_id
                        )));
                    }
                }
            }
            vm.state = new_state;
            vm.state_date = now;
            let value = serde_json::to_vec(&vm).map_err(map_err!(Serialize))?;
            vms.insert(vm_id, value.as_slice()).map_err(map_err!(Write))?;
            updated = vm;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%vm_id, state = ?new_state, "vm state changed");
        Ok(updated)
    }

    /// Move every listed VM to `new_state` in one transaction.
    ///
    /// All-or-nothing: if any VM is missing or any transition is illegal,
    /// nothing is written and `false` is returned. Duplicate IDs count once.
    pub fn batch_update_vm_states(
        &self,
        vm_ids: &[VmId],
        new_state: VmState,
        now: u64,
    ) -> StateResult<bool> {
        let unique: BTreeSet<&str> = vm_ids.iter().map(String::as_str).collect();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let applied = {
            let mut table = txn.open_table(VMS).map_err(map_err!(Table))?;
            let mut updates = Vec::with_capacity(unique.len());
            let mut valid = true;
            for vm_id in &unique {
                let current: Option<Vm> = match table.get(*vm_id).map_err(map_err!(Read))? {
                    Some(guard) => Some(decode(guard.value())?),
                    None => None,
                };
                match current {
                    Some(mut vm) if vm.state.can_transition_to(new_state) => {
                        vm.state = new_state;
                        vm.state_date = now;
                        updates.push(vm);
                    }
                    Some(vm) => {
                        warn!(%vm_id, from = ?vm.state, to = ?new_state, "batch update refused");
                        valid = false;
                        break;
                    }
                    None => {
                        warn!(%vm_id, "batch update refused: vm missing");
                        valid = false;
                        break;
                    }
                }
            }
            if valid {
                for vm in &updates {
                    let value = serde_json::to_vec(vm).map_err(map_err!(Serialize))?;
                    table
                        .insert(vm.vm_id.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                }
            }
            valid
        };
        if applied {
            txn.commit().map_err(map_err!(Transaction))?;
            debug!(count = unique.len(), state = ?new_state, "vm batch updated");
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
        }
        Ok(applied)
    }

    /// Delete a TERMINATED VM. Returns true if it existed.
    pub fn remove_vm(&self, vm_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(VMS).map_err(map_err!(Table))?;
            let state = match table.get(vm_id).map_err(map_err!(Read))? {
                Some(guard) => Some(decode::<Vm>(guard.value())?.state),
                None => None,
            };
            if let Some(state) = state
                && state != VmState::Terminated
            {
                return Err(StateError::Invariant(format!(
                    "vm {vm_id} is {state:?}, only TERMINATED vms can be removed"
                )));
            }
            existed = table.remove(vm_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%vm_id, existed, "vm removed");
        Ok(existed)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Insert or update a job.
    ///
    /// A RUNNING job must reference a VM that is READY or MARKED_FOR_DEATH.
    pub fn put_job(&self, job: &Job) -> StateResult<()> {
        let value = serde_json::to_vec(job).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            if job.state == JobState::Running {
                let vm_id = job.vm_id.as_deref().ok_or_else(|| {
                    StateError::Invariant(format!("running job {} has no vm", job.job_id))
                })?;
                let vms = txn.open_table(VMS).map_err(map_err!(Table))?;
                let vm_state = match vms.get(vm_id).map_err(map_err!(Read))? {
                    Some(guard) => decode::<Vm>(guard.value())?.state,
                    None => return Err(StateError::NotFound(vm_id.to_string())),
                };
                if !vm_state.can_host_running_jobs() {
                    return Err(StateError::Invariant(format!(
                        "job {} cannot run on vm {vm_id} in state {vm_state:?}",
                        job.job_id
                    )));
                }
            }
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            table
                .insert(job.job_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a job by ID.
    pub fn get_job(&self, job_id: &str) -> StateResult<Option<Job>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        match table.get(job_id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all jobs, ordered by ID.
    pub fn list_jobs(&self) -> StateResult<Vec<Job>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// List every job ever placed on a VM, in any state.
    pub fn list_jobs_for_vm(&self, vm_id: &str) -> StateResult<Vec<Job>> {
        Ok(self
            .list_jobs()?
            .into_iter()
            .filter(|job| job.vm_id.as_deref() == Some(vm_id))
            .collect())
    }

    /// Sum of cores and RAM requested by QUEUED jobs.
    pub fn queued_demand(&self) -> StateResult<ResourceDemand> {
        let demand = self
            .list_jobs()?
            .iter()
            .filter(|job| job.state == JobState::Queued)
            .fold(ResourceDemand::default(), |acc, job| {
                ResourceDemand::new(
                    acc.cores + f64::from(job.cores),
                    acc.ram + f64::from(job.ram),
                )
            });
        Ok(demand)
    }
}

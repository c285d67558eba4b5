//! Domain types for the vmscale state store.
//!
//! VMs and jobs as the scaler sees them. All types are serializable
//! to/from JSON for storage in redb tables.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Globally unique VM identifier, `{template}-{uuid}`.
pub type VmId = String;

/// Unique identifier for a job.
pub type JobId = String;

// ── VM ────────────────────────────────────────────────────────────

/// Lifecycle state of a worker VM.
///
/// ```text
/// NEW → PROVISION → READY → MARKED_FOR_DEATH → TERMINATED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmState {
    New,
    Provision,
    Ready,
    MarkedForDeath,
    Terminated,
}

impl VmState {
    fn rank(self) -> u8 {
        match self {
            VmState::New => 0,
            VmState::Provision => 1,
            VmState::Ready => 2,
            VmState::MarkedForDeath => 3,
            VmState::Terminated => 4,
        }
    }

    /// States only move forward, and MARKED_FOR_DEATH is reachable only
    /// from READY.
    pub fn can_transition_to(self, next: VmState) -> bool {
        if next == VmState::MarkedForDeath {
            return self == VmState::Ready;
        }
        next.rank() > self.rank()
    }

    /// Requested from the cloud but not yet usable.
    pub fn is_in_flight(self) -> bool {
        matches!(self, VmState::New | VmState::Provision)
    }

    /// States on which a RUNNING job may live.
    pub fn can_host_running_jobs(self) -> bool {
        matches!(self, VmState::Ready | VmState::MarkedForDeath)
    }
}

/// One provisioned or provisioning worker instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Vm {
    pub vm_id: VmId,
    /// Name of the template this VM was provisioned from.
    pub template: String,
    pub cores: u32,
    /// RAM in GiB.
    pub ram: u32,
    pub state: VmState,
    /// Unix timestamp (seconds) when the VM record was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last state change.
    pub state_date: u64,
}

impl Vm {
    /// A fresh NEW record.
    pub fn new(vm_id: VmId, template: &str, cores: u32, ram: u32, now: u64) -> Self {
        Self {
            vm_id,
            template: template.to_string(),
            cores,
            ram,
            state: VmState::New,
            created_at: now,
            state_date: now,
        }
    }
}

// ── Job ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    Failed,
    Finished,
}

/// A unit of work with a resource footprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub job_id: JobId,
    pub cores: u32,
    /// RAM in GiB.
    pub ram: u32,
    pub state: JobState,
    /// VM the job was placed on, if any.
    pub vm_id: Option<VmId>,
    /// Unix timestamp (seconds) of the last state change.
    pub state_date: u64,
}

/// Current wall-clock time in unix seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

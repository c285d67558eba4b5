//! Scale-out: provision one VM for outstanding demand.
//!
//! ```text
//! adjusted = demand - Σ capacity of NEW/PROVISION vms
//!
//! adjusted <= 0 in both dimensions        → nothing (capacity already coming)
//! in-flight vms >= max_in_flight          → nothing (don't pile on)
//! adjusted below min_cores or min_ram     → nothing (negligible demand)
//! otherwise                               → best-fit template, one VM
//! ```
//!
//! At most one VM is requested per call; persistent demand is picked up by
//! the next cycle. The decision lock is held from the in-flight read to the
//! NEW record write, so two scalers cannot both count the same gap.

use std::sync::Arc;

use tracing::{debug, info, warn};

use vmscale_core::{ResourceDemand, ScalerConfig};
use vmscale_state::{Exclusive, ResourcePool, Vm, VmState, epoch_secs};

use crate::best_fit::best_fit;
use crate::error::{ScaleError, ScaleResult};
use crate::provision::{ProvisionRequest, ProvisionSink};

/// Decides whether to request a new VM and of which template.
#[derive(Clone)]
pub struct ScaleOutDecider {
    pool: Arc<dyn ResourcePool>,
    exclusive: Exclusive,
    config: Arc<ScalerConfig>,
    sink: Arc<dyn ProvisionSink>,
}

impl ScaleOutDecider {
    pub fn new(
        pool: Arc<dyn ResourcePool>,
        exclusive: Exclusive,
        config: Arc<ScalerConfig>,
        sink: Arc<dyn ProvisionSink>,
    ) -> Self {
        Self {
            pool,
            exclusive,
            config,
            sink,
        }
    }

    /// Request at most one VM for `requested_cores` / `requested_ram`.
    ///
    /// Returns `Err` only for non-positive or non-finite input. Pool, lock,
    /// or sink failures are logged and reported as `Ok(None)`.
    pub fn decide_scale_out(
        &self,
        requested_cores: f64,
        requested_ram: f64,
    ) -> ScaleResult<Option<ProvisionRequest>> {
        let demand = ResourceDemand::new(requested_cores, requested_ram);
        if !demand.is_positive() {
            return Err(ScaleError::InvalidDemand {
                cores: requested_cores,
                ram: requested_ram,
            });
        }

        match self.try_scale_out(demand) {
            Ok(request) => Ok(request),
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "scale-out skipped this cycle");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn try_scale_out(&self, demand: ResourceDemand) -> ScaleResult<Option<ProvisionRequest>> {
        let policy = &self.config.policy;
        if self.config.catalog.is_empty() {
            debug!("template catalog is empty, nothing to provision");
            return Ok(None);
        }

        let Some(_lock) = self
            .exclusive
            .scoped_acquire(&policy.lock_name, policy.lock_wait)?
        else {
            debug!(lock = %policy.lock_name, "another decision in progress, scale-out skipped");
            return Ok(None);
        };

        let in_flight = self
            .pool
            .query_vms(&[VmState::New, VmState::Provision])?;
        let adjusted = in_flight
            .iter()
            .fold(demand, |left, vm| left.minus(vm.cores, vm.ram));

        if adjusted.is_satisfied() {
            debug!(in_flight = in_flight.len(), "in-flight capacity covers demand");
            return Ok(None);
        }
        if in_flight.len() >= policy.max_in_flight as usize {
            debug!(
                in_flight = in_flight.len(),
                max = policy.max_in_flight,
                "too many vms in flight"
            );
            return Ok(None);
        }
        if adjusted.cores < policy.min_cores || adjusted.ram < policy.min_ram {
            debug!(
                cores = adjusted.cores,
                ram = adjusted.ram,
                "remaining demand below provisioning floor"
            );
            return Ok(None);
        }

        let Some(fit) = best_fit(self.config.catalog.list_templates().values(), adjusted) else {
            return Ok(None);
        };
        debug!(
            template = %fit.template.name,
            distance = fit.distance,
            remainder = fit.remainder,
            "best-fit template"
        );

        let request = ProvisionRequest::for_template(fit.template);
        let vm = Vm::new(
            request.vm_id.clone(),
            &request.template,
            request.cores,
            request.ram,
            epoch_secs(),
        );
        if !self.pool.create_vm(&vm)? {
            warn!(vm_id = %vm.vm_id, "vm id already taken, scale-out skipped");
            return Ok(None);
        }

        // The NEW record stays even if the sink fails; it is counted as
        // in flight until the reconciler resolves it.
        self.sink.submit(&request)?;

        info!(
            vm_id = %request.vm_id,
            template = %request.template,
            cores = request.cores,
            ram = request.ram,
            "provisioning requested"
        );
        Ok(Some(request))
    }
}

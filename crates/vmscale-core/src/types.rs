//! Shared types used across vmscale crates.

use serde::{Deserialize, Serialize};

/// Immutable description of a VM shape that can be provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmTemplate {
    pub name: String,
    pub cores: u32,
    /// RAM in GiB.
    pub ram: u32,
    /// VMs of this template older than this are retired by scale-in.
    pub max_age_seconds: u64,
    /// Cloud provider image/size identifier.
    pub profile: String,
}

impl VmTemplate {
    /// RAM per core, the ratio best-fit selection compares against demand.
    pub fn ram_per_core(&self) -> f64 {
        f64::from(self.ram) / f64::from(self.cores)
    }
}

/// An amount of cores and RAM (GiB), possibly fractional.
///
/// Demand can go negative once in-flight capacity has been subtracted.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceDemand {
    pub cores: f64,
    pub ram: f64,
}

impl ResourceDemand {
    pub fn new(cores: f64, ram: f64) -> Self {
        Self { cores, ram }
    }

    /// Subtract a whole-unit capacity (a VM or template shape).
    pub fn minus(self, cores: u32, ram: u32) -> Self {
        Self {
            cores: self.cores - f64::from(cores),
            ram: self.ram - f64::from(ram),
        }
    }

    /// True when nothing is left to satisfy in either dimension.
    pub fn is_satisfied(&self) -> bool {
        self.cores <= 0.0 && self.ram <= 0.0
    }

    /// True when both dimensions are finite and strictly positive.
    pub fn is_positive(&self) -> bool {
        self.cores.is_finite() && self.ram.is_finite() && self.cores > 0.0 && self.ram > 0.0
    }
}

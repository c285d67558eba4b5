//! Autoscaler error types.

use thiserror::Error;

/// Why a scaling decision was not taken.
///
/// Only [`ScaleError::InvalidDemand`] ever reaches a caller; the rest are
/// collaborator failures that turn into "no decision this cycle".
#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("invalid demand: cores={cores}, ram={ram}")]
    InvalidDemand { cores: f64, ram: f64 },

    #[error("resource pool error: {0}")]
    Pool(#[from] vmscale_state::StateError),

    #[error("decision lock error: {0}")]
    Lock(#[from] vmscale_state::LockError),

    #[error("provisioning error: {0}")]
    Provision(#[from] anyhow::Error),
}

impl ScaleError {
    /// True for failures of the pool, lock, or cloud sink.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ScaleError::InvalidDemand { .. })
    }
}

pub type ScaleResult<T> = Result<T, ScaleError>;

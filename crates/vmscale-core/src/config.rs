//! vmscale.toml configuration parser.
//!
//! The file is read once at startup. Optional fields are resolved to their
//! defaults here, so the resulting [`ScalerConfig`] never needs a fallback at
//! use time and can be shared read-only between the deciders.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::VmTemplate;

pub const DEFAULT_STALENESS: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_UTILIZATION_THRESHOLD: f64 = 0.5;
pub const DEFAULT_BUSY_DRAIN_STRIDE: u32 = 2;
pub const DEFAULT_MAX_IN_FLIGHT: u32 = 6;
pub const DEFAULT_MIN_CORES: f64 = 1.0;
pub const DEFAULT_MIN_RAM: f64 = 2.0;
pub const DEFAULT_LOCK_NAME: &str = "vmscale-decision";
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);
/// Leases are stored with one-second resolution.
pub const MIN_LOCK_TTL: Duration = Duration::from_secs(1);
pub const MAX_LOCK_WAIT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for `{field}`: {reason}")]
    Duration { field: String, reason: String },

    #[error("invalid policy: {0}")]
    Policy(String),

    #[error("invalid template `{name}`: {reason}")]
    Template { name: String, reason: String },
}

// ── Raw file schema ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    pub policy: Option<RawPolicy>,
    pub defaults: Option<RawDefaults>,
    #[serde(default)]
    pub templates: BTreeMap<String, RawTemplate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawPolicy {
    pub staleness: Option<String>,
    pub utilization_threshold: Option<f64>,
    pub busy_drain_stride: Option<u32>,
    pub busy_drain_order: Option<DrainOrder>,
    pub max_in_flight: Option<u32>,
    pub min_cores: Option<f64>,
    pub min_ram: Option<f64>,
    pub lock_name: Option<String>,
    pub lock_ttl: Option<String>,
    pub lock_wait: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawDefaults {
    pub max_age: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawTemplate {
    pub cores: u32,
    pub ram: u32,
    pub profile: String,
    pub max_age: Option<String>,
}

// ── Resolved configuration ────────────────────────────────────────

/// Order in which partially-utilized scale-in candidates are walked before
/// the drain stride is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainOrder {
    /// Lowest utilization first, ties by VM id.
    #[default]
    LeastUtilized,
    /// Plain VM id order.
    VmId,
}

/// Tunables of the scale-in and scale-out policies.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalePolicy {
    /// A VM must have been inactive this long before it can be scaled in.
    pub staleness: Duration,
    /// Fraction of cores and of RAM at or under which a VM is underutilized.
    pub utilization_threshold: f64,
    /// Keep one of every `busy_drain_stride` partially-utilized candidates.
    pub busy_drain_stride: u32,
    pub busy_drain_order: DrainOrder,
    /// Scale-out stops once this many VMs are NEW or PROVISION.
    pub max_in_flight: u32,
    pub min_cores: f64,
    pub min_ram: f64,
    pub lock_name: String,
    /// Lease length of a held decision lock.
    pub lock_ttl: Duration,
    /// How long `scoped_acquire` may wait; zero means a single attempt.
    pub lock_wait: Duration,
}

impl Default for ScalePolicy {
    fn default() -> Self {
        Self {
            staleness: DEFAULT_STALENESS,
            utilization_threshold: DEFAULT_UTILIZATION_THRESHOLD,
            busy_drain_stride: DEFAULT_BUSY_DRAIN_STRIDE,
            busy_drain_order: DrainOrder::default(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            min_cores: DEFAULT_MIN_CORES,
            min_ram: DEFAULT_MIN_RAM,
            lock_name: DEFAULT_LOCK_NAME.to_string(),
            lock_ttl: DEFAULT_LOCK_TTL,
            lock_wait: Duration::ZERO,
        }
    }
}

/// Read-only registry of VM templates, keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateCatalog {
    templates: BTreeMap<String, VmTemplate>,
}

impl TemplateCatalog {
    pub fn new(templates: impl IntoIterator<Item = VmTemplate>) -> Self {
        Self {
            templates: templates
                .into_iter()
                .map(|t| (t.name.clone(), t))
                .collect(),
        }
    }

    pub fn list_templates(&self) -> &BTreeMap<String, VmTemplate> {
        &self.templates
    }

    pub fn get(&self, name: &str) -> Option<&VmTemplate> {
        self.templates.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }
}

/// Fully resolved scaler configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScalerConfig {
    pub policy: ScalePolicy,
    pub catalog: TemplateCatalog,
}

impl ScalerConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let raw: RawConfig = toml::from_str(content)?;
        Self::resolve(raw)
    }

    /// Apply defaults and validate a parsed file.
    pub fn resolve(raw: RawConfig) -> ConfigResult<Self> {
        let policy = resolve_policy(raw.policy.unwrap_or_default())?;

        let default_max_age = match raw.defaults.and_then(|d| d.max_age) {
            Some(s) => parse_duration("defaults.max_age", &s)?,
            None => DEFAULT_MAX_AGE,
        };

        let mut templates = Vec::with_capacity(raw.templates.len());
        for (name, t) in raw.templates {
            let invalid = |reason: &str| ConfigError::Template {
                name: name.clone(),
                reason: reason.to_string(),
            };
            if t.cores == 0 {
                return Err(invalid("cores must be positive"));
            }
            if t.ram == 0 {
                return Err(invalid("ram must be positive"));
            }
            if t.profile.trim().is_empty() {
                return Err(invalid("profile must not be empty"));
            }
            let max_age = match &t.max_age {
                Some(s) => parse_duration(&format!("templates.{name}.max_age"), s)?,
                None => default_max_age,
            };
            templates.push(VmTemplate {
                name: name.clone(),
                cores: t.cores,
                ram: t.ram,
                max_age_seconds: max_age.as_secs(),
                profile: t.profile,
            });
        }

        Ok(Self {
            policy,
            catalog: TemplateCatalog::new(templates),
        })
    }
}

fn resolve_policy(raw: RawPolicy) -> ConfigResult<ScalePolicy> {
    let defaults = ScalePolicy::default();
    let duration_or = |field: &str, value: &Option<String>, default: Duration| match value {
        Some(s) => parse_duration(field, s),
        None => Ok(default),
    };

    let policy = ScalePolicy {
        staleness: duration_or("policy.staleness", &raw.staleness, defaults.staleness)?,
        utilization_threshold: raw
            .utilization_threshold
            .unwrap_or(defaults.utilization_threshold),
        busy_drain_stride: raw.busy_drain_stride.unwrap_or(defaults.busy_drain_stride),
        busy_drain_order: raw.busy_drain_order.unwrap_or(defaults.busy_drain_order),
        max_in_flight: raw.max_in_flight.unwrap_or(defaults.max_in_flight),
        min_cores: raw.min_cores.unwrap_or(defaults.min_cores),
        min_ram: raw.min_ram.unwrap_or(defaults.min_ram),
        lock_name: raw.lock_name.unwrap_or(defaults.lock_name),
        lock_ttl: duration_or("policy.lock_ttl", &raw.lock_ttl, defaults.lock_ttl)?,
        lock_wait: duration_or("policy.lock_wait", &raw.lock_wait, defaults.lock_wait)?,
    };

    if !(policy.utilization_threshold > 0.0 && policy.utilization_threshold <= 1.0) {
        return Err(ConfigError::Policy(
            "utilization_threshold must be in (0, 1]".to_string(),
        ));
    }
    if policy.busy_drain_stride == 0 {
        return Err(ConfigError::Policy(
            "busy_drain_stride must be at least 1".to_string(),
        ));
    }
    // Both floors divide the demand ratio during best-fit, so zero is unusable.
    if !(policy.min_cores > 0.0 && policy.min_cores.is_finite())
        || !(policy.min_ram > 0.0 && policy.min_ram.is_finite())
    {
        return Err(ConfigError::Policy(
            "min_cores and min_ram must be positive".to_string(),
        ));
    }
    if policy.lock_name.trim().is_empty() {
        return Err(ConfigError::Policy("lock_name must not be empty".to_string()));
    }
    if policy.lock_ttl < MIN_LOCK_TTL {
        return Err(ConfigError::Policy(format!(
            "lock_ttl must be at least {}",
            humantime::format_duration(MIN_LOCK_TTL)
        )));
    }
    if policy.lock_wait > MAX_LOCK_WAIT {
        return Err(ConfigError::Policy(format!(
            "lock_wait must not exceed {}",
            humantime::format_duration(MAX_LOCK_WAIT)
        )));
    }

    Ok(policy)
}

fn parse_duration(field: &str, value: &str) -> ConfigResult<Duration> {
    humantime::parse_duration(value.trim()).map_err(|e| ConfigError::Duration {
        field: field.to_string(),
        reason: e.to_string(),
    })
}

//! Provisioning requests handed to the cloud side.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use vmscale_core::VmTemplate;
use vmscale_state::VmId;

/// Ask the cloud for one VM of a given template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub vm_id: VmId,
    pub template: String,
    pub cores: u32,
    pub ram: u32,
    pub profile: String,
}

impl ProvisionRequest {
    /// A request with a fresh `{template}-{uuid}` VM ID.
    pub fn for_template(template: &VmTemplate) -> Self {
        Self {
            vm_id: format!("{}-{}", template.name, uuid::Uuid::new_v4()),
            template: template.name.clone(),
            cores: template.cores,
            ram: template.ram,
            profile: template.profile.clone(),
        }
    }
}

/// Where provisioning requests go. Fire-and-forget: progress comes back
/// through the resource pool, not through this call.
pub trait ProvisionSink: Send + Sync {
    fn submit(&self, request: &ProvisionRequest) -> anyhow::Result<()>;
}

/// Keeps submitted requests in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    requests: Mutex<Vec<ProvisionRequest>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<ProvisionRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl ProvisionSink for MemorySink {
    fn submit(&self, request: &ProvisionRequest) -> anyhow::Result<()> {
        self.requests
            .lock()
            .map_err(|_| anyhow::anyhow!("memory sink poisoned"))?
            .push(request.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_id_is_prefixed_with_template() {
        let template = VmTemplate {
            name: "large".to_string(),
            cores: 8,
            ram: 16,
            max_age_seconds: 3600,
            profile: "standard-8".to_string(),
        };
        let a = ProvisionRequest::for_template(&template);
        let b = ProvisionRequest::for_template(&template);

        assert!(a.vm_id.starts_with("large-"));
        assert_eq!(a.vm_id.len(), "large-".len() + 36);
        assert_ne!(a.vm_id, b.vm_id);
        assert_eq!(a.profile, "standard-8");
    }

    #[test]
    fn memory_sink_records() {
        let sink = MemorySink::new();
        let request = ProvisionRequest {
            vm_id: "small-1".to_string(),
            template: "small".to_string(),
            cores: 2,
            ram: 4,
            profile: "p".to_string(),
        };
        sink.submit(&request).unwrap();
        assert_eq!(sink.requests(), vec![request]);
    }
}

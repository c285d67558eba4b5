//! Spool-directory provision sink.
//!
//! Each request becomes `<vm_id>.json` in the spool directory, where the
//! cloud provisioner picks it up. Files are written under a temporary name
//! and renamed, so a reader never sees a partial request.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use vmscale_autoscale::{ProvisionRequest, ProvisionSink};

pub struct SpoolSink {
    dir: PathBuf,
}

impl SpoolSink {
    /// Use `dir`, creating it if needed.
    pub fn new(dir: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating spool dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ProvisionSink for SpoolSink {
    fn submit(&self, request: &ProvisionRequest) -> anyhow::Result<()> {
        let body = serde_json::to_vec_pretty(request)?;
        let final_path = self.dir.join(format!("{}.json", request.vm_id));
        let tmp_path = self.dir.join(format!(".{}.json.tmp", request.vm_id));

        std::fs::write(&tmp_path, body)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("publishing {}", final_path.display()))?;

        debug!(path = %final_path.display(), "provision request spooled");
        Ok(())
    }
}

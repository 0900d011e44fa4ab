use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::{CapabilityKind, PipelineError, PipelineHandle, PipelineLoader, SessionConfig};

/// Process-scoped owner of the long-lived pipeline handles.
///
/// Built once at startup and passed to the orchestrator by reference. Handles
/// held here are shared by every request and are never released by one.
pub struct PipelineRegistry {
    session: SessionConfig,
    loader: Arc<dyn PipelineLoader>,
    warm: Mutex<HashMap<CapabilityKind, PipelineHandle>>,
}

impl PipelineRegistry {
    pub fn new(session: SessionConfig, loader: Arc<dyn PipelineLoader>) -> Self {
        Self {
            session,
            loader,
            warm: Mutex::new(HashMap::new()),
        }
    }

    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    pub async fn warm_up(&self, kinds: &[CapabilityKind]) -> Result<(), PipelineError> {
        for &kind in kinds {
            self.resident(kind).await?;
        }
        Ok(())
    }

    /// The long-lived handle for `kind`, loaded and kept on first use.
    pub async fn resident(&self, kind: CapabilityKind) -> Result<PipelineHandle, PipelineError> {
        // Held across the load so concurrent first uses load only once.
        let mut warm = self.warm.lock().await;
        if let Some(handle) = warm.get(&kind) {
            return Ok(handle.clone());
        }
        let handle = self.loader.load(kind, &self.session).await?;
        info!(%kind, "capability resident");
        warm.insert(kind, handle.clone());
        Ok(handle)
    }

    /// A fresh handle owned by the caller; it is not kept here.
    pub async fn load_scoped(&self, kind: CapabilityKind) -> Result<PipelineHandle, PipelineError> {
        self.loader.load(kind, &self.session).await
    }

    pub async fn is_resident(&self, kind: CapabilityKind) -> bool {
        self.warm.lock().await.contains_key(&kind)
    }

    /// Drops a resident handle, releasing its device memory.
    pub async fn evict(&self, kind: CapabilityKind) -> Result<bool, PipelineError> {
        let handle = self.warm.lock().await.remove(&kind);
        match handle {
            Some(handle) => handle.release().map(|_| true),
            None => Ok(false),
        }
    }
}

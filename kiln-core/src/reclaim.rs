use candle_core::Device;
use tracing::{debug, warn};

use crate::{Latent, PipelineHandle};

/// Everything a single request acquired that must not outlive it.
#[derive(Debug, Default)]
pub struct RequestScope {
    handles: Vec<PipelineHandle>,
    artifacts: Vec<Latent>,
}

impl RequestScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a short-lived handle and gives it back for use.
    pub fn adopt(&mut self, handle: PipelineHandle) -> PipelineHandle {
        self.handles.push(handle.clone());
        handle
    }

    pub fn stash(&mut self, latent: Latent) {
        self.artifacts.push(latent);
    }

    /// Moves the most recent artifact out of the scope, transferring ownership
    /// to the next stage.
    pub fn take_artifact(&mut self) -> Option<Latent> {
        self.artifacts.pop()
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    pub fn artifact_count(&self) -> usize {
        self.artifacts.len()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Handles that were still loaded and got released here.
    pub released: usize,
    pub artifacts_dropped: usize,
    pub failures: usize,
}

/// Returns a request's device resources on every exit path.
#[derive(Clone, Debug)]
pub struct Reclaimer {
    device: Device,
}

impl Reclaimer {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    /// Never fails: problems are logged and counted so they cannot replace the
    /// error the request is already reporting.
    pub fn reclaim(&self, scope: RequestScope) -> ReclaimReport {
        let RequestScope { handles, artifacts } = scope;
        let mut report = ReclaimReport::default();

        for handle in handles {
            let was_loaded = handle.is_loaded();
            match handle.release() {
                Ok(()) if was_loaded => report.released += 1,
                Ok(()) => {}
                Err(err) => {
                    report.failures += 1;
                    warn!(kind = %handle.kind(), error = %err, "failed to release pipeline");
                }
            }
        }

        report.artifacts_dropped = artifacts.len();
        drop(artifacts);

        // Pending kernels may still reference freed buffers; wait for them so the
        // allocator can hand the memory to the next request.
        if let Err(err) = self.device.synchronize() {
            report.failures += 1;
            warn!(error = %err, "device synchronize failed during reclaim");
        }

        debug!(?report, "request resources reclaimed");
        report
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Tensor};

    use super::*;
    use crate::testing::{Event, SpyLoader};
    use crate::{CapabilityKind, PipelineLoader, SessionConfig};

    fn latent() -> Latent {
        Latent {
            tensor: Tensor::zeros((1, 4, 8), DType::F32, &Device::Cpu).unwrap(),
            positions: None,
            width: 64,
            height: 64,
            timestep: 0.2,
        }
    }

    #[tokio::test]
    async fn releases_every_loaded_handle_once() {
        let loader = SpyLoader::new();
        let journal = loader.journal();
        let session = SessionConfig::cpu();
        let mut scope = RequestScope::new();
        let base = scope.adopt(loader.load(CapabilityKind::ImageBase, &session).await.unwrap());
        scope.adopt(loader.load(CapabilityKind::ImageRefiner, &session).await.unwrap());
        base.release().unwrap();

        let report = Reclaimer::new(Device::Cpu).reclaim(scope);
        assert_eq!(report.released, 1);
        assert_eq!(report.failures, 0);
        assert_eq!(
            journal.count(|e| matches!(e, Event::Release(_))),
            journal.count(|e| matches!(e, Event::Load(_)))
        );
    }

    #[test]
    fn drops_unconsumed_artifacts() {
        let mut scope = RequestScope::new();
        scope.stash(latent());
        scope.stash(latent());
        assert!(scope.take_artifact().is_some());
        assert_eq!(scope.artifact_count(), 1);

        let report = Reclaimer::new(Device::Cpu).reclaim(scope);
        assert_eq!(report.artifacts_dropped, 1);
    }

    #[tokio::test]
    async fn failing_release_is_counted_not_raised() {
        let loader = SpyLoader::new().failing_unload(CapabilityKind::ImageRefiner);
        let session = SessionConfig::cpu();
        let mut scope = RequestScope::new();
        scope.adopt(loader.load(CapabilityKind::ImageRefiner, &session).await.unwrap());
        scope.adopt(loader.load(CapabilityKind::ImageBase, &session).await.unwrap());

        let report = Reclaimer::new(Device::Cpu).reclaim(scope);
        assert_eq!(report.failures, 1);
        assert_eq!(report.released, 1);
    }
}

use std::time::Instant;

use async_trait::async_trait;
use hf_hub::api::tokio::Api;
use tracing::info;

use crate::{
    CapabilityKind, DelegatedPipeline, FluxPipeline, FluxVariant, MediaKind, Pipeline,
    PipelineError, PipelineHandle, RemoteDelegate, SamRemover, SessionConfig,
};

/// Builds pipeline handles bound to the session's device and precision.
#[async_trait]
pub trait PipelineLoader: Send + Sync {
    async fn load(
        &self,
        kind: CapabilityKind,
        session: &SessionConfig,
    ) -> Result<PipelineHandle, PipelineError>;
}

/// Loads the candle-backed capabilities from the Hugging Face hub.
///
/// Video has no local backend; it is served through the remote worker when
/// one is configured and reported as unsupported otherwise.
pub struct ModelLoader {
    api: Api,
    base: FluxVariant,
    refiner: FluxVariant,
    worker: Option<RemoteDelegate>,
}

impl ModelLoader {
    pub fn new(api: Api, base: FluxVariant, refiner: FluxVariant) -> Self {
        Self {
            api,
            base,
            refiner,
            worker: None,
        }
    }

    pub fn with_worker(mut self, worker: RemoteDelegate) -> Self {
        self.worker = Some(worker);
        self
    }
}

#[async_trait]
impl PipelineLoader for ModelLoader {
    async fn load(
        &self,
        kind: CapabilityKind,
        session: &SessionConfig,
    ) -> Result<PipelineHandle, PipelineError> {
        info!(%kind, "loading capability");
        let started = Instant::now();
        let pipeline: Box<dyn Pipeline> = match kind {
            CapabilityKind::ImageBase => {
                Box::new(FluxPipeline::load(&self.api, self.base, kind, session).await?)
            }
            CapabilityKind::ImageRefiner => {
                Box::new(FluxPipeline::load(&self.api, self.refiner, kind, session).await?)
            }
            CapabilityKind::BackgroundRemover => {
                Box::new(SamRemover::load(&self.api, session).await?)
            }
            CapabilityKind::Video => match &self.worker {
                Some(worker) => Box::new(DelegatedPipeline::new(worker.clone(), MediaKind::Video)?),
                None => return Err(PipelineError::Unsupported(kind)),
            },
        };
        info!(
            %kind,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "capability loaded"
        );
        Ok(PipelineHandle::new(pipeline))
    }
}

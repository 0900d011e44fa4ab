use std::time::Duration;

use reqwest::{header::CONTENT_TYPE, Client};
use serde_json::json;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::{
    CapabilityKind, EncodedVideo, InvokeParams, MediaKind, Pipeline, PipelineError, Prompt,
    RawOutput, StageInput, UpstreamError,
};

/// Upper bound for one delegated generation, connect included.
pub const DELEGATE_TIMEOUT: Duration = Duration::from_secs(60);
/// How much of an upstream error body ends up in the operator log.
const LOGGED_BODY_LIMIT: usize = 512;

impl MediaKind {
    fn worker_route(self) -> &'static str {
        match self {
            Self::Image => "generate_image",
            Self::Video => "generate_video",
        }
    }
}

/// Client for a remote worker that performs generation on our behalf.
#[derive(Clone, Debug)]
pub struct RemoteDelegate {
    client: Client,
    endpoint: String,
}

impl RemoteDelegate {
    pub fn new(endpoint: &str) -> Result<Self, UpstreamError> {
        Self::with_timeout(endpoint, DELEGATE_TIMEOUT)
    }

    pub fn with_timeout(endpoint: &str, timeout: Duration) -> Result<Self, UpstreamError> {
        let endpoint = endpoint.trim().trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(UpstreamError::new(None, "worker endpoint is empty"));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| UpstreamError::new(None, format!("building HTTP client: {err}")))?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Produces the same [`RawOutput`] a local invoke would: decoded pixels for
    /// images, the encoded stream for video.
    pub async fn delegate(
        &self,
        prompt: &Prompt,
        media: MediaKind,
    ) -> Result<RawOutput, UpstreamError> {
        let url = format!("{}/{}", self.endpoint, media.worker_route());
        debug!(%url, "delegating generation");

        let response = self
            .client
            .post(&url)
            .json(&json!({ "prompt": prompt.as_str() }))
            .send()
            .await
            .map_err(|err| {
                let reason = if err.is_timeout() {
                    format!("timed out after {DELEGATE_TIMEOUT:?}")
                } else {
                    format!("request failed: {err}")
                };
                UpstreamError::new(err.status().map(|s| s.as_u16()), reason)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                %url,
                status = status.as_u16(),
                body = %truncate(&body, LOGGED_BODY_LIMIT),
                "remote worker rejected request"
            );
            return Err(UpstreamError::new(
                Some(status.as_u16()),
                format!("worker answered {status}"),
            ));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.starts_with(media.mime()) {
            return Err(UpstreamError::new(
                Some(status.as_u16()),
                format!("expected {}, worker sent {content_type:?}", media.mime()),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| UpstreamError::new(Some(status.as_u16()), format!("reading body: {err}")))?;
        match media {
            MediaKind::Image => image::load_from_memory(&bytes)
                .map(RawOutput::Pixels)
                .map_err(|err| {
                    UpstreamError::new(Some(status.as_u16()), format!("undecodable image: {err}"))
                }),
            MediaKind::Video if bytes.is_empty() => Err(UpstreamError::new(
                Some(status.as_u16()),
                "worker sent an empty video",
            )),
            MediaKind::Video => Ok(RawOutput::Video(EncodedVideo {
                bytes: bytes.to_vec(),
            })),
        }
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// A capability whose compute lives on the remote worker.
///
/// `invoke` blocks on the delegated request, so it must run on a blocking
/// thread (the orchestrator always invokes through `spawn_blocking`).
pub struct DelegatedPipeline {
    remote: RemoteDelegate,
    media: MediaKind,
    runtime: Handle,
}

impl DelegatedPipeline {
    pub fn new(remote: RemoteDelegate, media: MediaKind) -> Result<Self, PipelineError> {
        let runtime = Handle::try_current().map_err(|err| {
            PipelineError::ComputationFailed(format!("delegated pipeline needs a runtime: {err}"))
        })?;
        Ok(Self {
            remote,
            media,
            runtime,
        })
    }
}

impl Pipeline for DelegatedPipeline {
    fn kind(&self) -> CapabilityKind {
        match self.media {
            MediaKind::Image => CapabilityKind::ImageBase,
            MediaKind::Video => CapabilityKind::Video,
        }
    }

    fn invoke(
        &mut self,
        _params: &InvokeParams,
        input: StageInput,
    ) -> Result<RawOutput, PipelineError> {
        let StageInput::Prompt(prompt) = input else {
            return Err(PipelineError::ComputationFailed(
                "remote worker only accepts prompts".into(),
            ));
        };
        Ok(self
            .runtime
            .block_on(self.remote.delegate(&prompt, self.media))?)
    }
}

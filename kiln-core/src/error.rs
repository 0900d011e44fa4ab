use thiserror::Error;

use crate::CapabilityKind;

/// Failure raised by a pipeline handle while loading or invoking a capability.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("device memory exhausted: {0}")]
    ResourceExhausted(String),
    #[error("computation failed: {0}")]
    ComputationFailed(String),
    #[error("{0} handle was already released")]
    Released(CapabilityKind),
    #[error("capability {0} is not available from this loader")]
    Unsupported(CapabilityKind),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl PipelineError {
    /// Classifies a backend error by its message. Allocation failures surface
    /// from cudarc/metal as plain strings, so text is all there is to go on.
    pub fn from_backend(err: impl std::fmt::Display) -> Self {
        let message = err.to_string();
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("out of memory")
            || lowered.contains("out_of_memory")
            || lowered.contains("failed to allocate")
        {
            Self::ResourceExhausted(message)
        } else {
            Self::ComputationFailed(message)
        }
    }
}

impl From<candle_core::Error> for PipelineError {
    fn from(err: candle_core::Error) -> Self {
        Self::from_backend(err)
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        Self::from_backend(format!("{err:#}"))
    }
}

/// The remote worker could not produce a usable artifact.
#[derive(Debug, Error)]
#[error("remote worker unavailable (status: {status:?}): {reason}")]
pub struct UpstreamError {
    pub status: Option<u16>,
    pub reason: String,
}

impl UpstreamError {
    pub fn new(status: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }
}

/// Uniform outcome of a failed generation request.
///
/// `Display` carries the operator-facing detail. Callers outside the process
/// only ever see [`GenerationError::public_message`].
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("invalid input: {0}")]
    InputValidation(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("computation failed: {0}")]
    ComputationFailed(String),
    #[error("degenerate output: {0}")]
    DegenerateOutput(String),
    #[error("upstream unavailable (status: {status:?}): {reason}")]
    UpstreamUnavailable { status: Option<u16>, reason: String },
}

impl GenerationError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InputValidation(_))
    }

    /// Fixed, user-safe text for each failure class.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::InputValidation(_) => "The request was missing a prompt or image.",
            Self::ResourceExhausted(_) => "The server is out of capacity. Please try again later.",
            Self::ComputationFailed(_) | Self::DegenerateOutput(_) => {
                "Generation failed. Please try a different prompt."
            }
            Self::UpstreamUnavailable { .. } => {
                "The generation service is unavailable. Please try again later."
            }
        }
    }
}

impl From<PipelineError> for GenerationError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::ResourceExhausted(msg) => Self::ResourceExhausted(msg),
            PipelineError::Upstream(up) => up.into(),
            other => Self::ComputationFailed(other.to_string()),
        }
    }
}

impl From<UpstreamError> for GenerationError {
    fn from(err: UpstreamError) -> Self {
        Self::UpstreamUnavailable {
            status: err.status,
            reason: err.reason,
        }
    }
}

impl From<image::ImageError> for GenerationError {
    fn from(err: image::ImageError) -> Self {
        Self::ComputationFailed(format!("image encoding: {err}"))
    }
}

impl From<std::io::Error> for GenerationError {
    fn from(err: std::io::Error) -> Self {
        Self::ComputationFailed(format!("writing output: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_text_is_classified_as_exhaustion() {
        let err = PipelineError::from_backend("DriverError(CUDA_ERROR_OUT_OF_MEMORY, \"out of memory\")");
        assert!(matches!(err, PipelineError::ResourceExhausted(_)));

        let err = PipelineError::from_backend("shape mismatch in matmul");
        assert!(matches!(err, PipelineError::ComputationFailed(_)));
    }

    #[test]
    fn public_message_hides_upstream_detail() {
        let err: GenerationError =
            UpstreamError::new(Some(502), "worker says: secret stack trace").into();
        assert!(matches!(
            err,
            GenerationError::UpstreamUnavailable { status: Some(502), .. }
        ));
        assert!(!err.public_message().contains("secret"));
        assert!(err.to_string().contains("secret"));
    }
}

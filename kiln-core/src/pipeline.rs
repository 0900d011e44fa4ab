use std::fmt;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use candle_core::Tensor;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{GenerationError, PipelineError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CapabilityKind {
    ImageBase,
    ImageRefiner,
    Video,
    BackgroundRemover,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ImageBase => "image-base",
            Self::ImageRefiner => "image-refiner",
            Self::Video => "video",
            Self::BackgroundRemover => "background-remover",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputForm {
    Pixels,
    Latent,
}

/// Slice of the diffusion schedule a stage executes, as fractions in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DenoiseRange {
    pub start: f64,
    pub end: f64,
}

impl DenoiseRange {
    pub const FULL: Self = Self {
        start: 0.0,
        end: 1.0,
    };

    pub fn new(start: f64, end: f64) -> Self {
        let start = start.clamp(0.0, 1.0);
        Self {
            start,
            end: end.clamp(start, 1.0),
        }
    }

    /// Share of the whole schedule covered by this range.
    pub fn fraction(&self) -> f64 {
        self.end - self.start
    }

    pub fn is_full(&self) -> bool {
        self.start <= 0.0 && self.end >= 1.0
    }
}

/// A prompt that is known to be non-empty once trimmed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prompt(String);

impl Prompt {
    pub fn new(raw: &str) -> Result<Self, GenerationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(GenerationError::InputValidation("no prompt provided".into()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optional knobs shared by every capability. Capabilities ignore the ones
/// they have no use for.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct GenerationOptions {
    pub negative_prompt: Option<String>,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub steps: Option<usize>,
    pub guidance: Option<f64>,
    pub seed: Option<u64>,
}

/// Accepted sampling iteration budget.
pub const STEP_RANGE: RangeInclusive<usize> = 1..=100;
/// Accepted output edge, in pixels.
pub const EDGE_RANGE: RangeInclusive<usize> = 64..=2048;
/// Accepted guidance scale.
pub const GUIDANCE_RANGE: RangeInclusive<f64> = 0.0..=50.0;

impl GenerationOptions {
    /// Rejects values no capability can honour without exhausting the host.
    pub fn validate(&self) -> Result<(), GenerationError> {
        if let Some(steps) = self.steps {
            if !STEP_RANGE.contains(&steps) {
                return Err(out_of_range("steps", steps, &STEP_RANGE));
            }
        }
        for (name, edge) in [("width", self.width), ("height", self.height)] {
            if let Some(edge) = edge {
                if !EDGE_RANGE.contains(&edge) {
                    return Err(out_of_range(name, edge, &EDGE_RANGE));
                }
            }
        }
        if let Some(guidance) = self.guidance {
            if !GUIDANCE_RANGE.contains(&guidance) {
                return Err(out_of_range("guidance", guidance, &GUIDANCE_RANGE));
            }
        }
        Ok(())
    }
}

fn out_of_range<T: fmt::Display>(
    name: &str,
    value: T,
    range: &RangeInclusive<T>,
) -> GenerationError {
    GenerationError::InputValidation(format!(
        "{name} must be between {} and {}, got {value}",
        range.start(),
        range.end()
    ))
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(flatten)]
    pub options: GenerationOptions,
}

#[derive(Clone, Debug)]
pub struct InvokeParams {
    pub options: GenerationOptions,
    pub output_form: OutputForm,
    pub range: DenoiseRange,
}

impl InvokeParams {
    pub fn pixels(options: GenerationOptions) -> Self {
        Self {
            options,
            output_form: OutputForm::Pixels,
            range: DenoiseRange::FULL,
        }
    }
}

/// Partially denoised sample handed from the base stage to the refiner.
#[derive(Debug)]
pub struct Latent {
    /// Packed latent sample at `timestep`.
    pub tensor: Tensor,
    /// Positional ids matching the packed layout, when the backend uses them.
    pub positions: Option<Tensor>,
    pub width: usize,
    pub height: usize,
    pub timestep: f64,
}

#[derive(Debug)]
pub enum StageInput {
    Prompt(Prompt),
    Refine { prompt: Prompt, latent: Latent },
    Image(DynamicImage),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedVideo {
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub enum RawOutput {
    Pixels(DynamicImage),
    Latent(Latent),
    Video(EncodedVideo),
}

impl RawOutput {
    pub fn form(&self) -> &'static str {
        match self {
            Self::Pixels(_) => "pixels",
            Self::Latent(_) => "latent",
            Self::Video(_) => "video",
        }
    }
}

/// A loaded generative capability.
pub trait Pipeline: Send {
    fn kind(&self) -> CapabilityKind;

    fn invoke(
        &mut self,
        params: &InvokeParams,
        input: StageInput,
    ) -> Result<RawOutput, PipelineError>;

    /// Hook run once when the owning handle is released. Weights are freed
    /// when the pipeline is dropped right after.
    fn unload(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }
}

struct Slot {
    kind: CapabilityKind,
    pipeline: Mutex<Option<Box<dyn Pipeline>>>,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn Pipeline>>> {
        self.pipeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self) -> Result<bool, PipelineError> {
        let taken = self.lock().take();
        match taken {
            Some(mut pipeline) => {
                debug!(kind = %self.kind, "releasing pipeline");
                pipeline.unload().map(|_| true)
            }
            None => Ok(false),
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(kind = %self.kind, error = %err, "release on drop failed");
        }
    }
}

/// Shared reference to one loaded capability.
///
/// Clones point at the same pipeline. Invokes serialise on an internal mutex,
/// so a handle is only ever driven by one thread at a time. The pipeline is
/// released by the first `release` call, or when the last clone is dropped.
#[derive(Clone)]
pub struct PipelineHandle {
    slot: Arc<Slot>,
}

impl PipelineHandle {
    pub fn new(pipeline: Box<dyn Pipeline>) -> Self {
        Self {
            slot: Arc::new(Slot {
                kind: pipeline.kind(),
                pipeline: Mutex::new(Some(pipeline)),
            }),
        }
    }

    pub fn kind(&self) -> CapabilityKind {
        self.slot.kind
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn invoke(
        &self,
        params: &InvokeParams,
        input: StageInput,
    ) -> Result<RawOutput, PipelineError> {
        let mut guard = self.slot.lock();
        let pipeline = guard
            .as_mut()
            .ok_or(PipelineError::Released(self.slot.kind))?;
        pipeline.invoke(params, input)
    }

    /// Idempotent: releasing an already released handle is a no-op.
    pub fn release(&self) -> Result<(), PipelineError> {
        self.slot.release().map(|_| ())
    }
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("kind", &self.slot.kind)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counting {
        unloads: Arc<AtomicUsize>,
    }

    impl Pipeline for Counting {
        fn kind(&self) -> CapabilityKind {
            CapabilityKind::ImageRefiner
        }

        fn invoke(
            &mut self,
            _params: &InvokeParams,
            _input: StageInput,
        ) -> Result<RawOutput, PipelineError> {
            Ok(RawOutput::Pixels(DynamicImage::new_rgb8(2, 2)))
        }

        fn unload(&mut self) -> Result<(), PipelineError> {
            self.unloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting() -> (PipelineHandle, Arc<AtomicUsize>) {
        let unloads = Arc::new(AtomicUsize::new(0));
        let handle = PipelineHandle::new(Box::new(Counting {
            unloads: unloads.clone(),
        }));
        (handle, unloads)
    }

    #[test]
    fn release_twice_is_a_noop() {
        let (handle, unloads) = counting();
        handle.release().unwrap();
        handle.release().unwrap();
        assert!(!handle.is_loaded());
        assert_eq!(unloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invoke_after_release_is_rejected() {
        let (handle, _) = counting();
        let prompt = Prompt::new("a lighthouse").unwrap();
        handle.release().unwrap();
        let err = handle
            .invoke(
                &InvokeParams::pixels(GenerationOptions::default()),
                StageInput::Prompt(prompt),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Released(CapabilityKind::ImageRefiner)));
    }

    #[test]
    fn dropping_last_clone_releases() {
        let (handle, unloads) = counting();
        let clone = handle.clone();
        drop(handle);
        assert_eq!(unloads.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(unloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prompt_is_trimmed_and_must_not_be_blank() {
        assert_eq!(Prompt::new("  a red balloon \n").unwrap().as_str(), "a red balloon");
        for blank in ["", "   ", "\t\n"] {
            assert!(matches!(
                Prompt::new(blank),
                Err(GenerationError::InputValidation(_))
            ));
        }
    }

    #[test]
    fn options_outside_accepted_ranges_are_rejected() {
        assert!(GenerationOptions::default().validate().is_ok());
        let ok = GenerationOptions {
            width: Some(1024),
            height: Some(64),
            steps: Some(100),
            guidance: Some(3.5),
            ..Default::default()
        };
        assert!(ok.validate().is_ok());

        for bad in [
            GenerationOptions { steps: Some(0), ..Default::default() },
            GenerationOptions { steps: Some(1_000_000_000_000), ..Default::default() },
            GenerationOptions { width: Some(100_000), ..Default::default() },
            GenerationOptions { height: Some(8), ..Default::default() },
            GenerationOptions { guidance: Some(f64::NAN), ..Default::default() },
        ] {
            assert!(
                matches!(bad.validate(), Err(GenerationError::InputValidation(_))),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn denoise_range_is_clamped() {
        let range = DenoiseRange::new(0.8, 1.4);
        assert_eq!(range.end, 1.0);
        assert!((range.fraction() - 0.2).abs() < 1e-9);
        assert!(DenoiseRange::FULL.is_full());
        assert!(!range.is_full());
    }
}

//! Spy doubles for the pipeline seam. They record every load, invoke and
//! release in a shared [`Journal`] and fabricate outputs of the right shape.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, Rgb, RgbImage, Rgba, RgbaImage};

use crate::{
    CapabilityKind, DenoiseRange, EncodedVideo, InvokeParams, Latent, OutputForm, Pipeline,
    PipelineError, PipelineHandle, PipelineLoader, RawOutput, SessionConfig, StageInput,
};

/// Bytes the spy video capability "renders".
pub const SPY_VIDEO: &[u8] = b"\0\0\0\x18ftypmp42";

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Load(CapabilityKind),
    Invoke {
        kind: CapabilityKind,
        output_form: OutputForm,
        range: DenoiseRange,
    },
    Release(CapabilityKind),
}

#[derive(Clone, Debug, Default)]
pub struct Journal(Arc<Mutex<Vec<Event>>>);

impl Journal {
    fn push(&self, event: Event) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.events().is_empty()
    }
}

#[derive(Clone, Debug, Default)]
struct Faults {
    blank_output: bool,
    fail_load: Option<CapabilityKind>,
    fail_invoke: Option<CapabilityKind>,
    exhaust_invoke: Option<CapabilityKind>,
    fail_unload: Option<CapabilityKind>,
    slow_invoke: Option<(CapabilityKind, Duration)>,
}

/// Loader that hands out [`SpyPipeline`]s. A failed load records nothing,
/// since no handle came into existence.
#[derive(Clone, Debug, Default)]
pub struct SpyLoader {
    journal: Journal,
    faults: Faults,
}

impl SpyLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    /// Every pixel output is all zeros.
    pub fn blank_output(mut self) -> Self {
        self.faults.blank_output = true;
        self
    }

    pub fn failing_load(mut self, kind: CapabilityKind) -> Self {
        self.faults.fail_load = Some(kind);
        self
    }

    pub fn failing_invoke(mut self, kind: CapabilityKind) -> Self {
        self.faults.fail_invoke = Some(kind);
        self
    }

    pub fn exhausted_invoke(mut self, kind: CapabilityKind) -> Self {
        self.faults.exhaust_invoke = Some(kind);
        self
    }

    pub fn failing_unload(mut self, kind: CapabilityKind) -> Self {
        self.faults.fail_unload = Some(kind);
        self
    }

    /// Invokes of `kind` hold their thread for `delay` before producing output.
    pub fn slow_invoke(mut self, kind: CapabilityKind, delay: Duration) -> Self {
        self.faults.slow_invoke = Some((kind, delay));
        self
    }
}

#[async_trait]
impl PipelineLoader for SpyLoader {
    async fn load(
        &self,
        kind: CapabilityKind,
        _session: &SessionConfig,
    ) -> Result<PipelineHandle, PipelineError> {
        if self.faults.fail_load == Some(kind) {
            return Err(PipelineError::ResourceExhausted(format!(
                "spy: no room for {kind}"
            )));
        }
        self.journal.push(Event::Load(kind));
        Ok(PipelineHandle::new(Box::new(SpyPipeline {
            kind,
            journal: self.journal.clone(),
            faults: self.faults.clone(),
        })))
    }
}

pub struct SpyPipeline {
    kind: CapabilityKind,
    journal: Journal,
    faults: Faults,
}

impl SpyPipeline {
    fn pixels(&self, input: StageInput) -> DynamicImage {
        if self.faults.blank_output {
            return DynamicImage::new_rgb8(640, 360);
        }
        match input {
            StageInput::Image(image) => {
                let rgb = image.to_rgb8();
                let (w, h) = rgb.dimensions();
                DynamicImage::ImageRgba8(RgbaImage::from_fn(w, h, |x, y| {
                    let [r, g, b] = rgb.get_pixel(x, y).0;
                    Rgba([r, g, b, if x < w / 2 { 255 } else { 0 }])
                }))
            }
            _ => DynamicImage::ImageRgb8(RgbImage::from_fn(640, 360, |x, y| {
                Rgb([(x % 256) as u8, (y % 256) as u8, 128])
            })),
        }
    }
}

impl Pipeline for SpyPipeline {
    fn kind(&self) -> CapabilityKind {
        self.kind
    }

    fn invoke(
        &mut self,
        params: &InvokeParams,
        input: StageInput,
    ) -> Result<RawOutput, PipelineError> {
        self.journal.push(Event::Invoke {
            kind: self.kind,
            output_form: params.output_form,
            range: params.range,
        });
        if let Some((kind, delay)) = self.faults.slow_invoke {
            if kind == self.kind {
                std::thread::sleep(delay);
            }
        }
        if self.faults.fail_invoke == Some(self.kind) {
            return Err(PipelineError::ComputationFailed(format!(
                "spy: {} backend raised an internal error at 0xdeadbeef",
                self.kind
            )));
        }
        if self.faults.exhaust_invoke == Some(self.kind) {
            return Err(PipelineError::ResourceExhausted(format!(
                "spy: {} ran out of device memory",
                self.kind
            )));
        }

        match (self.kind, params.output_form) {
            (CapabilityKind::Video, _) => Ok(RawOutput::Video(EncodedVideo {
                bytes: SPY_VIDEO.to_vec(),
            })),
            (_, OutputForm::Latent) => Ok(RawOutput::Latent(Latent {
                tensor: Tensor::zeros((1, 16, 64), DType::F32, &Device::Cpu)?,
                positions: None,
                width: 1024,
                height: 1024,
                timestep: 1.0 - params.range.end,
            })),
            (_, OutputForm::Pixels) => Ok(RawOutput::Pixels(self.pixels(input))),
        }
    }

    fn unload(&mut self) -> Result<(), PipelineError> {
        self.journal.push(Event::Release(self.kind));
        if self.faults.fail_unload == Some(self.kind) {
            return Err(PipelineError::ComputationFailed(format!(
                "spy: {} refused to unload",
                self.kind
            )));
        }
        Ok(())
    }
}

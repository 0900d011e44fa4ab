use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::segment_anything::sam::{self, Sam};
use hf_hub::api::tokio::Api;
use image::{imageops::FilterType, DynamicImage, Rgba, RgbaImage};
use tracing::info;

use crate::{
    image_to_tensor, CapabilityKind, InvokeParams, Pipeline, PipelineError, RawOutput,
    SessionConfig, StageInput,
};

/// Point prompt for the mask decoder: the centre of the frame, marked foreground.
const SUBJECT_POINT: (f64, f64, bool) = (0.5, 0.5, true);

/// Cuts the subject out of an uploaded image with MobileSAM, leaving the
/// background transparent.
pub struct SamRemover {
    device: Device,
    model: Sam,
}

impl SamRemover {
    pub async fn load(api: &Api, session: &SessionConfig) -> Result<Self> {
        let weights = api
            .model("lmz/candle-sam".to_string())
            .get("mobile_sam-tiny-vitt.safetensors")
            .await
            .context("failed to get SAM weights")?;
        let device = session.device().clone();
        tokio::task::spawn_blocking(move || Self::build(weights, device))
            .await
            .context("SAM construction task did not complete")?
    }

    fn build(weights: PathBuf, device: Device) -> Result<Self> {
        // Mask logits are thresholded at zero; keep the decoder in F32.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)
                .context("failed to build SAM var builder")?
        };
        let model = Sam::new_tiny(vb).context("failed to load SAM model")?;
        info!("background remover ready");
        Ok(Self { device, model })
    }

    fn cut_out(&self, image: &DynamicImage) -> Result<RgbaImage> {
        let edge = sam::IMAGE_SIZE as u32;
        let scaled = image.resize(edge, edge, FilterType::Triangle).to_rgb8();
        let tensor = image_to_tensor(&scaled, &self.device)?;
        let (mask, _iou) = self.model.forward(&tensor, &[SUBJECT_POINT], false)?;
        let mask = mask
            .squeeze(0)?
            .ge(0f32)?
            .to_device(&Device::Cpu)?
            .to_vec2::<u8>()?;

        let (width, height) = scaled.dimensions();
        Ok(RgbaImage::from_fn(width, height, |x, y| {
            let [r, g, b] = scaled.get_pixel(x, y).0;
            let keep = mask
                .get(y as usize)
                .and_then(|row| row.get(x as usize))
                .is_some_and(|&m| m != 0);
            Rgba([r, g, b, if keep { u8::MAX } else { 0 }])
        }))
    }
}

impl Pipeline for SamRemover {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::BackgroundRemover
    }

    fn invoke(
        &mut self,
        _params: &InvokeParams,
        input: StageInput,
    ) -> Result<RawOutput, PipelineError> {
        let StageInput::Image(image) = input else {
            return Err(PipelineError::ComputationFailed(
                "background removal needs an uploaded image".into(),
            ));
        };
        let cut = self.cut_out(&image)?;
        Ok(RawOutput::Pixels(DynamicImage::ImageRgba8(cut)))
    }
}

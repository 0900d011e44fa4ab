use std::path::PathBuf;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Module, VarBuilder};
use candle_transformers::models::{
    clip::text_model::{Activation, ClipTextConfig, ClipTextTransformer},
    flux::{self, autoencoder::AutoEncoder, model::Flux, sampling},
    t5::{self, T5EncoderModel},
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::{
    tensor_to_image, CapabilityKind, DenoiseRange, InvokeParams, Latent, OutputForm, Pipeline,
    PipelineError, Prompt, RawOutput, SessionConfig, StageInput,
};

/// Default output edge; matches the canonical result size so no resampling is needed.
const DEFAULT_EDGE: usize = 1024;
const T5_MAX_TOKENS: usize = 256;
/// Extra iterations the refiner spends on the tail it inherits from the base stage.
const RESTRENGTHEN_STEPS: usize = 2;
const MAX_REFINER_STEPS: usize = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FluxVariant {
    Schnell,
    Dev,
}

impl FluxVariant {
    /// Detect the variant from a model name such as `black-forest-labs/FLUX.1-dev`.
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();
        if !name_upper.contains("FLUX") {
            return None;
        }
        if name_upper.contains("DEV") {
            Some(Self::Dev)
        } else {
            // Default to Schnell if no specific variant is found
            Some(Self::Schnell)
        }
    }

    fn repo(self) -> &'static str {
        match self {
            Self::Schnell => "black-forest-labs/FLUX.1-schnell",
            Self::Dev => "black-forest-labs/FLUX.1-dev",
        }
    }

    fn weights(self) -> &'static str {
        match self {
            Self::Schnell => "flux1-schnell.safetensors",
            Self::Dev => "flux1-dev.safetensors",
        }
    }

    fn default_steps(self) -> usize {
        match self {
            Self::Schnell => 4,
            Self::Dev => 28,
        }
    }

    fn default_guidance(self) -> f64 {
        match self {
            Self::Schnell => 0.0,
            Self::Dev => 3.5,
        }
    }

    fn schedule(self, steps: usize, image_seq_len: usize) -> Vec<f64> {
        match self {
            Self::Schnell => sampling::get_schedule(steps, None),
            Self::Dev => sampling::get_schedule(steps, Some((image_seq_len, 0.5, 1.15))),
        }
    }
}

/// Text encoders, autoencoder and transformer for one Flux checkpoint.
///
/// Serves as the base stage (`ImageBase`) or, loaded from a second checkpoint,
/// as the refiner (`ImageRefiner`) that finishes a latent handed over by the base.
pub struct FluxPipeline {
    kind: CapabilityKind,
    variant: FluxVariant,
    device: Device,
    dtype: DType,
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: AutoEncoder,
    flux_model: Flux,
}

/// Local paths of everything one checkpoint needs.
struct FluxFiles {
    t5_model: PathBuf,
    t5_config: PathBuf,
    t5_tokenizer: PathBuf,
    clip_model: PathBuf,
    clip_tokenizer: PathBuf,
    autoencoder: PathBuf,
    flux: PathBuf,
}

impl FluxFiles {
    async fn fetch(api: &Api, variant: FluxVariant) -> Result<Self> {
        let t5_repo = api.repo(hf_hub::Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let t5_model = t5_repo
            .get("model.safetensors")
            .await
            .context("failed to load T5 model file")?;
        let t5_config = t5_repo
            .get("config.json")
            .await
            .context("failed to get T5 config")?;
        let t5_tokenizer = api
            .model("lmz/mt5-tokenizers".to_string())
            .get("t5-v1_1-xxl.tokenizer.json")
            .await
            .context("failed to get T5 tokenizer")?;

        let clip_repo = api.repo(hf_hub::Repo::model(
            "openai/clip-vit-large-patch14".to_string(),
        ));
        let clip_model = clip_repo
            .get("model.safetensors")
            .await
            .context("failed to get CLIP model file")?;
        let clip_tokenizer = clip_repo
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;

        let bf_repo = api.repo(hf_hub::Repo::model(variant.repo().to_string()));
        let autoencoder = bf_repo
            .get("ae.safetensors")
            .await
            .context("failed to get autoencoder model file")?;
        let flux = bf_repo
            .get(variant.weights())
            .await
            .context("failed to get flux model file")?;

        Ok(Self {
            t5_model,
            t5_config,
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            autoencoder,
            flux,
        })
    }
}

impl FluxPipeline {
    /// Downloads are awaited here; building the models is synchronous and runs
    /// on the blocking pool.
    pub async fn load(
        api: &Api,
        variant: FluxVariant,
        kind: CapabilityKind,
        session: &SessionConfig,
    ) -> Result<Self> {
        let files = FluxFiles::fetch(api, variant).await?;
        let device = session.device().clone();
        let dtype = session.dtype();
        tokio::task::spawn_blocking(move || Self::build(files, variant, kind, device, dtype))
            .await
            .context("flux construction task did not complete")?
    }

    fn build(
        files: FluxFiles,
        variant: FluxVariant,
        kind: CapabilityKind,
        device: Device,
        dtype: DType,
    ) -> Result<Self> {
        // --- T5 ---
        let t5_config: t5::Config = serde_json::from_str(
            &std::fs::read_to_string(&files.t5_config).context("failed to read T5 config")?,
        )
        .context("failed to parse T5 config")?;
        let t5_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[files.t5_model], dtype, &device)
                .context("failed to build T5 var builder")?
        };
        let t5_model =
            T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer = Tokenizer::from_file(files.t5_tokenizer)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        // --- CLIP ---
        let clip_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[files.clip_model], dtype, &device)
                .context("failed to build CLIP var builder")?
        };
        let clip_config = ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: 77,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer = Tokenizer::from_file(files.clip_tokenizer)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        // --- Autoencoder ---
        let autoencoder_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[files.autoencoder], dtype, &device)
                .context("failed to build autoencoder var builder")?
        };
        let autoencoder_config = match variant {
            FluxVariant::Schnell => flux::autoencoder::Config::schnell(),
            FluxVariant::Dev => flux::autoencoder::Config::dev(),
        };
        let autoencoder = AutoEncoder::new(&autoencoder_config, autoencoder_vb)
            .context("failed to load autoencoder")?;

        // --- Flux transformer (non-quantized) ---
        let flux_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[files.flux], dtype, &device)
                .context("failed to build flux var builder")?
        };
        let flux_config = match variant {
            FluxVariant::Schnell => flux::model::Config::schnell(),
            FluxVariant::Dev => flux::model::Config::dev(),
        };
        let flux_model = Flux::new(&flux_config, flux_vb).context("failed to load flux model")?;

        info!(%kind, ?variant, ?dtype, "flux pipeline ready");
        Ok(Self {
            kind,
            variant,
            device,
            dtype,
            t5_model,
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            autoencoder,
            flux_model,
        })
    }

    fn encode_prompt(&mut self, prompt: &str) -> Result<(Tensor, Tensor)> {
        let mut t5_tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        t5_tokens.resize(T5_MAX_TOKENS, 0);
        let t5_ids = Tensor::new(&*t5_tokens, &self.device)?.unsqueeze(0)?;
        let t5_emb = self.t5_model.forward(&t5_ids)?;

        let clip_tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let clip_ids = Tensor::new(&*clip_tokens, &self.device)?.unsqueeze(0)?;
        let clip_emb = self.clip_model.forward(&clip_ids)?;
        Ok((t5_emb, clip_emb))
    }

    fn generate(
        &mut self,
        params: &InvokeParams,
        prompt: &Prompt,
        handed_over: Option<Latent>,
    ) -> Result<RawOutput> {
        let options = &params.options;
        let steps = options.steps.unwrap_or(self.variant.default_steps()).max(1);
        let guidance = options.guidance.unwrap_or(self.variant.default_guidance());
        if let Some(seed) = options.seed {
            // Not every backend exposes a seedable generator.
            if let Err(err) = self.device.set_seed(seed) {
                warn!(kind = %self.kind, seed, error = %err, "seed ignored");
            }
        }
        if options.negative_prompt.is_some() {
            debug!(kind = %self.kind, "flux has no negative conditioning, ignoring negative prompt");
        }

        let (t5_emb, clip_emb) = self.encode_prompt(prompt.as_str())?;

        let (width, height) = match &handed_over {
            None => (
                snap_edge(options.width.unwrap_or(DEFAULT_EDGE)),
                snap_edge(options.height.unwrap_or(DEFAULT_EDGE)),
            ),
            Some(latent) => (latent.width, latent.height),
        };
        let noise = sampling::get_noise(1, height, width, &self.device)?.to_dtype(self.dtype)?;
        let state = sampling::State::new(&t5_emb, &clip_emb, &noise)?;

        let (img, img_ids, timesteps) = match handed_over {
            None => {
                let schedule = self.variant.schedule(steps, state.img.dim(1)?);
                let timesteps = slice_schedule(&schedule, params.range).to_vec();
                (state.img.clone(), state.img_ids.clone(), timesteps)
            }
            // The refiner keeps its own text conditioning but continues the base's sample.
            Some(latent) => {
                let img_ids = latent
                    .positions
                    .context("handed-over latent carries no positional ids")?
                    .to_device(&self.device)?;
                let img = latent.tensor.to_device(&self.device)?.to_dtype(self.dtype)?;
                let timesteps = refine_schedule(latent.timestep, steps, params.range);
                (img, img_ids, timesteps)
            }
        };

        debug!(kind = %self.kind, steps = timesteps.len().saturating_sub(1), "denoising");
        let img = sampling::denoise(
            &self.flux_model,
            &img,
            &img_ids,
            &state.txt,
            &state.txt_ids,
            &state.vec,
            &timesteps,
            guidance,
        )?;

        match params.output_form {
            OutputForm::Latent => Ok(RawOutput::Latent(Latent {
                tensor: img,
                positions: Some(img_ids),
                width,
                height,
                timestep: timesteps.last().copied().unwrap_or(1.0),
            })),
            OutputForm::Pixels => Ok(RawOutput::Pixels(self.decode(&img, height, width)?)),
        }
    }

    fn decode(&self, img: &Tensor, height: usize, width: usize) -> Result<DynamicImage> {
        let unpacked = sampling::unpack(img, height, width)?;
        let decoded = self.autoencoder.decode(&unpacked)?.to_dtype(DType::F32)?;
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        tensor_to_image(&img.i(0)?)
    }
}

impl Pipeline for FluxPipeline {
    fn kind(&self) -> CapabilityKind {
        self.kind
    }

    fn invoke(
        &mut self,
        params: &InvokeParams,
        input: StageInput,
    ) -> Result<RawOutput, PipelineError> {
        let (prompt, latent) = match input {
            StageInput::Prompt(prompt) => (prompt, None),
            StageInput::Refine { prompt, latent } => (prompt, Some(latent)),
            StageInput::Image(_) => {
                return Err(PipelineError::ComputationFailed(
                    "flux pipelines take a prompt, not an image".into(),
                ))
            }
        };
        Ok(self.generate(params, &prompt, latent)?)
    }
}

/// Flux packs 2x2 latent patches over an 8x downsampled image.
fn snap_edge(edge: usize) -> usize {
    (edge.max(16) / 16) * 16
}

/// The part of a full schedule (`steps + 1` timesteps from 1 to 0) that `range` covers.
fn slice_schedule(schedule: &[f64], range: DenoiseRange) -> &[f64] {
    let last = schedule.len().saturating_sub(1);
    let at = |fraction: f64| ((last as f64) * fraction).round() as usize;
    let (start, end) = (at(range.start).min(last), at(range.end).min(last));
    &schedule[start..=end.max(start)]
}

/// Evenly re-discretise `[t_start, 0]` for the refiner: the steps the base stage
/// would have spent on this interval plus a bounded number of extra ones.
fn refine_schedule(t_start: f64, steps: usize, range: DenoiseRange) -> Vec<f64> {
    let inherited = ((steps as f64) * range.fraction()).ceil() as usize;
    let n = (inherited + RESTRENGTHEN_STEPS).clamp(1, MAX_REFINER_STEPS);
    (0..=n)
        .map(|i| t_start * (1.0 - i as f64 / n as f64))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_detection_from_model_name() {
        assert_eq!(
            FluxVariant::from_name("black-forest-labs/FLUX.1-dev"),
            Some(FluxVariant::Dev)
        );
        assert_eq!(
            FluxVariant::from_name("black-forest-labs/FLUX.1-schnell"),
            Some(FluxVariant::Schnell)
        );
        assert_eq!(FluxVariant::from_name("flux"), Some(FluxVariant::Schnell));
        assert_eq!(FluxVariant::from_name("stabilityai/sdxl"), None);
    }

    #[test]
    fn base_slice_stops_at_eighty_percent() {
        let schedule: Vec<f64> = (0..=10).map(|i| 1.0 - i as f64 / 10.0).collect();
        let head = slice_schedule(&schedule, DenoiseRange::new(0.0, 0.8));
        assert_eq!(head.len(), 9);
        assert!((head[8] - 0.2).abs() < 1e-9);

        let tail = slice_schedule(&schedule, DenoiseRange::new(0.8, 1.0));
        assert_eq!(tail.len(), 3);
        assert_eq!(*tail.last().unwrap(), 0.0);
    }

    #[test]
    fn refiner_schedule_is_bounded_and_ends_at_zero() {
        let schedule = refine_schedule(0.2, 4, DenoiseRange::new(0.8, 1.0));
        assert_eq!(schedule.len(), 4);
        assert!((schedule[0] - 0.2).abs() < 1e-9);
        assert_eq!(*schedule.last().unwrap(), 0.0);

        let long = refine_schedule(0.5, 500, DenoiseRange::new(0.5, 1.0));
        assert_eq!(long.len(), MAX_REFINER_STEPS + 1);
    }

    #[test]
    fn edges_snap_to_patch_multiples() {
        assert_eq!(snap_edge(1024), 1024);
        assert_eq!(snap_edge(1000), 992);
        assert_eq!(snap_edge(3), 16);
    }
}

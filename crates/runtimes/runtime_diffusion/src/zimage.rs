//! Z-Image pipeline implementation
//!
//! Wraps candle-transformers' z_image module. Opening a pipeline reads the
//! tokenizer and configs and locates the weight shards; the weights are
//! mmapped onto the compute device in `to_device`, so precision changes made
//! before that are free.

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::z_image::{
    calculate_shift, postprocess_image, AutoEncoderKL, Config, FlowMatchEulerDiscreteScheduler,
    SchedulerConfig, TextEncoderConfig, VaeConfig, ZImageTextEncoder, ZImageTransformer2DModel,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use zimage_core::config::ModelsConfig;
use zimage_runtime_api::{
    AttentionBackend, DeviceProfile, DiffusionEngine, EngineImage, EngineLoader, EngineParams,
    GeneratorHost,
};

use crate::device::{device_for, dtype_for};
use crate::hub::{self, resolve_model_path, TEXT_ENCODER_SHARDS, TRANSFORMER_SHARDS};

/// Z-Image scheduler constants
const BASE_IMAGE_SEQ_LEN: usize = 256;
const MAX_IMAGE_SEQ_LEN: usize = 4096;
const BASE_SHIFT: f64 = 0.5;
const MAX_SHIFT: f64 = 1.15;

const LATENT_CHANNELS: usize = 16;
const VAE_ALIGN: usize = 16;

/// Resolves a model id to a directory (downloading if needed) and opens it
pub struct ZImageLoader {
    storage_path: PathBuf,
    hf_token: Option<String>,
}

impl ZImageLoader {
    pub fn new(storage_path: impl Into<PathBuf>, hf_token: Option<String>) -> Self {
        Self {
            storage_path: storage_path.into(),
            hf_token,
        }
    }

    pub fn from_config(config: &ModelsConfig) -> Self {
        Self::new(config.storage_path.clone(), config.hf_token.clone())
    }
}

impl EngineLoader for ZImageLoader {
    fn load(&self, model_id: &str, profile: &DeviceProfile) -> Result<Box<dyn DiffusionEngine>> {
        let model_path =
            resolve_model_path(model_id, &self.storage_path, self.hf_token.as_deref())?;
        tracing::info!("Opening Z-Image pipeline at {}", model_path.display());
        let pipeline = ZImagePipeline::open(&model_path, dtype_for(profile.precision))?;
        Ok(Box::new(pipeline))
    }
}

struct WeightFiles {
    text_encoder: Vec<PathBuf>,
    transformer: Vec<PathBuf>,
    vae: PathBuf,
}

/// Weights materialized on a device
struct Modules {
    text_encoder: ZImageTextEncoder,
    transformer: ZImageTransformer2DModel,
    vae: AutoEncoderKL,
    device: Device,
}

/// Z-Image generation pipeline
pub struct ZImagePipeline {
    tokenizer: Tokenizer,
    text_encoder_cfg: TextEncoderConfig,
    transformer_cfg: Config,
    vae_cfg: VaeConfig,
    weights: WeightFiles,
    dtype: DType,
    vae_dtype: DType,
    modules: Option<Modules>,
}

impl ZImagePipeline {
    /// Open a Z-Image pipeline from a model directory
    pub fn open(model_path: &Path, dtype: DType) -> Result<Self> {
        let tokenizer_path = model_path.join("tokenizer").join("tokenizer.json");
        if !tokenizer_path.exists() {
            anyhow::bail!("Tokenizer not found at {:?}", tokenizer_path);
        }
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;

        let text_encoder_dir = model_path.join("text_encoder");
        let text_encoder_cfg = read_config(&text_encoder_dir.join("config.json"))?
            .unwrap_or_else(TextEncoderConfig::z_image);
        let text_encoder = hub::shard_files(&text_encoder_dir, "model", TEXT_ENCODER_SHARDS);
        if text_encoder.is_empty() {
            anyhow::bail!("Text encoder weights not found in {:?}", text_encoder_dir);
        }

        let transformer_dir = model_path.join("transformer");
        let transformer_cfg = read_config(&transformer_dir.join("config.json"))?
            .unwrap_or_else(Config::z_image_turbo);
        let transformer = hub::shard_files(
            &transformer_dir,
            "diffusion_pytorch_model",
            TRANSFORMER_SHARDS,
        );
        if transformer.is_empty() {
            anyhow::bail!("Transformer weights not found in {:?}", transformer_dir);
        }

        let vae_dir = model_path.join("vae");
        let vae_cfg = read_config(&vae_dir.join("config.json"))?.unwrap_or_else(VaeConfig::z_image);
        let vae = vae_dir.join("diffusion_pytorch_model.safetensors");
        if !vae.exists() {
            anyhow::bail!("VAE weights not found at {:?}", vae);
        }

        Ok(Self {
            tokenizer,
            text_encoder_cfg,
            transformer_cfg,
            vae_cfg,
            weights: WeightFiles {
                text_encoder,
                transformer,
                vae,
            },
            dtype,
            vae_dtype: dtype,
            modules: None,
        })
    }

    fn build_vae(&self, device: &Device) -> Result<AutoEncoderKL> {
        let weights = mmap(std::slice::from_ref(&self.weights.vae), self.vae_dtype, device)?;
        Ok(AutoEncoderKL::new(&self.vae_cfg, weights)?)
    }

    /// Format prompt for Qwen3 chat template
    fn format_prompt(prompt: &str) -> String {
        format!(
            "<|im_start|>user\n{}<|im_end|>\n<|im_start|>assistant\n",
            prompt
        )
    }

    fn encode_prompt(&self, modules: &Modules, prompt: &str) -> Result<(Tensor, Tensor)> {
        let formatted = Self::format_prompt(prompt);
        let tokens = self
            .tokenizer
            .encode(formatted.as_str(), true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?
            .get_ids()
            .to_vec();

        let len = tokens.len();
        let input_ids = Tensor::from_vec(tokens, (1, len), &modules.device)?;
        let feats = modules.text_encoder.forward(&input_ids)?;
        let mask = Tensor::ones((1, len), DType::U8, &modules.device)?;
        Ok((feats, mask))
    }

    fn generate_internal(&self, params: &EngineParams) -> Result<EngineImage> {
        let modules = self
            .modules
            .as_ref()
            .context("Pipeline weights are not on a device yet")?;
        let device = &modules.device;
        let num_steps = params.steps as usize;

        let (cap_feats, cap_mask) = self.encode_prompt(modules, &params.prompt)?;

        // The unconditional branch only matters with classifier-free guidance
        let negative = match params.negative_prompt.as_deref() {
            Some(neg) if !neg.is_empty() && params.guidance_scale > 1.0 => {
                Some(self.encode_prompt(modules, neg)?)
            }
            _ => None,
        };

        let height = params.height as usize;
        let width = params.width as usize;
        if height % VAE_ALIGN != 0 || width % VAE_ALIGN != 0 {
            anyhow::bail!(
                "Image dimensions must be divisible by {}. Got {}x{}",
                VAE_ALIGN,
                width,
                height
            );
        }

        let patch_size = modules.transformer.config().all_patch_size[0];
        let latent_h = 2 * (height / VAE_ALIGN);
        let latent_w = 2 * (width / VAE_ALIGN);

        let image_seq_len = (latent_h / patch_size) * (latent_w / patch_size);
        let mu = calculate_shift(
            image_seq_len,
            BASE_IMAGE_SEQ_LEN,
            MAX_IMAGE_SEQ_LEN,
            BASE_SHIFT,
            MAX_SHIFT,
        );

        let mut scheduler = FlowMatchEulerDiscreteScheduler::new(SchedulerConfig::z_image_turbo());
        scheduler.set_timesteps(num_steps, Some(mu));

        let noise = initial_noise(
            params.seed,
            params.generator_host,
            (1, LATENT_CHANNELS, latent_h, latent_w),
            device,
        )?;
        // Add frame dimension
        let mut latents = noise.to_dtype(self.dtype)?.unsqueeze(2)?;

        for _step in 0..num_steps {
            let t = scheduler.current_timestep_normalized();
            let t_tensor = Tensor::from_vec(vec![t as f32], (1,), device)?.to_dtype(self.dtype)?;

            let noise_pred = modules
                .transformer
                .forward(&latents, &t_tensor, &cap_feats, &cap_mask)?;

            let noise_pred = match &negative {
                Some((neg_feats, neg_mask)) => {
                    let neg_pred = modules
                        .transformer
                        .forward(&latents, &t_tensor, neg_feats, neg_mask)?;
                    let diff = (&noise_pred - &neg_pred)?;
                    (&neg_pred + (diff * params.guidance_scale as f64)?)?
                }
                None => noise_pred,
            };

            // Z-Image predicts the negated velocity
            let noise_pred = noise_pred.neg()?;

            let prev_latents = scheduler.step(&noise_pred.squeeze(2)?, &latents.squeeze(2)?)?;
            latents = prev_latents.unsqueeze(2)?;
        }

        let latents = latents.squeeze(2)?.to_dtype(self.vae_dtype)?;
        let image = modules.vae.decode(&latents)?;
        let image = postprocess_image(&image)?.i(0)?.to_dtype(DType::U8)?;

        let (c, h, w) = image.dims3()?;
        if c != 3 {
            anyhow::bail!("Expected 3 channels from the VAE, got {}", c);
        }

        // CHW -> interleaved RGB
        let pixels: Vec<u8> = image.permute((1, 2, 0))?.flatten_all()?.to_vec1()?;

        Ok(EngineImage {
            pixels,
            width: w as u32,
            height: h as u32,
        })
    }
}

impl DiffusionEngine for ZImagePipeline {
    fn upcast_decoder(&mut self) -> Result<()> {
        self.vae_dtype = DType::F32;
        let device = self.modules.as_ref().map(|m| m.device.clone());
        if let Some(device) = device {
            let vae = self.build_vae(&device)?;
            if let Some(modules) = self.modules.as_mut() {
                modules.vae = vae;
            }
        }
        Ok(())
    }

    fn set_attention_backend(&mut self, backend: AttentionBackend) -> Result<()> {
        match backend {
            AttentionBackend::Native => Ok(()),
            AttentionBackend::Sdpa => {
                anyhow::bail!("the candle Z-Image transformer has a fixed attention implementation")
            }
        }
    }

    fn to_device(&mut self, profile: &DeviceProfile) -> Result<()> {
        let device = device_for(profile)?;
        tracing::info!("Loading weights onto {:?} ({:?})", device, self.dtype);

        let text_encoder = ZImageTextEncoder::new(
            &self.text_encoder_cfg,
            mmap(&self.weights.text_encoder, self.dtype, &device)?,
        )?;
        let transformer = ZImageTransformer2DModel::new(
            &self.transformer_cfg,
            mmap(&self.weights.transformer, self.dtype, &device)?,
        )?;
        let vae = self.build_vae(&device)?;

        self.modules = Some(Modules {
            text_encoder,
            transformer,
            vae,
            device,
        });
        Ok(())
    }

    fn generate(&self, params: &EngineParams) -> Result<EngineImage> {
        self.generate_internal(params)
    }

    fn name(&self) -> &str {
        "Z-Image-Turbo"
    }
}

// candle modules hold only reference-counted tensors and the tokenizer is
// thread-safe; generation itself is serialized by the runtime.
unsafe impl Send for ZImagePipeline {}
unsafe impl Sync for ZImagePipeline {}

fn read_config<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = std::fs::File::open(path)?;
    let config = serde_json::from_reader(file).with_context(|| format!("Invalid {:?}", path))?;
    Ok(Some(config))
}

fn mmap<'a>(files: &[PathBuf], dtype: DType, device: &'a Device) -> Result<VarBuilder<'a>> {
    // Safety: the safetensors files are not modified while mapped
    Ok(unsafe { VarBuilder::from_mmaped_safetensors(files, dtype, device)? })
}

/// Seeded initial latents.
///
/// With `GeneratorHost::Host`, or when the device is the CPU itself, the
/// noise comes from a seeded `StdRng` on the host and is copied over.
/// Otherwise the device's own generator is seeded.
fn initial_noise(
    seed: u64,
    host: GeneratorHost,
    shape: (usize, usize, usize, usize),
    device: &Device,
) -> Result<Tensor> {
    if host == GeneratorHost::Device && !device.is_cpu() {
        device.set_seed(seed)?;
        return Ok(Tensor::randn(0f32, 1f32, shape, device)?);
    }

    let (b, c, h, w) = shape;
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f32> = (0..b * c * h * w)
        .map(|_| rng.sample(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(data, shape, &Device::Cpu)?.to_device(device)?)
}

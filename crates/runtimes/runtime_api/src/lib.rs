//! zimage_runtime_api - Runtime API traits and types
//!
//! This crate defines the contract between the serving runtime and the
//! diffusion engine it drives. The engine is opaque: given prompt, negative
//! prompt, size, step count, guidance and a seed it produces one image.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Compute backend, in selection priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    /// Apple Silicon GPU
    Metal,
    /// NVIDIA GPU
    Cuda,
    Cpu,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Metal => write!(f, "metal"),
            Backend::Cuda => write!(f, "cuda"),
            Backend::Cpu => write!(f, "cpu"),
        }
    }
}

/// Numeric precision of the model weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    Bf16,
    F32,
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::Bf16 => write!(f, "bf16"),
            Precision::F32 => write!(f, "f32"),
        }
    }
}

/// Where the seeded noise generator lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeneratorHost {
    /// Host processor. Used on Metal, where device-side seeding is unreliable.
    Host,
    /// The compute device itself
    Device,
}

/// Device and precision chosen once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub backend: Backend,
    pub precision: Precision,
}

impl DeviceProfile {
    pub fn is_reduced_precision(&self) -> bool {
        self.precision != Precision::F32
    }

    /// Noise for a seeded generation is drawn on the host for Metal and on
    /// the device everywhere else. Reproducibility across runs depends on it.
    pub fn generator_host(&self) -> GeneratorHost {
        match self.backend {
            Backend::Metal => GeneratorHost::Host,
            Backend::Cuda | Backend::Cpu => GeneratorHost::Device,
        }
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.backend, self.precision)
    }
}

/// Runtime status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeStatus {
    Unloaded,
    Loading,
    Ready,
    /// Terminal: the load failed and no generation will ever run
    Failed,
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeStatus::Unloaded => write!(f, "unloaded"),
            RuntimeStatus::Loading => write!(f, "loading"),
            RuntimeStatus::Ready => write!(f, "ready"),
            RuntimeStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Attention kernel selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionBackend {
    /// Fused scaled-dot-product attention
    Sdpa,
    /// Whatever the engine does by default
    Native,
}

/// Parameters of a single engine call
#[derive(Debug, Clone, PartialEq)]
pub struct EngineParams {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance_scale: f32,
    pub seed: u64,
    pub generator_host: GeneratorHost,
}

/// Raw engine output
pub struct EngineImage {
    /// Raw pixel data (RGB, u8, row-major)
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// A loaded diffusion pipeline.
///
/// `generate` is not safe to run concurrently on shared device memory; the
/// runtime serializes calls. The `&mut self` methods are only called while
/// loading, before the engine is shared.
pub trait DiffusionEngine: Send + Sync {
    /// Run the output-decoding stage (VAE) in full precision
    fn upcast_decoder(&mut self) -> Result<()>;

    /// Select an attention kernel. Failing here is not fatal to loading.
    fn set_attention_backend(&mut self, backend: AttentionBackend) -> Result<()>;

    /// Move the pipeline onto the compute device
    fn to_device(&mut self, profile: &DeviceProfile) -> Result<()>;

    /// Generate one image
    fn generate(&self, params: &EngineParams) -> Result<EngineImage>;

    /// Get the model name
    fn name(&self) -> &str;
}

/// Loads an engine by model identifier
pub trait EngineLoader: Send + Sync {
    fn load(&self, model_id: &str, profile: &DeviceProfile) -> Result<Box<dyn DiffusionEngine>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metal_draws_noise_on_host() {
        let profile = DeviceProfile {
            backend: Backend::Metal,
            precision: Precision::Bf16,
        };
        assert_eq!(profile.generator_host(), GeneratorHost::Host);
        assert!(profile.is_reduced_precision());
    }

    #[test]
    fn other_backends_draw_noise_on_device() {
        for backend in [Backend::Cuda, Backend::Cpu] {
            let profile = DeviceProfile {
                backend,
                precision: Precision::F32,
            };
            assert_eq!(profile.generator_host(), GeneratorHost::Device);
        }
    }

    #[test]
    fn display_is_lowercase() {
        let profile = DeviceProfile {
            backend: Backend::Cuda,
            precision: Precision::Bf16,
        };
        assert_eq!(profile.to_string(), "cuda (bf16)");
        assert_eq!(RuntimeStatus::Ready.to_string(), "ready");
    }
}

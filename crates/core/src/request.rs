use image::RgbImage;

use crate::config::GenerationConfig;
use crate::error::{Error, Result};
use crate::seed::MAX_SEED;

/// Width and height must be multiples of this (VAE downsampling factor times patch size).
pub const DIMENSION_ALIGN: u32 = 16;

/// Image generation request
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    /// `None` means "pick one at execution time"
    pub seed: Option<u64>,
}

impl GenerationRequest {
    /// Request for `prompt` using the configured size and step defaults
    pub fn new(prompt: impl Into<String>, defaults: &GenerationConfig) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            width: defaults.width,
            height: defaults.height,
            steps: defaults.steps,
            seed: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidRequest(format!(
                "width and height must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.width % DIMENSION_ALIGN != 0 || self.height % DIMENSION_ALIGN != 0 {
            return Err(Error::InvalidRequest(format!(
                "width and height must be multiples of {}, got {}x{}",
                DIMENSION_ALIGN, self.width, self.height
            )));
        }
        if self.steps == 0 {
            return Err(Error::InvalidRequest("steps must be positive".to_string()));
        }
        if let Some(seed) = self.seed {
            if seed > MAX_SEED {
                return Err(Error::InvalidRequest(format!(
                    "seed must be below 2^63, got {}",
                    seed
                )));
            }
        }
        Ok(())
    }

    /// Negative prompt with empty strings treated as absent
    pub fn negative_prompt(&self) -> Option<&str> {
        self.negative_prompt.as_deref().filter(|s| !s.is_empty())
    }
}

/// Output of one generation, handed straight to the artifact writer
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub image: RgbImage,
    pub seed_used: u64,
    pub elapsed_seconds: f64,
}

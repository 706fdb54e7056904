//! JSON bodies of the HTTP API, shared by the daemon and the remote client.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::artifact::ArtifactMeta;
use crate::config::GenerationConfig;
use crate::error::{Error, Result};
use crate::request::GenerationRequest;

/// `POST /generate` body.
///
/// Integers are signed on the wire so that `"width": -1` reaches validation
/// and comes back as an invalid request, not as a decode failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateBody {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    /// Accepted for compatibility and ignored: Z-Image-Turbo samples without guidance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f32>,
}

impl GenerateBody {
    /// Fill in defaults and check ranges
    pub fn into_request(self, defaults: &GenerationConfig) -> Result<GenerationRequest> {
        let request = GenerationRequest {
            width: positive_u32("width", self.width, defaults.width)?,
            height: positive_u32("height", self.height, defaults.height)?,
            steps: positive_u32("steps", self.steps, defaults.steps)?,
            seed: match self.seed {
                Some(seed) if seed < 0 => {
                    return Err(Error::InvalidRequest(format!(
                        "seed must not be negative, got {}",
                        seed
                    )))
                }
                Some(seed) => Some(seed as u64),
                None => None,
            },
            negative_prompt: self.negative_prompt,
            prompt: self.prompt,
        };
        request.validate()?;
        Ok(request)
    }
}

impl From<&GenerationRequest> for GenerateBody {
    fn from(request: &GenerationRequest) -> Self {
        Self {
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            width: Some(request.width as i64),
            height: Some(request.height as i64),
            steps: Some(request.steps as i64),
            seed: request.seed.map(|s| s as i64),
            guidance_scale: None,
        }
    }
}

fn positive_u32(field: &str, value: Option<i64>, default: u32) -> Result<u32> {
    match value {
        None => Ok(default),
        Some(v) if v <= 0 => Err(Error::InvalidRequest(format!(
            "{} must be positive, got {}",
            field, v
        ))),
        Some(v) => u32::try_from(v)
            .map_err(|_| Error::InvalidRequest(format!("{} is too large: {}", field, v))),
    }
}

/// `POST /generate` success body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub status: String,
    pub image_path: PathBuf,
    pub time_taken: f64,
    pub meta: ArtifactMeta,
}

/// `GET /status` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub model: String,
    pub backend: String,
    pub precision: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: String,
}

impl From<&Error> for ErrorResponse {
    fn from(err: &Error) -> Self {
        Self {
            error: ErrorDetail {
                message: err.to_string(),
                r#type: err.kind().to_string(),
            },
        }
    }
}

//! zimage_core - Core library for the image generation service
//!
//! This crate provides:
//! - User configuration (`~/.config/zimage/config.toml`)
//! - The error taxonomy shared by every front-end
//! - Generation requests, seed resolution and artifact storage
//! - HTTP wire types shared by the daemon and the remote client

pub mod api;
pub mod artifact;
pub mod config;
pub mod error;
pub mod request;
pub mod seed;

pub use artifact::{ArtifactMeta, ArtifactRecord, ArtifactWriter};
pub use config::Config;
pub use error::{Error, Result};
pub use request::{GenerationRequest, GenerationResult};
pub use seed::{resolve_seed, MAX_SEED};

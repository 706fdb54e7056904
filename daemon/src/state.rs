use std::sync::Arc;
use zimage_core::config::GenerationConfig;
use zimage_core::{ArtifactWriter, Config};
use zimage_runtime_diffusion::DiffusionRuntime;

pub struct AppState {
    pub runtime: Arc<DiffusionRuntime>,
    pub writer: ArtifactWriter,
    /// Used for fields missing from a request body
    pub defaults: GenerationConfig,
}

impl AppState {
    pub fn new(
        runtime: Arc<DiffusionRuntime>,
        writer: ArtifactWriter,
        defaults: GenerationConfig,
    ) -> Self {
        Self {
            runtime,
            writer,
            defaults,
        }
    }

    pub fn from_config(runtime: Arc<DiffusionRuntime>, config: &Config) -> Self {
        Self::new(
            runtime,
            ArtifactWriter::from_config(&config.output),
            config.generation.clone(),
        )
    }
}

//! Remote image generation through a running server

use anyhow::Result;
use zimage_core::api::GenerateBody;
use zimage_core::Config;

/// Flags that override the configured generation defaults
#[derive(Debug, Default)]
pub struct GenerateOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub steps: Option<u32>,
    pub seed: Option<u64>,
    pub negative_prompt: Option<String>,
}

impl GenerateOptions {
    fn into_body(self, prompt: &str, config: &Config) -> GenerateBody {
        let defaults = &config.generation;
        GenerateBody {
            prompt: prompt.to_string(),
            negative_prompt: self.negative_prompt,
            width: Some(self.width.unwrap_or(defaults.width) as i64),
            height: Some(self.height.unwrap_or(defaults.height) as i64),
            steps: Some(self.steps.unwrap_or(defaults.steps) as i64),
            seed: self.seed.map(|s| s as i64),
            guidance_scale: None,
        }
    }
}

pub async fn execute(prompt: &str, url: Option<&str>, options: GenerateOptions) -> Result<()> {
    let config = Config::load()?;
    let client = super::client_for(url, &config)?;
    let body = options.into_body(prompt, &config);

    println!(
        "Generating {}x{} ({} steps) on {}...",
        body.width.unwrap_or_default(),
        body.height.unwrap_or_default(),
        body.steps.unwrap_or_default(),
        client.base_url()
    );

    let response = client.generate(&body).await?;

    println!("Saved: {}", response.image_path.display());
    println!("Seed: {}", response.meta.seed);
    println!("Time: {:.1}s", response.time_taken);
    Ok(())
}

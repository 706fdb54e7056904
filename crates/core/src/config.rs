use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_MODEL_ID: &str = "Tongyi-MAI/Z-Image-Turbo";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Daemon settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Model settings
    #[serde(default)]
    pub models: ModelsConfig,

    /// Where generated images go
    #[serde(default)]
    pub output: OutputConfig,

    /// Request defaults
    #[serde(default)]
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Requests admitted at once, including the one being generated.
    /// Anything beyond this is rejected instead of queued.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// HuggingFace repo id or local directory of the pipeline
    #[serde(default = "default_model_id")]
    pub model_id: String,

    /// Directory to store models (default: ~/.config/zimage/models/)
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// HuggingFace token for private models
    #[serde(default)]
    pub hf_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output directory, relative paths resolve against the working directory
    #[serde(default = "default_output_dir")]
    pub directory: PathBuf,

    /// Filename prefix: `<prefix>_<timestamp>_<seed>.png`
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    /// Number of denoising steps
    #[serde(default = "default_steps")]
    pub steps: u32,
}

fn default_port() -> u16 {
    8000
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_max_pending() -> usize {
    8
}

fn default_model_id() -> String {
    DEFAULT_MODEL_ID.to_string()
}

fn default_storage_path() -> PathBuf {
    Config::base_dir()
        .map(|p| p.join("models"))
        .unwrap_or_else(|_| PathBuf::from("~/.config/zimage/models"))
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("generated_images")
}

fn default_prefix() -> String {
    "img".to_string()
}

fn default_width() -> u32 {
    896
}

fn default_height() -> u32 {
    512
}

fn default_steps() -> u32 {
    5
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            max_pending: default_max_pending(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            model_id: default_model_id(),
            storage_path: default_storage_path(),
            hf_token: None,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_dir(),
            prefix: default_prefix(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            steps: default_steps(),
        }
    }
}

impl Config {
    /// Get the base directory: ~/.config/zimage/
    pub fn base_dir() -> Result<PathBuf> {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .or_else(|_| std::env::var("USERPROFILE").map(PathBuf::from))
            .map_err(|_| anyhow::anyhow!("Could not determine home directory"))?;
        Ok(home.join(".config").join("zimage"))
    }

    /// Load config from default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load config from `path`, falling back to defaults when it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save config to default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the config file path: ~/.config/zimage/config.toml
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("config.toml"))
    }

    /// Read a dotted key such as `daemon.port`
    pub fn get(&self, key: &str) -> Result<String> {
        let value = match key {
            "daemon.host" => self.daemon.host.clone(),
            "daemon.port" => self.daemon.port.to_string(),
            "daemon.max_pending" => self.daemon.max_pending.to_string(),
            "models.model_id" => self.models.model_id.clone(),
            "models.storage_path" => self.models.storage_path.display().to_string(),
            "models.hf_token" => self
                .models
                .hf_token
                .as_ref()
                .map(|_| "***".to_string())
                .unwrap_or_default(),
            "output.directory" => self.output.directory.display().to_string(),
            "output.prefix" => self.output.prefix.clone(),
            "generation.width" => self.generation.width.to_string(),
            "generation.height" => self.generation.height.to_string(),
            "generation.steps" => self.generation.steps.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        };
        Ok(value)
    }

    /// Set a dotted key from its string form
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "daemon.host" => self.daemon.host = value.to_string(),
            "daemon.port" => self.daemon.port = value.parse()?,
            "daemon.max_pending" => {
                let max_pending: usize = value.parse()?;
                if max_pending == 0 {
                    anyhow::bail!("daemon.max_pending must be at least 1");
                }
                self.daemon.max_pending = max_pending;
            }
            "models.model_id" => self.models.model_id = value.to_string(),
            "models.storage_path" => self.models.storage_path = value.into(),
            "models.hf_token" => {
                self.models.hf_token = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "output.directory" => self.output.directory = value.into(),
            "output.prefix" => self.output.prefix = value.to_string(),
            "generation.width" => self.generation.width = value.parse()?,
            "generation.height" => self.generation.height = value.parse()?,
            "generation.steps" => self.generation.steps = value.parse()?,
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }
}

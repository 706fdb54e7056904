mod client;
mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "zimage")]
#[command(author, version, about = "Generate images locally with Z-Image", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the model and start the HTTP server
    Serve {
        /// Address to bind (defaults to daemon.host)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (defaults to daemon.port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Load the model and generate from prompts typed at the terminal
    #[command(alias = "i")]
    Interactive,

    /// Generate an image through a running server
    Generate {
        /// Text prompt for image generation
        prompt: String,

        /// Server base URL (defaults to http://<daemon.host>:<daemon.port>)
        #[arg(long)]
        url: Option<String>,

        /// Image width in pixels
        #[arg(long)]
        width: Option<u32>,

        /// Image height in pixels
        #[arg(long)]
        height: Option<u32>,

        /// Number of inference steps
        #[arg(short, long)]
        steps: Option<u32>,

        /// Random seed for reproducibility
        #[arg(long)]
        seed: Option<u64>,

        /// Negative prompt
        #[arg(long)]
        negative_prompt: Option<String>,
    },

    /// Show the server's model status
    Status {
        /// Server base URL
        #[arg(long)]
        url: Option<String>,
    },

    /// View or set configuration
    Config {
        /// Config key (e.g., "daemon.port", "generation.steps")
        key: Option<String>,

        /// Value to set (if omitted, shows current value)
        value: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, port } => {
            commands::serve::execute(host, port).await?;
        }
        Commands::Interactive => {
            commands::interactive::execute().await?;
        }
        Commands::Generate {
            prompt,
            url,
            width,
            height,
            steps,
            seed,
            negative_prompt,
        } => {
            let options = commands::generate::GenerateOptions {
                width,
                height,
                steps,
                seed,
                negative_prompt,
            };
            commands::generate::execute(&prompt, url.as_deref(), options).await?;
        }
        Commands::Status { url } => {
            commands::status::execute(url.as_deref()).await?;
        }
        Commands::Config { key, value } => {
            commands::config::execute(key.as_deref(), value.as_deref())?;
        }
    }

    Ok(())
}

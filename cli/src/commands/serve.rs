use anyhow::{Context, Result};
use std::net::SocketAddr;
use zimage_core::Config;

pub async fn execute(host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(host) = host {
        config.daemon.host = host;
    }
    if let Some(port) = port {
        config.daemon.port = port;
    }

    let addr: SocketAddr = format!("{}:{}", config.daemon.host, config.daemon.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.daemon.host))?;

    println!("Starting zimage server...");
    println!("Model: {}", config.models.model_id);
    println!("Output: {}", config.output.directory.display());
    println!("\nAPI endpoints:");
    println!("  GET  /health   - Health check");
    println!("  GET  /status   - Model status");
    println!("  POST /generate - Generate an image");
    println!("\nThe model loads before the server listens on http://{}.", addr);
    println!("Press Ctrl+C to stop.\n");

    zimage_daemon::run_server(addr, config).await?;

    Ok(())
}

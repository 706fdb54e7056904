use anyhow::Result;
use zimage_core::Config;

pub async fn execute(url: Option<&str>) -> Result<()> {
    let config = Config::load()?;
    let client = super::client_for(url, &config)?;

    println!("zimage status\n");
    println!("Server: {}", client.base_url());

    match client.status().await {
        Ok(status) => {
            println!("Model: {} ({})", status.model, status.status);
            println!("Device: {} ({})", status.backend, status.precision);
        }
        Err(e) => {
            println!("Unavailable: {}", e);
        }
    }

    println!("Output directory: {}", config.output.directory.display());
    Ok(())
}

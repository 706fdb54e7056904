pub mod config;
pub mod generate;
pub mod interactive;
pub mod serve;
pub mod status;

use crate::client::ImageClient;
use zimage_core::{Config, Result};

/// Base URL of the configured daemon
pub fn default_url(config: &Config) -> String {
    format!("http://{}:{}", config.daemon.host, config.daemon.port)
}

/// Client for `url`, or for the configured daemon when no URL is given
pub fn client_for(url: Option<&str>, config: &Config) -> Result<ImageClient> {
    match url {
        Some(url) => ImageClient::new(url),
        None => ImageClient::new(default_url(config)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_url_wins_over_config() {
        let mut config = Config::default();
        config.daemon.port = 9100;

        let client = client_for(Some("http://10.0.0.2:8000/"), &config).unwrap();
        assert_eq!(client.base_url(), "http://10.0.0.2:8000");

        let client = client_for(None, &config).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:9100");
    }
}

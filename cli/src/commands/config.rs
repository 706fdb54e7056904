use anyhow::Result;
use zimage_core::Config;

const KEYS: &[&str] = &[
    "daemon.host",
    "daemon.port",
    "daemon.max_pending",
    "models.model_id",
    "models.storage_path",
    "models.hf_token",
    "output.directory",
    "output.prefix",
    "generation.width",
    "generation.height",
    "generation.steps",
];

pub fn execute(key: Option<&str>, value: Option<&str>) -> Result<()> {
    let mut config = Config::load()?;

    match (key, value) {
        // Show all config
        (None, _) => {
            println!("Configuration file: {:?}\n", Config::config_path()?);
            let mut section = "";
            for key in KEYS {
                let (head, name) = key.split_once('.').unwrap_or(("", key));
                if head != section {
                    if !section.is_empty() {
                        println!();
                    }
                    println!("[{}]", head);
                    section = head;
                }
                let value = config.get(key)?;
                println!("  {} = {}", name, if value.is_empty() { "(not set)" } else { &value });
            }
        }

        // Get a specific key
        (Some(key), None) => {
            println!("{}", config.get(key)?);
        }

        // Set a specific key
        (Some(key), Some(value)) => {
            config.set(key, value)?;
            config.save()?;
            println!("Set {} = {}", key, value);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_listed_key_is_readable() {
        let config = Config::default();
        for key in KEYS {
            assert!(config.get(key).is_ok(), "{} is not a config key", key);
        }
    }
}

//! Initialize the configuration directory: create ~/.convo and a default config file.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::Config;

/// Create the config directory and default config if they do not exist.
/// An existing config file is left untouched. Returns the config directory.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        let default_config = serde_json::to_string_pretty(&Config::default())
            .context("serializing default config")?;
        std::fs::write(config_path, default_config)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    } else {
        log::debug!(
            "config already exists at {}, skipping",
            config_path.display()
        );
    }

    Ok(config_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config;

    fn temp_config_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("convo-init-test-{}", uuid::Uuid::new_v4()))
            .join("config.json")
    }

    #[test]
    fn writes_loadable_default_config() {
        let path = temp_config_path();
        let dir = init_config_dir(&path).expect("init");
        assert!(dir.is_dir());
        let (config, _) = load_config(Some(path)).expect("load");
        assert_eq!(config.mirai.base_url, "http://127.0.0.1:8080");
    }

    #[test]
    fn keeps_existing_config() {
        let path = temp_config_path();
        init_config_dir(&path).expect("init");
        std::fs::write(&path, r#"{"mirai":{"qq":7}}"#).expect("write");
        init_config_dir(&path).expect("init again");
        let (config, _) = load_config(Some(path)).expect("load");
        assert_eq!(config.mirai.qq, 7);
    }
}

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// One row of the device table: every id in `ids` maps to the same screen size.
#[derive(Debug, Deserialize, Clone)]
pub struct DevicePreset {
    pub ids: Vec<String>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub message_log_suffix: String,
    pub image_suffix: String,
    pub content_column: usize,
    pub attachments_column: usize,
    pub module_url: String,
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub max_guest_memory_mib: Option<u64>,
    #[serde(default)]
    pub abort_on_sandbox_fault: bool,
    pub progress_interval_ms: u64,
    #[serde(default)]
    pub devices: Vec<DevicePreset>,
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub config_hash: String,
}

pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig> {
    let bytes: Vec<u8> = if let Some(p) = path {
        std::fs::read(p).with_context(|| format!("failed to read config {}", p.display()))?
    } else {
        include_bytes!("../config/default.yml").to_vec()
    };

    let config: Config = serde_yaml::from_slice(&bytes)?;
    validate(&config)?;

    let config_hash = hash_bytes(&bytes);

    Ok(LoadedConfig { config, config_hash })
}

fn validate(config: &Config) -> Result<()> {
    if config.message_log_suffix.trim().is_empty() {
        bail!("message_log_suffix must not be empty");
    }
    if config.image_suffix.trim().is_empty() {
        bail!("image_suffix must not be empty");
    }
    if config.content_column == config.attachments_column {
        bail!(
            "content_column and attachments_column both point at column {}",
            config.content_column
        );
    }
    Ok(())
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(digest)
}

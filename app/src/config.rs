use anyhow::{bail, Context, Result};
use derivative_store::DerivativeStore;
use image_derivatives::DerivativeConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// How many directory levels `add` descends into.
    #[serde(default = "default_scan_depth")]
    pub scan_depth: usize,

    #[serde(default)]
    pub derivatives: DerivativeConfig,
}

fn default_db_path() -> PathBuf {
    DerivativeStore::default_location()
        .unwrap_or_else(|_| PathBuf::from(".photozip").join("derivatives.db"))
}

fn default_scan_depth() -> usize {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            scan_depth: default_scan_depth(),
            derivatives: DerivativeConfig::default(),
        }
    }
}

impl Config {
    /// Load from `path`, or from the per-user config file when `None`.
    ///
    /// An explicitly named file must exist. The per-user file is created with
    /// defaults on first run.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::read(path),
            None => {
                let config_path = Self::config_path();
                if config_path.exists() {
                    Self::read(&config_path)
                } else {
                    let config = Config::default();
                    config.save(&config_path)?;
                    Ok(config)
                }
            }
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let derivatives = &self.derivatives;
        if derivatives.thumbnail_size == 0 {
            bail!("derivatives.thumbnail_size must be at least 1");
        }
        if derivatives.resize_size == 0 {
            bail!("derivatives.resize_size must be at least 1");
        }
        if !(1..=100).contains(&derivatives.jpeg_quality) {
            bail!(
                "derivatives.jpeg_quality must be between 1 and 100, got {}",
                derivatives.jpeg_quality
            );
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("photozip")
            .join("config.toml")
    }
}

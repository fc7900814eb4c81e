//! Configuration for runs driven by a companion capture process.
//!
//! When no `--image` is given the capture parameters arrive through a
//! `config.json` the companion writes, so loading starts with the bounded
//! file wait.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use physdump::engine::SessionConfig;
use physdump::wait::await_file;

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Deserialize)]
pub struct Config {
    pub image: PathBuf,
    #[serde(default)]
    pub dtb: Option<u64>,
    #[serde(default)]
    pub kernel_base: Option<u64>,
    #[serde(default)]
    pub build: Option<u32>,
}

impl Config {
    /// Config equivalent of an explicit `--image` invocation.
    pub fn for_image(image: PathBuf) -> Self {
        Self {
            image,
            dtb: None,
            kernel_base: None,
            build: None,
        }
    }

    /// Wait for the companion process to produce the config file, then
    /// parse it.
    pub fn load_when_available(
        path: &Path,
        interval: Duration,
        max_attempts: u32,
    ) -> Result<Self> {
        await_file(path, interval, max_attempts)?;
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn session_config(&self) -> SessionConfig {
        let mut session = SessionConfig::new(self.image.clone());
        session.dtb = self.dtb;
        session.kernel_base = self.kernel_base;
        session
    }
}

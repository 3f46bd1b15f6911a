//! Capture-loop configuration.
//! Defaults mirror the shipped setup; a JSON config file and CLI flags
//! override individual fields.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Which click mechanism is tried first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClickerKind {
    /// External click helper, with the pointer as fallback.
    #[default]
    Helper,
    /// Direct virtual-pointer clicks only.
    Pointer,
}

impl fmt::Display for ClickerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClickerKind::Helper => write!(f, "helper"),
            ClickerKind::Pointer => write!(f, "pointer"),
        }
    }
}

impl FromStr for ClickerKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "helper" => Ok(ClickerKind::Helper),
            "pointer" => Ok(ClickerKind::Pointer),
            other => bail!("unknown click mechanism: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Image whose average RGB defines the target color.
    pub reference_image: PathBuf,
    /// Directory rewritten with capture artifacts each iteration.
    pub captures_dir: PathBuf,
    pub ocr_enabled: bool,
    /// Case-insensitive phrases the affordance label must contain.
    pub search_phrases: Vec<String>,
    pub color_tolerance: u8,
    pub poll_interval_ms: u64,
    /// Delay between pointer movement and click.
    pub click_delay_ms: u64,
    /// Pause after an input event before re-checking the region.
    pub settle_delay_ms: u64,
    pub preferred_clicker: ClickerKind,
    pub auto_click: bool,
    pub debug: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            reference_image: PathBuf::from("assets/color_ref.png"),
            captures_dir: PathBuf::from("captures"),
            ocr_enabled: true,
            search_phrases: vec![
                "Allow".to_string(),
                "Try Again".to_string(),
                "Continue".to_string(),
            ],
            color_tolerance: 30,
            poll_interval_ms: 1000,
            click_delay_ms: 500,
            settle_delay_ms: 300,
            preferred_clicker: ClickerKind::Helper,
            auto_click: true,
            debug: false,
        }
    }
}

impl CaptureConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid config JSON in {}", path.display()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn click_delay(&self) -> Duration {
        Duration::from_millis(self.click_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

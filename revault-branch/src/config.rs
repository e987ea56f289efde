//! Notifier configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// How long queued notifications wait before a batch is delivered.
    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,
}

fn default_flush_delay_ms() -> u64 {
    100
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            flush_delay_ms: default_flush_delay_ms(),
        }
    }
}

impl NotifierConfig {
    /// Load config from a JSON file, falling back to defaults if it is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read notifier config from {:?}", path))?;
        serde_json::from_str(&data).with_context(|| "Failed to parse notifier config JSON")
    }

    /// Save config as pretty JSON (atomic replace).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }
}

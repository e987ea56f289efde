//! Engine configuration
//!
//! Stored as JSON (e.g. `revault.json` next to the archive root). Missing
//! fields take their defaults, and a missing file yields the full default
//! configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration shared by every archive handle in the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Where deleted archives are relocated.
    #[serde(default = "default_cemetery_dir")]
    pub cemetery_dir: PathBuf,
    /// Scratch space for digest computation.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Digest cache snapshot file.
    #[serde(default = "default_digest_snapshot_path")]
    pub digest_snapshot_path: PathBuf,
    /// Quiet interval before a dirty digest cache is written out.
    #[serde(default = "default_digest_save_delay_ms")]
    pub digest_save_delay_ms: u64,
    /// Maximum number of cached digests.
    #[serde(default = "default_digest_capacity")]
    pub digest_capacity: usize,
    /// zlib level used for compressed payloads (0-9).
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
    /// Longest run of deltas before a full payload is stored again.
    #[serde(default = "default_max_delta_chain")]
    pub max_delta_chain: usize,
    /// Keep a `.old` copy of the previous archive image after each write.
    #[serde(default = "default_keep_rollback_copy")]
    pub keep_rollback_copy: bool,
}

fn default_cemetery_dir() -> PathBuf {
    PathBuf::from("data/cemetery")
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("data/scratch")
}

fn default_digest_snapshot_path() -> PathBuf {
    PathBuf::from("data/digests.bin")
}

fn default_digest_save_delay_ms() -> u64 {
    2000
}

fn default_digest_capacity() -> usize {
    100_000
}

fn default_compression_level() -> u32 {
    6
}

fn default_max_delta_chain() -> usize {
    32
}

fn default_keep_rollback_copy() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cemetery_dir: default_cemetery_dir(),
            scratch_dir: default_scratch_dir(),
            digest_snapshot_path: default_digest_snapshot_path(),
            digest_save_delay_ms: default_digest_save_delay_ms(),
            digest_capacity: default_digest_capacity(),
            compression_level: default_compression_level(),
            max_delta_chain: default_max_delta_chain(),
            keep_rollback_copy: default_keep_rollback_copy(),
        }
    }
}

impl EngineConfig {
    /// Configuration with every data directory placed under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            cemetery_dir: root.join("cemetery"),
            scratch_dir: root.join("scratch"),
            digest_snapshot_path: root.join("digests.bin"),
            ..Self::default()
        }
    }

    /// Load config from a JSON file, falling back to defaults if it is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config from {:?}", path))?;
        let config: EngineConfig =
            serde_json::from_str(&data).with_context(|| "Failed to parse engine config JSON")?;
        if config.compression_level > 9 {
            anyhow::bail!("compression_level must be 0-9, got {}", config.compression_level);
        }
        Ok(config)
    }

    /// Save config as pretty JSON (atomic replace).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Debounce interval for digest snapshots.
    pub fn digest_save_delay(&self) -> Duration {
        Duration::from_millis(self.digest_save_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = EngineConfig::load(&tmp.path().join("revault.json")).unwrap();
        assert_eq!(config.digest_save_delay_ms, 2000);
        assert_eq!(config.max_delta_chain, 32);
        assert!(config.keep_rollback_copy);
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("revault.json");
        let mut config = EngineConfig::rooted_at(tmp.path());
        config.digest_save_delay_ms = 50;
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.digest_save_delay_ms, 50);
        assert_eq!(loaded.cemetery_dir, tmp.path().join("cemetery"));
    }

    #[test]
    fn test_partial_file_uses_field_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("revault.json");
        fs::write(&path, r#"{ "max_delta_chain": 4 }"#).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.max_delta_chain, 4);
        assert_eq!(loaded.compression_level, 6);
    }

    #[test]
    fn test_rejects_bad_compression_level() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("revault.json");
        fs::write(&path, r#"{ "compression_level": 12 }"#).unwrap();
        assert!(EngineConfig::load(&path).is_err());
    }
}

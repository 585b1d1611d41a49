use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the AV1 batch transcoder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// Append-only completion journal shared by every instance
    pub journal_path: PathBuf,
    /// Lock registry file; the advisory lock lives next to it with a `.lock` suffix
    pub lock_registry_path: PathBuf,
    /// Inputs below this overall bit rate are recorded as skipped
    pub min_bitrate_bps: u64,
    /// Maximum age in seconds of the in-memory journal snapshot
    pub journal_refresh_secs: u64,
    /// Ignore failure records for this run (skips and successes still apply)
    pub retry_failed: bool,
    /// Path to ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// FFmpeg AV1 encoder name
    pub encoder: String,
    /// Constant rate factor passed to the encoder
    pub crf: u8,
    /// Encoder speed preset
    pub preset: u8,
    /// Opus bit rate for mono/stereo audio
    pub audio_bitrate_kbps: u32,
    /// Opus bit rate when the source carries surround audio
    pub surround_audio_bitrate_kbps: u32,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl TranscodeConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            journal_path: default_journal_path(),
            lock_registry_path: std::env::temp_dir().join("av1batch").join("locks.ndjson"),
            min_bitrate_bps: 3_000_000,
            journal_refresh_secs: 60,
            retry_failed: false,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            encoder: "libsvtav1".to_string(),
            crf: 30,
            preset: 6,
            audio_bitrate_kbps: 128,
            surround_audio_bitrate_kbps: 384,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    pub fn journal_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.journal_refresh_secs)
    }
}

/// `~/.local/share/av1batch/journal.ndjson` on Linux, falling back to the temp dir
fn default_journal_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("av1batch")
        .join("journal.ndjson")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TranscodeConfig::load_config(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(cfg.min_bitrate_bps, 3_000_000);
        assert_eq!(cfg.journal_refresh_secs, 60);
        assert!(!cfg.retry_failed);
        assert!(cfg.journal_path.ends_with("av1batch/journal.ndjson"));
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("av1batch.toml");
        std::fs::write(&path, "min_bitrate_bps = 5000000\nretry_failed = true\n").unwrap();

        let cfg = TranscodeConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.min_bitrate_bps, 5_000_000);
        assert!(cfg.retry_failed);
        assert_eq!(cfg.encoder, "libsvtav1");
        assert_eq!(cfg.crf, 30);
    }

    #[test]
    fn test_json_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("av1batch.json");
        std::fs::write(&path, r#"{"journal_path": "/srv/journal.ndjson", "journal_refresh_secs": 5}"#).unwrap();

        let cfg = TranscodeConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.journal_path, PathBuf::from("/srv/journal.ndjson"));
        assert_eq!(cfg.journal_refresh_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(TranscodeConfig::load_config(Some(&path)).is_err());
    }
}

use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::{debug, warn};
use serde::Deserialize;
use tokio::process::Command;

/// Complete ffprobe output structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeData {
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
    #[serde(default)]
    pub format: ProbeFormat,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeFormat {
    /// Overall bit rate in bits per second, as the decimal string ffprobe prints
    pub bit_rate: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeStream {
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub channels: Option<u32>,
    pub color_space: Option<String>,
    pub color_transfer: Option<String>,
    pub color_primaries: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl ProbeStream {
    pub fn is_video(&self) -> bool {
        self.codec_type.as_deref() == Some("video")
    }

    pub fn is_audio(&self) -> bool {
        self.codec_type.as_deref() == Some("audio")
    }

    pub fn is_subtitle(&self) -> bool {
        self.codec_type.as_deref() == Some("subtitle")
    }

    pub fn is_surround_audio(&self) -> bool {
        self.is_audio() && self.channels.unwrap_or(0) > 2
    }

    /// HDR10 (PQ) or HLG on a BT.2020 non-constant-luminance matrix
    pub fn is_hdr(&self) -> bool {
        self.is_video()
            && self.color_space.as_deref() == Some("bt2020nc")
            && matches!(self.color_transfer.as_deref(), Some("smpte2084") | Some("arib-std-b67"))
    }
}

impl ProbeData {
    /// Overall bit rate; `None` if ffprobe did not report a parseable value
    pub fn bit_rate_bps(&self) -> Option<u64> {
        let raw = self.format.bit_rate.as_deref()?;
        match raw.trim().parse() {
            Ok(bps) => Some(bps),
            Err(e) => {
                warn!("Failed to parse bit rate {:?}: {}", raw, e);
                None
            }
        }
    }

    pub fn video_stream(&self) -> Option<&ProbeStream> {
        self.streams.iter().find(|s| s.is_video())
    }

    pub fn has_hdr(&self) -> bool {
        self.streams.iter().any(|s| s.is_hdr())
    }

    pub fn has_surround_audio(&self) -> bool {
        self.streams.iter().any(|s| s.is_surround_audio())
    }

    pub fn has_subtitles(&self) -> bool {
        self.streams.iter().any(|s| s.is_subtitle())
    }
}

/// Source of stream properties for a media file
#[allow(async_fn_in_trait)]
pub trait MediaInspector {
    async fn inspect(&self, path: &Path) -> Result<ProbeData>;
}

/// Inspector backed by a local ffprobe binary
#[derive(Debug, Clone)]
pub struct FfprobeInspector {
    ffprobe_bin: PathBuf,
}

impl FfprobeInspector {
    pub fn new(ffprobe_bin: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe_bin: ffprobe_bin.into(),
        }
    }
}

impl MediaInspector for FfprobeInspector {
    async fn inspect(&self, path: &Path) -> Result<ProbeData> {
        if !path.exists() {
            anyhow::bail!("File does not exist: {}", path.display());
        }
        debug!("ffprobe: probing {}", path.display());

        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("quiet")
            .arg("-print_format")
            .arg("json")
            .arg("-show_format")
            .arg("-show_streams")
            .arg(path)
            .output()
            .await
            .with_context(|| format!(
                "Failed to execute ffprobe at {} for: {}",
                self.ffprobe_bin.display(),
                path.display()
            ))?;

        if !output.status.success() {
            anyhow::bail!(
                "ffprobe failed (exit code {}) for {}: {}",
                output.status.code().unwrap_or(-1),
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        parse_probe_json(&output.stdout)
            .with_context(|| format!("Failed to parse ffprobe JSON for: {}", path.display()))
    }
}

pub fn parse_probe_json(json: &[u8]) -> Result<ProbeData> {
    Ok(serde_json::from_slice(json)?)
}

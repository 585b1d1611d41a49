use std::path::{Path, PathBuf};
use std::process::Stdio;
use log::{debug, info};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::config::TranscodeConfig;
use crate::ffprobe::ProbeData;

/// Lines of encoder stderr kept for the journal
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {}: {stderr_tail}", .code.map_or("signal".to_string(), |c| format!("code {}", c)))]
    Exit {
        program: String,
        code: Option<i32>,
        stderr_tail: String,
    },
}

/// The long-running media transform
#[allow(async_fn_in_trait)]
pub trait Transformer {
    /// Full invocation, recorded in the journal for diagnostics
    fn command_line(&self, input: &Path, temp_output: &Path, probe: &ProbeData) -> Vec<String>;

    /// Produce `temp_output` from `input`; runs to completion, there is no cancellation
    async fn transform(&self, input: &Path, temp_output: &Path, probe: &ProbeData) -> Result<(), TransformError>;
}

/// AV1 encode through a local ffmpeg binary
#[derive(Debug, Clone)]
pub struct FfmpegTransformer {
    ffmpeg_bin: PathBuf,
    encoder: String,
    crf: u8,
    preset: u8,
    audio_bitrate_kbps: u32,
    surround_audio_bitrate_kbps: u32,
}

impl FfmpegTransformer {
    pub fn new(cfg: &TranscodeConfig) -> Self {
        Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            encoder: cfg.encoder.clone(),
            crf: cfg.crf,
            preset: cfg.preset,
            audio_bitrate_kbps: cfg.audio_bitrate_kbps,
            surround_audio_bitrate_kbps: cfg.surround_audio_bitrate_kbps,
        }
    }

    /// Arguments after the program name
    ///
    /// - first video stream, every audio and subtitle stream
    /// - 10-bit output with colour metadata carried over for HDR sources
    /// - Opus audio, at the surround rate when any track has more than two channels
    pub fn build_args(&self, input: &Path, temp_output: &Path, probe: &ProbeData) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-nostats".into(),
            "-i".into(),
            input.to_string_lossy().to_string(),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "0:a?".into(),
            "-map".into(),
            "0:s?".into(),
            "-c:v".into(),
            self.encoder.clone(),
            "-crf".into(),
            self.crf.to_string(),
            "-preset".into(),
            self.preset.to_string(),
        ];

        if probe.has_hdr() {
            args.extend(["-pix_fmt".into(), "yuv420p10le".into()]);
            if let Some(video) = probe.video_stream() {
                if let Some(primaries) = &video.color_primaries {
                    args.extend(["-color_primaries".into(), primaries.clone()]);
                }
                if let Some(transfer) = &video.color_transfer {
                    args.extend(["-color_trc".into(), transfer.clone()]);
                }
                if let Some(space) = &video.color_space {
                    args.extend(["-colorspace".into(), space.clone()]);
                }
            }
        } else {
            args.extend(["-pix_fmt".into(), "yuv420p".into()]);
        }

        let audio_kbps = if probe.has_surround_audio() {
            // libopus rejects some 5.1(side) layouts without an explicit mapping family
            args.extend(["-mapping_family".into(), "1".into()]);
            self.surround_audio_bitrate_kbps
        } else {
            self.audio_bitrate_kbps
        };
        args.extend([
            "-c:a".into(),
            "libopus".into(),
            "-b:a".into(),
            format!("{}k", audio_kbps),
        ]);

        if probe.has_subtitles() {
            args.extend(["-c:s".into(), "copy".into()]);
        }

        args.extend(["-y".into(), temp_output.to_string_lossy().to_string()]);
        args
    }
}

impl Transformer for FfmpegTransformer {
    fn command_line(&self, input: &Path, temp_output: &Path, probe: &ProbeData) -> Vec<String> {
        let mut cmd = vec![self.ffmpeg_bin.to_string_lossy().to_string()];
        cmd.extend(self.build_args(input, temp_output, probe));
        cmd
    }

    async fn transform(&self, input: &Path, temp_output: &Path, probe: &ProbeData) -> Result<(), TransformError> {
        let program = self.ffmpeg_bin.to_string_lossy().to_string();
        let args = self.build_args(input, temp_output, probe);
        debug!("Executing: {} {}", program, args.join(" "));

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| TransformError::Spawn {
                program: program.clone(),
                source,
            })?;

        // Keep only the tail of stderr; ffmpeg progress output is unbounded
        let mut tail = std::collections::VecDeque::with_capacity(STDERR_TAIL_LINES);
        if let Some(stderr) = child.stderr.take() {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(String::from_utf8_lossy(&buf).trim_end().to_string());
                    }
                }
            }
        }

        let status = child.wait().await.map_err(|source| TransformError::Spawn {
            program: program.clone(),
            source,
        })?;

        if !status.success() {
            return Err(TransformError::Exit {
                program,
                code: status.code(),
                stderr_tail: tail.into_iter().collect::<Vec<_>>().join("\n"),
            });
        }

        info!("ffmpeg finished: {}", temp_output.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffprobe::{parse_probe_json, ProbeStream};

    fn transformer() -> FfmpegTransformer {
        FfmpegTransformer::new(&TranscodeConfig::default_config())
    }

    fn sdr_stereo() -> ProbeData {
        ProbeData {
            streams: vec![
                ProbeStream {
                    codec_type: Some("video".to_string()),
                    color_space: Some("bt709".to_string()),
                    ..Default::default()
                },
                ProbeStream {
                    codec_type: Some("audio".to_string()),
                    channels: Some(2),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(|s| s.as_str())
    }

    #[test]
    fn test_sdr_stereo_args() {
        let args = transformer().build_args(Path::new("/m/in.mp4"), Path::new("/m/in.av1.partial.mkv"), &sdr_stereo());
        assert_eq!(value_after(&args, "-i"), Some("/m/in.mp4"));
        assert_eq!(value_after(&args, "-c:v"), Some("libsvtav1"));
        assert_eq!(value_after(&args, "-crf"), Some("30"));
        assert_eq!(value_after(&args, "-pix_fmt"), Some("yuv420p"));
        assert_eq!(value_after(&args, "-b:a"), Some("128k"));
        assert!(!args.contains(&"-c:s".to_string()));
        assert!(!args.contains(&"-mapping_family".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/m/in.av1.partial.mkv"));
    }

    #[test]
    fn test_hdr_surround_subtitled_args() {
        let probe = parse_probe_json(br#"{"streams": [
            {"codec_type": "video", "color_space": "bt2020nc", "color_transfer": "smpte2084", "color_primaries": "bt2020"},
            {"codec_type": "audio", "channels": 6},
            {"codec_type": "subtitle"}
        ], "format": {"bit_rate": "20000000"}}"#).unwrap();
        let args = transformer().build_args(Path::new("/m/in.mkv"), Path::new("/m/in.av1.partial.mkv"), &probe);

        assert_eq!(value_after(&args, "-pix_fmt"), Some("yuv420p10le"));
        assert_eq!(value_after(&args, "-color_trc"), Some("smpte2084"));
        assert_eq!(value_after(&args, "-color_primaries"), Some("bt2020"));
        assert_eq!(value_after(&args, "-colorspace"), Some("bt2020nc"));
        assert_eq!(value_after(&args, "-b:a"), Some("384k"));
        assert_eq!(value_after(&args, "-mapping_family"), Some("1"));
        assert_eq!(value_after(&args, "-c:s"), Some("copy"));
    }

    #[test]
    fn test_command_line_starts_with_program() {
        let cmd = transformer().command_line(Path::new("/m/a.mp4"), Path::new("/m/a.av1.partial.mkv"), &sdr_stereo());
        assert_eq!(cmd[0], "ffmpeg");
        assert_eq!(&cmd[1..], transformer().build_args(Path::new("/m/a.mp4"), Path::new("/m/a.av1.partial.mkv"), &sdr_stereo()).as_slice());
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let mut cfg = TranscodeConfig::default_config();
        cfg.ffmpeg_bin = PathBuf::from("/nonexistent/ffmpeg");
        let result = FfmpegTransformer::new(&cfg)
            .transform(Path::new("/m/a.mp4"), Path::new("/m/a.av1.partial.mkv"), &sdr_stereo())
            .await;
        assert!(matches!(result, Err(TransformError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_exit_error() {
        let mut cfg = TranscodeConfig::default_config();
        cfg.ffmpeg_bin = PathBuf::from("false");
        let result = FfmpegTransformer::new(&cfg)
            .transform(Path::new("/m/a.mp4"), Path::new("/m/a.av1.partial.mkv"), &sdr_stereo())
            .await;
        match result {
            Err(TransformError::Exit { code, .. }) => assert_eq!(code, Some(1)),
            other => panic!("expected exit error, got {:?}", other),
        }
    }
}

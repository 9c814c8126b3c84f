//! Source media probing with ffprobe

use crate::gpu_env::EnvMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe ran but rejected the file.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    #[error("Failed to run ffprobe: {0}")]
    Io(#[from] std::io::Error),
}

/// What the encoder plan needs to know about a source.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MediaInfo {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Video stream bitrate; falls back to the container rate minus audio
    pub video_kbps: Option<f64>,
    pub audio_kbps: Option<f64>,
    pub duration_secs: Option<f64>,
    pub video_codec: Option<String>,
    pub has_video: bool,
    pub has_audio: bool,
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub bit_rate: Option<String>,
        pub duration: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub bit_rate: Option<String>,
    }
}

/// Run `ffprobe -v quiet -print_format json -show_streams -show_format <path>`.
pub async fn probe_media(ffprobe: &str, path: &Path, env: &EnvMap) -> Result<MediaInfo, ProbeError> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(path)
        .env_clear()
        .envs(env)
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let info = parse_ffprobe_output(&stdout)?;
    debug!(path = %path.display(), ?info, "Probed source");
    Ok(info)
}

fn kbps(raw: Option<&String>) -> Option<f64> {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|bps| bps.is_finite() && *bps > 0.0)
        .map(|bps| bps / 1000.0)
}

fn seconds(raw: Option<&String>) -> Option<f64> {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
}

/// Parses ffprobe JSON output. Only the first video and audio streams count.
pub fn parse_ffprobe_output(json_str: &str) -> Result<MediaInfo, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let video = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let audio = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    let duration_secs = seconds(format.duration.as_ref())
        .or_else(|| video.and_then(|v| seconds(v.duration.as_ref())));
    let audio_kbps = audio.and_then(|a| kbps(a.bit_rate.as_ref()));

    // MKV sources often carry no per-stream bitrate
    let video_kbps = video.and_then(|v| kbps(v.bit_rate.as_ref())).or_else(|| {
        video?;
        let total = kbps(format.bit_rate.as_ref())?;
        let remainder = total - audio_kbps.unwrap_or(0.0);
        (remainder > 0.0).then_some(remainder)
    });

    Ok(MediaInfo {
        width: video.and_then(|v| v.width).filter(|w| *w > 0),
        height: video.and_then(|v| v.height).filter(|h| *h > 0),
        video_kbps,
        audio_kbps,
        duration_secs,
        video_codec: video.and_then(|v| v.codec_name.clone()),
        has_video: video.is_some(),
        has_audio: audio.is_some(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ffprobe_output_basic() {
        let json = r#"{
            "streams": [
                {
                    "codec_type": "video",
                    "codec_name": "h264",
                    "width": 1920,
                    "height": 1080,
                    "bit_rate": "8000000"
                },
                {
                    "codec_type": "audio",
                    "codec_name": "aac",
                    "bit_rate": "128000"
                }
            ],
            "format": {
                "duration": "120.5",
                "bit_rate": "8200000"
            }
        }"#;

        let info = parse_ffprobe_output(json).expect("Should parse valid JSON");
        assert_eq!(info.width, Some(1920));
        assert_eq!(info.height, Some(1080));
        assert_eq!(info.video_kbps, Some(8000.0));
        assert_eq!(info.audio_kbps, Some(128.0));
        assert_eq!(info.duration_secs, Some(120.5));
        assert_eq!(info.video_codec.as_deref(), Some("h264"));
        assert!(info.has_video && info.has_audio);
    }

    #[test]
    fn test_video_bitrate_from_container() {
        let json = r#"{
            "streams": [
                {"codec_type": "video", "codec_name": "hevc", "width": 3840, "height": 2160},
                {"codec_type": "audio", "codec_name": "opus", "bit_rate": "160000"}
            ],
            "format": {"duration": "60.0", "bit_rate": "12160000"}
        }"#;

        let info = parse_ffprobe_output(json).unwrap();
        assert!((info.video_kbps.unwrap() - 12000.0).abs() < 1e-6);
    }

    #[test]
    fn test_audio_only_source() {
        let json = r#"{
            "streams": [{"codec_type": "audio", "codec_name": "mp3", "bit_rate": "320000"}],
            "format": {"duration": "200.0", "bit_rate": "320000"}
        }"#;

        let info = parse_ffprobe_output(json).unwrap();
        assert!(!info.has_video);
        assert_eq!(info.width, None);
        assert_eq!(info.video_kbps, None);
        assert_eq!(info.audio_kbps, Some(320.0));
    }

    #[test]
    fn test_missing_optional_fields() {
        let json = r#"{
            "streams": [{"codec_type": "video", "codec_name": "vp9", "duration": "12.0"}],
            "format": {"duration": "N/A"}
        }"#;

        let info = parse_ffprobe_output(json).unwrap();
        assert_eq!(info.width, None);
        assert_eq!(info.height, None);
        assert_eq!(info.video_kbps, None);
        assert_eq!(info.duration_secs, Some(12.0));
    }

    #[test]
    fn test_missing_format_is_error() {
        let result = parse_ffprobe_output(r#"{"streams": []}"#);
        assert!(matches!(result, Err(ProbeError::ParseError(_))));
    }

    #[test]
    fn test_garbage_is_error() {
        assert!(matches!(
            parse_ffprobe_output("not json"),
            Err(ProbeError::ParseError(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let result = probe_media(
            "/nonexistent/ffprobe-sizecap",
            Path::new("/tmp/none.mp4"),
            &EnvMap::new(),
        )
        .await;
        assert!(matches!(result, Err(ProbeError::Io(_))));
    }
}

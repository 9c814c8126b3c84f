//! Per-job encode planning
//!
//! Turns a request, the probed source and the cached hardware profile into
//! concrete encoder settings: bitrate budget, scaling, encoder choice and
//! output location.

use super::EncodeError;
use crate::hardware::{CodecFamily, HardwareProfile};
use crate::job::{AudioCodec, CompressRequest, Container, Preset, TrimWindow, Tune, ValidationError, VideoCodec};
use crate::probe::MediaInfo;
use crate::resolution::{self, PlanRequest};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// kbit per MB of target size (MiB × 8)
const KBIT_PER_MB: f64 = 8192.0;

/// Video bitrate never drops below this, however small the target
pub const MIN_VIDEO_KBPS: f64 = 64.0;

/// Audio-only outputs never drop below this
pub const MIN_AUDIO_KBPS: u32 = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct VideoPlan {
    /// ffmpeg encoder name actually used
    pub encoder: String,
    pub family: CodecFamily,
    pub bitrate_kbps: f64,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub preset: Preset,
    pub tune: Tune,
    pub hw_decode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioPlan {
    pub codec: AudioCodec,
    pub bitrate_kbps: u32,
}

/// Everything needed to build the encoder command line
#[derive(Debug, Clone, PartialEq)]
pub struct EncodePlan {
    pub input: PathBuf,
    pub output: PathBuf,
    pub trim: TrimWindow,
    /// Length of the encoded span
    pub duration_secs: f64,
    pub total_kbps: f64,
    /// `None` for audio-only output
    pub video: Option<VideoPlan>,
    pub audio: Option<AudioPlan>,
    pub container: Container,
    /// Fragmented MP4 instead of a faststart rewrite
    pub fragmented_mp4: bool,
}

/// Host-side inputs to planning
#[derive(Debug, Clone, Copy)]
pub struct PlanContext<'a> {
    pub hardware: &'a HardwareProfile,
    pub outputs_dir: &'a Path,
    pub default_min_height: u32,
}

/// Where an upload lives: `<uploads_dir>/<job_id>/<filename>`.
///
/// Only the final component of `filename` is used.
pub fn source_path(uploads_dir: &Path, request: &CompressRequest) -> Result<PathBuf, ValidationError> {
    let name = Path::new(&request.filename)
        .file_name()
        .ok_or(ValidationError::Filename)?;
    let job_dir = Path::new(&request.job_id)
        .file_name()
        .ok_or(ValidationError::Filename)?;
    Ok(uploads_dir.join(job_dir).join(name))
}

/// Pick the encoder to run for `requested` on this host
pub fn choose_encoder(requested: VideoCodec, hardware: &HardwareProfile) -> String {
    if requested.is_software() || hardware.supports(requested.as_str()) {
        return requested.as_str().to_string();
    }
    let fallback = hardware.encoder_for(requested.family());
    warn!(
        requested = %requested,
        fallback,
        hardware = %hardware.hw_type,
        "Requested encoder unavailable, falling back"
    );
    fallback.to_string()
}

impl EncodePlan {
    pub fn build(
        task_id: &str,
        request: &CompressRequest,
        input: PathBuf,
        media: &MediaInfo,
        ctx: PlanContext<'_>,
    ) -> Result<Self, EncodeError> {
        let trim = request.trim_window()?;
        let source_duration = media.duration_secs.ok_or(EncodeError::NoDuration)?;
        let duration_secs = trim.effective_duration(source_duration);
        if duration_secs <= 0.0 {
            return Err(EncodeError::NoDuration);
        }

        let total_kbps = request.target_size_mb * KBIT_PER_MB / duration_secs;

        if request.audio_only {
            return Self::build_audio_only(task_id, request, input, media, ctx, trim, duration_secs, total_kbps);
        }
        if !media.has_video {
            return Err(EncodeError::MissingStream("video"));
        }

        let audio = match request.audio_codec {
            AudioCodec::None => None,
            _ if !media.has_audio => None,
            codec => Some(AudioPlan {
                codec,
                bitrate_kbps: request.audio_bitrate_kbps,
            }),
        };
        let audio_kbps = audio.map(|a| f64::from(a.bitrate_kbps)).unwrap_or(0.0);
        let video_kbps = (total_kbps - audio_kbps).max(MIN_VIDEO_KBPS);

        let (max_width, max_height) = if request.max_width.is_some() || request.max_height.is_some() {
            (request.max_width, request.max_height)
        } else if request.auto_resolution {
            let min_height = request.min_auto_resolution.unwrap_or(ctx.default_min_height);
            let decision = resolution::plan(
                &PlanRequest::new(media.width, media.height, video_kbps)
                    .with_orig_video_kbps(media.video_kbps)
                    .with_min_height(min_height)
                    .with_explicit_height(request.target_resolution),
            );
            (decision.max_width, decision.max_height)
        } else {
            (None, None)
        };

        let encoder = choose_encoder(request.video_codec, ctx.hardware);
        let output = ctx
            .outputs_dir
            .join(format!("{}.{}", task_id, request.container.as_str()));

        info!(
            task_id,
            encoder = %encoder,
            video_kbps = video_kbps.round(),
            audio_kbps,
            max_height = ?max_height,
            duration_secs,
            "Encode planned"
        );

        Ok(Self {
            input,
            output,
            trim,
            duration_secs,
            total_kbps,
            video: Some(VideoPlan {
                encoder,
                family: request.video_codec.family(),
                bitrate_kbps: video_kbps,
                max_width,
                max_height,
                preset: request.preset,
                tune: request.tune,
                hw_decode: request.force_hw_decode,
            }),
            audio,
            container: request.container,
            fragmented_mp4: request.fast_mp4_finalize && request.container == Container::Mp4,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_audio_only(
        task_id: &str,
        request: &CompressRequest,
        input: PathBuf,
        media: &MediaInfo,
        ctx: PlanContext<'_>,
        trim: TrimWindow,
        duration_secs: f64,
        total_kbps: f64,
    ) -> Result<Self, EncodeError> {
        if !media.has_audio {
            return Err(EncodeError::MissingStream("audio"));
        }
        let codec = match request.audio_codec {
            AudioCodec::None => AudioCodec::Aac,
            codec => codec,
        };
        let budget = total_kbps.floor().max(0.0) as u32;
        let bitrate_kbps = request.audio_bitrate_kbps.min(budget).max(MIN_AUDIO_KBPS);

        info!(task_id, audio_kbps = bitrate_kbps, duration_secs, "Audio-only encode planned");

        Ok(Self {
            input,
            output: ctx.outputs_dir.join(format!("{}.m4a", task_id)),
            trim,
            duration_secs,
            total_kbps,
            video: None,
            audio: Some(AudioPlan {
                codec,
                bitrate_kbps,
            }),
            container: Container::Mp4,
            fragmented_mp4: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::HardwareType;
    use std::collections::BTreeMap;

    fn media(width: u32, height: u32, video_kbps: f64, duration: f64) -> MediaInfo {
        MediaInfo {
            width: Some(width),
            height: Some(height),
            video_kbps: Some(video_kbps),
            audio_kbps: Some(128.0),
            duration_secs: Some(duration),
            video_codec: Some("h264".to_string()),
            has_video: true,
            has_audio: true,
        }
    }

    fn nvidia() -> HardwareProfile {
        let mut available_encoders = BTreeMap::new();
        available_encoders.insert(CodecFamily::H264, "h264_nvenc".to_string());
        available_encoders.insert(CodecFamily::Hevc, "hevc_nvenc".to_string());
        available_encoders.insert(CodecFamily::Av1, "av1_nvenc".to_string());
        HardwareProfile {
            hw_type: HardwareType::Nvidia,
            available_encoders,
        }
    }

    fn build(request: &CompressRequest, media: &MediaInfo, hardware: &HardwareProfile) -> Result<EncodePlan, EncodeError> {
        EncodePlan::build(
            "t1",
            request,
            PathBuf::from("/in/clip.mp4"),
            media,
            PlanContext {
                hardware,
                outputs_dir: Path::new("/out"),
                default_min_height: 240,
            },
        )
    }

    #[test]
    fn test_bitrate_budget() {
        // 10 MB over 80 s = 1024 kbps total, 128 for audio
        let request = CompressRequest::new("u", "clip.mp4", 10.0);
        let plan = build(&request, &media(1920, 1080, 8000.0, 80.0), &nvidia()).unwrap();

        assert!((plan.total_kbps - 1024.0).abs() < 1e-9);
        let video = plan.video.unwrap();
        assert!((video.bitrate_kbps - 896.0).abs() < 1e-9);
        assert_eq!(plan.audio.unwrap().bitrate_kbps, 128);
        assert_eq!(plan.output, PathBuf::from("/out/t1.mp4"));
        assert_eq!(video.max_height, None);
    }

    #[test]
    fn test_video_bitrate_floor() {
        let request = CompressRequest::new("u", "clip.mp4", 0.5);
        let plan = build(&request, &media(1920, 1080, 8000.0, 3600.0), &nvidia()).unwrap();
        assert_eq!(plan.video.unwrap().bitrate_kbps, MIN_VIDEO_KBPS);
    }

    #[test]
    fn test_trim_shortens_duration() {
        let mut request = CompressRequest::new("u", "clip.mp4", 10.0);
        request.start_time = Some("00:00:20".to_string());
        request.end_time = Some("60".to_string());
        let plan = build(&request, &media(1280, 720, 3000.0, 600.0), &nvidia()).unwrap();

        assert_eq!(plan.duration_secs, 40.0);
        assert!((plan.total_kbps - 2048.0).abs() < 1e-9);
    }

    #[test]
    fn test_trim_past_end_is_rejected() {
        let mut request = CompressRequest::new("u", "clip.mp4", 10.0);
        request.start_time = Some("700".to_string());
        let result = build(&request, &media(1280, 720, 3000.0, 600.0), &nvidia());
        assert!(matches!(result, Err(EncodeError::NoDuration)));
    }

    #[test]
    fn test_explicit_dimensions_used_verbatim() {
        let mut request = CompressRequest::new("u", "clip.mp4", 10.0);
        request.max_width = Some(1280);
        request.auto_resolution = true;
        let plan = build(&request, &media(1920, 1080, 8000.0, 80.0), &nvidia()).unwrap();
        let video = plan.video.unwrap();
        assert_eq!(video.max_width, Some(1280));
        assert_eq!(video.max_height, None);
    }

    #[test]
    fn test_auto_resolution_consults_planner() {
        // ~300 kbps of video for 1080p starves it
        let mut request = CompressRequest::new("u", "clip.mp4", 2.5);
        request.audio_codec = AudioCodec::None;
        request.auto_resolution = true;
        let plan = build(&request, &media(1920, 1080, 8000.0, 68.0), &nvidia()).unwrap();
        let height = plan.video.unwrap().max_height.unwrap();
        assert!(height < 1080 && height >= 240);
    }

    #[test]
    fn test_auto_resolution_explicit_target() {
        let mut request = CompressRequest::new("u", "clip.mp4", 50.0);
        request.auto_resolution = true;
        request.target_resolution = Some(480);
        let plan = build(&request, &media(1920, 1080, 8000.0, 60.0), &nvidia()).unwrap();
        assert_eq!(plan.video.unwrap().max_height, Some(480));
    }

    #[test]
    fn test_unavailable_encoder_falls_back() {
        let mut request = CompressRequest::new("u", "clip.mp4", 10.0);
        request.video_codec = VideoCodec::HevcQsv;
        let plan = build(&request, &media(1920, 1080, 8000.0, 80.0), &nvidia()).unwrap();
        assert_eq!(plan.video.unwrap().encoder, "hevc_nvenc");

        request.video_codec = VideoCodec::Av1Nvenc;
        let plan = build(&request, &media(1920, 1080, 8000.0, 80.0), &HardwareProfile::cpu()).unwrap();
        assert_eq!(plan.video.unwrap().encoder, "libaom-av1");
    }

    #[test]
    fn test_software_encoder_kept() {
        let mut request = CompressRequest::new("u", "clip.mp4", 10.0);
        request.video_codec = VideoCodec::Libsvtav1;
        let plan = build(&request, &media(1920, 1080, 8000.0, 80.0), &HardwareProfile::cpu()).unwrap();
        assert_eq!(plan.video.unwrap().encoder, "libsvtav1");
    }

    #[test]
    fn test_no_audio_stream_gives_full_budget_to_video() {
        let request = CompressRequest::new("u", "clip.mp4", 10.0);
        let mut source = media(1920, 1080, 8000.0, 80.0);
        source.has_audio = false;
        let plan = build(&request, &source, &nvidia()).unwrap();
        assert!(plan.audio.is_none());
        assert!((plan.video.unwrap().bitrate_kbps - 1024.0).abs() < 1e-9);
    }

    #[test]
    fn test_audio_only_plan() {
        let mut request = CompressRequest::new("u", "song.mp4", 1.0);
        request.audio_only = true;
        request.audio_codec = AudioCodec::None;
        // 1 MB over 100 s = 81.92 kbps budget
        let plan = build(&request, &media(1920, 1080, 8000.0, 100.0), &nvidia()).unwrap();

        assert!(plan.video.is_none());
        assert_eq!(plan.output, PathBuf::from("/out/t1.m4a"));
        let audio = plan.audio.unwrap();
        assert_eq!(audio.codec, AudioCodec::Aac);
        assert_eq!(audio.bitrate_kbps, 81);
    }

    #[test]
    fn test_fragmented_only_for_mp4() {
        let mut request = CompressRequest::new("u", "clip.mp4", 10.0);
        request.fast_mp4_finalize = true;
        let plan = build(&request, &media(1920, 1080, 8000.0, 80.0), &nvidia()).unwrap();
        assert!(plan.fragmented_mp4);

        request.container = Container::Mkv;
        let plan = build(&request, &media(1920, 1080, 8000.0, 80.0), &nvidia()).unwrap();
        assert!(!plan.fragmented_mp4);
        assert_eq!(plan.output, PathBuf::from("/out/t1.mkv"));
    }

    #[test]
    fn test_source_path_strips_directories() {
        let mut request = CompressRequest::new("abc", "../../etc/passwd", 1.0);
        let path = source_path(Path::new("/up"), &request).unwrap();
        assert_eq!(path, PathBuf::from("/up/abc/passwd"));

        request.filename = "..".to_string();
        assert!(source_path(Path::new("/up"), &request).is_err());
    }

    #[test]
    fn test_missing_duration() {
        let request = CompressRequest::new("u", "clip.mp4", 10.0);
        let mut source = media(1920, 1080, 8000.0, 80.0);
        source.duration_secs = None;
        assert!(matches!(build(&request, &source, &nvidia()), Err(EncodeError::NoDuration)));
    }
}

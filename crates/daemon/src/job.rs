//! Compression requests and job records
//!
//! A [`JobRecord`] moves through `queued → running → {completed|failed|canceled}`
//! (or directly `queued → canceled`). The transition methods here are the only
//! way records change state; they reject anything that would leave a terminal
//! state so the manager can log and ignore duplicate calls.

use crate::hardware::CodecFamily;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Progress fraction below which no completion estimate is made
const MIN_ETA_FRACTION: f64 = 0.001;

/// Rejected compression request
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("target_size_mb must be a positive number, got {0}")]
    TargetSize(f64),

    #[error("audio_bitrate_kbps must be positive when audio is encoded")]
    AudioBitrate,

    #[error("unknown {field}: {value}")]
    UnknownVariant { field: &'static str, value: String },

    #[error("invalid {field}: {value:?} (expected seconds or HH:MM:SS)")]
    TimeFormat { field: &'static str, value: String },

    #[error("end_time ({end}s) must be after start_time ({start}s)")]
    TrimWindow { start: f64, end: f64 },

    #[error("{0} must be positive")]
    Dimension(&'static str),

    #[error("filename must not be empty")]
    Filename,
}

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $field:literal { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ValidationError::UnknownVariant {
                        field: $field,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum! {
    /// Encoder requested for the video stream
    VideoCodec, "video_codec" {
        Av1Nvenc => "av1_nvenc",
        HevcNvenc => "hevc_nvenc",
        H264Nvenc => "h264_nvenc",
        Libx264 => "libx264",
        Libx265 => "libx265",
        Libsvtav1 => "libsvtav1",
        LibaomAv1 => "libaom-av1",
        H264Qsv => "h264_qsv",
        HevcQsv => "hevc_qsv",
        Av1Qsv => "av1_qsv",
        H264Vaapi => "h264_vaapi",
        HevcVaapi => "hevc_vaapi",
        Av1Vaapi => "av1_vaapi",
        H264Videotoolbox => "h264_videotoolbox",
        HevcVideotoolbox => "hevc_videotoolbox",
    }
}

impl VideoCodec {
    pub fn family(&self) -> CodecFamily {
        match self {
            VideoCodec::H264Nvenc
            | VideoCodec::Libx264
            | VideoCodec::H264Qsv
            | VideoCodec::H264Vaapi
            | VideoCodec::H264Videotoolbox => CodecFamily::H264,
            VideoCodec::HevcNvenc
            | VideoCodec::Libx265
            | VideoCodec::HevcQsv
            | VideoCodec::HevcVaapi
            | VideoCodec::HevcVideotoolbox => CodecFamily::Hevc,
            VideoCodec::Av1Nvenc
            | VideoCodec::Libsvtav1
            | VideoCodec::LibaomAv1
            | VideoCodec::Av1Qsv
            | VideoCodec::Av1Vaapi => CodecFamily::Av1,
        }
    }

    pub fn is_software(&self) -> bool {
        matches!(
            self,
            VideoCodec::Libx264 | VideoCodec::Libx265 | VideoCodec::Libsvtav1 | VideoCodec::LibaomAv1
        )
    }
}

string_enum! {
    AudioCodec, "audio_codec" {
        Libopus => "libopus",
        Aac => "aac",
        None => "none",
    }
}

string_enum! {
    /// Speed/quality preset, named after the NVENC scale
    Preset, "preset" {
        P1 => "p1",
        P2 => "p2",
        P3 => "p3",
        P4 => "p4",
        P5 => "p5",
        P6 => "p6",
        P7 => "p7",
        ExtraQuality => "extraquality",
    }
}

string_enum! {
    Container, "container" {
        Mp4 => "mp4",
        Mkv => "mkv",
    }
}

string_enum! {
    Tune, "tune" {
        Hq => "hq",
        Ll => "ll",
        Ull => "ull",
        Lossless => "lossless",
    }
}

fn default_video_codec() -> VideoCodec {
    VideoCodec::Av1Nvenc
}

fn default_audio_codec() -> AudioCodec {
    AudioCodec::Libopus
}

fn default_audio_bitrate() -> u32 {
    128
}

fn default_preset() -> Preset {
    Preset::P6
}

fn default_container() -> Container {
    Container::Mp4
}

fn default_tune() -> Tune {
    Tune::Hq
}

/// Compression request as submitted by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressRequest {
    /// Upload the request refers to
    pub job_id: String,
    pub filename: String,
    pub target_size_mb: f64,
    #[serde(default = "default_video_codec")]
    pub video_codec: VideoCodec,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: AudioCodec,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate_kbps: u32,
    #[serde(default = "default_preset")]
    pub preset: Preset,
    #[serde(default = "default_container")]
    pub container: Container,
    #[serde(default = "default_tune")]
    pub tune: Tune,
    #[serde(default)]
    pub max_width: Option<u32>,
    #[serde(default)]
    pub max_height: Option<u32>,
    /// Seconds (`"12.5"`) or `HH:MM:SS`
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub force_hw_decode: bool,
    /// Fragmented MP4 output, skipping the faststart rewrite
    #[serde(default)]
    pub fast_mp4_finalize: bool,
    #[serde(default)]
    pub auto_resolution: bool,
    #[serde(default)]
    pub min_auto_resolution: Option<u32>,
    /// Explicit target height; overrides the automatic choice
    #[serde(default)]
    pub target_resolution: Option<u32>,
    #[serde(default)]
    pub audio_only: bool,
}

impl CompressRequest {
    /// Request with defaults for everything but the identity and size
    pub fn new(job_id: impl Into<String>, filename: impl Into<String>, target_size_mb: f64) -> Self {
        Self {
            job_id: job_id.into(),
            filename: filename.into(),
            target_size_mb,
            video_codec: default_video_codec(),
            audio_codec: default_audio_codec(),
            audio_bitrate_kbps: default_audio_bitrate(),
            preset: default_preset(),
            container: default_container(),
            tune: default_tune(),
            max_width: None,
            max_height: None,
            start_time: None,
            end_time: None,
            force_hw_decode: false,
            fast_mp4_finalize: false,
            auto_resolution: false,
            min_auto_resolution: None,
            target_resolution: None,
            audio_only: false,
        }
    }

    /// Check everything the type system does not
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(self.target_size_mb.is_finite() && self.target_size_mb > 0.0) {
            return Err(ValidationError::TargetSize(self.target_size_mb));
        }
        if self.filename.trim().is_empty() {
            return Err(ValidationError::Filename);
        }
        if self.audio_codec != AudioCodec::None && self.audio_bitrate_kbps == 0 {
            return Err(ValidationError::AudioBitrate);
        }
        for (name, value) in [
            ("max_width", self.max_width),
            ("max_height", self.max_height),
            ("min_auto_resolution", self.min_auto_resolution),
            ("target_resolution", self.target_resolution),
        ] {
            if value == Some(0) {
                return Err(ValidationError::Dimension(name));
            }
        }
        self.trim_window()?;
        Ok(())
    }

    /// Parsed trim window
    pub fn trim_window(&self) -> Result<TrimWindow, ValidationError> {
        let start = self
            .start_time
            .as_deref()
            .map(|s| parse_timestamp("start_time", s))
            .transpose()?;
        let end = self
            .end_time
            .as_deref()
            .map(|s| parse_timestamp("end_time", s))
            .transpose()?;

        if let (Some(start), Some(end)) = (start, end) {
            if end <= start {
                return Err(ValidationError::TrimWindow { start, end });
            }
        }
        Ok(TrimWindow { start, end })
    }
}

/// Optional cut of the source, in seconds
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrimWindow {
    pub start: Option<f64>,
    pub end: Option<f64>,
}

impl TrimWindow {
    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Length of the encoded span for a source of `duration` seconds
    pub fn effective_duration(&self, duration: f64) -> f64 {
        let start = self.start.unwrap_or(0.0).clamp(0.0, duration);
        let end = self.end.unwrap_or(duration).clamp(start, duration);
        end - start
    }
}

/// Parse `"90"`, `"90.5"`, `"01:30"` or `"00:01:30.5"` into seconds
pub fn parse_timestamp(field: &'static str, raw: &str) -> Result<f64, ValidationError> {
    let bad = || ValidationError::TimeFormat {
        field,
        value: raw.to_string(),
    };
    let trimmed = raw.trim();
    let parts: Vec<&str> = trimmed.split(':').collect();
    if trimmed.is_empty() || parts.len() > 3 {
        return Err(bad());
    }

    let mut seconds = 0.0;
    for (i, part) in parts.iter().enumerate() {
        let is_last = i == parts.len() - 1;
        let value: f64 = if is_last {
            part.parse().map_err(|_| bad())?
        } else {
            f64::from(part.parse::<u32>().map_err(|_| bad())?)
        };
        if !value.is_finite() || value < 0.0 {
            return Err(bad());
        }
        if parts.len() > 1 && i > 0 && value >= 60.0 {
            return Err(bad());
        }
        seconds = seconds * 60.0 + value;
    }
    Ok(seconds)
}

/// Coarse job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage within a job's lifetime, finer than [`JobState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Queued,
    Encoding,
    Finalizing,
    Done,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Queued => write!(f, "queued"),
            JobPhase::Encoding => write!(f, "encoding"),
            JobPhase::Finalizing => write!(f, "finalizing"),
            JobPhase::Done => write!(f, "done"),
        }
    }
}

/// A rejected state change
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("job is already {0}")]
    AlreadyTerminal(JobState),

    #[error("cannot move job from {from} to {to}")]
    Invalid { from: JobState, to: JobState },
}

/// What happened to a progress sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressUpdate {
    Applied { progress: f64 },
    /// Lower than the current value; dropped
    Stale { current: f64 },
    NotRunning(JobState),
}

/// One compression attempt. Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub task_id: String,
    pub job_id: String,
    pub filename: String,
    pub target_size_mb: f64,
    pub video_codec: VideoCodec,
    pub state: JobState,
    pub phase: JobPhase,
    pub progress: f64,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
    pub output_path: Option<PathBuf>,
    pub final_size_mb: Option<f64>,
    pub last_progress_update: Option<i64>,
    pub estimated_completion_time: Option<i64>,
}

impl JobRecord {
    pub fn new(task_id: String, request: &CompressRequest, now_ms: i64) -> Self {
        Self {
            task_id,
            job_id: request.job_id.clone(),
            filename: request.filename.clone(),
            target_size_mb: request.target_size_mb,
            video_codec: request.video_codec,
            state: JobState::Queued,
            phase: JobPhase::Queued,
            progress: 0.0,
            created_at: now_ms,
            started_at: None,
            completed_at: None,
            error: None,
            output_path: None,
            final_size_mb: None,
            last_progress_update: None,
            estimated_completion_time: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    fn guard(&self, to: JobState) -> Result<(), TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(self.state));
        }
        let allowed = match (self.state, to) {
            (JobState::Queued, JobState::Running) => true,
            (JobState::Queued, JobState::Canceled) => true,
            (JobState::Running, s) => s.is_terminal(),
            _ => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(TransitionError::Invalid {
                from: self.state,
                to,
            })
        }
    }

    /// `queued → running`
    pub fn start(&mut self, now_ms: i64) -> Result<(), TransitionError> {
        self.guard(JobState::Running)?;
        self.state = JobState::Running;
        self.phase = JobPhase::Encoding;
        self.started_at = Some(now_ms);
        Ok(())
    }

    /// Apply a progress sample in percent; clamped to [0, 100]
    pub fn record_progress(&mut self, percent: f64, now_ms: i64) -> ProgressUpdate {
        if self.state != JobState::Running {
            return ProgressUpdate::NotRunning(self.state);
        }
        let percent = if percent.is_nan() { 0.0 } else { percent.clamp(0.0, 100.0) };
        if percent < self.progress {
            return ProgressUpdate::Stale {
                current: self.progress,
            };
        }

        self.progress = percent;
        self.last_progress_update = Some(now_ms);
        self.estimated_completion_time = self
            .started_at
            .and_then(|started| estimate_completion(started, now_ms, percent / 100.0));
        ProgressUpdate::Applied { progress: percent }
    }

    /// Move a running job to a later phase. Phases never go backwards.
    pub fn advance_phase(&mut self, phase: JobPhase) -> bool {
        let rank = |p: JobPhase| p as u8;
        if self.state != JobState::Running || phase == JobPhase::Done || rank(phase) <= rank(self.phase) {
            return false;
        }
        self.phase = phase;
        true
    }

    pub fn complete(
        &mut self,
        now_ms: i64,
        output_path: PathBuf,
        final_size_mb: f64,
    ) -> Result<(), TransitionError> {
        self.guard(JobState::Completed)?;
        self.state = JobState::Completed;
        self.phase = JobPhase::Done;
        self.progress = 100.0;
        self.completed_at = Some(now_ms);
        self.output_path = Some(output_path);
        self.final_size_mb = Some(final_size_mb);
        self.estimated_completion_time = None;
        Ok(())
    }

    pub fn fail(&mut self, now_ms: i64, error: String) -> Result<(), TransitionError> {
        self.guard(JobState::Failed)?;
        self.state = JobState::Failed;
        self.completed_at = Some(now_ms);
        self.error = Some(error);
        self.estimated_completion_time = None;
        Ok(())
    }

    pub fn cancel(&mut self, now_ms: i64) -> Result<(), TransitionError> {
        self.guard(JobState::Canceled)?;
        self.state = JobState::Canceled;
        self.completed_at = Some(now_ms);
        self.estimated_completion_time = None;
        Ok(())
    }
}

/// `now + elapsed·(1−f)/f`, or `None` while `f` is too small to extrapolate
pub fn estimate_completion(started_ms: i64, now_ms: i64, fraction: f64) -> Option<i64> {
    if !(fraction >= MIN_ETA_FRACTION) {
        return None;
    }
    let fraction = fraction.min(1.0);
    let elapsed = (now_ms - started_ms).max(0) as f64;
    let remaining = elapsed * (1.0 - fraction) / fraction;
    Some(now_ms + remaining.round() as i64)
}

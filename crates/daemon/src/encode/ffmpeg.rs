//! ffmpeg supervisor
//!
//! Builds the ffmpeg command line from an [`EncodePlan`], runs it with the GPU
//! environment and turns its `-progress pipe:1` key/value stream into
//! progress samples. Cancellation sends SIGTERM, waits out the grace period
//! and then kills the process.

use super::plan::{source_path, EncodePlan, PlanContext, VideoPlan};
use super::{bytes_to_mb, EncodeError, EncodeOutcome, TranscodeJob, Transcoder};
use crate::config::Config;
use crate::events::EncodeStats;
use crate::gpu_env::EnvMap;
use crate::hardware::SharedHardware;
use crate::job::{AudioCodec, Container, Preset};
use crate::manager::ProgressReporter;
use crate::probe::probe_media;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lines of stderr kept for failure messages
const STDERR_TAIL_LINES: usize = 20;

/// Render device used for VAAPI encoders
const VAAPI_DEVICE: &str = "/dev/dri/renderD128";

/// One completed `-progress` block
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSample {
    pub percent: f64,
    pub stats: EncodeStats,
    /// ffmpeg reported `progress=end`; all frames are written
    pub end: bool,
}

/// Incremental parser for ffmpeg's `-progress` output
#[derive(Debug, Clone)]
pub struct ProgressParser {
    duration_secs: f64,
    stats: EncodeStats,
}

impl ProgressParser {
    pub fn new(duration_secs: f64) -> Self {
        Self {
            duration_secs,
            stats: EncodeStats::default(),
        }
    }

    /// Feed one line; returns a sample at the end of each block
    pub fn feed(&mut self, line: &str) -> Option<ProgressSample> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();

        match key {
            // Both keys carry microseconds
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<i64>() {
                    self.stats.out_time_secs = Some(us.max(0) as f64 / 1_000_000.0);
                }
            }
            "fps" => self.stats.fps = value.parse().ok().filter(|f: &f64| f.is_finite()),
            "bitrate" => {
                self.stats.bitrate_kbps = value
                    .strip_suffix("kbits/s")
                    .and_then(|v| v.trim().parse().ok());
            }
            "speed" => {
                self.stats.speed = value
                    .strip_suffix('x')
                    .and_then(|v| v.trim().parse().ok());
            }
            "progress" => {
                return Some(ProgressSample {
                    percent: self.percent(),
                    stats: self.stats.clone(),
                    end: value == "end",
                });
            }
            _ => {}
        }
        None
    }

    fn percent(&self) -> f64 {
        match self.stats.out_time_secs {
            Some(t) if self.duration_secs > 0.0 => (t / self.duration_secs * 100.0).clamp(0.0, 100.0),
            _ => 0.0,
        }
    }
}

/// `-hwaccel` value matching an encoder's vendor
fn hwaccel_for(encoder: &str) -> Option<&'static str> {
    if encoder.ends_with("_nvenc") {
        Some("cuda")
    } else if encoder.ends_with("_qsv") {
        Some("qsv")
    } else if encoder.ends_with("_vaapi") {
        Some("vaapi")
    } else if encoder.ends_with("_videotoolbox") {
        Some("videotoolbox")
    } else {
        None
    }
}

fn preset_rank(preset: Preset) -> usize {
    match preset {
        Preset::P1 => 0,
        Preset::P2 => 1,
        Preset::P3 => 2,
        Preset::P4 => 3,
        Preset::P5 => 4,
        Preset::P6 => 5,
        Preset::P7 => 6,
        Preset::ExtraQuality => 7,
    }
}

/// Encoder-specific speed/quality arguments for a preset
fn preset_args(video: &VideoPlan) -> Vec<String> {
    const X26X: [&str; 8] = [
        "ultrafast", "superfast", "veryfast", "faster", "fast", "medium", "slow", "slower",
    ];
    const QSV: [&str; 8] = [
        "veryfast", "faster", "fast", "medium", "slow", "slower", "veryslow", "veryslow",
    ];
    const SVT: [&str; 8] = ["12", "10", "8", "7", "6", "5", "4", "3"];
    const AOM: [&str; 8] = ["8", "7", "6", "5", "4", "3", "2", "1"];

    let rank = preset_rank(video.preset);
    let encoder = video.encoder.as_str();
    let args: Vec<&str> = if encoder.ends_with("_nvenc") {
        let mut args = vec!["-preset"];
        if video.preset == Preset::ExtraQuality {
            args.extend(["p7", "-multipass", "fullres"]);
        } else {
            args.push(video.preset.as_str());
        }
        args.extend(["-tune", video.tune.as_str(), "-rc", "vbr"]);
        args
    } else if encoder.ends_with("_qsv") {
        vec!["-preset", QSV[rank]]
    } else if encoder == "libx264" || encoder == "libx265" {
        vec!["-preset", X26X[rank]]
    } else if encoder == "libsvtav1" {
        vec!["-preset", SVT[rank]]
    } else if encoder == "libaom-av1" {
        vec!["-cpu-used", AOM[rank], "-row-mt", "1"]
    } else {
        Vec::new()
    };
    args.into_iter().map(str::to_string).collect()
}

fn scale_filter(video: &VideoPlan) -> Option<String> {
    match (video.max_width, video.max_height) {
        (None, None) => None,
        (None, Some(h)) => Some(format!("scale=-2:'min({},ih)'", h)),
        (Some(w), None) => Some(format!("scale='min({},iw)':-2", w)),
        (Some(w), Some(h)) => Some(format!(
            "scale='min({},iw)':'min({},ih)':force_original_aspect_ratio=decrease:force_divisible_by=2",
            w, h
        )),
    }
}

fn kbps_arg(kbps: f64) -> String {
    format!("{}k", kbps.round().max(1.0) as u64)
}

/// Build the full ffmpeg argument list for a plan
pub fn build_ffmpeg_args(plan: &EncodePlan) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-y", "-nostats", "-loglevel", "error", "-progress", "pipe:1"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

    let encoder = plan.video.as_ref().map(|v| v.encoder.as_str()).unwrap_or("");
    let is_vaapi = encoder.ends_with("_vaapi");
    if is_vaapi {
        push(&["-vaapi_device", VAAPI_DEVICE]);
    }
    if let Some(hwaccel) = plan
        .video
        .as_ref()
        .filter(|v| v.hw_decode)
        .and_then(|v| hwaccel_for(&v.encoder))
    {
        push(&["-hwaccel", hwaccel]);
    }

    if let Some(start) = plan.trim.start {
        let start = format!("{:.3}", start);
        push(&["-ss", start.as_str()]);
    }
    let input = plan.input.to_string_lossy();
    push(&["-i", &*input]);
    if plan.trim.start.is_some() || plan.trim.end.is_some() {
        let duration = format!("{:.3}", plan.duration_secs);
        push(&["-t", duration.as_str()]);
    }

    match &plan.video {
        Some(video) => {
            push(&["-map", "0:v:0"]);
            if plan.audio.is_some() {
                push(&["-map", "0:a:0?"]);
            }

            let mut filters: Vec<String> = scale_filter(video).into_iter().collect();
            if is_vaapi {
                filters.push("format=nv12,hwupload".to_string());
            }
            if !filters.is_empty() {
                let filter = filters.join(",");
                push(&["-vf", filter.as_str()]);
            }

            let bitrate = video.bitrate_kbps;
            let rates = [
                kbps_arg(bitrate),
                kbps_arg(bitrate * 1.5),
                kbps_arg(bitrate * 2.0),
            ];
            push(&[
                "-c:v",
                video.encoder.as_str(),
                "-b:v",
                rates[0].as_str(),
                "-maxrate",
                rates[1].as_str(),
                "-bufsize",
                rates[2].as_str(),
            ]);
            let preset = preset_args(video);
            push(&preset.iter().map(String::as_str).collect::<Vec<_>>());

            if video.family == crate::hardware::CodecFamily::Hevc && plan.container == Container::Mp4 {
                push(&["-tag:v", "hvc1"]);
            }
        }
        None => push(&["-vn", "-map", "0:a:0"]),
    }

    match plan.audio {
        Some(audio) if audio.codec != AudioCodec::None => {
            let bitrate = format!("{}k", audio.bitrate_kbps);
            push(&["-c:a", audio.codec.as_str(), "-b:a", bitrate.as_str()]);
        }
        _ => push(&["-an"]),
    }

    if plan.container == Container::Mp4 {
        if plan.fragmented_mp4 {
            push(&["-movflags", "+frag_keyframe+empty_moov+default_base_moof"]);
        } else {
            push(&["-movflags", "+faststart"]);
        }
    }

    let output = plan.output.to_string_lossy();
    push(&[&*output]);
    args
}

/// Keep the last `limit` lines of a stream
async fn collect_tail<R: AsyncRead + Unpin>(reader: R, limit: usize) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(limit);
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == limit {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(err) => {
            debug!(pid, error = %err, "SIGTERM failed");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}

/// [`Transcoder`] that runs ffmpeg
pub struct FfmpegTranscoder {
    ffmpeg: String,
    ffprobe: String,
    uploads_dir: PathBuf,
    outputs_dir: PathBuf,
    hardware: Arc<SharedHardware>,
    env: EnvMap,
    cancel_grace: Duration,
    default_min_height: u32,
}

impl FfmpegTranscoder {
    pub fn new(cfg: &Config, hardware: Arc<SharedHardware>, env: EnvMap) -> Self {
        Self {
            ffmpeg: cfg.tools.ffmpeg.clone(),
            ffprobe: cfg.tools.ffprobe.clone(),
            uploads_dir: cfg.paths.uploads_dir.clone(),
            outputs_dir: cfg.paths.outputs_dir.clone(),
            hardware,
            env,
            cancel_grace: Duration::from_secs(cfg.worker.cancel_grace_secs),
            default_min_height: cfg.resolution.default_min_height,
        }
    }

    /// SIGTERM, wait for the grace period, then kill
    async fn terminate(&self, child: &mut Child, task_id: &str) {
        if send_sigterm(child) {
            match tokio::time::timeout(self.cancel_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(task_id, %status, "Encoder stopped after SIGTERM");
                    return;
                }
                Ok(Err(err)) => warn!(task_id, error = %err, "Waiting for encoder failed"),
                Err(_) => warn!(
                    task_id,
                    grace_secs = self.cancel_grace.as_secs(),
                    "Encoder ignored SIGTERM, killing"
                ),
            }
        }
        if let Err(err) = child.kill().await {
            warn!(task_id, error = %err, "Failed to kill encoder");
        }
    }

    async fn run_encoder(
        &self,
        task_id: &str,
        plan: &EncodePlan,
        reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), EncodeError> {
        let args = build_ffmpeg_args(plan);
        debug!(task_id, ?args, "Starting ffmpeg");

        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EncodeError::Spawn {
                program: self.ffmpeg.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("ffmpeg stdout not captured"))?;
        let stderr_tail = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(collect_tail(stderr, STDERR_TAIL_LINES)));

        let mut lines = BufReader::new(stdout).lines();
        let mut parser = ProgressParser::new(plan.duration_secs);
        let mut finalizing = false;

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(task_id, "Stopping encoder");
                    self.terminate(&mut child, task_id).await;
                    if let Some(handle) = stderr_tail {
                        handle.abort();
                    }
                    let _ = tokio::fs::remove_file(&plan.output).await;
                    return Err(EncodeError::Canceled);
                }
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                break;
            };

            if let Some(sample) = parser.feed(&line) {
                reporter.progress(sample.percent, Some(sample.stats)).await;
                if sample.end && !finalizing {
                    finalizing = true;
                    reporter.finalizing().await;
                }
            }
        }

        let status = child.wait().await?;
        let detail = match stderr_tail {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        if status.success() {
            return Ok(());
        }
        let _ = tokio::fs::remove_file(&plan.output).await;
        Err(EncodeError::EncoderFailed {
            status: status.to_string(),
            detail: if detail.is_empty() {
                "no error output".to_string()
            } else {
                detail
            },
        })
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        job: TranscodeJob,
        reporter: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<EncodeOutcome, EncodeError> {
        let request = job.request.as_ref();
        let input = source_path(&self.uploads_dir, request)?;
        if tokio::fs::metadata(&input).await.is_err() {
            return Err(EncodeError::MissingSource(input));
        }

        let media = tokio::select! {
            _ = cancel.cancelled() => return Err(EncodeError::Canceled),
            media = probe_media(&self.ffprobe, &input, &self.env) => media?,
        };

        let hardware = self.hardware.snapshot();
        let plan = EncodePlan::build(
            &job.task_id,
            request,
            input,
            &media,
            PlanContext {
                hardware: &hardware,
                outputs_dir: &self.outputs_dir,
                default_min_height: self.default_min_height,
            },
        )?;
        tokio::fs::create_dir_all(&self.outputs_dir).await?;

        match &plan.video {
            Some(video) => reporter.log(format!(
                "Encoding with {} at {} kbps",
                video.encoder,
                video.bitrate_kbps.round()
            )),
            None => reporter.log("Extracting audio"),
        }

        self.run_encoder(&job.task_id, &plan, &reporter, &cancel).await?;

        let size = match tokio::fs::metadata(&plan.output).await {
            Ok(meta) if meta.len() > 0 => meta.len(),
            _ => return Err(EncodeError::MissingOutput(plan.output)),
        };
        Ok(EncodeOutcome {
            output_path: plan.output,
            final_size_mb: bytes_to_mb(size),
        })
    }
}

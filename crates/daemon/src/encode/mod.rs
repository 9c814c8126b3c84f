//! Encoding: per-job planning and the ffmpeg supervisor

pub mod ffmpeg;
pub mod plan;

pub use ffmpeg::{build_ffmpeg_args, FfmpegTranscoder, ProgressParser, ProgressSample};
pub use plan::{AudioPlan, EncodePlan, VideoPlan};

use crate::job::{CompressRequest, ValidationError};
use crate::manager::ProgressReporter;
use crate::probe::ProbeError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error type for a single encode attempt
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Cancellation was requested and the encoder has stopped
    #[error("canceled")]
    Canceled,

    #[error("source file not found: {0}")]
    MissingSource(PathBuf),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Invalid(#[from] ValidationError),

    /// Unknown duration, or the trim window lies outside the source
    #[error("source has no usable duration")]
    NoDuration,

    #[error("source has no {0} stream")]
    MissingStream(&'static str),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// Encoder exited unsuccessfully; `detail` is the tail of its stderr
    #[error("ffmpeg exited with {status}: {detail}")]
    EncoderFailed { status: String, detail: String },

    #[error("encoder produced no output at {0}")]
    MissingOutput(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A dispatched job handed to the transcoder
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub task_id: String,
    pub request: Arc<CompressRequest>,
}

/// Result of a successful encode
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeOutcome {
    pub output_path: PathBuf,
    pub final_size_mb: f64,
}

/// Runs one job to completion.
///
/// Implementations report progress through `reporter` and must return
/// [`EncodeError::Canceled`] once `cancel` fires and the work has stopped.
#[async_trait]
pub trait Transcoder: Send + Sync + 'static {
    async fn transcode(
        &self,
        job: TranscodeJob,
        reporter: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<EncodeOutcome, EncodeError>;
}

/// Bytes to MB (MiB, matching the bitrate budget's 8192 kbit per MB)
pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

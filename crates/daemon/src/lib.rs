//! sizecap
//!
//! Daemon that compresses videos to a caller-specified target size, using
//! hardware encoders when the host has them. Hosts the encoder detector, the
//! resolution planner, the job lifecycle manager and the HTTP surface.

pub mod concurrency;
pub mod daemon;
pub mod encode;
pub mod events;
pub mod gpu_env;
pub mod hardware;
pub mod job;
pub mod manager;
pub mod metrics;
pub mod probe;
pub mod resolution;
pub mod retention;
pub mod server;
pub mod startup;

pub use sizecap_config as config;
pub use sizecap_config::Config;
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use daemon::{Daemon, DaemonError};
pub use encode::{EncodeError, EncodeOutcome, EncodePlan, FfmpegTranscoder, TranscodeJob, Transcoder};
pub use events::{EncodeStats, EventKind, ProgressEvent};
pub use gpu_env::{build_env, current_gpu_env, EnvMap};
pub use hardware::{CodecFamily, HardwareDetector, HardwareProfile, HardwareType, SharedHardware};
pub use job::{CompressRequest, JobPhase, JobRecord, JobState, ValidationError};
pub use manager::{CancelOutcome, JobError, JobLifecycleManager, ProgressReporter, QueueStatus};
pub use metrics::{collect_system_metrics, MetricsSnapshot, SystemMetrics};
pub use probe::{probe_media, MediaInfo, ProbeError};
pub use resolution::{plan as plan_resolution, PlanRequest, ResolutionDecision};
pub use retention::{run_retention_loop, sweep_files, RetentionPolicy, SweepReport};
pub use server::{create_router, run_server, AppState, ServerError};
pub use startup::{parse_ffmpeg_version, run_startup_checks, StartupError};

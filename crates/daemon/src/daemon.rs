//! Daemon startup and main loop
//!
//! Wires configuration, hardware detection, the job manager, the ffmpeg
//! transcoder, the HTTP server and the retention sweep together.

use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::encode::FfmpegTranscoder;
use crate::gpu_env::{current_gpu_env, EnvMap};
use crate::hardware::{CommandProbeRunner, HardwareDetector, ProbeCommands, ProbeRunner, SharedHardware};
use crate::manager::JobLifecycleManager;
use crate::metrics::MetricsSampler;
use crate::retention::{run_retention_loop, RetentionPolicy};
use crate::server::{run_server, AppState, ServerError, SharedDetector};
use crate::startup::{run_startup_checks, StartupError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Extra time on top of the cancel grace period for jobs to wind down
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("Failed to prepare {path}: {source}")]
    Directory {
        path: String,
        source: std::io::Error,
    },
}

/// Daemon state containing all runtime components
pub struct Daemon {
    pub config: Config,
    pub concurrency_plan: ConcurrencyPlan,
    pub manager: JobLifecycleManager,
    pub hardware: Arc<SharedHardware>,
    detector: SharedDetector,
    env: EnvMap,
    metrics: Arc<MetricsSampler>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Full startup sequence:
    /// 1. Load config from file (defaults when missing) plus env overrides
    /// 2. Run startup checks unless `skip_checks`
    /// 3. Detect hardware and derive the slot count
    pub async fn new<P: AsRef<Path>>(config_path: P, skip_checks: bool) -> Result<Self, DaemonError> {
        let config = Config::load_or_default(config_path)?;
        Self::with_config(config, skip_checks).await
    }

    pub async fn with_config(config: Config, skip_checks: bool) -> Result<Self, DaemonError> {
        let env = current_gpu_env();
        if skip_checks {
            warn!("Startup checks skipped");
        } else {
            let cfg = config.clone();
            let check_env = env.clone();
            tokio::task::spawn_blocking(move || run_startup_checks(&cfg, &check_env))
                .await
                .map_err(|e| StartupError::Io(std::io::Error::other(e)))??;
        }

        let runner: Arc<dyn ProbeRunner> = Arc::new(CommandProbeRunner::new(env.clone()));
        let commands = ProbeCommands {
            gpu_smi: config.tools.gpu_smi.clone(),
            ffmpeg: config.tools.ffmpeg.clone(),
        };
        let detector = Arc::new(HardwareDetector::new(runner, commands));

        let detect = Arc::clone(&detector);
        let profile = tokio::task::spawn_blocking(move || detect.detect())
            .await
            .map_err(|e| StartupError::Io(std::io::Error::other(e)))?;

        Ok(Self::assemble(config, detector, profile, env))
    }

    /// Build the daemon from an already detected profile without touching
    /// the host
    pub fn assemble(
        config: Config,
        detector: SharedDetector,
        profile: crate::hardware::HardwareProfile,
        env: EnvMap,
    ) -> Self {
        let concurrency_plan = derive_plan(&config, &profile);
        info!(
            hardware = %profile.hw_type,
            cores = concurrency_plan.total_cores,
            slots = concurrency_plan.max_concurrent_jobs,
            "Concurrency plan derived"
        );

        let recent_window = Duration::from_secs(u64::from(config.retention.recent_window_minutes) * 60);
        let manager = JobLifecycleManager::new(concurrency_plan.max_concurrent_jobs as usize, recent_window);

        Self {
            config,
            concurrency_plan,
            manager,
            hardware: Arc::new(SharedHardware::new(profile)),
            detector,
            env,
            metrics: Arc::new(MetricsSampler::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the daemon when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            manager: self.manager.clone(),
            hardware: Arc::clone(&self.hardware),
            detector: Arc::clone(&self.detector),
            metrics: Arc::clone(&self.metrics),
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        let retention = &self.config.retention;
        RetentionPolicy {
            dirs: vec![
                self.config.paths.uploads_dir.clone(),
                self.config.paths.outputs_dir.clone(),
            ],
            max_age: Duration::from_secs(u64::from(retention.file_retention_hours) * 3600),
            interval: Duration::from_secs(u64::from(retention.sweep_interval_minutes.max(1)) * 60),
        }
    }

    fn prepare_dirs(&self) -> Result<(), DaemonError> {
        for dir in [&self.config.paths.uploads_dir, &self.config.paths.outputs_dir] {
            std::fs::create_dir_all(dir).map_err(|source| DaemonError::Directory {
                path: dir.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    /// Run until a shutdown signal arrives or the server fails
    pub async fn run(&self) -> Result<(), DaemonError> {
        self.prepare_dirs()?;

        let transcoder = Arc::new(FfmpegTranscoder::new(
            &self.config,
            Arc::clone(&self.hardware),
            self.env.clone(),
        ));
        let dispatcher = self.manager.spawn_dispatcher(transcoder, self.shutdown.clone());
        let retention = tokio::spawn(run_retention_loop(
            self.retention_policy(),
            self.manager.clone(),
            self.shutdown.clone(),
        ));
        let signals = tokio::spawn(shutdown_signal(self.shutdown.clone()));

        let served = run_server(
            &self.config.server.host,
            self.config.server.port,
            self.app_state(),
            self.shutdown.clone(),
        )
        .await;
        if let Err(err) = &served {
            error!(error = %err, "HTTP server stopped");
        }

        self.shutdown.cancel();
        signals.abort();
        self.drain().await;

        if let Err(err) = dispatcher.await {
            warn!(error = %err, "Dispatcher task failed");
        }
        if let Err(err) = retention.await {
            warn!(error = %err, "Retention task failed");
        }

        info!("Daemon stopped");
        served.map_err(DaemonError::from)
    }

    /// Stop running encoders and wait for their jobs to settle
    async fn drain(&self) {
        let running = self.manager.cancel_running().await;
        if running == 0 {
            return;
        }
        info!(running, "Stopping running jobs");

        let deadline = Duration::from_secs(self.config.worker.cancel_grace_secs) + SHUTDOWN_SLACK;
        let settled = tokio::time::timeout(deadline, async {
            while self.manager.running_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        if settled.is_err() {
            warn!("Jobs still running at shutdown");
        }
    }
}

/// Wait for SIGINT or SIGTERM, then cancel `shutdown`
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = shutdown.cancelled() => return,
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}

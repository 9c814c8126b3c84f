//! Retention sweep
//!
//! Periodically deletes uploads and outputs older than the retention period
//! and prunes finished job records of the same age.

use crate::events::current_timestamp_ms;
use crate::manager::JobLifecycleManager;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one sweep removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub files_removed: usize,
    pub dirs_removed: usize,
    pub records_pruned: usize,
}

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Directories swept; the roots themselves are never removed
    pub dirs: Vec<PathBuf>,
    pub max_age: Duration,
    pub interval: Duration,
}

/// Delete files under `dirs` last modified before `cutoff`, then any
/// directories left empty that are themselves older than `cutoff`.
pub fn sweep_files(dirs: &[PathBuf], cutoff: SystemTime) -> SweepReport {
    use walkdir::WalkDir;

    let mut report = SweepReport::default();

    for root in dirs {
        if !root.exists() {
            continue;
        }

        // Children before parents so emptied directories can go too
        let walker = WalkDir::new(root).min_depth(1).contents_first(true);
        for entry in walker.into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            let modified = match entry
                .metadata()
                .map_err(std::io::Error::from)
                .and_then(|m| m.modified())
            {
                Ok(modified) => modified,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if modified >= cutoff {
                continue;
            }

            if entry.file_type().is_dir() {
                // Fails while the directory still has content
                if std::fs::remove_dir(path).is_ok() {
                    report.dirs_removed += 1;
                }
            } else {
                match std::fs::remove_file(path) {
                    Ok(()) => report.files_removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove expired file"),
                }
            }
        }
    }

    report
}

/// One full sweep: files on a blocking thread, then job records
pub async fn sweep_once(policy: &RetentionPolicy, manager: &JobLifecycleManager) -> SweepReport {
    let cutoff = SystemTime::now()
        .checked_sub(policy.max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let dirs = policy.dirs.clone();

    let mut report = match tokio::task::spawn_blocking(move || sweep_files(&dirs, cutoff)).await {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, "Retention sweep task failed");
            SweepReport::default()
        }
    };

    let cutoff_ms = current_timestamp_ms() - policy.max_age.as_millis() as i64;
    report.records_pruned = manager.prune(cutoff_ms).await;
    report
}

/// Sweep every `policy.interval` until `shutdown` fires
pub async fn run_retention_loop(
    policy: RetentionPolicy,
    manager: JobLifecycleManager,
    shutdown: CancellationToken,
) {
    info!(
        max_age_secs = policy.max_age.as_secs(),
        interval_secs = policy.interval.as_secs(),
        "Retention sweep scheduled"
    );
    let mut ticker = tokio::time::interval(policy.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let report = sweep_once(&policy, &manager).await;
                if report != SweepReport::default() {
                    info!(
                        files = report.files_removed,
                        dirs = report.dirs_removed,
                        records = report.records_pruned,
                        "Retention sweep removed expired data"
                    );
                }
            }
        }
    }
}

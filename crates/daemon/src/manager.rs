//! Job lifecycle manager
//!
//! Owns the job table, the FIFO queue and a fixed pool of encode slots
//! (a tokio [`Semaphore`]). Records are mutated only here; everything else
//! receives cloned snapshots.
//!
//! Locking: state transitions take the table write lock and then the record
//! lock, so the queue/running indexes always agree with record states.
//! Progress samples take the table read lock and the record lock only, so
//! jobs never wait on each other's progress.

use crate::encode::{EncodeError, TranscodeJob, Transcoder};
use crate::events::{current_timestamp_ms, EncodeStats, ProgressEvent, EVENT_CHANNEL_CAPACITY};
use crate::job::{
    CompressRequest, JobPhase, JobRecord, JobState, ProgressUpdate, ValidationError,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Notify, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Error type for job manager operations
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("job not found: {0}")]
    NotFound(String),
}

/// What a cancel request did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Job was still queued and is now canceled
    Canceled,
    /// Encoder has been asked to stop; the job becomes canceled once it exits
    Signaled,
    AlreadyFinished(JobState),
}

/// Aggregate queue view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Queued jobs in dispatch order, then running jobs by start time
    pub active_jobs: Vec<JobRecord>,
    pub queued_count: usize,
    pub running_count: usize,
    /// Jobs completed within the recent window
    pub completed_count: usize,
}

struct JobEntry {
    record: Arc<Mutex<JobRecord>>,
    request: Arc<CompressRequest>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<String, JobEntry>,
    queued: VecDeque<String>,
    running: HashSet<String>,
    /// `(completed_at, task_id)` for completed jobs, oldest first
    completed: VecDeque<(i64, String)>,
    /// `(completed_at, task_id)` for every terminal job, oldest first
    finished: VecDeque<(i64, String)>,
}

impl JobTable {
    fn index_terminal(&mut self, task_id: &str, previous: JobState, record: &JobRecord) {
        match previous {
            JobState::Queued => self.queued.retain(|id| id != task_id),
            JobState::Running => {
                self.running.remove(task_id);
            }
            _ => {}
        }
        let at = record.completed_at.unwrap_or_default();
        self.finished.push_back((at, task_id.to_string()));
        if record.state == JobState::Completed {
            self.completed.push_back((at, task_id.to_string()));
        }
    }
}

/// Job handed from the queue to a worker slot
pub(crate) struct Dispatch {
    task_id: String,
    request: Arc<CompressRequest>,
    cancel: CancellationToken,
}

struct Shared {
    table: RwLock<JobTable>,
    slots: Arc<Semaphore>,
    max_concurrent_jobs: usize,
    wake: Notify,
    events: broadcast::Sender<ProgressEvent>,
    recent_window_ms: i64,
}

fn lock_record(record: &Mutex<JobRecord>) -> MutexGuard<'_, JobRecord> {
    record.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle to the job manager; clones share the same state
#[derive(Clone)]
pub struct JobLifecycleManager {
    shared: Arc<Shared>,
}

impl JobLifecycleManager {
    /// Create a manager with `max_concurrent_jobs` slots (at least one).
    /// `recent_window` bounds the completed count in [`QueueStatus`].
    pub fn new(max_concurrent_jobs: usize, recent_window: Duration) -> Self {
        let slots = max_concurrent_jobs.max(1);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                table: RwLock::new(JobTable::default()),
                slots: Arc::new(Semaphore::new(slots)),
                max_concurrent_jobs: slots,
                wake: Notify::new(),
                events,
                recent_window_ms: recent_window.as_millis() as i64,
            }),
        }
    }

    pub fn max_concurrent_jobs(&self) -> usize {
        self.shared.max_concurrent_jobs
    }

    /// Receive every event published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.shared.events.subscribe()
    }

    fn emit(&self, event: ProgressEvent) {
        // No subscribers is fine
        let _ = self.shared.events.send(event);
    }

    /// Progress handle for a job, as given to transcoders
    pub fn reporter(&self, task_id: &str) -> ProgressReporter {
        ProgressReporter {
            manager: self.clone(),
            task_id: task_id.to_string(),
        }
    }

    /// Validate and queue a request. Returns the new task id.
    pub async fn enqueue(&self, request: CompressRequest) -> Result<String, JobError> {
        request.validate()?;

        let task_id = Uuid::new_v4().to_string();
        let record = JobRecord::new(task_id.clone(), &request, current_timestamp_ms());

        info!(
            task_id = %task_id,
            job_id = %request.job_id,
            codec = %request.video_codec,
            target_mb = request.target_size_mb,
            "Job queued"
        );

        {
            let mut table = self.shared.table.write().await;
            table.jobs.insert(
                task_id.clone(),
                JobEntry {
                    record: Arc::new(Mutex::new(record)),
                    request: Arc::new(request),
                    cancel: CancellationToken::new(),
                },
            );
            table.queued.push_back(task_id.clone());
        }

        self.shared.wake.notify_one();
        Ok(task_id)
    }

    /// Cancel a job. Queued jobs are canceled on the spot; running jobs are
    /// signaled and become canceled when their encoder exits.
    pub async fn cancel(&self, task_id: &str) -> Result<CancelOutcome, JobError> {
        let outcome = {
            let mut table = self.shared.table.write().await;
            let now = current_timestamp_ms();
            let (record, token) = table
                .jobs
                .get(task_id)
                .map(|e| (Arc::clone(&e.record), e.cancel.clone()))
                .ok_or_else(|| JobError::NotFound(task_id.to_string()))?;

            let mut job = lock_record(&record);
            let current = job.state;
            match current {
                JobState::Queued => {
                    let canceled = job.cancel(now);
                    match canceled {
                        Ok(()) => {
                            table.index_terminal(task_id, JobState::Queued, &job);
                            CancelOutcome::Canceled
                        }
                        Err(err) => {
                            warn!(task_id, error = %err, "Cancel rejected");
                            CancelOutcome::AlreadyFinished(current)
                        }
                    }
                }
                JobState::Running => {
                    token.cancel();
                    CancelOutcome::Signaled
                }
                state => CancelOutcome::AlreadyFinished(state),
            }
        };

        match outcome {
            CancelOutcome::Canceled => {
                info!(task_id, "Queued job canceled");
                self.emit(ProgressEvent::error(task_id, "Canceled"));
            }
            CancelOutcome::Signaled => info!(task_id, "Cancellation requested for running job"),
            CancelOutcome::AlreadyFinished(state) => {
                debug!(task_id, state = %state, "Cancel ignored for finished job")
            }
        }
        Ok(outcome)
    }

    async fn record_handle(&self, task_id: &str) -> Result<Arc<Mutex<JobRecord>>, JobError> {
        let table = self.shared.table.read().await;
        table
            .jobs
            .get(task_id)
            .map(|e| Arc::clone(&e.record))
            .ok_or_else(|| JobError::NotFound(task_id.to_string()))
    }

    pub async fn report_progress(
        &self,
        task_id: &str,
        percent: f64,
        stats: Option<EncodeStats>,
    ) -> Result<ProgressUpdate, JobError> {
        self.report_progress_at(task_id, percent, stats, current_timestamp_ms())
            .await
    }

    /// [`report_progress`](Self::report_progress) with an explicit clock
    pub async fn report_progress_at(
        &self,
        task_id: &str,
        percent: f64,
        stats: Option<EncodeStats>,
        now_ms: i64,
    ) -> Result<ProgressUpdate, JobError> {
        let record = self.record_handle(task_id).await?;
        let update = lock_record(&record).record_progress(percent, now_ms);

        match update {
            ProgressUpdate::Applied { progress } => {
                self.emit(ProgressEvent::progress(task_id, progress, stats));
            }
            ProgressUpdate::Stale { current } => {
                debug!(task_id, percent, current, "Dropping stale progress sample");
            }
            ProgressUpdate::NotRunning(state) => {
                debug!(task_id, state = %state, "Progress for job that is not running");
            }
        }
        Ok(update)
    }

    /// Advance a running job's phase; returns whether it changed
    pub async fn set_phase(&self, task_id: &str, phase: JobPhase) -> Result<bool, JobError> {
        let record = self.record_handle(task_id).await?;
        let changed = lock_record(&record).advance_phase(phase);
        if changed {
            debug!(task_id, phase = %phase, "Phase changed");
            self.emit(ProgressEvent::log(task_id, format!("Phase: {}", phase)));
        }
        Ok(changed)
    }

    /// Apply a terminal transition under the table lock. `None` means the
    /// record refused it (already terminal or not started).
    ///
    /// The completion time is read while the write lock is held so the
    /// finished indexes stay ordered by time.
    async fn finish<F>(&self, task_id: &str, apply: F) -> Result<Option<JobRecord>, JobError>
    where
        F: FnOnce(&mut JobRecord, i64) -> Result<(), crate::job::TransitionError>,
    {
        let mut table = self.shared.table.write().await;
        let now = current_timestamp_ms();
        let record = table
            .jobs
            .get(task_id)
            .map(|e| Arc::clone(&e.record))
            .ok_or_else(|| JobError::NotFound(task_id.to_string()))?;

        let mut job = lock_record(&record);
        let previous = job.state;
        if let Err(err) = apply(&mut *job, now) {
            warn!(task_id, error = %err, "Ignoring terminal transition");
            return Ok(None);
        }
        table.index_terminal(task_id, previous, &job);
        Ok(Some(job.clone()))
    }

    /// Mark a running job completed. A second terminal call is logged and ignored.
    pub async fn complete(
        &self,
        task_id: &str,
        output_path: PathBuf,
        final_size_mb: f64,
    ) -> Result<bool, JobError> {
        let done = self
            .finish(task_id, |job, now| job.complete(now, output_path, final_size_mb))
            .await?;

        if let Some(record) = &done {
            info!(
                task_id,
                final_size_mb,
                target_mb = record.target_size_mb,
                elapsed_ms = record.started_at.zip(record.completed_at).map(|(s, e)| e - s),
                "Job completed"
            );
            self.emit(ProgressEvent::done(task_id, final_size_mb));
        }
        Ok(done.is_some())
    }

    /// Mark a running job failed. A second terminal call is logged and ignored.
    pub async fn fail(&self, task_id: &str, error: impl Into<String>) -> Result<bool, JobError> {
        let message = error.into();
        let logged = message.clone();
        let done = self.finish(task_id, |job, now| job.fail(now, message)).await?;

        if done.is_some() {
            error!(task_id, error = %logged, "Job failed");
            self.emit(ProgressEvent::error(task_id, logged));
        }
        Ok(done.is_some())
    }

    /// Record that a signaled encoder has stopped
    async fn finish_canceled(&self, task_id: &str) -> Result<bool, JobError> {
        let done = self.finish(task_id, |job, now| job.cancel(now)).await?;
        if done.is_some() {
            info!(task_id, "Running job canceled");
            self.emit(ProgressEvent::error(task_id, "Canceled"));
        }
        Ok(done.is_some())
    }

    pub async fn status(&self, task_id: &str) -> Option<JobRecord> {
        let table = self.shared.table.read().await;
        table.jobs.get(task_id).map(|e| lock_record(&e.record).clone())
    }

    pub async fn queue_status(&self) -> QueueStatus {
        self.queue_status_at(current_timestamp_ms()).await
    }

    /// [`queue_status`](Self::queue_status) with an explicit clock
    pub async fn queue_status_at(&self, now_ms: i64) -> QueueStatus {
        let table = self.shared.table.read().await;
        let cutoff = now_ms - self.shared.recent_window_ms;
        let first_recent = table.completed.partition_point(|(at, _)| *at < cutoff);

        let snapshot = |id: &String| table.jobs.get(id).map(|e| lock_record(&e.record).clone());
        let mut running: Vec<JobRecord> = table.running.iter().filter_map(snapshot).collect();
        running.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        let mut active_jobs: Vec<JobRecord> = table.queued.iter().filter_map(snapshot).collect();
        active_jobs.extend(running);

        QueueStatus {
            active_jobs,
            queued_count: table.queued.len(),
            running_count: table.running.len(),
            completed_count: table.completed.len() - first_recent,
        }
    }

    /// Number of jobs currently holding a slot
    pub async fn running_count(&self) -> usize {
        self.shared.table.read().await.running.len()
    }

    /// Drop terminal records that finished before `cutoff_ms`. Returns how many.
    pub async fn prune(&self, cutoff_ms: i64) -> usize {
        let mut table = self.shared.table.write().await;
        let mut removed = 0;

        while table.finished.front().is_some_and(|(at, _)| *at < cutoff_ms) {
            if let Some((_, task_id)) = table.finished.pop_front() {
                if table.jobs.remove(&task_id).is_some() {
                    removed += 1;
                }
            }
        }
        while table.completed.front().is_some_and(|(at, _)| *at < cutoff_ms) {
            table.completed.pop_front();
        }

        if removed > 0 {
            debug!(removed, "Pruned finished job records");
        }
        removed
    }

    /// Signal every running job to stop
    pub async fn cancel_running(&self) -> usize {
        let table = self.shared.table.read().await;
        for task_id in &table.running {
            if let Some(entry) = table.jobs.get(task_id) {
                entry.cancel.cancel();
            }
        }
        table.running.len()
    }

    /// Pop the oldest queued job and move it to running
    pub(crate) async fn start_next(&self) -> Option<Dispatch> {
        let mut table = self.shared.table.write().await;
        let now = current_timestamp_ms();

        while let Some(task_id) = table.queued.pop_front() {
            let Some(entry) = table.jobs.get(&task_id) else {
                continue;
            };
            let dispatch = Dispatch {
                task_id: task_id.clone(),
                request: Arc::clone(&entry.request),
                cancel: entry.cancel.clone(),
            };
            let started = lock_record(&entry.record).start(now);

            match started {
                Ok(()) => {
                    table.running.insert(task_id.clone());
                    drop(table);
                    info!(task_id = %task_id, "Job started");
                    self.emit(ProgressEvent::log(&task_id, "Encoding started"));
                    return Some(dispatch);
                }
                Err(err) => debug!(task_id = %task_id, error = %err, "Skipping queued entry"),
            }
        }
        None
    }

    /// Start the dispatcher: waits for a free slot, then for a queued job,
    /// and hands the job to `transcoder` on its own task.
    pub fn spawn_dispatcher<T: Transcoder>(
        &self,
        transcoder: Arc<T>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.dispatch_loop(transcoder, shutdown).await })
    }

    async fn dispatch_loop<T: Transcoder>(self, transcoder: Arc<T>, shutdown: CancellationToken) {
        info!(slots = self.shared.max_concurrent_jobs, "Dispatcher started");

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&self.shared.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let dispatch = loop {
                if let Some(dispatch) = self.start_next().await {
                    break Some(dispatch);
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break None,
                    _ = self.shared.wake.notified() => {}
                }
            };
            let Some(dispatch) = dispatch else {
                break;
            };

            let manager = self.clone();
            let transcoder = Arc::clone(&transcoder);
            tokio::spawn(async move { manager.supervise(transcoder, dispatch, permit).await });
        }

        info!("Dispatcher stopped");
    }

    async fn supervise<T: Transcoder>(
        self,
        transcoder: Arc<T>,
        dispatch: Dispatch,
        permit: OwnedSemaphorePermit,
    ) {
        let Dispatch {
            task_id,
            request,
            cancel,
        } = dispatch;

        let job = TranscodeJob {
            task_id: task_id.clone(),
            request,
        };
        let reporter = self.reporter(&task_id);
        let handle =
            tokio::spawn(async move { transcoder.transcode(job, reporter, cancel).await });

        let applied = match handle.await {
            Ok(Ok(outcome)) => {
                self.complete(&task_id, outcome.output_path, outcome.final_size_mb)
                    .await
            }
            Ok(Err(EncodeError::Canceled)) => self.finish_canceled(&task_id).await,
            Ok(Err(err)) => self.fail(&task_id, err.to_string()).await,
            Err(join_err) => {
                self.fail(&task_id, format!("encoder task aborted: {}", join_err))
                    .await
            }
        };
        if let Err(err) = applied {
            warn!(task_id = %task_id, error = %err, "Job disappeared before it finished");
        }

        drop(permit);
    }
}

/// Per-job progress handle given to a [`Transcoder`]
#[derive(Clone)]
pub struct ProgressReporter {
    manager: JobLifecycleManager,
    task_id: String,
}

impl ProgressReporter {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub async fn progress(&self, percent: f64, stats: Option<EncodeStats>) {
        if let Err(err) = self
            .manager
            .report_progress(&self.task_id, percent, stats)
            .await
        {
            debug!(task_id = %self.task_id, error = %err, "Progress not recorded");
        }
    }

    /// The encoder has finished writing frames and is muxing the output
    pub async fn finalizing(&self) {
        if let Err(err) = self
            .manager
            .set_phase(&self.task_id, JobPhase::Finalizing)
            .await
        {
            debug!(task_id = %self.task_id, error = %err, "Phase not recorded");
        }
    }

    pub fn log(&self, message: impl Into<String>) {
        self.manager
            .emit(ProgressEvent::log(&self.task_id, message));
    }
}

//! Download task lifecycle: run, stop, resume, complete.
//!
//! A [`DownloadTask`] owns the shared state its workers operate on: the
//! control flags behind one mutex, the progress record behind another, and
//! lock-free byte counters. The two mutexes are never held at the same time
//! and never across an await point.
//!
//! Each run of a task is an *incarnation* with its own cancellation token
//! and speed sampler. Stopping cancels the token; workers from a cancelled
//! incarnation wind down quietly and their errors are dropped, so a stopped
//! run ends with neither `on_complete` nor `on_error`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use reqwest::Client;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::DownloadConfig;
use crate::error::DownloadError;
use crate::listener::DownloadListener;
use crate::progress::{self, ProgressRecord};
use crate::sampler::SpeedSampler;
use crate::worker::DownloadWorker;

/// Handle to one run incarnation, cloned into every worker of that run.
#[derive(Clone)]
pub(crate) struct RunHandle {
    pub(crate) incarnation: u64,
    pub(crate) token: CancellationToken,
    pub(crate) sampler: SpeedSampler,
}

/// Control flags for the task lifecycle, all behind one mutex.
struct ControlState {
    /// Between run start and the first worker spawn.
    preparing: bool,
    running: bool,
    /// Set when `stop` arrives while still preparing; consumed by `run`.
    early_stop: bool,
    /// A completed task never runs again.
    done: bool,
    incarnation: u64,
    /// Cancellation token of the current incarnation.
    token: CancellationToken,
    /// Speed sampler of the current incarnation.
    sampler: SpeedSampler,
    start_time: Option<Instant>,
}

/// The progress record of the current run together with the slots that
/// have a live worker in this incarnation. Both live under one lock so a
/// worker resolving its next range sees a consistent view of which slots
/// are already being streamed.
struct RecordState {
    record: Option<ProgressRecord>,
    active_slots: HashSet<usize>,
}

pub(crate) struct TaskInner {
    pub(crate) client: Client,
    pub(crate) config: DownloadConfig,
    pub(crate) listener: Arc<dyn DownloadListener>,
    pub(crate) original_url: Url,
    pub(crate) dest_path: PathBuf,
    pub(crate) resumable: bool,
    record_path: PathBuf,
    report_progress: bool,
    /// Parent token, cancelled when the engine shuts down.
    task_token: CancellationToken,
    control: Mutex<ControlState>,
    record: Mutex<RecordState>,
    /// Bytes streamed to disk so far.
    pub(crate) downloaded: AtomicU64,
    /// Remote content length, 0 while unknown.
    pub(crate) file_length: AtomicU64,
}

impl TaskInner {
    fn control(&self) -> MutexGuard<'_, ControlState> {
        // Nothing under this lock is left half-updated on panic.
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs a closure against the progress record, mapping IO failures to
    /// [`DownloadError::Io`]. Returns `Ok(None)` for non-resumable tasks,
    /// which carry no record.
    pub(crate) fn with_record<T>(
        &self,
        f: impl FnOnce(&mut ProgressRecord) -> std::io::Result<T>,
    ) -> Result<Option<T>, DownloadError> {
        self.with_record_state(|record, _| f(record))
    }

    /// Like [`with_record`](Self::with_record) but also exposes the set of
    /// slots owned by a live worker of the current incarnation. Used by
    /// range resolution so one worker never takes over a range another
    /// worker is still streaming.
    pub(crate) fn with_record_state<T>(
        &self,
        f: impl FnOnce(&mut ProgressRecord, &mut HashSet<usize>) -> std::io::Result<T>,
    ) -> Result<Option<T>, DownloadError> {
        let mut guard = self.record.lock().unwrap_or_else(PoisonError::into_inner);
        let RecordState {
            record,
            active_slots,
        } = &mut *guard;
        match record.as_mut() {
            Some(record) => f(record, active_slots)
                .map(Some)
                .map_err(|e| DownloadError::io(self.record_path.clone(), e)),
            None => Ok(None),
        }
    }

    /// Starts a new run: opens the record, mints a fresh incarnation and
    /// spawns the lead worker. A stop that arrived before this point makes
    /// it a no-op.
    fn run(self: &Arc<Self>) {
        {
            let mut control = self.control();
            if control.early_stop {
                control.early_stop = false;
                control.preparing = false;
                debug!(url = %self.original_url, "run cancelled before start");
                return;
            }
        }

        self.listener.on_prepare();

        if self.resumable {
            match ProgressRecord::open(&self.record_path, self.config.thread_count) {
                Ok(record) => {
                    let mut guard = self.record.lock().unwrap_or_else(PoisonError::into_inner);
                    guard.record = Some(record);
                    guard.active_slots.clear();
                    // The lead worker always starts on slot 0.
                    guard.active_slots.insert(0);
                }
                Err(e) => {
                    let error = DownloadError::io(self.record_path.clone(), e);
                    warn!(error = %error, "failed to open progress record");
                    self.control().preparing = false;
                    self.listener
                        .on_error(self.downloaded.load(Ordering::SeqCst), &error);
                    return;
                }
            }
        }

        let stopped_during_setup = {
            let mut control = self.control();
            // A stop may have landed while the record was being opened.
            if control.early_stop {
                control.early_stop = false;
                control.preparing = false;
                true
            } else {
                false
            }
        };
        if stopped_during_setup {
            let mut guard = self.record.lock().unwrap_or_else(PoisonError::into_inner);
            guard.record.take();
            guard.active_slots.clear();
            debug!(url = %self.original_url, "run cancelled during setup");
            return;
        }

        let run = {
            let mut control = self.control();
            control.incarnation += 1;
            control.token = self.task_token.child_token();
            control.sampler =
                SpeedSampler::new(self.config.speed_window, self.config.progress_interval);
            control.start_time = Some(Instant::now());
            control.preparing = false;
            control.running = true;
            RunHandle {
                incarnation: control.incarnation,
                token: control.token.clone(),
                sampler: control.sampler.clone(),
            }
        };

        let partial_content_expected = self
            .with_record(|record| Ok(record.thread_count() > 1))
            .ok()
            .flatten()
            .unwrap_or(false);

        info!(
            url = %self.original_url,
            dest = %self.dest_path.display(),
            incarnation = run.incarnation,
            resumable = self.resumable,
            "starting download run"
        );

        let lead = DownloadWorker::new(
            Arc::clone(self),
            run.clone(),
            0,
            true,
            partial_content_expected,
        );
        tokio::spawn(lead.run());

        if self.report_progress {
            self.spawn_progress_loop(run);
        }
    }

    fn spawn_run(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.run();
        });
    }

    /// Periodic progress reporting for one incarnation. Exits when the
    /// incarnation's token is cancelled.
    fn spawn_progress_loop(self: &Arc<Self>, run: RunHandle) {
        let task = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(task.config.progress_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of an interval completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = run.token.cancelled() => break,
                    _ = ticker.tick() => {
                        let downloaded = task.downloaded.load(Ordering::SeqCst);
                        // Nothing meaningful to report until the first bytes
                        // arrive and the counters are initialized.
                        if downloaded == 0 {
                            continue;
                        }
                        let speed = run.sampler.tick_and_speed();
                        task.listener.on_progress_update(
                            downloaded,
                            task.file_length.load(Ordering::SeqCst),
                            speed,
                        );
                    }
                }
            }
        });
    }

    /// Stops the current run. Returns whether this call performed the
    /// running-to-stopped transition; callers use that to report errors
    /// exactly once per run.
    pub(crate) fn stop_run(&self) -> bool {
        let elapsed;
        {
            let mut control = self.control();
            if control.preparing {
                control.early_stop = true;
                return false;
            }
            if !control.running {
                return false;
            }
            control.running = false;
            control.token.cancel();
            elapsed = elapsed_seconds(control.start_time.take());
        }

        if elapsed > 0 {
            if let Err(error) = self.with_record(|record| record.add_active_seconds(elapsed)) {
                warn!(error = %error, "failed to persist download time");
            }
        }
        // Close the record handle; the file itself stays behind for resume.
        {
            let mut guard = self.record.lock().unwrap_or_else(PoisonError::into_inner);
            guard.record.take();
            guard.active_slots.clear();
        }

        info!(
            url = %self.original_url,
            downloaded = self.downloaded.load(Ordering::SeqCst),
            "download stopped"
        );
        true
    }

    /// Reports a worker failure: stops the run and notifies the listener,
    /// unless the worker belongs to an incarnation that was already
    /// stopped or completed.
    pub(crate) fn report_error(&self, run: &RunHandle, error: DownloadError) {
        if run.token.is_cancelled() {
            debug!(
                incarnation = run.incarnation,
                error = %error,
                "dropping error from cancelled run"
            );
            return;
        }
        warn!(url = %self.original_url, error = %error, "download failed");
        if self.stop_run() {
            self.listener
                .on_error(self.downloaded.load(Ordering::SeqCst), &error);
        }
    }

    /// Finishes the task: persists the total time, deletes the progress
    /// record and fires `on_complete`. Without `force` this is a no-op
    /// until every byte has been downloaded; with it the caller asserts
    /// completion (used when the record shows nothing left to fetch).
    pub(crate) fn complete(&self, force: bool) {
        let elapsed;
        {
            let mut control = self.control();
            if control.done {
                return;
            }
            if !force
                && self.downloaded.load(Ordering::SeqCst) != self.file_length.load(Ordering::SeqCst)
            {
                return;
            }
            control.done = true;
            control.running = false;
            control.token.cancel();
            elapsed = elapsed_seconds(control.start_time.take());
        }

        let mut total_seconds = u32::from(elapsed);
        {
            let mut guard = self.record.lock().unwrap_or_else(PoisonError::into_inner);
            guard.active_slots.clear();
            if let Some(mut record) = guard.record.take() {
                if let Err(e) = record.add_active_seconds(elapsed) {
                    warn!(error = %e, "failed to persist download time");
                }
                total_seconds = u32::from(record.active_seconds());
                if let Err(e) = record.delete() {
                    warn!(error = %e, "failed to delete progress record");
                }
            }
        }

        let downloaded = self.downloaded.load(Ordering::SeqCst);
        let file_length = self.file_length.load(Ordering::SeqCst);
        info!(
            url = %self.original_url,
            dest = %self.dest_path.display(),
            downloaded,
            total_seconds,
            "download complete"
        );
        self.listener
            .on_complete(downloaded, file_length, total_seconds);
    }

    /// Spawns workers for slots above `lead_index`, stopping at the first
    /// slot with neither leftover bytes nor a claimable chunk. Called by
    /// the lead worker once the file length is known.
    pub(crate) fn spawn_siblings(
        self: &Arc<Self>,
        run: &RunHandle,
        lead_index: usize,
        thread_count: u8,
    ) -> Result<(), DownloadError> {
        let chunk_size = self.config.chunk_size;
        for index in (lead_index + 1)..usize::from(thread_count) {
            let has_work = self
                .with_record_state(|record, active| {
                    let (start, end) = record.range(index);
                    if start > end {
                        return Ok(false);
                    }
                    if start == end && record.claim_next_chunk(index, chunk_size)?.is_none() {
                        return Ok(false);
                    }
                    active.insert(index);
                    Ok(true)
                })?
                .unwrap_or(false);
            if !has_work {
                break;
            }
            debug!(index, "spawning sibling worker");
            let worker = DownloadWorker::new(Arc::clone(self), run.clone(), index, false, true);
            tokio::spawn(worker.run());
        }
        Ok(())
    }
}

fn elapsed_seconds(start: Option<Instant>) -> u16 {
    start
        .map(|t| u16::try_from(t.elapsed().as_secs()).unwrap_or(u16::MAX))
        .unwrap_or(0)
}

/// A single download: one URL, one destination file, and the workers that
/// stream byte ranges into it.
///
/// Tasks are created through
/// [`DownloadEngine::start_download`](crate::DownloadEngine::start_download)
/// and begin running immediately. The handle is cheap to clone; all clones
/// control the same task.
#[derive(Clone)]
pub struct DownloadTask {
    inner: Arc<TaskInner>,
}

impl DownloadTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        client: Client,
        config: DownloadConfig,
        url: Url,
        dest_path: PathBuf,
        listener: Arc<dyn DownloadListener>,
        resumable: bool,
        report_progress: bool,
        task_token: CancellationToken,
    ) -> Self {
        let record_path = progress::record_path(&dest_path);
        let sampler = SpeedSampler::new(config.speed_window, config.progress_interval);
        Self {
            inner: Arc::new(TaskInner {
                client,
                config,
                listener,
                original_url: url,
                dest_path,
                resumable,
                record_path,
                report_progress,
                control: Mutex::new(ControlState {
                    preparing: true,
                    running: false,
                    early_stop: false,
                    done: false,
                    incarnation: 0,
                    token: task_token.child_token(),
                    sampler,
                    start_time: None,
                }),
                task_token,
                record: Mutex::new(RecordState {
                    record: None,
                    active_slots: HashSet::new(),
                }),
                downloaded: AtomicU64::new(0),
                file_length: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn spawn_run(&self) {
        self.inner.spawn_run();
    }

    /// Stops the task. The progress record stays on disk so a later
    /// [`resume`](Self::resume) can pick up where this run left off. A task
    /// that has not started yet is marked to not start at all.
    pub fn stop(&self) {
        self.inner.stop_run();
    }

    /// Alias for [`stop`](Self::stop).
    pub fn cancel(&self) {
        self.stop();
    }

    /// Restarts a stopped task as a fresh incarnation. No-op while the task
    /// is running or after it completed.
    pub fn resume(&self) {
        {
            let mut control = self.inner.control();
            if control.running || control.done {
                return;
            }
            control.preparing = true;
        }
        self.inner.downloaded.store(0, Ordering::SeqCst);
        self.inner.spawn_run();
    }

    /// Whether a run is currently active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.control().running
    }

    /// Whether the task is not currently running (stopped, finished, or
    /// never started).
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        !self.is_running()
    }

    /// Whether the download finished.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.control().done
    }

    /// Bytes streamed to disk so far.
    #[must_use]
    pub fn downloaded_bytes(&self) -> u64 {
        self.inner.downloaded.load(Ordering::SeqCst)
    }

    /// Remote content length, or 0 while still unknown.
    #[must_use]
    pub fn file_length(&self) -> u64 {
        self.inner.file_length.load(Ordering::SeqCst)
    }

    /// The URL this task was created with.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.inner.original_url
    }

    /// The destination file path.
    #[must_use]
    pub fn dest_path(&self) -> &Path {
        &self.inner.dest_path
    }
}

impl std::fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTask")
            .field("url", &self.inner.original_url.as_str())
            .field("dest", &self.inner.dest_path)
            .field("resumable", &self.inner.resumable)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::listener::NoopListener;
    use tempfile::TempDir;

    fn test_task(dir: &TempDir) -> DownloadTask {
        DownloadTask::new(
            Client::new(),
            DownloadConfig::default(),
            Url::parse("http://example.com/file.bin").unwrap(),
            dir.path().join("file.bin"),
            Arc::new(NoopListener),
            true,
            false,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_stop_before_start_marks_early_stop() {
        let dir = TempDir::new().unwrap();
        let task = test_task(&dir);

        // Not yet running, so this records an early stop.
        task.stop();
        assert!(!task.is_running());

        task.inner.run();
        // The early stop consumed the run: no worker, no record.
        assert!(!task.is_running());
        assert!(!dir.path().join("file.bin.cfg").exists());
    }

    #[tokio::test]
    async fn test_stop_run_reports_transition_once() {
        let dir = TempDir::new().unwrap();
        let task = test_task(&dir);
        {
            let mut control = task.inner.control();
            control.preparing = false;
            control.running = true;
            control.start_time = Some(Instant::now());
        }
        assert!(task.inner.stop_run());
        assert!(!task.inner.stop_run(), "second stop must be a no-op");
    }

    #[tokio::test]
    async fn test_complete_requires_all_bytes_unless_forced() {
        let dir = TempDir::new().unwrap();
        let task = test_task(&dir);
        {
            let mut control = task.inner.control();
            control.preparing = false;
            control.running = true;
        }
        task.inner.file_length.store(100, Ordering::SeqCst);
        task.inner.downloaded.store(40, Ordering::SeqCst);

        task.inner.complete(false);
        assert!(!task.is_done(), "incomplete byte count must not complete");

        task.inner.complete(true);
        assert!(task.is_done());
    }

    #[tokio::test]
    async fn test_resume_is_noop_after_completion() {
        let dir = TempDir::new().unwrap();
        let task = test_task(&dir);
        {
            let mut control = task.inner.control();
            control.preparing = false;
            control.running = true;
        }
        task.inner.complete(true);

        task.resume();
        assert!(!task.is_running());
        assert!(task.is_done());
    }

    #[tokio::test]
    async fn test_error_from_cancelled_incarnation_is_dropped() {
        use std::sync::atomic::AtomicUsize;

        struct CountingListener(AtomicUsize);
        impl DownloadListener for CountingListener {
            fn on_error(&self, _downloaded: u64, _error: &DownloadError) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dir = TempDir::new().unwrap();
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        let task = DownloadTask::new(
            Client::new(),
            DownloadConfig::default(),
            Url::parse("http://example.com/file.bin").unwrap(),
            dir.path().join("file.bin"),
            Arc::clone(&listener) as Arc<dyn DownloadListener>,
            true,
            false,
            CancellationToken::new(),
        );
        let run = {
            let mut control = task.inner.control();
            control.preparing = false;
            control.running = true;
            RunHandle {
                incarnation: 1,
                token: control.token.clone(),
                sampler: control.sampler.clone(),
            }
        };

        task.stop();
        task.inner
            .report_error(&run, DownloadError::http_status("http://example.com", 503));
        assert_eq!(listener.0.load(Ordering::SeqCst), 0);
    }
}

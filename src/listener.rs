//! Listener contract between a download task and its caller.

use crate::error::DownloadError;

/// Callbacks a download task delivers over its lifetime.
///
/// All methods default to no-ops so callers implement only what they need.
/// Callbacks arrive from worker and sampler tasks; implementations must be
/// cheap and must not block.
///
/// Delivery guarantees:
/// - `on_prepare` fires once per run, before any network activity.
/// - `on_receive_file_length` fires once per run, as soon as the total
///   length is learned.
/// - `on_progress_update` fires on the configured interval while the task
///   runs with progress reporting enabled.
/// - Exactly one of `on_complete` / `on_error` ends a run; a stopped run
///   ends with neither.
pub trait DownloadListener: Send + Sync {
    /// A run is about to start.
    fn on_prepare(&self) {}

    /// The remote content length became known.
    fn on_receive_file_length(&self, _downloaded: u64, _file_length: u64) {}

    /// Periodic progress report. `file_length` is 0 while still unknown,
    /// `speed` is in bytes per second averaged over the sampling window.
    fn on_progress_update(&self, _downloaded: u64, _file_length: u64, _speed: u64) {}

    /// The download finished and the progress record was deleted.
    fn on_complete(&self, _downloaded: u64, _file_length: u64, _total_seconds: u32) {}

    /// The run stopped on an error. The caller decides whether to
    /// [`resume`](crate::DownloadTask::resume).
    fn on_error(&self, _downloaded: u64, _error: &DownloadError) {}
}

/// Listener that ignores every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl DownloadListener for NoopListener {}

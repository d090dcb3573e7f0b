//! Tuning knobs for download tasks.
//!
//! One [`DownloadConfig`] is captured per task at construction time. The
//! defaults favor a small number of connections with chunk sizes large
//! enough to amortize request overhead; tests shrink everything.

use std::time::Duration;

/// Default number of parallel connections per task.
pub const DEFAULT_THREAD_COUNT: usize = 3;

/// Default per-worker transfer buffer size (64 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default size of a claimed byte-range chunk (1 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Default size of the very first provisional request, made while the file
/// length is still unknown (256 KiB).
pub const DEFAULT_INITIAL_CHUNK_SIZE: u64 = 256 * 1024;

/// Default maximum retry attempts per worker.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default backoff before the first retry (500 ms), doubled per attempt.
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Default backoff cap (32 seconds).
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(32);

/// Default sliding window over which download speed is averaged.
const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(10);

/// Default interval between progress callbacks.
const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Default HTTP connect timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default HTTP read timeout.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Configuration for one download task.
///
/// Construct with [`DownloadConfig::default`] and override selectively:
///
/// ```
/// use rangeget::DownloadConfig;
/// use std::time::Duration;
///
/// let config = DownloadConfig::default()
///     .with_thread_count(4)
///     .with_chunk_size(2 * 1024 * 1024)
///     .with_max_retries(5);
/// assert_eq!(config.thread_count, 4);
/// ```
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Maximum parallel connections for one task. The effective count
    /// shrinks for small files so no connection gets less than one
    /// initial chunk.
    pub thread_count: usize,
    /// Per-worker transfer buffer size in bytes.
    pub buffer_size: usize,
    /// Size of each claimed byte-range chunk.
    pub chunk_size: u64,
    /// Size of the first provisional request, before the file length is known.
    pub initial_chunk_size: u64,
    /// Retry budget per worker.
    pub max_retries: u32,
    /// Backoff before the first retry; doubles per attempt.
    pub initial_backoff: Duration,
    /// Backoff cap.
    pub max_backoff: Duration,
    /// Window over which speed samples are averaged.
    pub speed_window: Duration,
    /// Interval between `on_progress_update` callbacks.
    pub progress_interval: Duration,
    /// HTTP connect timeout.
    pub connect_timeout: Duration,
    /// HTTP read timeout.
    pub read_timeout: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            thread_count: DEFAULT_THREAD_COUNT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            initial_chunk_size: DEFAULT_INITIAL_CHUNK_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            speed_window: DEFAULT_SPEED_WINDOW,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl DownloadConfig {
    /// Sets the connection count (clamped to at least 1).
    #[must_use]
    pub fn with_thread_count(mut self, count: usize) -> Self {
        self.thread_count = count.max(1);
        self
    }

    /// Sets the per-worker buffer size (clamped to at least 1 KiB).
    #[must_use]
    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes.max(1024);
        self
    }

    /// Sets the chunk size (clamped to at least 1 KiB).
    #[must_use]
    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes.max(1024);
        self
    }

    /// Sets the provisional initial chunk size (clamped to at least 1 KiB).
    #[must_use]
    pub fn with_initial_chunk_size(mut self, bytes: u64) -> Self {
        self.initial_chunk_size = bytes.max(1024);
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the initial retry backoff.
    #[must_use]
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Sets the retry backoff cap.
    #[must_use]
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Sets the speed-sampling window.
    #[must_use]
    pub fn with_speed_window(mut self, window: Duration) -> Self {
        self.speed_window = window;
        self
    }

    /// Sets the progress callback interval.
    #[must_use]
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Sets the HTTP connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the HTTP read timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DownloadConfig::default();
        assert_eq!(config.thread_count, DEFAULT_THREAD_COUNT);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.initial_chunk_size, DEFAULT_INITIAL_CHUNK_SIZE);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert!(config.initial_backoff < config.max_backoff);
    }

    #[test]
    fn test_thread_count_clamped_to_one() {
        let config = DownloadConfig::default().with_thread_count(0);
        assert_eq!(config.thread_count, 1);
    }

    #[test]
    fn test_builders_chain() {
        let config = DownloadConfig::default()
            .with_thread_count(4)
            .with_chunk_size(2048)
            .with_max_retries(7)
            .with_initial_backoff(Duration::from_millis(10))
            .with_progress_interval(Duration::from_millis(100));
        assert_eq!(config.thread_count, 4);
        assert_eq!(config.chunk_size, 2048);
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.initial_backoff, Duration::from_millis(10));
        assert_eq!(config.progress_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_small_sizes_clamped() {
        let config = DownloadConfig::default()
            .with_chunk_size(1)
            .with_initial_chunk_size(1)
            .with_buffer_size(1);
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.initial_chunk_size, 1024);
        assert_eq!(config.buffer_size, 1024);
    }
}

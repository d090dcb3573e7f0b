//! Resumable multi-connection HTTP downloader.
//!
//! This library downloads a file over several parallel HTTP range requests
//! and keeps a small crash-safe ledger (`<dest>.cfg`) next to the
//! destination file, so an interrupted download resumes exactly where it
//! stopped instead of starting over.
//!
//! # Architecture
//!
//! - [`engine`] - Engine that creates tasks and owns the shared HTTP client
//! - `task` - Task lifecycle: run, stop, resume, complete
//! - `worker` - Per-connection state machine: claim a range, stream it,
//!   retry with backoff
//! - [`progress`] - The on-disk progress record and chunk allocator
//! - [`sampler`] - Sliding-window download speed measurement
//! - [`listener`] - Callback trait for observing a task
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rangeget::{DownloadEngine, DownloadListener};
//!
//! struct PrintProgress;
//!
//! impl DownloadListener for PrintProgress {
//!     fn on_progress_update(&self, downloaded: u64, file_length: u64, speed: u64) {
//!         println!("{downloaded}/{file_length} bytes, {speed} B/s");
//!     }
//! }
//!
//! # async fn example() -> Result<(), rangeget::EngineError> {
//! let engine = DownloadEngine::new("rangeget/0.1", 6)?;
//! let task = engine.start_download(
//!     "https://example.com/big.iso",
//!     "./big.iso",
//!     Arc::new(PrintProgress),
//!     true,  // resumable
//!     true,  // progress callbacks
//! )?;
//! // ... later:
//! task.stop();
//! task.resume();
//! # Ok(())
//! # }
//! ```

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod engine;
pub mod error;
pub mod listener;
pub mod progress;
pub mod sampler;
mod task;
mod worker;

// Re-export commonly used types
pub use config::{
    DEFAULT_BUFFER_SIZE, DEFAULT_CHUNK_SIZE, DEFAULT_INITIAL_CHUNK_SIZE, DEFAULT_MAX_RETRIES,
    DEFAULT_THREAD_COUNT, DownloadConfig,
};
pub use engine::{DownloadEngine, EngineError};
pub use error::DownloadError;
pub use listener::{DownloadListener, NoopListener};
pub use progress::ProgressRecord;
pub use sampler::SpeedSampler;
pub use task::DownloadTask;

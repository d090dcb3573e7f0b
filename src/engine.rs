//! Entry point for creating and running download tasks.
//!
//! One [`DownloadEngine`] holds a single connection-pooled HTTP client that
//! all tasks share, plus a root cancellation token that shutdown fans out
//! to every running task.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use reqwest::{Client, redirect};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::config::DownloadConfig;
use crate::listener::DownloadListener;
use crate::task::DownloadTask;

/// Error type for engine construction and task creation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    /// The download URL could not be parsed.
    #[error("invalid URL {url}: {source}")]
    InvalidUrl {
        /// The URL string that failed to parse.
        url: String,
        /// The underlying parse error.
        #[source]
        source: url::ParseError,
    },

    /// The engine no longer accepts downloads.
    #[error("engine is shut down")]
    ShutDown,
}

/// Creates download tasks and owns the resources they share.
///
/// The engine is created once and reused: its HTTP client pools
/// connections across all tasks, and redirects are handled by the workers
/// themselves so range requests can be reissued against the final URL.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use rangeget::{DownloadEngine, NoopListener};
///
/// # async fn example() -> Result<(), rangeget::EngineError> {
/// let engine = DownloadEngine::new("rangeget/0.1", 6)?;
/// let task = engine.start_download(
///     "https://example.com/big.iso",
///     "./big.iso",
///     Arc::new(NoopListener),
///     true,
///     true,
/// )?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct DownloadEngine {
    client: Client,
    config: DownloadConfig,
    root_token: CancellationToken,
    accepting: AtomicBool,
}

impl DownloadEngine {
    /// Creates an engine with the default [`DownloadConfig`].
    ///
    /// `max_connections` bounds the idle connections kept pooled per host.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ClientBuild`] if the HTTP client cannot be
    /// constructed (for example when no TLS backend is available).
    pub fn new(user_agent: &str, max_connections: usize) -> Result<Self, EngineError> {
        Self::with_config(user_agent, max_connections, DownloadConfig::default())
    }

    /// Creates an engine with an explicit configuration. The configuration
    /// becomes the default for every task this engine starts.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ClientBuild`] if the HTTP client cannot be
    /// constructed.
    pub fn with_config(
        user_agent: &str,
        max_connections: usize,
        config: DownloadConfig,
    ) -> Result<Self, EngineError> {
        let client = Client::builder()
            .user_agent(user_agent)
            // Workers follow redirects themselves so the Range header is
            // reissued against the redirect target.
            .redirect(redirect::Policy::none())
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .pool_max_idle_per_host(max_connections.max(1))
            .build()
            .map_err(EngineError::ClientBuild)?;

        debug!(
            user_agent,
            max_connections,
            thread_count = config.thread_count,
            "created download engine"
        );

        Ok(Self {
            client,
            config,
            root_token: CancellationToken::new(),
            accepting: AtomicBool::new(true),
        })
    }

    /// Starts downloading `url` into `dest_path` with the engine's default
    /// configuration. The task begins running immediately; its lifetime is
    /// observed through `listener` and controlled through the returned
    /// [`DownloadTask`].
    ///
    /// With `resumable` set, progress is tracked in a `<dest>.cfg` ledger
    /// next to the destination file and interrupted downloads pick up where
    /// they left off. `report_progress` enables the periodic
    /// `on_progress_update` callback.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidUrl`] for unparsable URLs and
    /// [`EngineError::ShutDown`] after [`shutdown`](Self::shutdown).
    pub fn start_download(
        &self,
        url: &str,
        dest_path: impl Into<PathBuf>,
        listener: Arc<dyn DownloadListener>,
        resumable: bool,
        report_progress: bool,
    ) -> Result<DownloadTask, EngineError> {
        self.start_download_with_config(
            url,
            dest_path,
            listener,
            resumable,
            report_progress,
            self.config.clone(),
        )
    }

    /// Like [`start_download`](Self::start_download) but with a per-task
    /// configuration override. The engine-level HTTP timeouts still apply;
    /// everything else comes from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidUrl`] for unparsable URLs and
    /// [`EngineError::ShutDown`] after [`shutdown`](Self::shutdown).
    pub fn start_download_with_config(
        &self,
        url: &str,
        dest_path: impl Into<PathBuf>,
        listener: Arc<dyn DownloadListener>,
        resumable: bool,
        report_progress: bool,
        config: DownloadConfig,
    ) -> Result<DownloadTask, EngineError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }
        let parsed = Url::parse(url).map_err(|source| EngineError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        let dest_path = dest_path.into();

        info!(url = %parsed, dest = %dest_path.display(), resumable, "starting download");

        let task = DownloadTask::new(
            self.client.clone(),
            config,
            parsed,
            dest_path,
            listener,
            resumable,
            report_progress,
            self.root_token.child_token(),
        );
        task.spawn_run();
        Ok(task)
    }

    /// Stops accepting new downloads and cancels every running task. Tasks
    /// keep their progress records, so they can be downloaded again later
    /// with a fresh engine.
    pub fn shutdown(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            info!("shutting down download engine");
            self.root_token.cancel();
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        !self.accepting.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::listener::NoopListener;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let engine = DownloadEngine::new("rangeget-test", 4).unwrap();
        let dir = TempDir::new().unwrap();
        let result = engine.start_download(
            "not a url",
            dir.path().join("out.bin"),
            Arc::new(NoopListener),
            true,
            false,
        );
        assert!(matches!(result, Err(EngineError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_downloads() {
        let engine = DownloadEngine::new("rangeget-test", 4).unwrap();
        let dir = TempDir::new().unwrap();
        engine.shutdown();
        assert!(engine.is_shut_down());

        let result = engine.start_download(
            "http://example.com/file.bin",
            dir.path().join("out.bin"),
            Arc::new(NoopListener),
            true,
            false,
        );
        assert!(matches!(result, Err(EngineError::ShutDown)));
    }

    #[test]
    fn test_engine_error_display() {
        let error = EngineError::ShutDown;
        assert!(error.to_string().contains("shut down"));
    }
}

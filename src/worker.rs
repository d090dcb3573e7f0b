//! Per-connection download worker.
//!
//! Each worker owns one range slot of the progress record and loops through
//! resolve-connect-stream: resolve the next byte range to fetch, issue a
//! ranged GET, stream the body into its reusable buffer and flush to the
//! destination file at the right offset. When its slot is exhausted it
//! claims a fresh chunk; when every byte of the file has been claimed it
//! takes over the next slot without a live worker, in case a range from a
//! previous run was left behind. Past the last slot it winds down and lets
//! the last finisher complete the task, or, when the record showed nothing
//! left before it ever streamed, completes without touching the network.
//!
//! The lead worker of a run additionally performs the first-206 negotiation:
//! it learns the file length from Content-Range, sizes the connection count
//! for the file, persists the negotiated state and spawns the sibling
//! workers.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{Response, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};
use url::Url;

use crate::error::DownloadError;
use crate::task::{RunHandle, TaskInner};

/// Redirect hops allowed within one connection attempt.
const MAX_REDIRECTS: u32 = 10;

pub(crate) struct DownloadWorker {
    task: Arc<TaskInner>,
    run: RunHandle,
    /// Range slot this worker currently owns.
    index: usize,
    /// Current request URL; falls back to the original after a bad status.
    url: Url,
    /// Whether this worker performs the first-206 negotiation.
    lead: bool,
    config_initialized: bool,
    /// Once the server has honored a range request, anything but 206 is an
    /// error rather than a fallback.
    partial_content_expected: bool,
    /// Whether this worker has streamed any range this run. Running out of
    /// ranges before the first stream means the record was already complete
    /// when the run started.
    streamed: bool,
    /// Reusable transfer buffer, flushed to disk when full.
    buffer: Vec<u8>,
    file: Option<File>,
    /// Next write offset within the destination file.
    position: u64,
    /// Exclusive end of the current range.
    end: u64,
    retries: u32,
    backoff: Duration,
}

impl DownloadWorker {
    pub(crate) fn new(
        task: Arc<TaskInner>,
        run: RunHandle,
        index: usize,
        lead: bool,
        partial_content_expected: bool,
    ) -> Self {
        let buffer = Vec::with_capacity(task.config.buffer_size);
        let backoff = task.config.initial_backoff;
        Self {
            url: task.original_url.clone(),
            task,
            run,
            index,
            lead,
            config_initialized: false,
            partial_content_expected,
            streamed: false,
            buffer,
            file: None,
            position: 0,
            end: 0,
            retries: 0,
            backoff,
        }
    }

    /// Runs the worker until its slot is exhausted, the run is cancelled,
    /// or an unrecoverable error is reported.
    pub(crate) async fn run(mut self) {
        debug!(index = self.index, url = %self.url, "worker started");
        loop {
            match self.attempt().await {
                Ok(()) => break,
                Err(error) => {
                    if self.run.token.is_cancelled() {
                        break;
                    }
                    if error.is_fatal() {
                        self.task.report_error(&self.run, error);
                        break;
                    }
                    let wrong_status = matches!(error, DownloadError::WrongStatus { .. });
                    if wrong_status {
                        // The server honored ranges before, so insist on
                        // partial content and retry against the original URL.
                        self.partial_content_expected = true;
                        self.url = self.task.original_url.clone();
                    }
                    debug!(index = self.index, error = %error, "worker attempt failed");
                    if self.retry().await {
                        continue;
                    }
                    let error = if wrong_status {
                        error
                    } else {
                        DownloadError::max_retries_reached(error)
                    };
                    self.task.report_error(&self.run, error);
                    break;
                }
            }
        }
        debug!(index = self.index, "worker finished");
    }

    /// One full attempt: resolve ranges, connect and stream until the slot
    /// is exhausted or an error propagates to the retry loop.
    async fn attempt(&mut self) -> Result<(), DownloadError> {
        loop {
            if self.run.token.is_cancelled() {
                return Ok(());
            }

            if self.task.resumable && !self.resolve_range()? {
                if self.streamed {
                    // Every byte is claimed and the leftover ranges belong
                    // to live workers; whichever finishes last completes
                    // the task.
                    debug!(index = self.index, "no chunks left, winding down");
                    return Ok(());
                }
                return self.finish_range_exhausted();
            }

            let Some(response) = self.connect().await? else {
                // Cancelled mid-connect.
                return Ok(());
            };

            match response.status() {
                StatusCode::OK => return self.stream_full(response).await,
                StatusCode::PARTIAL_CONTENT => {
                    if self.lead && !self.config_initialized && !self.init_from_partial(&response)?
                    {
                        // Content-Range was unusable; fall back to a single
                        // plain-body connection.
                        return self.stream_full(response).await;
                    }
                    if self.run.token.is_cancelled() {
                        return Ok(());
                    }
                    self.streamed = true;
                    self.stream_partial(response).await?;
                    // The worker that streamed the final bytes finishes the
                    // task here; otherwise loop around for the next chunk.
                    self.task.complete(false);
                }
                StatusCode::RANGE_NOT_SATISFIABLE => {
                    // The range lies past the end of the resource: nothing
                    // left to fetch for this slot. Mark it consumed.
                    let end = self.end;
                    let index = self.index;
                    self.task
                        .with_record(|record| record.set_start_offset(index, end))?;
                    debug!(index, "range not satisfiable, slot marked consumed");
                    return Ok(());
                }
                status if status.is_client_error() => {
                    return Err(DownloadError::unexpected_status(
                        self.url.as_str(),
                        status.as_u16(),
                    ));
                }
                status => {
                    return Err(DownloadError::http_status(
                        self.url.as_str(),
                        status.as_u16(),
                    ));
                }
            }
        }
    }

    /// Determines the byte range for the next request.
    ///
    /// A worker whose own slot is exhausted claims a fresh chunk, or walks
    /// up the slot indices looking for a range left behind by a previous
    /// run whose slot has no live worker. Slots owned by a live worker are
    /// skipped: taking one over would download the same bytes twice.
    ///
    /// Returns `Ok(false)` when nothing at or above this worker's slot is
    /// left to take.
    fn resolve_range(&mut self) -> Result<bool, DownloadError> {
        let chunk_size = self.task.config.chunk_size;
        let initial_chunk_size = self.task.config.initial_chunk_size;
        let start_index = self.index;

        let resolved = self.task.with_record_state(|record, active| {
            let mut index = start_index;
            loop {
                if index != start_index && active.contains(&index) {
                    index += 1;
                    if index >= usize::from(record.thread_count()) {
                        return Ok(None);
                    }
                    continue;
                }
                let (mut start, end) = record.range(index);
                if start > end {
                    // A start offset past the end should not happen; pull it
                    // back one chunk rather than fail the download.
                    start = end.saturating_sub(chunk_size);
                }
                if end == 0 {
                    // First request of this download; the length is unknown
                    // so ask for a provisional chunk.
                    return Ok(Some((index, start, initial_chunk_size)));
                }
                if start == end {
                    if let Some((s, e)) = record.claim_next_chunk(index, chunk_size)? {
                        if index != start_index {
                            active.remove(&start_index);
                            active.insert(index);
                        }
                        return Ok(Some((index, s, e)));
                    }
                    index += 1;
                    if index >= usize::from(record.thread_count()) {
                        return Ok(None);
                    }
                    continue;
                }
                if index != start_index {
                    active.remove(&start_index);
                    active.insert(index);
                }
                return Ok(Some((index, start, end)));
            }
        })?;

        match resolved.flatten() {
            Some((index, start, end)) => {
                self.index = index;
                self.position = start;
                self.end = end;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The record shows the whole file was claimed and streamed in an
    /// earlier run: complete without touching the network.
    fn finish_range_exhausted(&self) -> Result<(), DownloadError> {
        let Some(length) = self.task.with_record(|record| Ok(record.file_length()))? else {
            // The record was already taken by a completed run.
            return Ok(());
        };
        self.task.file_length.store(length, Ordering::SeqCst);
        self.task.downloaded.store(length, Ordering::SeqCst);
        debug!(index = self.index, length, "no chunks left to download");
        self.task.complete(true);
        Ok(())
    }

    /// Issues the GET request, following redirects and retrying responses
    /// that carry no usable content length. Returns `None` when cancelled.
    async fn connect(&mut self) -> Result<Option<Response>, DownloadError> {
        let mut redirects = 0u32;
        loop {
            let mut request = self
                .task
                .client
                .get(self.url.clone())
                // Ranges are only meaningful over the raw bytes.
                .header(ACCEPT_ENCODING, "identity");
            if self.task.resumable {
                request = request.header(
                    RANGE,
                    format!("bytes={}-{}", self.position, self.end.saturating_sub(1)),
                );
            }
            debug!(
                index = self.index,
                url = %self.url,
                start = self.position,
                end = self.end,
                "issuing request"
            );

            let result = tokio::select! {
                () = self.run.token.cancelled() => return Ok(None),
                result = request.send() => result,
            };
            let response = result.map_err(|e| DownloadError::network(self.url.as_str(), e))?;
            let status = response.status();

            if status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND {
                redirects += 1;
                if redirects > MAX_REDIRECTS {
                    return Err(DownloadError::http_status(
                        self.url.as_str(),
                        status.as_u16(),
                    ));
                }
                self.url = follow_location(&self.url, &response, status)?;
                debug!(index = self.index, url = %self.url, "following redirect");
                continue;
            }

            if status != StatusCode::PARTIAL_CONTENT {
                if self.partial_content_expected {
                    return Err(DownloadError::wrong_status(
                        self.url.as_str(),
                        status.as_u16(),
                    ));
                }
                if status == StatusCode::OK && response.content_length().unwrap_or(0) == 0 {
                    // A 200 without a usable Content-Length cannot be
                    // downloaded; retry the original URL within the shared
                    // budget before giving up.
                    self.url = self.task.original_url.clone();
                    if self.retry().await {
                        continue;
                    }
                    return Err(DownloadError::zero_content_length(self.url.as_str()));
                }
            }

            return Ok(Some(response));
        }
    }

    /// First-206 negotiation by the lead worker: learn the total length
    /// from Content-Range, size the connection count, persist the record
    /// state and spawn siblings.
    ///
    /// Returns `Ok(false)` when Content-Range is unusable and the caller
    /// should fall back to a full-body download.
    fn init_from_partial(&mut self, response: &Response) -> Result<bool, DownloadError> {
        let Some(total) = content_range_total(response) else {
            warn!(url = %self.url, "206 without usable Content-Range");
            return Ok(false);
        };
        self.partial_content_expected = true;

        let configured_count = self.task.config.thread_count;
        let initial_chunk_size = self.task.config.initial_chunk_size;
        let index = self.index;
        let position = self.position;
        let mut end = self.end;

        let (thread_count, downloaded) = self
            .task
            .with_record(|record| {
                let persisted_count = record.thread_count();
                let persisted_length = record.file_length();
                if persisted_count == 0 || (persisted_length != 0 && persisted_length != total) {
                    if persisted_length != 0 && persisted_length != total {
                        warn!(
                            persisted_length,
                            total, "remote length changed, discarding previous progress"
                        );
                        record.reset()?;
                    }
                    // Small files do not get the full connection count: every
                    // connection should have at least one initial chunk.
                    let mut count = u8::try_from(configured_count).unwrap_or(u8::MAX).max(1);
                    while count > 1 && total / u64::from(count) < initial_chunk_size {
                        count -= 1;
                    }
                    // The provisional first request may reach past the end
                    // of a small file.
                    if end > total {
                        end = total;
                    }
                    record.set_range(index, position, end)?;
                    record.set_high_water_mark(end)?;
                    record.set_file_length(total)?;
                    record.set_thread_count(count)?;
                    Ok((count, 0))
                } else {
                    Ok((persisted_count, record.downloaded_bytes()))
                }
            })?
            .unwrap_or((1, 0));
        self.end = end;

        self.task.file_length.store(total, Ordering::SeqCst);
        self.task.downloaded.store(downloaded, Ordering::SeqCst);
        self.config_initialized = true;

        debug!(
            index = self.index,
            total, thread_count, downloaded, "negotiated ranged download"
        );
        self.task.listener.on_receive_file_length(downloaded, total);
        self.task.spawn_siblings(&self.run, self.index, thread_count)?;
        Ok(true)
    }

    /// Streams a 206 body into the current range, flushing through the
    /// buffer and persisting the slot's start offset after every flush.
    async fn stream_partial(&mut self, response: Response) -> Result<(), DownloadError> {
        // Bytes are flowing again: give future failures a full budget.
        self.retries = 0;
        self.backoff = self.task.config.initial_backoff;

        self.ensure_file().await?;
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                () = self.run.token.cancelled() => {
                    self.flush(true).await?;
                    return Ok(());
                }
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    let remaining = usize::try_from(self.end.saturating_sub(self.position))
                        .unwrap_or(usize::MAX)
                        .saturating_sub(self.buffer.len());
                    if bytes.len() > remaining {
                        // A body running past the requested range would spill
                        // into a sibling's bytes; drop the excess.
                        warn!(
                            index = self.index,
                            end = self.end,
                            "response body runs past the requested range"
                        );
                    }
                    self.buffer
                        .extend_from_slice(&bytes[..bytes.len().min(remaining)]);
                    if self.buffer.len() >= self.task.config.buffer_size {
                        self.flush(true).await?;
                    }
                }
                Some(Err(e)) => {
                    // Keep what already arrived before surfacing the error.
                    self.flush(true).await?;
                    return Err(DownloadError::network(self.url.as_str(), e));
                }
                None => {
                    self.flush(true).await?;
                    return Ok(());
                }
            }
        }
    }

    /// Streams a plain 200 body from the top of the file. Used when the
    /// server does not honor range requests.
    async fn stream_full(&mut self, response: Response) -> Result<(), DownloadError> {
        self.retries = 0;
        self.backoff = self.task.config.initial_backoff;

        let length = response.content_length().unwrap_or(0);
        self.task.file_length.store(length, Ordering::SeqCst);
        self.task.downloaded.store(0, Ordering::SeqCst);
        self.task.listener.on_receive_file_length(0, length);
        debug!(index = self.index, length, "falling back to full-body download");

        // Restarting from scratch; whatever ranges were written before no
        // longer line up with this response.
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.task.dest_path)
            .await
            .map_err(|e| DownloadError::io(self.task.dest_path.clone(), e))?;
        self.file = Some(file);
        self.position = 0;

        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                () = self.run.token.cancelled() => {
                    self.flush(false).await?;
                    return Ok(());
                }
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    self.buffer.extend_from_slice(&bytes);
                    if self.buffer.len() >= self.task.config.buffer_size {
                        self.flush(false).await?;
                    }
                }
                Some(Err(e)) => {
                    self.flush(false).await?;
                    return Err(DownloadError::network(self.url.as_str(), e));
                }
                None => {
                    self.flush(false).await?;
                    self.task.complete(true);
                    return Ok(());
                }
            }
        }
    }

    /// Writes the buffer at the current position, advances the counters and
    /// optionally persists the slot's start offset.
    async fn flush(&mut self, persist_offset: bool) -> Result<(), DownloadError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let dest = self.task.dest_path.clone();
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => self.file.insert(open_destination(&dest).await?),
        };
        file.seek(std::io::SeekFrom::Start(self.position))
            .await
            .map_err(|e| DownloadError::io(dest.clone(), e))?;
        file.write_all(&self.buffer)
            .await
            .map_err(|e| DownloadError::io(dest.clone(), e))?;
        file.flush()
            .await
            .map_err(|e| DownloadError::io(dest, e))?;

        let written = self.buffer.len() as u64;
        self.buffer.clear();
        self.position += written;

        if persist_offset {
            let index = self.index;
            let position = self.position;
            self.task
                .with_record(|record| record.set_start_offset(index, position))?;
        }
        self.task.downloaded.fetch_add(written, Ordering::SeqCst);
        self.run.sampler.record(written);
        Ok(())
    }

    async fn ensure_file(&mut self) -> Result<(), DownloadError> {
        if self.file.is_none() {
            self.file = Some(open_destination(&self.task.dest_path).await?);
        }
        Ok(())
    }

    /// Sleeps the current backoff and doubles it for next time. Returns
    /// whether another attempt should be made.
    async fn retry(&mut self) -> bool {
        if self.retries >= self.task.config.max_retries {
            return false;
        }
        self.retries += 1;
        let wait = self.backoff;
        self.backoff = (self.backoff * 2).min(self.task.config.max_backoff);
        debug!(
            index = self.index,
            retries = self.retries,
            wait_ms = wait.as_millis(),
            "backing off before retry"
        );
        tokio::select! {
            () = self.run.token.cancelled() => {}
            () = tokio::time::sleep(wait) => {}
        }
        !self.run.token.is_cancelled()
    }
}

/// Resolves the Location header of a redirect against the current URL.
fn follow_location(
    current: &Url,
    response: &Response,
    status: StatusCode,
) -> Result<Url, DownloadError> {
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| DownloadError::http_status(current.as_str(), status.as_u16()))?;
    current
        .join(location)
        .map_err(|_| DownloadError::invalid_url(location))
}

/// Opens the destination file for in-place range writes, creating it if
/// needed and never truncating existing bytes.
async fn open_destination(path: &std::path::Path) -> Result<File, DownloadError> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await
        .map_err(|e| DownloadError::io(path.to_path_buf(), e))
}

/// Extracts the total length from a Content-Range header
/// (`bytes 0-499/1234` gives 1234). Returns `None` for `*` or anything
/// unparsable.
fn content_range_total(response: &Response) -> Option<u64> {
    let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    parse_content_range_total(value)
}

fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

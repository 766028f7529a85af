// src/downloader.rs

use crate::limiter::SpeedLimiter;
use crate::models::{DownloadEvent, DownloadId, DownloadRow, DownloadStatus, EventKind};
use futures_util::TryStreamExt;
use log::{debug, info, trace, warn};
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Client, StatusCode, Url};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

/// `total_size` value until the first successful response.
pub const UNKNOWN_SIZE: i64 = -1;

/// Errors for download operations.
///
/// Fetch failures never leave the fetch task; they are recorded and turn the
/// download into [`DownloadStatus::Error`]. Only the command variants are
/// returned to callers.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("server responded with {0}")]
    Status(StatusCode),
    #[error("missing or invalid content length")]
    InvalidContentLength,
    #[error("stream ended after {received} of {expected} bytes")]
    Truncated { received: u64, expected: u64 },
    #[error("cannot {action} a download that is {from}")]
    InvalidTransition { action: &'static str, from: DownloadStatus },
    #[error("download already started")]
    AlreadyStarted,
}

impl DownloadError {
    /// True for failures caused by the server's answer rather than the transport.
    pub const fn is_protocol(&self) -> bool {
        matches!(self, Self::Status(_) | Self::InvalidContentLength)
    }
}

/// Fixed settings of a download.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub url: Url,
    pub destination: PathBuf,
    /// Largest read/write per loop iteration.
    pub chunk_size: usize,
}

/// How a fetch run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchOutcome {
    /// The body was consumed to its end.
    Finished,
    /// A pause or cancel stopped the run.
    Interrupted,
}

/// The fetch task currently owning the destination file.
#[derive(Debug)]
struct ActiveRun {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// One resumable HTTP transfer.
///
/// The fetch loop runs on its own tokio task. `status` is the only field
/// written from both sides; it is an atomic and every transition is a
/// compare-exchange, so a terminal state is never overwritten.
///
/// `pause` and `cancel` flip the status while holding `write_gate`, the same
/// lock the fetch loop holds from its status re-check to the chunk's progress
/// event. Once either command returns, no further chunk reaches the file.
#[derive(Debug)]
pub struct Download {
    id: DownloadId,
    client: Client,
    options: DownloadOptions,
    limiter: SpeedLimiter,
    status: AtomicU8,
    total_size: AtomicI64,
    bytes_transferred: AtomicU64,
    last_error: Mutex<Option<String>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DownloadEvent>>>,
    run: Mutex<Option<ActiveRun>>,
    write_gate: Mutex<()>,
}

impl Download {
    /// Creates a download in the `Downloading` state. Nothing is fetched until
    /// [`Download::start`] is called, so subscribers can attach first.
    pub fn new(
        id: DownloadId,
        options: DownloadOptions,
        client: Client,
        limiter: SpeedLimiter,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            client,
            options,
            limiter,
            status: AtomicU8::new(DownloadStatus::Downloading as u8),
            total_size: AtomicI64::new(UNKNOWN_SIZE),
            bytes_transferred: AtomicU64::new(0),
            last_error: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            run: Mutex::new(None),
            write_gate: Mutex::new(()),
        })
    }

    pub fn id(&self) -> DownloadId {
        self.id
    }

    pub fn url(&self) -> &Url {
        &self.options.url
    }

    pub fn destination(&self) -> &Path {
        &self.options.destination
    }

    pub fn status(&self) -> DownloadStatus {
        DownloadStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Resource length in bytes, or [`UNKNOWN_SIZE`].
    pub fn total_size(&self) -> i64 {
        self.total_size.load(Ordering::SeqCst)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::SeqCst)
    }

    /// Progress as a percentage, `None` while the size is unknown.
    pub fn progress(&self) -> Option<f32> {
        let total = self.total_size();
        if total <= 0 {
            return None;
        }
        Some(self.bytes_transferred() as f32 / total as f32 * 100.0)
    }

    /// Reason of the most recent failed fetch, cleared on resume.
    pub async fn last_error(&self) -> Option<String> {
        self.last_error.lock().await.clone()
    }

    pub fn snapshot(&self) -> DownloadRow {
        let total = self.total_size();
        DownloadRow {
            id: self.id,
            url: self.options.url.to_string(),
            size: u64::try_from(total).ok(),
            progress: self.progress(),
            status: self.status(),
        }
    }

    /// Registers a new observer. Events are delivered in emission order.
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<DownloadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push(tx);
        rx
    }

    /// Launches the first fetch.
    pub async fn start(self: &Arc<Self>) -> Result<(), DownloadError> {
        let mut run = self.run.lock().await;
        if run.is_some() {
            return Err(DownloadError::AlreadyStarted);
        }
        let status = self.status();
        if status != DownloadStatus::Downloading {
            return Err(DownloadError::InvalidTransition { action: "start", from: status });
        }
        info!("Download {}: starting {}", self.id, self.options.url);
        *run = Some(self.spawn_run(None));
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), DownloadError> {
        let _gate = self.write_gate.lock().await;
        self.transition(&[DownloadStatus::Downloading], DownloadStatus::Paused, "pause")?;
        self.interrupt().await;
        info!("Download {}: paused at {} bytes", self.id, self.bytes_transferred());
        self.emit(EventKind::StatusChanged(DownloadStatus::Paused)).await;
        Ok(())
    }

    /// Restarts the fetch from `bytes_transferred` after a pause or error.
    ///
    /// A download whose bytes are all on disk completes without a request.
    pub async fn resume(self: &Arc<Self>) -> Result<(), DownloadError> {
        if self.is_fully_written() {
            self.transition(
                &[DownloadStatus::Paused, DownloadStatus::Error],
                DownloadStatus::Complete,
                "resume",
            )?;
            *self.last_error.lock().await = None;
            self.join().await;
            info!("Download {}: all {} bytes already written", self.id, self.bytes_transferred());
            self.emit(EventKind::StatusChanged(DownloadStatus::Complete)).await;
            return Ok(());
        }

        self.transition(
            &[DownloadStatus::Paused, DownloadStatus::Error],
            DownloadStatus::Downloading,
            "resume",
        )?;
        *self.last_error.lock().await = None;
        info!("Download {}: resuming from {} bytes", self.id, self.bytes_transferred());
        self.emit(EventKind::StatusChanged(DownloadStatus::Downloading)).await;

        let mut run = self.run.lock().await;
        let previous = run.take().map(|active| active.handle);
        *run = Some(self.spawn_run(previous));
        Ok(())
    }

    pub async fn cancel(&self) -> Result<(), DownloadError> {
        let _gate = self.write_gate.lock().await;
        self.transition(
            &[DownloadStatus::Downloading, DownloadStatus::Paused],
            DownloadStatus::Cancelled,
            "cancel",
        )?;
        self.interrupt().await;
        info!("Download {}: cancelled", self.id);
        self.emit(EventKind::StatusChanged(DownloadStatus::Cancelled)).await;
        Ok(())
    }

    /// Waits for the current fetch task, if any, to release the file.
    pub async fn join(&self) {
        let handle = self.run.lock().await.take().map(|active| active.handle);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Download {}: fetch task ended abnormally: {}", self.id, e);
            }
        }
    }

    fn transition(
        &self,
        from: &[DownloadStatus],
        to: DownloadStatus,
        action: &'static str,
    ) -> Result<(), DownloadError> {
        let mut current = self.status();
        loop {
            if !from.contains(&current) {
                return Err(DownloadError::InvalidTransition { action, from: current });
            }
            match self.status.compare_exchange(
                current as u8,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = DownloadStatus::from_u8(actual),
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn observer_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    fn is_fully_written(&self) -> bool {
        u64::try_from(self.total_size()).is_ok_and(|total| total > 0 && self.bytes_transferred() == total)
    }

    /// Moves a running download to `to`; false if a command got there first.
    fn settle(&self, to: DownloadStatus) -> bool {
        self.status
            .compare_exchange(
                DownloadStatus::Downloading as u8,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    async fn interrupt(&self) {
        if let Some(active) = self.run.lock().await.as_ref() {
            active.token.cancel();
        }
    }

    async fn emit(&self, kind: EventKind) {
        let event = DownloadEvent { id: self.id, kind };
        // drop observers whose receiver is gone
        self.subscribers
            .lock()
            .await
            .retain(|tx| tx.send(event).is_ok());
    }

    fn spawn_run(self: &Arc<Self>, previous: Option<JoinHandle<()>>) -> ActiveRun {
        let token = CancellationToken::new();
        let this = Arc::clone(self);
        let run_token = token.clone();
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            this.run_fetch(run_token).await;
        });
        ActiveRun { token, handle }
    }

    async fn run_fetch(&self, token: CancellationToken) {
        match self.fetch(&token).await {
            Ok(FetchOutcome::Finished) => {
                if self.settle(DownloadStatus::Complete) {
                    info!(
                        "Download {}: complete, {} bytes written to {}",
                        self.id,
                        self.bytes_transferred(),
                        self.options.destination.display()
                    );
                    self.emit(EventKind::StatusChanged(DownloadStatus::Complete)).await;
                }
            }
            Ok(FetchOutcome::Interrupted) => {
                debug!("Download {}: fetch stopped as {}", self.id, self.status());
            }
            Err(e) => {
                if self.settle(DownloadStatus::Error) {
                    let kind = if e.is_protocol() { "protocol" } else { "transport" };
                    warn!("Download {}: {} error: {}", self.id, kind, e);
                    *self.last_error.lock().await = Some(e.to_string());
                    self.emit(EventKind::StatusChanged(DownloadStatus::Error)).await;
                } else {
                    debug!("Download {}: ignoring error after {}: {}", self.id, self.status(), e);
                }
            }
        }
    }

    /// One HTTP attempt starting at `bytes_transferred`.
    async fn fetch(&self, token: &CancellationToken) -> Result<FetchOutcome, DownloadError> {
        let offset = self.bytes_transferred();
        debug!("Download {}: requesting bytes={}-", self.id, offset);

        let request = self
            .client
            .get(self.options.url.clone())
            .header(RANGE, format!("bytes={offset}-"))
            .send();
        let response = tokio::select! {
            biased;
            () = token.cancelled() => return Ok(FetchOutcome::Interrupted),
            response = request => response?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status(status));
        }
        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|&len| len >= 1)
            .ok_or(DownloadError::InvalidContentLength)?;

        if self.total_size() == UNKNOWN_SIZE {
            let size = i64::try_from(content_length).map_err(|_| DownloadError::InvalidContentLength)?;
            self.total_size.store(size, Ordering::SeqCst);
            debug!("Download {}: size is {} bytes", self.id, content_length);
            self.emit(EventKind::SizeKnown(content_length)).await;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.options.destination)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let body = Box::pin(response.bytes_stream().map_err(io::Error::other));
        let mut reader = StreamReader::new(body);

        // A 200 carries the whole resource; drop what is already on disk.
        if status != StatusCode::PARTIAL_CONTENT && offset > 0 {
            debug!("Download {}: range ignored by server, skipping {} bytes", self.id, offset);
            let skipped = tokio::io::copy(&mut (&mut reader).take(offset), &mut tokio::io::sink()).await?;
            if skipped < offset {
                return Err(DownloadError::Truncated { received: skipped, expected: offset });
            }
        }

        let outcome = self.pump(&mut reader, &mut file, token).await;
        let flushed = file.flush().await;
        let outcome = outcome?;
        flushed?;
        Ok(outcome)
    }

    /// The chunk loop. Re-checks status and token between chunks and races
    /// every read against the token so pause/cancel never wait on the network.
    async fn pump<R>(
        &self,
        reader: &mut R,
        file: &mut tokio::fs::File,
        token: &CancellationToken,
    ) -> Result<FetchOutcome, DownloadError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = vec![0u8; self.options.chunk_size.max(1)];
        loop {
            let cap = self.next_chunk_len(buffer.len());
            if cap == 0 {
                return Ok(FetchOutcome::Finished);
            }
            if token.is_cancelled() || self.status() != DownloadStatus::Downloading {
                return Ok(FetchOutcome::Interrupted);
            }

            let count = tokio::select! {
                biased;
                () = token.cancelled() => return Ok(FetchOutcome::Interrupted),
                count = fill_chunk(&mut *reader, &mut buffer[..cap]) => count?,
            };
            // A body shorter than the advertised length ends in Error rather
            // than Complete, so the missing tail can still be fetched by resume.
            if count == 0 {
                let expected = self.total_size();
                let received = self.bytes_transferred();
                if expected > 0 && received < expected as u64 {
                    return Err(DownloadError::Truncated { received, expected: expected as u64 });
                }
                return Ok(FetchOutcome::Finished);
            }

            tokio::select! {
                biased;
                () = token.cancelled() => return Ok(FetchOutcome::Interrupted),
                () = self.limiter.take(count as u64) => {}
            }

            let _gate = self.write_gate.lock().await;
            if self.status() != DownloadStatus::Downloading {
                return Ok(FetchOutcome::Interrupted);
            }
            file.write_all(&buffer[..count]).await?;
            let transferred = self.bytes_transferred.fetch_add(count as u64, Ordering::SeqCst) + count as u64;
            trace!("Download {}: {} bytes", self.id, transferred);
            self.emit(EventKind::ProgressAdvanced { transferred }).await;
        }
    }

    /// Chunk cap for the next read, shrunk so the loop never asks for more
    /// than the remaining length.
    fn next_chunk_len(&self, max: usize) -> usize {
        let total = self.total_size();
        if total < 0 {
            return max;
        }
        let remaining = (total as u64).saturating_sub(self.bytes_transferred());
        usize::try_from(remaining).map_or(max, |remaining| remaining.min(max))
    }
}

/// Reads until `buf` is full or the stream ends.
async fn fill_chunk<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

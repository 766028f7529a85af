// src/registry.rs

use crate::config::{ConfigError, DownloadConfig};
use crate::downloader::{Download, DownloadError, DownloadOptions};
use crate::limiter::SpeedLimiter;
use crate::models::{DownloadEvent, DownloadId, DownloadRow, DownloadStatus, RegistryEvent};
use crate::validation::{file_name, validate_url, UrlError};
use log::{debug, info};
use reqwest::{Client, Url};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid download url: {0}")]
    InvalidUrl(#[from] UrlError),
    #[error("no download at row {index} (rows: {len})")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("download at row {index} is still {status}")]
    StillActive { index: usize, status: DownloadStatus },
    #[error("download {0} not found")]
    NotFound(DownloadId),
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
    #[error("download error: {0}")]
    Download(#[from] DownloadError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

type Entries = Arc<Mutex<Vec<Entry>>>;
type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<RegistryEvent>>>>;

struct Entry {
    download: Arc<Download>,
    /// Forwards the download's events as row updates.
    relay: AbortHandle,
}

/// Ordered collection of downloads; the position of a download is its row.
///
/// Lock order is always `entries` then `subscribers`, and row events are
/// published while `entries` is held, so subscribers never see an update for
/// a row index that has already shifted.
pub struct DownloadRegistry {
    config: DownloadConfig,
    http_client: Client,
    limiter: SpeedLimiter,
    entries: Entries,
    subscribers: Subscribers,
    /// Relay tasks of every row, reachable from `Drop` without awaiting.
    relays: std::sync::Mutex<Vec<(DownloadId, AbortHandle)>>,
    next_id: AtomicU64,
}

impl DownloadRegistry {
    pub fn new(config: DownloadConfig) -> Result<Self, RegistryError> {
        config.validate()?;
        let http_client = Client::builder().user_agent(config.user_agent.as_str()).build()?;
        let limiter = SpeedLimiter::new(config.speed_limit);

        Ok(Self {
            config,
            http_client,
            limiter,
            entries: Arc::new(Mutex::new(Vec::new())),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            relays: std::sync::Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Current shared bandwidth cap in bytes per second, 0 when unlimited.
    pub async fn speed_limit(&self) -> u64 {
        self.limiter.rate().await
    }

    /// Changes the shared bandwidth cap. 0 means unlimited.
    pub async fn set_speed_limit(&self, bytes_per_sec: u64) {
        info!("Registry: speed limit set to {} B/s", bytes_per_sec);
        self.limiter.set_rate(bytes_per_sec).await;
    }

    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<RegistryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().await.push(tx);
        rx
    }

    /// Validates `url`, then starts a download into the configured directory
    /// named after the last path segment.
    pub async fn add_download(&self, url: &str) -> Result<Arc<Download>, RegistryError> {
        let url = validate_url(url)?;
        let destination = self.config.download_dir.join(file_name(&url));
        self.create(url, destination).await
    }

    /// Like [`add_download`](Self::add_download) with an explicit destination.
    pub async fn add_download_to(
        &self,
        url: &str,
        destination: impl Into<PathBuf>,
    ) -> Result<Arc<Download>, RegistryError> {
        let url = validate_url(url)?;
        self.create(url, destination.into()).await
    }

    async fn create(&self, url: Url, destination: PathBuf) -> Result<Arc<Download>, RegistryError> {
        let id = DownloadId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let options = DownloadOptions {
            url,
            destination,
            chunk_size: self.config.chunk_size,
        };
        let download = Download::new(id, options, self.http_client.clone(), self.limiter.clone());

        self.add(Arc::clone(&download)).await;
        download.start().await?;
        Ok(download)
    }

    /// Appends `download` as the last row and relays its notifications.
    pub async fn add(&self, download: Arc<Download>) -> usize {
        let events = download.subscribe().await;

        let mut entries = self.entries.lock().await;
        let relay = tokio::spawn(relay(
            events,
            Arc::clone(&self.entries),
            Arc::clone(&self.subscribers),
        ));
        self.relays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((download.id(), relay.abort_handle()));
        let relay = relay.abort_handle();
        info!("Registry: added download {} ({})", download.id(), download.url());
        entries.push(Entry { download, relay });
        let index = entries.len() - 1;
        publish(&self.subscribers, RegistryEvent::RowInserted { index }).await;
        index
    }

    pub async fn get(&self, index: usize) -> Result<Arc<Download>, RegistryError> {
        let entries = self.entries.lock().await;
        entries
            .get(index)
            .map(|entry| Arc::clone(&entry.download))
            .ok_or(RegistryError::IndexOutOfRange { index, len: entries.len() })
    }

    pub async fn position(&self, id: DownloadId) -> Option<usize> {
        self.entries
            .lock()
            .await
            .iter()
            .position(|entry| entry.download.id() == id)
    }

    /// Removes the row at `index`. Later rows move up by one.
    ///
    /// Rows that are downloading or paused are refused; cancel them first.
    /// Returns once the download's fetch task has released the file.
    pub async fn remove(&self, index: usize) -> Result<Arc<Download>, RegistryError> {
        let download = {
            let mut entries = self.entries.lock().await;
            let len = entries.len();
            let status = entries
                .get(index)
                .ok_or(RegistryError::IndexOutOfRange { index, len })?
                .download
                .status();
            if status.is_active() {
                return Err(RegistryError::StillActive { index, status });
            }

            let entry = entries.remove(index);
            entry.relay.abort();
            self.relays
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != entry.download.id());
            publish(&self.subscribers, RegistryEvent::RowRemoved { index }).await;
            entry.download
        };

        download.join().await;
        info!("Registry: cleared download {}", download.id());
        Ok(download)
    }

    /// Removes the download with the given handle.
    pub async fn clear(&self, id: DownloadId) -> Result<Arc<Download>, RegistryError> {
        let index = self.position(id).await.ok_or(RegistryError::NotFound(id))?;
        self.remove(index).await
    }

    /// Cancels every download that is still downloading or paused.
    pub async fn cancel_all(&self) {
        for download in self.downloads().await {
            if download.status().is_active() {
                if let Err(e) = download.cancel().await {
                    debug!("Registry: cancel of {} skipped: {}", download.id(), e);
                }
            }
        }
    }

    pub async fn downloads(&self) -> Vec<Arc<Download>> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|entry| Arc::clone(&entry.download))
            .collect()
    }

    pub async fn rows(&self) -> Vec<DownloadRow> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|entry| entry.download.snapshot())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl Drop for DownloadRegistry {
    fn drop(&mut self) {
        let relays = self.relays.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, relay) in relays.drain(..) {
            relay.abort();
        }
    }
}

async fn relay(
    mut events: mpsc::UnboundedReceiver<DownloadEvent>,
    entries: Entries,
    subscribers: Subscribers,
) {
    while let Some(event) = events.recv().await {
        let rows = entries.lock().await;
        let Some(index) = rows.iter().position(|entry| entry.download.id() == event.id) else {
            continue;
        };
        publish(
            &subscribers,
            RegistryEvent::RowUpdated { index, id: event.id, kind: event.kind },
        )
        .await;
    }
}

async fn publish(subscribers: &Subscribers, event: RegistryEvent) {
    subscribers
        .lock()
        .await
        .retain(|tx| tx.send(event).is_ok());
}

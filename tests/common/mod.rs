#![allow(dead_code)]

use dlmgr::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};

pub const WAIT: Duration = Duration::from_secs(5);

/// Deterministic body of `len` bytes.
pub fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn test_download(url: &str, destination: &std::path::Path, chunk_size: usize) -> Arc<Download> {
    let options = DownloadOptions {
        url: validate_url(url).unwrap(),
        destination: destination.to_path_buf(),
        chunk_size,
    };
    Download::new(DownloadId(1), options, reqwest::Client::new(), SpeedLimiter::unlimited())
}

/// Receives until `pred` matches, failing the test after [`WAIT`].
pub async fn wait_for<T, F>(rx: &mut mpsc::UnboundedReceiver<T>, mut pred: F) -> T
where
    T: std::fmt::Debug,
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub async fn wait_for_status(rx: &mut mpsc::UnboundedReceiver<DownloadEvent>, status: DownloadStatus) {
    wait_for(rx, |e| e.kind == EventKind::StatusChanged(status)).await;
}

/// Waits for `download` to reach `status`, whether or not it already has.
pub async fn wait_until(download: &Download, status: DownloadStatus) {
    let mut rx = download.subscribe().await;
    if download.status() == status {
        return;
    }
    wait_for_status(&mut rx, status).await;
}

/// Minimal HTTP/1.1 server for scenarios wiremock cannot express: it can
/// stall the first response after a number of body bytes, and it can omit
/// `Content-Length`.
pub struct GatedServer {
    pub url: String,
    ranges: Arc<Mutex<Vec<Option<String>>>>,
    release: Arc<Notify>,
}

#[derive(Clone)]
pub struct ServerBehavior {
    pub body: Vec<u8>,
    /// Stall the first response after this many body bytes until released.
    pub stall_after: Option<usize>,
    pub content_length: bool,
    /// Advertise this length instead of the real one.
    pub declared_length: Option<usize>,
    pub honor_range: bool,
}

impl ServerBehavior {
    pub fn new(body: Vec<u8>) -> Self {
        Self { body, stall_after: None, content_length: true, declared_length: None, honor_range: true }
    }
}

impl GatedServer {
    pub async fn start(behavior: ServerBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ranges = Arc::new(Mutex::new(Vec::new()));
        let release = Arc::new(Notify::new());

        let server_ranges = Arc::clone(&ranges);
        let server_release = Arc::clone(&release);
        tokio::spawn(async move {
            let mut first = true;
            while let Ok((stream, _)) = listener.accept().await {
                let stall = if first { behavior.stall_after } else { None };
                first = false;
                tokio::spawn(serve(
                    stream,
                    behavior.clone(),
                    stall,
                    Arc::clone(&server_ranges),
                    Arc::clone(&server_release),
                ));
            }
        });

        Self { url: format!("http://{addr}/file.bin"), ranges, release }
    }

    /// `Range` header of every request received so far.
    pub fn ranges(&self) -> Vec<Option<String>> {
        self.ranges.lock().unwrap().clone()
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

async fn serve(
    mut stream: TcpStream,
    behavior: ServerBehavior,
    stall: Option<usize>,
    ranges: Arc<Mutex<Vec<Option<String>>>>,
    release: Arc<Notify>,
) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }

    let text = String::from_utf8_lossy(&request).to_string();
    let range = text.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.eq_ignore_ascii_case("range").then(|| value.trim().to_string())
    });
    ranges.lock().unwrap().push(range.clone());

    let offset = range
        .as_deref()
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.trim_end_matches('-').parse::<usize>().ok())
        .unwrap_or(0)
        .min(behavior.body.len());

    let total = behavior.body.len();
    let (status, payload) = if behavior.honor_range && offset > 0 {
        ("206 Partial Content", &behavior.body[offset..])
    } else {
        ("200 OK", &behavior.body[..])
    };

    let mut head = format!("HTTP/1.1 {status}\r\nConnection: close\r\n");
    if behavior.content_length {
        let length = behavior.declared_length.unwrap_or(payload.len());
        head.push_str(&format!("Content-Length: {length}\r\n"));
    }
    if status.starts_with("206") {
        head.push_str(&format!("Content-Range: bytes {}-{}/{}\r\n", offset, total - 1, total));
    }
    head.push_str("\r\n");

    if stream.write_all(head.as_bytes()).await.is_err() {
        return;
    }
    match stall {
        Some(split) if split < payload.len() => {
            if stream.write_all(&payload[..split]).await.is_err() {
                return;
            }
            let _ = stream.flush().await;
            release.notified().await;
            let _ = stream.write_all(&payload[split..]).await;
        }
        _ => {
            let _ = stream.write_all(payload).await;
        }
    }
    let _ = stream.shutdown().await;
}

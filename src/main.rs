// src/main.rs

use anyhow::{bail, Context, Result};
use dlmgr::prelude::*;
use log::{error, info};
use std::path::PathBuf;

const USAGE: &str = "usage: dlmgr [--config FILE] [--dir DIR] [--limit BYTES_PER_SEC] URL...";

struct Args {
    config: Option<PathBuf>,
    dir: Option<PathBuf>,
    limit: Option<u64>,
    urls: Vec<String>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args { config: None, dir: None, limit: None, urls: Vec::new() };
    let mut raw = std::env::args().skip(1);
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--config" => args.config = Some(raw.next().context(USAGE)?.into()),
            "--dir" => args.dir = Some(raw.next().context(USAGE)?.into()),
            "--limit" => {
                let value = raw.next().context(USAGE)?;
                args.limit = Some(value.parse().with_context(|| format!("invalid limit: {value}"))?);
            }
            "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            _ => args.urls.push(arg),
        }
    }
    if args.urls.is_empty() {
        bail!(USAGE);
    }
    Ok(args)
}

fn render(row: &DownloadRow) -> String {
    let progress = row
        .progress
        .map(|p| format!("{p:6.2}%"))
        .unwrap_or_else(|| "      ?".to_string());
    format!("{} {:>11} {:>10} {}", progress, row.status, row.size_label(), row.url)
}

fn commands(actions: Actions) -> String {
    [
        (actions.pause, "pause"),
        (actions.resume, "resume"),
        (actions.cancel, "cancel"),
        (actions.clear, "clear"),
    ]
    .iter()
    .filter(|(enabled, _)| *enabled)
    .map(|(_, name)| *name)
    .collect::<Vec<_>>()
    .join(", ")
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = parse_args()?;

    let mut config = match &args.config {
        Some(path) => DownloadConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => DownloadConfig::default(),
    };
    if let Some(dir) = args.dir {
        config = config.with_download_dir(dir);
    }
    if let Some(limit) = args.limit {
        config = config.with_speed_limit(limit);
    }
    tokio::fs::create_dir_all(&config.download_dir).await?;

    let registry = DownloadRegistry::new(config)?;
    let mut events = registry.subscribe().await;
    match registry.speed_limit().await {
        0 => info!("No speed limit"),
        limit => info!("Speed limit: {} B/s", limit),
    }

    for url in &args.urls {
        match registry.add_download(url).await {
            Ok(download) => info!("Queued {} -> {}", download.url(), download.destination().display()),
            Err(e) => error!("Skipping {}: {}", url, e),
        }
    }
    if registry.is_empty().await {
        bail!("no valid download URLs given");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, cancelling downloads");
                registry.cancel_all().await;
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if let RegistryEvent::RowUpdated { index, kind: EventKind::StatusChanged(_), .. } = event {
                    if let Ok(download) = registry.get(index).await {
                        let row = download.snapshot();
                        println!("[{index}] {} (available: {})", render(&row), commands(row.status.actions()));
                        if let Some(reason) = download.last_error().await {
                            println!("[{index}] error: {reason}");
                        }
                    }
                }
                let rows = registry.rows().await;
                if rows.iter().all(|row| row.status.is_terminal()) {
                    break;
                }
            }
        }
    }

    for download in registry.downloads().await {
        download.join().await;
    }
    for (index, row) in registry.rows().await.iter().enumerate() {
        println!("[{index}] {}", render(row));
    }

    let failed = registry
        .rows()
        .await
        .iter()
        .filter(|row| row.status != DownloadStatus::Complete)
        .count();
    if failed > 0 {
        bail!("{failed} download(s) did not complete");
    }
    Ok(())
}

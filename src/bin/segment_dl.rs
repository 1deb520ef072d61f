use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use segment_dl::core::engine::EventSender;
use segment_dl::core::progress::eta_seconds;
use segment_dl::utils::{format_bytes, is_valid_download_url};
use segment_dl::{
    DownloadEngine, DownloadEvent, DownloadStatus, EngineConfig, JsonFileStore, ResumeOutcome,
};

const USAGE: &str = "Usage:
  segment_dl <url> [threads] [directory]
  segment_dl resume <download-id>
  segment_dl list";

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    segment_dl::init()?;

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(first) = args.first() else {
        eprintln!("{USAGE}");
        std::process::exit(1);
    };

    let mut config = EngineConfig::load().unwrap_or_else(|e| {
        tracing::warn!("Failed to load configuration ({}), using defaults", e);
        EngineConfig::default()
    });

    let store = Arc::new(JsonFileStore::open(state_dir()).await?);
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    match first.as_str() {
        "list" => {
            let engine = DownloadEngine::new(config, store)?;
            for download in engine.list_downloads().await? {
                println!(
                    "{}  {:<11} {:>6.1}%  {:>10}  {}",
                    download.id,
                    download.status.as_str(),
                    download.progress,
                    format_bytes(download.size),
                    download.name
                );
            }
            Ok(())
        }
        "resume" => {
            let id = args.get(1).context("resume needs a download id")?;
            let engine = build_engine(config, store, event_tx)?;
            match engine.resume_download(id).await? {
                ResumeOutcome::Restarted(handle) => watch(&engine, id, handle, event_rx).await,
                ResumeOutcome::InPlace => bail!("download {id} is already running"),
            }
        }
        url => {
            if !is_valid_download_url(url) {
                eprintln!("Not an http(s) URL: {url}\n\n{USAGE}");
                std::process::exit(1);
            }
            if let Some(threads) = args.get(1) {
                config.max_threads_per_download = threads
                    .parse()
                    .with_context(|| format!("invalid thread count: {threads}"))?;
            }
            if let Some(directory) = args.get(2) {
                config.download_directory = directory.clone();
            }

            let engine = build_engine(config, store, event_tx)?;
            let download = engine.create_download(url, None).await?;
            println!("Download id: {}", download.id);

            let handle = engine.start_download(&download.id).await?;
            watch(&engine, &download.id, handle, event_rx).await
        }
    }
}

fn build_engine(
    config: EngineConfig,
    store: Arc<JsonFileStore>,
    events: EventSender,
) -> Result<DownloadEngine> {
    Ok(DownloadEngine::new(config, store)?.with_event_sender(events))
}

/// Print events until the coordinator finishes. Ctrl-C pauses the download
/// so it can be picked up again with `resume`.
async fn watch(
    engine: &DownloadEngine,
    id: &str,
    handle: tokio::task::JoinHandle<DownloadStatus>,
    mut events: mpsc::UnboundedReceiver<DownloadEvent>,
) -> Result<()> {
    let mut handle = handle;

    loop {
        tokio::select! {
            status = &mut handle => {
                let status = status.context("download task panicked")?;
                let download = engine.get_download(id).await?;
                println!();
                match status {
                    DownloadStatus::Completed => {
                        println!(
                            "Saved {} to {:?}",
                            format_bytes(download.size),
                            download.file_path.unwrap_or_default()
                        );
                        return Ok(());
                    }
                    _ => bail!(
                        "download ended as {}: {}",
                        status,
                        download.error_message.unwrap_or_default()
                    ),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                // 暂停后直接退出，分片文件和记录留给 resume
                engine.pause_download(id).await?;
                println!("\nInterrupted; run `segment_dl resume {id}` to continue");
                return Ok(());
            }
            Some(event) = events.recv() => print_event(event),
        }
    }
}

fn print_event(event: DownloadEvent) {
    match event {
        DownloadEvent::Progress {
            progress,
            speed,
            downloaded,
            total,
            ..
        } => {
            let eta = eta_seconds(total, downloaded, speed)
                .map(|secs| format!("ETA {}:{:02}", secs / 60, secs % 60))
                .unwrap_or_default();
            print!(
                "\r{:>6.1}%  {} / {}  {}/s  {}      ",
                progress,
                format_bytes(downloaded),
                format_bytes(total),
                format_bytes(speed as u64),
                eta
            );
            let _ = std::io::stdout().flush();
        }
        DownloadEvent::StatusChanged { status, .. } => println!("\n[{status}]"),
        DownloadEvent::PostProcessFailed { error, .. } => {
            println!("\nPost-processing failed: {error}")
        }
        DownloadEvent::Completed { .. } | DownloadEvent::Failed { .. } => {}
    }
}

fn state_dir() -> PathBuf {
    ProjectDirs::from("com", "segmentdl", "engine")
        .map(|dirs| dirs.data_dir().join("downloads"))
        .unwrap_or_else(|| env::temp_dir().join("segment-dl"))
}

//! pakt-worker - runs one pacman job on behalf of the pakt backend.
//!
//! Usage:
//!   pkexec pakt-worker [--pacman PATH] [--pacman-conf FILE]
//!
//! stdin carries requests and stdout carries notifications, one JSON
//! object per line. Logs go to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use pakt_core::protocol::{decode_line, encode_line};
use pakt_core::{WorkerMessage, WorkerRequest};
use pakt_worker::JobRunner;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pakt-worker")]
#[command(about = "Privileged pacman worker for pakt", long_about = None)]
struct Cli {
    /// pacman binary to run
    #[arg(long, default_value = "pacman")]
    pacman: PathBuf,

    /// Alternate pacman.conf
    #[arg(long)]
    pacman_conf: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pakt_worker=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let (message_tx, mut message_rx) = mpsc::channel::<WorkerMessage>(256);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = message_rx.recv().await {
            let line = encode_line(&message)?;
            stdout.write_all(line.as_bytes()).await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    let (request_tx, mut requests) = mpsc::channel::<WorkerRequest>(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match decode_line::<WorkerRequest>(&line) {
                    Ok(Some(request)) => {
                        if request_tx.send(request).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Ignoring malformed request: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read requests: {}", e);
                    break;
                }
            }
        }
    });

    let mut runner = JobRunner::new(&cli.pacman, message_tx.clone());
    if let Some(conf) = &cli.pacman_conf {
        runner = runner.with_args([PathBuf::from("--config"), conf.clone()]);
    }

    info!("Worker started");
    message_tx.send(WorkerMessage::Started).await?;

    let success = loop {
        match requests.recv().await {
            Some(request) if request.is_job() => break runner.run(request, &mut requests).await,
            Some(WorkerRequest::CancelDownload) => {
                info!("Cancelled before a job was given");
                break false;
            }
            Some(other) => warn!("Ignoring {:?}, no job is running", other),
            None => {
                warn!("Requests closed before a job was given");
                break false;
            }
        }
    };

    info!("Job finished, success: {}", success);
    message_tx.send(WorkerMessage::Finished { success }).await?;

    drop(runner);
    drop(message_tx);
    writer.await.context("stdout writer panicked")??;
    Ok(())
}

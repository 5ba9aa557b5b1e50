//! Follows a running worker job on the terminal.

use anyhow::{bail, Result};
use pakt_core::codes::{accept_answer, keys, selection_answer};
use pakt_core::{Backend, BackendEvent, Details, FetchType, WorkerEvent, WorkerQuestion};
use serde_json::Value;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Job to start on the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Commit,
    UpdateCache,
}

/// Terminal side of a job: prints notifications, asks questions.
pub struct Session {
    backend: Backend,
    assume_yes: bool,
    input: Lines<BufReader<Stdin>>,
}

impl Session {
    pub fn new(backend: Backend, assume_yes: bool) -> Self {
        Self {
            backend,
            assume_yes,
            input: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    /// Starts `job` and follows it until the worker finishes.
    pub async fn run(&mut self, job: Job) -> Result<bool> {
        let mut events = self.backend.subscribe();
        match job {
            Job::Commit => self.backend.commit_changes().await?,
            Job::UpdateCache => self.backend.update_cache().await?,
        }

        let mut interrupted = false;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(BackendEvent::WorkerFinished { success }) => return Ok(success),
                    Ok(event) => self.handle(event, &mut interrupted).await?,
                    Err(RecvError::Lagged(missed)) => warn!("Missed {} notifications", missed),
                    Err(RecvError::Closed) => bail!("the backend stopped"),
                },
                _ = tokio::signal::ctrl_c(), if !interrupted => {
                    eprintln!("\nCancelling...");
                    interrupted = true;
                    self.backend.cancel_download().await;
                }
            }
        }
    }

    async fn handle(&mut self, event: BackendEvent, interrupted: &mut bool) -> Result<()> {
        match event {
            BackendEvent::ErrorOccurred { code, details } => {
                eprintln!("error: {}: {}", code, message(&details));
            }
            BackendEvent::WarningOccurred { details, .. } => {
                eprintln!("warning: {}", message(&details));
            }
            BackendEvent::QuestionOccurred { question, details } => {
                let response = self.ask(question, &details, interrupted).await;
                match response {
                    Some(response) => self.backend.answer_worker_question(response).await?,
                    None => self.backend.cancel_download().await,
                }
            }
            BackendEvent::WorkerEvent(event) => {
                if let Some(text) = describe(event) {
                    println!(":: {}", text);
                }
            }
            BackendEvent::DownloadMessage { flag, message } => match flag {
                FetchType::Downloading => println!(" downloading {}...", message),
                FetchType::UpToDate => println!(" {} is up to date", message),
                FetchType::Failed => println!(" failed to download {}", message),
            },
            BackendEvent::DownloadProgress {
                percentage,
                speed,
                eta,
            } => {
                println!(
                    " [{:>3}%] {}/s, {} left",
                    percentage,
                    format_size(speed),
                    format_eta(eta)
                );
            }
            BackendEvent::CommitProgress { status, percentage } => {
                println!(" [{:>3}%] {}", percentage, status);
            }
            BackendEvent::WorkerStarted => debug!("Worker started"),
            BackendEvent::PackageChanged => {}
            BackendEvent::WorkerFinished { .. } => {}
        }
        Ok(())
    }

    /// Asks a worker question on the terminal. `None` means the user
    /// interrupted instead of answering.
    async fn ask(
        &mut self,
        question: WorkerQuestion,
        details: &Details,
        interrupted: &mut bool,
    ) -> Option<Details> {
        let prompt = details
            .get(keys::PROMPT)
            .and_then(Value::as_str)
            .unwrap_or("Continue?");
        let default = details.get(keys::DEFAULT).and_then(Value::as_bool);

        if question.expects_selection() {
            if let Some(context) = details.get(keys::CONTEXT).and_then(Value::as_array) {
                for line in context.iter().filter_map(Value::as_str) {
                    println!("{}", line);
                }
            }
        }

        if self.assume_yes {
            println!(":: {}", prompt);
            return Some(if question.expects_selection() {
                selection_answer("")
            } else {
                accept_answer(default.unwrap_or(true))
            });
        }

        print!(":: {} ", prompt);
        let _ = std::io::stdout().flush();

        let reply = if *interrupted {
            self.input.next_line().await.ok().flatten()
        } else {
            tokio::select! {
                line = self.input.next_line() => line.ok().flatten(),
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("\nCancelling...");
                    *interrupted = true;
                    return None;
                }
            }
        };
        let reply = reply.unwrap_or_default();

        Some(if question.expects_selection() {
            selection_answer(reply.trim())
        } else {
            accept_answer(parse_reply(&reply).or(default).unwrap_or(false))
        })
    }
}

/// Reads a yes/no reply; empty or unrecognised input gives `None`.
pub fn parse_reply(reply: &str) -> Option<bool> {
    match reply.trim().to_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

fn message(details: &Details) -> &str {
    details
        .get(keys::MESSAGE)
        .and_then(Value::as_str)
        .unwrap_or_default()
}

fn describe(event: WorkerEvent) -> Option<&'static str> {
    match event {
        WorkerEvent::CacheUpdateStarted => Some("Synchronizing package databases..."),
        WorkerEvent::CacheUpdateFinished => Some("Package databases are up to date"),
        WorkerEvent::PackageDownloadStarted => Some("Retrieving packages..."),
        WorkerEvent::PackageDownloadFinished => None,
        WorkerEvent::CommitChangesStarted => Some("Processing package changes..."),
        WorkerEvent::CommitChangesFinished => Some("Changes applied"),
    }
}

/// Formats a byte count the way pacman does.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

fn format_eta(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

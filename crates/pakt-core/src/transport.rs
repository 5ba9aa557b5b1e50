//! Transports connecting the backend to a privileged worker.

use crate::codes::{keys, message_details, ErrorCode};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::protocol::{decode_line, encode_line, WorkerMessage, WorkerRequest};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Exit codes pkexec uses when authorization is dismissed or refused.
const PKEXEC_DISMISSED: i32 = 126;
const PKEXEC_NOT_AUTHORIZED: i32 = 127;

/// A live connection to one worker instance.
#[derive(Debug)]
pub struct WorkerSession {
    /// Requests for the worker.
    pub requests: mpsc::Sender<WorkerRequest>,
    /// Notifications from the worker, ending with `Finished`.
    pub messages: mpsc::Receiver<WorkerMessage>,
}

/// Starts worker sessions.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Starts a worker and returns the channel pair talking to it.
    async fn connect(&self) -> Result<WorkerSession>;
}

/// Runs the worker as a child process, optionally through an elevation
/// command such as pkexec, speaking the line protocol over stdio.
#[derive(Debug, Clone)]
pub struct ProcessTransport {
    program: PathBuf,
    elevation: Option<String>,
}

impl ProcessTransport {
    pub fn new(program: impl Into<PathBuf>, elevation: Option<String>) -> Self {
        Self {
            program: program.into(),
            elevation,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(
            config.worker.clone(),
            config.elevation_command().map(str::to_string),
        )
    }

    fn command(&self) -> Command {
        let mut command = match &self.elevation {
            Some(elevation) => {
                let mut command = Command::new(elevation);
                command.arg(&self.program);
                command
            }
            None => Command::new(&self.program),
        };
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl WorkerTransport for ProcessTransport {
    async fn connect(&self) -> Result<WorkerSession> {
        info!("Starting worker {}", self.program.display());

        let mut child = self.command().spawn().map_err(|e| {
            Error::WorkerUnavailable(format!("failed to spawn {}: {}", self.program.display(), e))
        })?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::WorkerUnavailable("worker stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::WorkerUnavailable("worker stdout not captured".into()))?;

        let (request_tx, mut request_rx) = mpsc::channel::<WorkerRequest>(16);
        let (message_tx, message_rx) = mpsc::channel::<WorkerMessage>(256);

        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                let line = match encode_line(&request) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Dropping unencodable request: {}", e);
                        continue;
                    }
                };
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    debug!("Worker stdin closed: {}", e);
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut started = false;
            let mut finished = false;

            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read from worker: {}", e);
                        break;
                    }
                };
                let message = match decode_line::<WorkerMessage>(&line) {
                    Ok(Some(message)) => message,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("Ignoring worker output: {}", e);
                        continue;
                    }
                };
                match message {
                    WorkerMessage::Started => started = true,
                    WorkerMessage::Finished { .. } => finished = true,
                    _ => {}
                }
                if message_tx.send(message).await.is_err() {
                    debug!("Backend stopped listening, killing worker");
                    let _ = child.start_kill();
                    break;
                }
            }

            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Failed to wait for worker: {}", e);
                    None
                }
            };
            debug!("Worker exited with {:?}", code);

            if !finished {
                let error = if !started
                    && matches!(code, Some(PKEXEC_DISMISSED) | Some(PKEXEC_NOT_AUTHORIZED))
                {
                    ErrorCode::AuthError
                } else {
                    ErrorCode::WorkerDisappeared
                };
                warn!("Worker exited without finishing: {}", error);

                let mut details = message_details(error.to_string());
                if let Some(code) = code {
                    details.insert(keys::EXIT_CODE.to_string(), code.into());
                }
                let _ = message_tx
                    .send(WorkerMessage::Error {
                        code: error,
                        details,
                    })
                    .await;
                let _ = message_tx
                    .send(WorkerMessage::Finished { success: false })
                    .await;
            }
        });

        Ok(WorkerSession {
            requests: request_tx,
            messages: message_rx,
        })
    }
}

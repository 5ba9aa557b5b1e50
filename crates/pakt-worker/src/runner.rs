//! Runs worker jobs as pacman processes.

use crate::output::{answer_input, OutputParser};
use crate::plan::{commit_plan, update_plan, PacmanCommand};
use pakt_core::codes::{keys, message_details};
use pakt_core::{
    ErrorCode, WarningCode, WorkerEvent, WorkerMessage, WorkerQuestion, WorkerRequest,
};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long pacman may take to wind down after an interrupt.
const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// How one pacman invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Exited(Option<i32>),
    Cancelled,
    NotStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// A question pacman is waiting on.
#[derive(Debug, Clone, Copy)]
struct Prompt {
    question: WorkerQuestion,
    stream: Stream,
}

/// Splits a byte stream into lines, keeping the unterminated rest.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    fn tail(&self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.pending).into_owned())
        }
    }

    fn finish(&mut self) -> Vec<String> {
        let rest = self.tail();
        self.pending.clear();
        rest.into_iter().collect()
    }

    fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Executes jobs by running pacman and reporting its progress.
#[derive(Debug, Clone)]
pub struct JobRunner {
    program: PathBuf,
    base_args: Vec<OsString>,
    cancel_grace: Duration,
    messages: mpsc::Sender<WorkerMessage>,
}

impl JobRunner {
    pub fn new(program: impl Into<PathBuf>, messages: mpsc::Sender<WorkerMessage>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            cancel_grace: CANCEL_GRACE,
            messages,
        }
    }

    /// Time between interrupting pacman and killing it outright.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Arguments placed before every pacman command, e.g. `--config`.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.base_args.extend(args.into_iter().map(Into::into));
        self
    }

    async fn send(&self, message: WorkerMessage) {
        let _ = self.messages.send(message).await;
    }

    async fn send_all(&self, messages: Vec<WorkerMessage>) {
        for message in messages {
            self.send(message).await;
        }
    }

    /// Runs a job to completion, serving answers and cancellation from
    /// `requests` meanwhile. Returns whether the job succeeded.
    pub async fn run(&self, job: WorkerRequest, requests: &mut mpsc::Receiver<WorkerRequest>) -> bool {
        let (plan, finished, fallback) = match &job {
            WorkerRequest::UpdateCache => {
                info!("Updating package databases");
                (update_plan(), WorkerEvent::CacheUpdateFinished, ErrorCode::FetchError)
            }
            WorkerRequest::CommitChanges { changes } => {
                info!("Committing {} package changes", changes.len());
                (
                    commit_plan(changes),
                    WorkerEvent::CommitChangesFinished,
                    ErrorCode::CommitError,
                )
            }
            other => {
                warn!("Not a job: {:?}", other);
                return false;
            }
        };

        let mut parser = OutputParser::new();
        for command in &plan {
            info!("Running {}", command);
            parser.begin_command();
            let errors = parser.errors();

            match self.run_command(command, &mut parser, requests).await {
                Outcome::Exited(Some(0)) => debug!("{} succeeded", command),
                Outcome::Exited(code) => {
                    warn!("{} failed with {:?}", command, code);
                    // pacman usually explains itself with `error:` lines.
                    if parser.errors() == errors {
                        let mut details = message_details(format!("{} failed", command));
                        if let Some(code) = code {
                            details.insert(keys::EXIT_CODE.to_string(), code.into());
                        }
                        self.send(WorkerMessage::Error {
                            code: fallback,
                            details,
                        })
                        .await;
                    }
                    return false;
                }
                Outcome::Cancelled => {
                    self.send(WorkerMessage::Error {
                        code: ErrorCode::UserCancelError,
                        details: message_details("Cancelled on request"),
                    })
                    .await;
                    return false;
                }
                Outcome::NotStarted => return false,
            }
        }

        self.send(WorkerMessage::Event { event: finished }).await;
        true
    }

    async fn run_command(
        &self,
        command: &PacmanCommand,
        parser: &mut OutputParser,
        requests: &mut mpsc::Receiver<WorkerRequest>,
    ) -> Outcome {
        let spawned = Command::new(&self.program)
            .args(&self.base_args)
            .args(&command.args)
            .env("LC_ALL", "C")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to start {}: {}", self.program.display(), e);
                self.send(WorkerMessage::Error {
                    code: ErrorCode::InitError,
                    details: message_details(format!(
                        "Failed to start {}: {}",
                        self.program.display(),
                        e
                    )),
                })
                .await;
                return Outcome::NotStarted;
            }
        };

        let (Some(mut stdin), Some(mut stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            return Outcome::NotStarted;
        };

        let mut out = LineBuffer::default();
        let mut err = LineBuffer::default();
        let mut out_chunk = [0u8; 4096];
        let mut err_chunk = [0u8; 4096];
        let mut out_open = true;
        let mut err_open = true;
        let mut listening = true;
        let mut cancelled = false;
        let mut kill_at: Option<Instant> = None;
        let mut prompt: Option<Prompt> = None;

        while out_open || err_open {
            tokio::select! {
                read = stdout.read(&mut out_chunk), if out_open => {
                    let lines = match read {
                        Ok(0) | Err(_) => {
                            out_open = false;
                            out.finish()
                        }
                        Ok(n) => out.push(&out_chunk[..n]),
                    };
                    self.handle_output(parser, lines, &out, Stream::Stdout, &mut prompt).await;
                }
                read = stderr.read(&mut err_chunk), if err_open => {
                    let lines = match read {
                        Ok(0) | Err(_) => {
                            err_open = false;
                            err.finish()
                        }
                        Ok(n) => err.push(&err_chunk[..n]),
                    };
                    self.handle_output(parser, lines, &err, Stream::Stderr, &mut prompt).await;
                }
                request = requests.recv(), if listening => match request {
                    Some(WorkerRequest::Answer { response }) => match prompt.take() {
                        Some(Prompt { question, stream }) => {
                            debug!("Answering {:?}", question);
                            let input = answer_input(question, &response);
                            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                                warn!("Failed to answer pacman: {}", e);
                            } else {
                                let _ = stdin.flush().await;
                            }
                            match stream {
                                Stream::Stdout => out.clear(),
                                Stream::Stderr => err.clear(),
                            }
                        }
                        None => warn!("Dropping an answer, no question is pending"),
                    },
                    Some(WorkerRequest::CancelDownload) if parser.is_committing() => {
                        warn!("Not cancelling {}, changes are being applied", command);
                        self.send(WorkerMessage::Warning {
                            code: WarningCode::UnknownWarning,
                            details: message_details(
                                "Changes are being applied and can no longer be cancelled",
                            ),
                        })
                        .await;
                    }
                    Some(WorkerRequest::CancelDownload) => {
                        if !cancelled {
                            info!("Cancelling {}", command);
                            cancelled = true;
                            interrupt(&child);
                            kill_at = Some(Instant::now() + self.cancel_grace);
                        }
                    }
                    Some(other) => warn!("Ignoring {:?} while a job is running", other),
                    None => {
                        listening = false;
                        if parser.is_committing() {
                            warn!("Request channel closed, letting {} finish", command);
                        } else if !cancelled {
                            warn!("Request channel closed, stopping {}", command);
                            cancelled = true;
                            interrupt(&child);
                            kill_at = Some(Instant::now() + self.cancel_grace);
                        }
                    }
                },
                _ = tokio::time::sleep_until(kill_at.unwrap_or_else(Instant::now)), if kill_at.is_some() => {
                    warn!("pacman ignored the interrupt, killing it");
                    kill_at = None;
                    let _ = child.start_kill();
                }
            }
        }

        let status = child.wait().await;
        if cancelled {
            return Outcome::Cancelled;
        }
        match status {
            Ok(status) => Outcome::Exited(status.code()),
            Err(e) => {
                warn!("Failed to wait for pacman: {}", e);
                Outcome::Exited(None)
            }
        }
    }

    async fn handle_output(
        &self,
        parser: &mut OutputParser,
        lines: Vec<String>,
        buffer: &LineBuffer,
        stream: Stream,
        prompt: &mut Option<Prompt>,
    ) {
        for line in lines {
            debug!("pacman: {}", line.trim_end());
            self.send_all(parser.parse_line(&line)).await;
        }

        if prompt.is_some() {
            return;
        }
        let Some(tail) = buffer.tail() else {
            return;
        };
        if let Some((question, details)) = parser.parse_prompt(&tail) {
            info!("pacman asks {:?}", question);
            *prompt = Some(Prompt { question, stream });
            self.send(WorkerMessage::Question { question, details }).await;
        }
    }
}

/// Sends SIGINT, on which pacman aborts the transaction and removes its
/// database lock.
fn interrupt(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
    if ret != 0 {
        warn!("Failed to interrupt pacman: {}", std::io::Error::last_os_error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pakt_core::codes::accept_answer;
    use pakt_core::{ChangeSet, FetchType};
    use std::path::Path;
    use tempfile::TempDir;

    /// A runner that executes `script` with sh in place of pacman.
    fn fake_pacman(dir: &TempDir, script: &str) -> (JobRunner, mpsc::Receiver<WorkerMessage>) {
        let path = dir.path().join("pacman.sh");
        std::fs::write(&path, script).unwrap();
        let (tx, rx) = mpsc::channel(64);
        (JobRunner::new("sh", tx).with_args([path]), rx)
    }

    fn commit_job() -> WorkerRequest {
        WorkerRequest::CommitChanges {
            changes: ChangeSet {
                install: vec!["vim".into()],
                ..Default::default()
            },
        }
    }

    async fn collect(mut rx: mpsc::Receiver<WorkerMessage>) -> Vec<WorkerMessage> {
        let mut messages = Vec::new();
        while let Some(message) = rx.recv().await {
            messages.push(message);
        }
        messages
    }

    #[tokio::test]
    async fn test_update_reports_downloads() {
        let dir = TempDir::new().unwrap();
        let (runner, rx) = fake_pacman(
            &dir,
            "echo ':: Synchronizing package databases...'\necho ' core downloading...'\necho ' extra is up to date'\n",
        );
        let (_requests_tx, mut requests) = mpsc::channel(4);

        assert!(runner.run(WorkerRequest::UpdateCache, &mut requests).await);
        drop(runner);

        let messages = collect(rx).await;
        assert_eq!(
            messages,
            vec![
                WorkerMessage::Event {
                    event: WorkerEvent::CacheUpdateStarted
                },
                WorkerMessage::DownloadMessage {
                    flag: FetchType::Downloading,
                    message: "core".into()
                },
                WorkerMessage::DownloadMessage {
                    flag: FetchType::UpToDate,
                    message: "extra".into()
                },
                WorkerMessage::Event {
                    event: WorkerEvent::CacheUpdateFinished
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_question_is_answered_through_stdin() {
        let dir = TempDir::new().unwrap();
        let (runner, mut rx) = fake_pacman(
            &dir,
            r#"printf ':: Proceed with installation? [Y/n] ' >&2
read answer
if [ "$answer" = "y" ]; then
  echo ':: Processing package changes...'
  echo '(1/1) installing vim'
  exit 0
fi
echo 'error: failed to commit transaction (aborted)' >&2
exit 1
"#,
        );
        let (requests_tx, mut requests) = mpsc::channel(4);
        let job = tokio::spawn(async move { runner.run(commit_job(), &mut requests).await });

        match rx.recv().await {
            Some(WorkerMessage::Question { question, details }) => {
                assert_eq!(question, WorkerQuestion::ConfirmTransaction);
                assert_eq!(details[keys::DEFAULT], true);
            }
            other => panic!("expected a question, got {:?}", other),
        }
        requests_tx
            .send(WorkerRequest::Answer {
                response: accept_answer(true),
            })
            .await
            .unwrap();

        assert!(job.await.unwrap());
        let messages = collect(rx).await;
        assert!(messages.contains(&WorkerMessage::CommitProgress {
            status: "installing vim".into(),
            percentage: 100
        }));
        assert_eq!(
            messages.last(),
            Some(&WorkerMessage::Event {
                event: WorkerEvent::CommitChangesFinished
            })
        );
    }

    #[tokio::test]
    async fn test_reported_errors_are_not_repeated() {
        let dir = TempDir::new().unwrap();
        let (runner, rx) = fake_pacman(
            &dir,
            "echo 'error: target not found: vim' >&2\nexit 1\n",
        );
        let (_requests_tx, mut requests) = mpsc::channel(4);

        assert!(!runner.run(commit_job(), &mut requests).await);
        drop(runner);

        let messages = collect(rx).await;
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            messages[0],
            WorkerMessage::Error {
                code: ErrorCode::PackageNotFoundError,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_silent_failure_reports_exit_code() {
        let dir = TempDir::new().unwrap();
        let (runner, rx) = fake_pacman(&dir, "exit 3\n");
        let (_requests_tx, mut requests) = mpsc::channel(4);

        assert!(!runner.run(WorkerRequest::UpdateCache, &mut requests).await);
        drop(runner);

        let messages = collect(rx).await;
        match &messages[..] {
            [WorkerMessage::Error { code, details }] => {
                assert_eq!(*code, ErrorCode::FetchError);
                assert_eq!(details[keys::EXIT_CODE], 3);
            }
            other => panic!("unexpected messages {:?}", other),
        }
    }

    /// Reads messages until one matches, returning everything seen.
    async fn wait_for(
        rx: &mut mpsc::Receiver<WorkerMessage>,
        wanted: impl Fn(&WorkerMessage) -> bool,
    ) -> Vec<WorkerMessage> {
        let mut seen = Vec::new();
        loop {
            match rx.recv().await {
                Some(message) => {
                    let done = wanted(&message);
                    seen.push(message);
                    if done {
                        return seen;
                    }
                }
                None => panic!("runner stopped early, saw {:?}", seen),
            }
        }
    }

    fn is_cancel_error(message: &WorkerMessage) -> bool {
        matches!(
            message,
            WorkerMessage::Error {
                code: ErrorCode::UserCancelError,
                ..
            }
        )
    }

    #[tokio::test]
    async fn test_cancel_releases_the_lock() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("db.lck");
        let (runner, mut rx) = fake_pacman(
            &dir,
            &format!(
                r#"lock='{}'
touch "$lock"
trap 'rm -f "$lock"; kill $! 2>/dev/null; exit 130' INT TERM
echo ':: Retrieving packages...'
echo ' vim-9.1.0-1-x86_64 downloading...'
sleep 30 >/dev/null 2>&1 &
wait $!
"#,
                lock.display()
            ),
        );
        let (requests_tx, mut requests) = mpsc::channel(4);
        let job = tokio::spawn(async move { runner.run(commit_job(), &mut requests).await });

        wait_for(&mut rx, |m| matches!(m, WorkerMessage::DownloadMessage { .. })).await;
        assert!(lock.exists());
        requests_tx.send(WorkerRequest::CancelDownload).await.unwrap();

        assert!(!job.await.unwrap());
        assert!(!lock.exists());
        let messages = collect(rx).await;
        assert!(messages.iter().any(is_cancel_error));
    }

    #[tokio::test]
    async fn test_ignored_interrupt_ends_in_a_kill() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let path = dir.path().join("pacman.sh");
        std::fs::write(
            &path,
            "trap '' INT\necho ':: Retrieving packages...'\necho ' vim downloading...'\nexec sleep 30\n",
        )
        .unwrap();
        let runner = JobRunner::new("sh", tx)
            .with_args([path])
            .with_cancel_grace(Duration::from_millis(200));
        let (requests_tx, mut requests) = mpsc::channel(4);
        let job = tokio::spawn(async move { runner.run(commit_job(), &mut requests).await });

        wait_for(&mut rx, |m| matches!(m, WorkerMessage::DownloadMessage { .. })).await;
        requests_tx.send(WorkerRequest::CancelDownload).await.unwrap();

        let finished = tokio::time::timeout(Duration::from_secs(10), job)
            .await
            .expect("pacman was not killed");
        assert!(!finished.unwrap());
        let messages = collect(rx).await;
        assert!(messages.iter().any(is_cancel_error));
    }

    #[tokio::test]
    async fn test_cancel_while_committing_is_refused() {
        let dir = TempDir::new().unwrap();
        let (runner, mut rx) = fake_pacman(
            &dir,
            r#"trap 'exit 130' INT TERM
echo ':: Processing package changes...'
sleep 1
echo '(1/1) installing vim'
"#,
        );
        let (requests_tx, mut requests) = mpsc::channel(4);
        let job = tokio::spawn(async move { runner.run(commit_job(), &mut requests).await });

        wait_for(&mut rx, |m| {
            *m == WorkerMessage::Event {
                event: WorkerEvent::CommitChangesStarted,
            }
        })
        .await;
        requests_tx.send(WorkerRequest::CancelDownload).await.unwrap();

        assert!(job.await.unwrap());
        let messages = collect(rx).await;
        assert!(!messages.iter().any(is_cancel_error));
        assert!(messages.iter().any(|m| matches!(
            m,
            WorkerMessage::Warning {
                code: WarningCode::UnknownWarning,
                ..
            }
        )));
        assert_eq!(
            messages.last(),
            Some(&WorkerMessage::Event {
                event: WorkerEvent::CommitChangesFinished
            })
        );
    }

    #[tokio::test]
    async fn test_missing_pacman() {
        let (tx, rx) = mpsc::channel(4);
        let runner = JobRunner::new(Path::new("/nonexistent/pacman"), tx);
        let (_requests_tx, mut requests) = mpsc::channel(4);

        assert!(!runner.run(WorkerRequest::UpdateCache, &mut requests).await);
        drop(runner);

        let messages = collect(rx).await;
        assert!(matches!(
            messages[..],
            [WorkerMessage::Error {
                code: ErrorCode::InitError,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn test_answer_without_question_is_dropped() {
        let dir = TempDir::new().unwrap();
        let (runner, rx) = fake_pacman(&dir, "sleep 0.2\necho ':: Processing package changes...'\n");
        let (requests_tx, mut requests) = mpsc::channel(4);
        requests_tx
            .send(WorkerRequest::Answer {
                response: accept_answer(true),
            })
            .await
            .unwrap();

        assert!(runner.run(commit_job(), &mut requests).await);
        drop(runner);
        let messages = collect(rx).await;
        assert!(!messages
            .iter()
            .any(|m| matches!(m, WorkerMessage::Question { .. })));
    }

    #[test]
    fn test_line_buffer_keeps_partial_lines() {
        let mut buffer = LineBuffer::default();
        assert_eq!(buffer.push(b"one\ntw"), vec!["one\n".to_string()]);
        assert_eq!(buffer.tail().as_deref(), Some("tw"));
        assert_eq!(buffer.push(b"o\n"), vec!["two\n".to_string()]);
        assert_eq!(buffer.tail(), None);
        buffer.push(b"rest");
        assert_eq!(buffer.finish(), vec!["rest".to_string()]);
        assert_eq!(buffer.tail(), None);
    }
}

//! Translation of pacman's output into worker messages.
//!
//! pacman runs with `LC_ALL=C` and without progress bars, so its output is
//! a stable sequence of lines. Questions are the exception: pacman prints
//! them without a trailing newline and waits, so they are matched against
//! the unterminated tail of the output.

use crate::progress::{parse_size, DownloadTracker};
use pakt_core::codes::{keys, message_details};
use pakt_core::{Details, ErrorCode, FetchType, WarningCode, WorkerEvent, WorkerMessage, WorkerQuestion};
use serde_json::Value;
use std::time::Instant;

/// Lines of context kept for questions that refer to earlier output.
const CONTEXT_LINES: usize = 4;

/// Where in a transaction pacman currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Preparing,
    Syncing,
    Downloading,
    Committing,
}

/// Stateful parser for the output of one pacman invocation.
#[derive(Debug)]
pub struct OutputParser {
    phase: Phase,
    downloads: DownloadTracker,
    committed: usize,
    errors: usize,
    context: Vec<String>,
}

impl Default for OutputParser {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputParser {
    pub fn new() -> Self {
        Self {
            phase: Phase::Preparing,
            downloads: DownloadTracker::default(),
            committed: 0,
            errors: 0,
            context: Vec::new(),
        }
    }

    /// Whether pacman is applying changes; interrupting it now could
    /// leave packages half installed.
    pub fn is_committing(&self) -> bool {
        self.phase == Phase::Committing
    }

    /// Forgets the section of the previous pacman invocation.
    pub fn begin_command(&mut self) {
        self.phase = Phase::Preparing;
    }

    /// Number of errors reported so far.
    pub fn errors(&self) -> usize {
        self.errors
    }

    /// Parses one complete line, using the current time for download
    /// rates.
    pub fn parse_line(&mut self, line: &str) -> Vec<WorkerMessage> {
        self.parse_line_at(line, Instant::now())
    }

    pub fn parse_line_at(&mut self, line: &str, now: Instant) -> Vec<WorkerMessage> {
        let line = line.trim_end();
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        if self.context.len() == CONTEXT_LINES {
            self.context.remove(0);
        }
        self.context.push(trimmed.to_string());

        if let Some(message) = trimmed.strip_prefix("error:") {
            return self.error(message.trim());
        }
        if let Some(message) = trimmed.strip_prefix("warning:") {
            let message = message.trim();
            return vec![WorkerMessage::Warning {
                code: classify_warning(message),
                details: message_details(message),
            }];
        }
        if let Some(section) = trimmed.strip_prefix("::") {
            return self.section(section.trim(), now);
        }
        if let Some(summary) = self.summary(trimmed) {
            return summary;
        }

        match self.phase {
            Phase::Syncing | Phase::Downloading => self.download_line(trimmed, now),
            Phase::Committing => self.commit_line(trimmed),
            Phase::Preparing => Vec::new(),
        }
    }

    /// Recognises a question in unterminated output.
    pub fn parse_prompt(&self, tail: &str) -> Option<(WorkerQuestion, Details)> {
        let prompt = tail.trim();
        let prompt = prompt.strip_prefix("::").unwrap_or(prompt).trim();

        let (question, default) = if let Some(text) = prompt.strip_suffix("[Y/n]") {
            (classify_question(text), Some(true))
        } else if let Some(text) = prompt.strip_suffix("[y/N]") {
            (classify_question(text), Some(false))
        } else if prompt.starts_with("Enter a number") || prompt.starts_with("Enter a selection") {
            (WorkerQuestion::ProviderSelection, None)
        } else {
            return None;
        };

        let mut details = message_details(prompt);
        details.insert(keys::PROMPT.to_string(), Value::String(prompt.to_string()));
        if let Some(default) = default {
            details.insert(keys::DEFAULT.to_string(), Value::Bool(default));
        }
        if question == WorkerQuestion::ProviderSelection {
            details.insert(
                keys::CONTEXT.to_string(),
                Value::Array(self.context.iter().cloned().map(Value::String).collect()),
            );
        }
        Some((question, details))
    }

    fn error(&mut self, message: &str) -> Vec<WorkerMessage> {
        // A single mirror failing is not fatal, pacman tries the next one.
        if message.starts_with("failed retrieving file") {
            return vec![
                WorkerMessage::Warning {
                    code: WarningCode::FetchFailed,
                    details: message_details(message),
                },
                WorkerMessage::DownloadMessage {
                    flag: FetchType::Failed,
                    message: quoted(message).unwrap_or(message).to_string(),
                },
            ];
        }
        self.errors += 1;
        vec![WorkerMessage::Error {
            code: classify_error(message),
            details: message_details(message),
        }]
    }

    fn section(&mut self, section: &str, now: Instant) -> Vec<WorkerMessage> {
        let mut messages = self.leave_downloads(now);

        if section.starts_with("Synchronizing package databases") {
            self.phase = Phase::Syncing;
            messages.push(WorkerMessage::Event {
                event: WorkerEvent::CacheUpdateStarted,
            });
        } else if section.starts_with("Starting full system upgrade") {
            if self.phase == Phase::Syncing {
                messages.push(WorkerMessage::Event {
                    event: WorkerEvent::CacheUpdateFinished,
                });
            }
            self.phase = Phase::Preparing;
        } else if section.starts_with("Retrieving packages") {
            self.phase = Phase::Downloading;
            messages.push(WorkerMessage::Event {
                event: WorkerEvent::PackageDownloadStarted,
            });
        } else if section.starts_with("Processing package changes") {
            self.phase = Phase::Committing;
            messages.push(WorkerMessage::Event {
                event: WorkerEvent::CommitChangesStarted,
            });
        } else if section.starts_with("Running post-transaction hooks")
            || section.starts_with("Running pre-transaction hooks")
        {
            // Hooks are numbered `(n/m)` lines like package steps.
            self.phase = Phase::Committing;
        }
        messages
    }

    /// Ends the download phase when another section starts.
    fn leave_downloads(&mut self, now: Instant) -> Vec<WorkerMessage> {
        if self.phase != Phase::Downloading {
            return Vec::new();
        }
        self.phase = Phase::Preparing;
        let progress = self.downloads.finished(now);
        vec![
            WorkerMessage::DownloadProgress {
                percentage: progress.percentage,
                speed: progress.speed,
                eta: progress.eta,
            },
            WorkerMessage::Event {
                event: WorkerEvent::PackageDownloadFinished,
            },
        ]
    }

    /// Transaction summary lines: `Packages (N) ...`, `Total Download Size:`.
    fn summary(&mut self, line: &str) -> Option<Vec<WorkerMessage>> {
        if let Some(rest) = line.strip_prefix("Packages (") {
            let count = rest.split(')').next()?.trim().parse().ok()?;
            self.downloads.set_total_items(count);
            return Some(Vec::new());
        }
        if let Some(size) = line.strip_prefix("Total Download Size:") {
            self.downloads.set_total_bytes(parse_size(size.trim())?);
            return Some(Vec::new());
        }
        None
    }

    fn download_line(&mut self, line: &str, now: Instant) -> Vec<WorkerMessage> {
        if let Some(item) = line.strip_suffix("is up to date") {
            return vec![WorkerMessage::DownloadMessage {
                flag: FetchType::UpToDate,
                message: item.trim().to_string(),
            }];
        }

        let item = line
            .strip_suffix("downloading...")
            .or_else(|| line.strip_prefix("downloading ").map(|l| l.trim_end_matches("...")));
        let Some(item) = item.map(str::trim).filter(|i| !i.is_empty()) else {
            // Leaving the download section without a header, e.g. "checking keyring...".
            return self.leave_downloads(now);
        };

        let mut messages = vec![WorkerMessage::DownloadMessage {
            flag: FetchType::Downloading,
            message: item.to_string(),
        }];
        if self.phase == Phase::Downloading {
            let progress = self.downloads.item_started(now);
            messages.push(WorkerMessage::DownloadProgress {
                percentage: progress.percentage,
                speed: progress.speed,
                eta: progress.eta,
            });
        }
        messages
    }

    fn commit_line(&mut self, line: &str) -> Vec<WorkerMessage> {
        // "(3/10) installing vim" as printed for packages and hooks.
        if let Some(rest) = line.strip_prefix('(') {
            if let Some((counter, status)) = rest.split_once(')') {
                if let Some((done, total)) = counter.split_once('/') {
                    if let (Ok(done), Ok(total)) = (done.trim().parse::<usize>(), total.trim().parse::<usize>()) {
                        return vec![commit_progress(status.trim(), done, total)];
                    }
                }
            }
        }

        // "installing vim..." without a counter.
        const ACTIONS: [&str; 5] = ["installing ", "upgrading ", "reinstalling ", "downgrading ", "removing "];
        if ACTIONS.iter().any(|action| line.starts_with(action)) {
            self.committed += 1;
            let total = self.downloads.total_items().max(self.committed);
            return vec![commit_progress(line.trim_end_matches("..."), self.committed, total)];
        }

        Vec::new()
    }
}

fn commit_progress(status: &str, done: usize, total: usize) -> WorkerMessage {
    let percentage = if total == 0 {
        100
    } else {
        (done.min(total) * 100 / total) as u8
    };
    WorkerMessage::CommitProgress {
        status: status.to_string(),
        percentage,
    }
}

fn classify_error(message: &str) -> ErrorCode {
    let message = message.to_lowercase();
    if message.contains("unable to lock database") || message.contains("could not lock database") {
        ErrorCode::LockError
    } else if message.contains("unless you are root") {
        ErrorCode::AuthError
    } else if message.starts_with("target not found") {
        ErrorCode::PackageNotFoundError
    } else if message.contains("could not satisfy dependencies")
        || message.contains("conflicting dependencies")
        || message.contains("unresolvable package conflicts")
    {
        ErrorCode::DepError
    } else if message.contains("not enough free disk space") || message.contains("too full") {
        ErrorCode::DiskSpaceError
    } else if message.contains("failed to synchronize") || message.contains("failed to retrieve some files") {
        ErrorCode::FetchError
    } else if message.contains("failed to commit transaction") {
        ErrorCode::CommitError
    } else if message.contains("failed to initialize alpm") || message.contains("failed to init transaction") {
        ErrorCode::InitError
    } else {
        ErrorCode::UnknownError
    }
}

fn classify_warning(message: &str) -> WarningCode {
    if message.contains(".pacnew") || message.contains(".pacsave") {
        WarningCode::ConfigFileSaved
    } else if message.contains("size mismatch") || message.contains("file size") {
        WarningCode::SizeMismatch
    } else if message.contains("failed retrieving file") {
        WarningCode::FetchFailed
    } else {
        WarningCode::UnknownWarning
    }
}

fn classify_question(prompt: &str) -> WorkerQuestion {
    let prompt = prompt.to_lowercase();
    if prompt.starts_with("proceed with")
        || prompt.starts_with("do you want to remove these packages")
    {
        WorkerQuestion::ConfirmTransaction
    } else if prompt.starts_with("replace ") {
        WorkerQuestion::ReplacePackage
    } else if prompt.contains("are in conflict") {
        WorkerQuestion::ConflictResolution
    } else if prompt.starts_with("import pgp key") {
        WorkerQuestion::ImportKey
    } else if prompt.contains("corrupted") || prompt.contains("do you want to delete it") {
        WorkerQuestion::CorruptedPackage
    } else {
        WorkerQuestion::GenericConfirmation
    }
}

/// The first single-quoted part of a message, e.g. a file name.
fn quoted(message: &str) -> Option<&str> {
    let start = message.find('\'')? + 1;
    let len = message[start..].find('\'')?;
    Some(&message[start..start + len])
}

/// The text written to pacman's stdin for an answer.
pub fn answer_input(question: WorkerQuestion, response: &Details) -> String {
    if question.expects_selection() {
        let selection = response
            .get(keys::SELECTION)
            .and_then(Value::as_str)
            .unwrap_or_default();
        return format!("{}\n", selection.trim());
    }
    match response.get(keys::ACCEPT).and_then(Value::as_bool) {
        Some(true) => "y\n".to_string(),
        Some(false) => "n\n".to_string(),
        // An empty answer takes pacman's default.
        None => "\n".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pakt_core::codes::{accept_answer, selection_answer};
    use std::time::Duration;

    fn parse_all(parser: &mut OutputParser, output: &str, start: Instant) -> Vec<WorkerMessage> {
        output
            .lines()
            .enumerate()
            .flat_map(|(i, line)| parser.parse_line_at(line, start + Duration::from_secs(i as u64)))
            .collect()
    }

    #[test]
    fn test_cache_update_output() {
        let mut parser = OutputParser::new();
        let messages = parse_all(
            &mut parser,
            ":: Synchronizing package databases...\n core downloading...\n extra is up to date\n",
            Instant::now(),
        );
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
            ]
        );
        assert_eq!(parser.errors(), 0);
    }

    #[test]
    fn test_install_transaction_output() {
        let output = "resolving dependencies...
looking for conflicting packages...

Packages (2) vim-runtime-9.1.0-1  vim-9.1.0-1

Total Download Size:    2.00 MiB
Total Installed Size:  40.12 MiB

:: Retrieving packages...
 vim-runtime-9.1.0-1-x86_64 downloading...
 vim-9.1.0-1-x86_64 downloading...
checking keyring...
checking package integrity...
:: Processing package changes...
installing vim-runtime...
installing vim...
warning: /etc/vimrc installed as /etc/vimrc.pacnew
:: Running post-transaction hooks...
(1/1) Arming ConditionNeedsUpdate...
";
        let mut parser = OutputParser::new();
        let messages = parse_all(&mut parser, output, Instant::now());

        let events: Vec<_> = messages
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::Event { event } => Some(*event),
                _ => None,
            })
            .collect();
        assert_eq!(
            events,
            vec![
                WorkerEvent::PackageDownloadStarted,
                WorkerEvent::PackageDownloadFinished,
                WorkerEvent::CommitChangesStarted,
            ]
        );

        let downloads: Vec<_> = messages
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::DownloadProgress { percentage, .. } => Some(*percentage),
                _ => None,
            })
            .collect();
        assert_eq!(downloads, vec![0, 50, 100]);

        let commits: Vec<_> = messages
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::CommitProgress { status, percentage } => Some((status.as_str(), *percentage)),
                _ => None,
            })
            .collect();
        assert_eq!(
            commits,
            vec![
                ("installing vim-runtime", 50),
                ("installing vim", 100),
                ("Arming ConditionNeedsUpdate...", 100),
            ]
        );

        assert!(messages.contains(&WorkerMessage::Warning {
            code: WarningCode::ConfigFileSaved,
            details: message_details("/etc/vimrc installed as /etc/vimrc.pacnew"),
        }));
    }

    #[test]
    fn test_commit_phase_tracking() {
        let mut parser = OutputParser::new();
        let start = Instant::now();
        parse_all(&mut parser, ":: Retrieving packages...\n vim downloading...\n", start);
        assert!(!parser.is_committing());

        parse_all(&mut parser, ":: Processing package changes...\n(1/1) removing vim\n", start);
        assert!(parser.is_committing());

        parser.begin_command();
        assert!(!parser.is_committing());
    }

    #[test]
    fn test_error_classification() {
        let mut parser = OutputParser::new();
        let messages = parse_all(
            &mut parser,
            "error: failed to init transaction (unable to lock database)\nerror: target not found: vmi\nerror: something odd\n",
            Instant::now(),
        );
        let codes: Vec<_> = messages
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::Error { code, .. } => Some(*code),
                _ => None,
            })
            .collect();
        assert_eq!(
            codes,
            vec![
                ErrorCode::LockError,
                ErrorCode::PackageNotFoundError,
                ErrorCode::UnknownError
            ]
        );
        assert_eq!(parser.errors(), 3);
    }

    #[test]
    fn test_mirror_failure_is_a_warning() {
        let mut parser = OutputParser::new();
        let messages = parser.parse_line(
            "error: failed retrieving file 'core.db' from mirror.example.org : Connection timed out",
        );
        assert_eq!(parser.errors(), 0);
        assert_eq!(
            messages[1],
            WorkerMessage::DownloadMessage {
                flag: FetchType::Failed,
                message: "core.db".into()
            }
        );
    }

    #[test]
    fn test_prompts() {
        let parser = OutputParser::new();

        let (question, details) = parser.parse_prompt(":: Proceed with installation? [Y/n] ").unwrap();
        assert_eq!(question, WorkerQuestion::ConfirmTransaction);
        assert_eq!(details[keys::DEFAULT], Value::Bool(true));
        assert_eq!(details[keys::PROMPT], "Proceed with installation? [Y/n]");

        let (question, details) = parser
            .parse_prompt(":: vim-9.1 and gvim-9.1 are in conflict. Remove gvim? [y/N] ")
            .unwrap();
        assert_eq!(question, WorkerQuestion::ConflictResolution);
        assert_eq!(details[keys::DEFAULT], Value::Bool(false));

        let (question, _) = parser
            .parse_prompt(":: Import PGP key 1234ABCD, \"Someone <someone@example.org>\"? [Y/n] ")
            .unwrap();
        assert_eq!(question, WorkerQuestion::ImportKey);

        let (question, _) = parser.parse_prompt(":: Replace foo with extra/bar? [Y/n] ").unwrap();
        assert_eq!(question, WorkerQuestion::ReplacePackage);

        assert!(parser.parse_prompt("resolving depend").is_none());
    }

    #[test]
    fn test_provider_selection_keeps_context() {
        let mut parser = OutputParser::new();
        parser.parse_line(":: There are 2 providers available for java-runtime:");
        parser.parse_line(":: Repository extra");
        parser.parse_line("   1) jre-openjdk  2) jre17-openjdk");

        let (question, details) = parser.parse_prompt("Enter a number (default=1): ").unwrap();
        assert_eq!(question, WorkerQuestion::ProviderSelection);
        assert!(details.get(keys::DEFAULT).is_none());
        let context = details[keys::CONTEXT].as_array().unwrap();
        assert_eq!(context.last().unwrap(), "1) jre-openjdk  2) jre17-openjdk");
    }

    #[test]
    fn test_answer_input() {
        assert_eq!(answer_input(WorkerQuestion::ConfirmTransaction, &accept_answer(true)), "y\n");
        assert_eq!(answer_input(WorkerQuestion::ImportKey, &accept_answer(false)), "n\n");
        assert_eq!(answer_input(WorkerQuestion::ReplacePackage, &Details::new()), "\n");
        assert_eq!(
            answer_input(WorkerQuestion::ProviderSelection, &selection_answer(" 2 ")),
            "2\n"
        );
    }
}

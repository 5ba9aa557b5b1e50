//! Coded values reported by the worker.
//!
//! Every error, warning and question travels with a [`Details`] payload.
//! The keys used inside the payload are listed as constants in [`keys`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Loosely-typed payload attached to worker notifications and answers.
pub type Details = serde_json::Map<String, serde_json::Value>;

/// Well-known keys inside a [`Details`] payload.
pub mod keys {
    /// Human readable message, usually the raw line from pacman.
    pub const MESSAGE: &str = "message";
    /// The prompt text of a question.
    pub const PROMPT: &str = "prompt";
    /// Default answer of a yes/no question.
    pub const DEFAULT: &str = "default";
    /// Yes/no answer.
    pub const ACCEPT: &str = "accept";
    /// Free text answer to a selection question.
    pub const SELECTION: &str = "selection";
    /// Package names the notification refers to.
    pub const PACKAGES: &str = "packages";
    /// Exit status of a process that failed.
    pub const EXIT_CODE: &str = "exit_code";
    /// Output lines leading up to a question.
    pub const CONTEXT: &str = "context";
}

/// Kinds of errors a worker job can hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The package database could not be opened.
    InitError,
    /// The package database is locked by another process.
    LockError,
    /// Downloading databases or packages failed.
    FetchError,
    /// The transaction failed while being applied.
    CommitError,
    /// Authorization for the privileged worker was refused.
    AuthError,
    /// Dependencies could not be satisfied.
    DepError,
    /// A requested package does not exist.
    PackageNotFoundError,
    /// Not enough free disk space.
    DiskSpaceError,
    /// The job was cancelled on request.
    UserCancelError,
    /// The worker exited without finishing its job.
    WorkerDisappeared,
    UnknownError,
}

/// Kinds of non-fatal problems a worker job can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WarningCode {
    /// A downloaded file had an unexpected size.
    SizeMismatch,
    /// A single download failed but the job continued.
    FetchFailed,
    /// A modified configuration file was kept as .pacnew or .pacsave.
    ConfigFileSaved,
    UnknownWarning,
}

/// Questions the worker may ask while a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerQuestion {
    /// Proceed with the computed transaction?
    ConfirmTransaction,
    /// Replace one package with another?
    ReplacePackage,
    /// Remove a conflicting package?
    ConflictResolution,
    /// Import a PGP key?
    ImportKey,
    /// Delete a corrupted package file?
    CorruptedPackage,
    /// Pick one of several providers.
    ProviderSelection,
    /// Any other yes/no prompt.
    GenericConfirmation,
}

impl WorkerQuestion {
    /// True when the answer is free text rather than yes/no.
    pub fn expects_selection(self) -> bool {
        matches!(self, WorkerQuestion::ProviderSelection)
    }
}

/// Milestones of a worker job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerEvent {
    CacheUpdateStarted,
    CacheUpdateFinished,
    PackageDownloadStarted,
    PackageDownloadFinished,
    CommitChangesStarted,
    CommitChangesFinished,
}

/// Outcome attached to a download message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchType {
    /// The item is being downloaded.
    Downloading,
    /// The item was already current.
    UpToDate,
    /// The item could not be downloaded.
    Failed,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorCode::InitError => "could not open the package database",
            ErrorCode::LockError => "the package database is locked",
            ErrorCode::FetchError => "download failed",
            ErrorCode::CommitError => "the transaction could not be committed",
            ErrorCode::AuthError => "authorization failed",
            ErrorCode::DepError => "dependencies could not be resolved",
            ErrorCode::PackageNotFoundError => "package not found",
            ErrorCode::DiskSpaceError => "not enough free disk space",
            ErrorCode::UserCancelError => "cancelled",
            ErrorCode::WorkerDisappeared => "the worker exited unexpectedly",
            ErrorCode::UnknownError => "unknown error",
        };
        f.write_str(text)
    }
}

/// Builds a details payload holding a single message.
pub fn message_details(message: impl Into<String>) -> Details {
    let mut details = Details::new();
    details.insert(keys::MESSAGE.to_string(), message.into().into());
    details
}

/// Builds the answer payload for a yes/no question.
pub fn accept_answer(accept: bool) -> Details {
    let mut details = Details::new();
    details.insert(keys::ACCEPT.to_string(), accept.into());
    details
}

/// Builds the answer payload for a selection question.
pub fn selection_answer(selection: impl Into<String>) -> Details {
    let mut details = Details::new();
    details.insert(keys::SELECTION.to_string(), selection.into().into());
    details
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_serialize_as_names() {
        let json = serde_json::to_string(&ErrorCode::LockError).unwrap();
        assert_eq!(json, "\"LockError\"");
        let question: WorkerQuestion = serde_json::from_str("\"ImportKey\"").unwrap();
        assert_eq!(question, WorkerQuestion::ImportKey);
    }

    #[test]
    fn test_answer_payloads() {
        assert_eq!(accept_answer(false)[keys::ACCEPT], serde_json::Value::Bool(false));
        assert_eq!(selection_answer("2")[keys::SELECTION], "2");
        assert_eq!(message_details("boom")[keys::MESSAGE], "boom");
    }
}

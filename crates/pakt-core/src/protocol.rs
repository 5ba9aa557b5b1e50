//! Wire protocol between the backend and the privileged worker.
//!
//! Both directions carry newline-delimited JSON: one request or message
//! per line.

use crate::codes::{Details, ErrorCode, FetchType, WarningCode, WorkerEvent, WorkerQuestion};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Pending changes handed to the worker on commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Packages to install.
    pub install: Vec<String>,
    /// Installed packages to upgrade.
    pub upgrade: Vec<String>,
    /// Installed packages to remove.
    pub remove: Vec<String>,
    /// Whether a full system upgrade was requested.
    #[serde(default)]
    pub dist_upgrade: bool,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.install.is_empty() && self.upgrade.is_empty() && self.remove.is_empty() && !self.dist_upgrade
    }

    /// Total number of named packages.
    pub fn len(&self) -> usize {
        self.install.len() + self.upgrade.len() + self.remove.len()
    }
}

/// A request from the backend to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Refresh the package source lists.
    UpdateCache,
    /// Apply the pending changes.
    CommitChanges { changes: ChangeSet },
    /// Abort the running job.
    CancelDownload,
    /// Answer to the outstanding question.
    Answer { response: Details },
}

impl WorkerRequest {
    /// Whether this request starts a job.
    pub fn is_job(&self) -> bool {
        matches!(self, WorkerRequest::UpdateCache | WorkerRequest::CommitChanges { .. })
    }
}

/// A notification from the worker to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Started,
    Finished { success: bool },
    Error { code: ErrorCode, details: Details },
    Warning { code: WarningCode, details: Details },
    Question { question: WorkerQuestion, details: Details },
    Event { event: WorkerEvent },
    DownloadProgress { percentage: u8, speed: u64, eta: u64 },
    DownloadMessage { flag: FetchType, message: String },
    CommitProgress { status: String, percentage: u8 },
}

/// Serializes a value as one protocol line, newline included.
pub fn encode_line<T: Serialize>(value: &T) -> Result<String> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

/// Parses one protocol line. Blank lines yield `None`.
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<Option<T>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line)
        .map(Some)
        .map_err(|e| Error::ProtocolError(format!("{}: {}", e, line)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::message_details;

    #[test]
    fn test_request_wire_format() {
        let request = WorkerRequest::CommitChanges {
            changes: ChangeSet {
                install: vec!["vim".into()],
                remove: vec!["nano".into()],
                ..Default::default()
            },
        };
        let line = encode_line(&request).unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.starts_with(r#"{"type":"commit_changes""#));

        let decoded: WorkerRequest = decode_line(&line).unwrap().unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_message_wire_format() {
        let line = r#"{"type":"error","code":"LockError","details":{"message":"unable to lock database"}}"#;
        let message: WorkerMessage = decode_line(line).unwrap().unwrap();
        assert_eq!(
            message,
            WorkerMessage::Error {
                code: ErrorCode::LockError,
                details: message_details("unable to lock database"),
            }
        );
    }

    #[test]
    fn test_blank_and_garbage_lines() {
        assert!(decode_line::<WorkerMessage>("   \n").unwrap().is_none());
        assert!(matches!(
            decode_line::<WorkerMessage>("not json"),
            Err(Error::ProtocolError(_))
        ));
    }

    #[test]
    fn test_change_set_emptiness() {
        assert!(ChangeSet::default().is_empty());
        let dist = ChangeSet {
            dist_upgrade: true,
            ..Default::default()
        };
        assert!(!dist.is_empty());
        assert_eq!(dist.len(), 0);
    }
}

//! Error types for the commit pipeline

use dsvn_core::{DeltaError, Md5Digest, NodeKind};
use std::path::PathBuf;

/// Result type for working-copy operations
pub type Result<T> = std::result::Result<T, CommitError>;

/// Kind of conflict blocking a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    Text,
    Property,
    Tree,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConflictKind::Text => "text",
            ConflictKind::Property => "property",
            ConflictKind::Tree => "tree",
        })
    }
}

/// Errors reported by a repository editor
#[derive(Debug, thiserror::Error)]
pub enum RaError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Path is out of date: {0}")]
    OutOfDate(String),

    #[error("Path '{path}' is locked by '{owner}'")]
    Locked { path: String, owner: String },

    #[error("Checksum mismatch for '{path}': expected {expected}, actual {actual}")]
    ChecksumMismatch {
        path: String,
        expected: Md5Digest,
        actual: Md5Digest,
    },

    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid editor call: {0}")]
    InvalidCall(String),

    #[error("Delta error: {0}")]
    Delta(#[from] DeltaError),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Errors that can occur while committing
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("'{0}' is not under version control")]
    NotVersioned(String),

    #[error("Aborting commit: '{path}' remains in {kind} conflict")]
    Conflict { path: String, kind: ConflictKind },

    #[error("Cannot commit '{path}' because its parent '{parent}' is not known to exist in the repository and is not part of the commit")]
    DanglingParent { path: String, parent: String },

    #[error("Unknown or unexpected node kind at '{0}'")]
    UnknownNodeKind(String),

    #[error("{kind} '{path}' is out of date")]
    OutOfDate { path: String, kind: NodeKind },

    #[error("Pristine text of '{path}' is corrupt: recorded {recorded}, actual {actual}")]
    CorruptBase {
        path: String,
        recorded: Md5Digest,
        actual: Md5Digest,
    },

    #[error("Checksum mismatch for '{path}': local {expected}, repository {actual}")]
    ChecksumMismatch {
        path: String,
        expected: Md5Digest,
        actual: Md5Digest,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Working copy '{0}' is locked")]
    WcLocked(PathBuf),

    #[error("Commit rejected: {0}")]
    Rejected(String),

    #[error("Pristine text not found: {0}")]
    PristineNotFound(String),

    #[error("Repository error: {0}")]
    Ra(#[from] RaError),

    #[error("Delta error: {0}")]
    Delta(#[from] DeltaError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Corrupt working copy metadata: {0}")]
    Corrupt(String),

    #[error("Invalid working copy operation: {0}")]
    InvalidOperation(String),

    #[error("While processing '{path}': {source}")]
    AtPath {
        path: String,
        #[source]
        source: Box<CommitError>,
    },

    #[error("Commit failed (details follow): {0}")]
    CommitFailed(#[source] Box<CommitError>),
}

impl CommitError {
    /// Attach the path being processed, unless already attached
    pub fn at_path(self, path: impl Into<String>) -> Self {
        match self {
            e @ CommitError::AtPath { .. } => e,
            e @ CommitError::Cancelled => e,
            other => CommitError::AtPath {
                path: path.into(),
                source: Box::new(other),
            },
        }
    }

    /// The error with all context wrappers removed
    pub fn root_cause(&self) -> &CommitError {
        match self {
            CommitError::AtPath { source, .. } | CommitError::CommitFailed(source) => {
                source.root_cause()
            }
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), CommitError::Cancelled)
    }
}

/// Adds path context to fallible results
pub trait ResultExt<T> {
    fn at_path(self, path: &str) -> Result<T>;
}

impl<T, E: Into<CommitError>> ResultExt<T> for std::result::Result<T, E> {
    fn at_path(self, path: &str) -> Result<T> {
        self.map_err(|e| e.into().at_path(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_path_wraps_once() {
        let err = CommitError::UnknownNodeKind("x".into()).at_path("a").at_path("b");
        match &err {
            CommitError::AtPath { path, .. } => assert_eq!(path, "a"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(err.root_cause(), CommitError::UnknownNodeKind(_)));
    }

    #[test]
    fn test_cancellation_seen_through_wrappers() {
        let err = CommitError::CommitFailed(Box::new(CommitError::Cancelled));
        assert!(err.is_cancelled());
        assert!(CommitError::Cancelled.at_path("p").is_cancelled());
        assert!(!CommitError::Rejected("no".into()).is_cancelled());
    }

    #[test]
    fn test_result_ext_converts_sources() {
        let res: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        let err = res.at_path("dir/file").unwrap_err();
        assert!(err.to_string().contains("dir/file"));
        assert!(matches!(err.root_cause(), CommitError::Io(_)));
    }
}

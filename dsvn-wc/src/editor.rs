//! Repository-side interfaces of a commit
//!
//! A commit is described to the repository as a depth-first edit of its
//! tree. Paths passed to a [`CommitEditor`] are relative to the anchor the
//! editor was opened at; the anchor itself is `""`. Calls are made one at a
//! time. File batons may stay open after their parent directory is closed,
//! which lets the driver send all text deltas after the tree changes.

use crate::error::RaError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dsvn_core::{DeltaWindow, Md5Digest, PropertySet, Revnum};
use std::collections::BTreeMap;

pub type RaResult<T> = std::result::Result<T, RaError>;

/// Copy source of an added node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopySource {
    pub url: String,
    pub revision: Revnum,
}

/// What the repository reports after a successful commit
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub revision: Revnum,
    pub date: DateTime<Utc>,
    pub author: Option<String>,
    /// Failure of a repository-side post-commit step; the commit stands
    pub post_commit_err: Option<String>,
    /// Server-assigned properties per committed repository relpath
    pub dav_cache: BTreeMap<String, PropertySet>,
}

/// Receiver of one tree edit
#[async_trait]
pub trait CommitEditor: Send {
    async fn open_root(&mut self, base_revision: Option<Revnum>) -> RaResult<()>;

    /// Delete `path`, which must be unchanged since `revision`
    async fn delete_entry(&mut self, path: &str, revision: Option<Revnum>) -> RaResult<()>;

    async fn add_directory(&mut self, path: &str, copy_from: Option<&CopySource>) -> RaResult<()>;

    async fn open_directory(&mut self, path: &str, base_revision: Option<Revnum>) -> RaResult<()>;

    async fn change_dir_prop(&mut self, path: &str, name: &str, value: Option<&str>)
    -> RaResult<()>;

    async fn close_directory(&mut self, path: &str) -> RaResult<()>;

    async fn add_file(&mut self, path: &str, copy_from: Option<&CopySource>) -> RaResult<()>;

    async fn open_file(&mut self, path: &str, base_revision: Option<Revnum>) -> RaResult<()>;

    async fn change_file_prop(
        &mut self,
        path: &str,
        name: &str,
        value: Option<&str>,
    ) -> RaResult<()>;

    /// Start a text delta against the file's current text, whose MD5 the
    /// client believes is `base_md5`
    async fn apply_textdelta(&mut self, path: &str, base_md5: Option<&Md5Digest>) -> RaResult<()>;

    async fn send_window(&mut self, path: &str, window: &DeltaWindow) -> RaResult<()>;

    /// Close a file. Returns the MD5 of the text the repository now holds
    /// when a delta was applied.
    async fn close_file(
        &mut self,
        path: &str,
        text_md5: Option<&Md5Digest>,
    ) -> RaResult<Option<Md5Digest>>;

    async fn close_edit(&mut self) -> RaResult<CommitInfo>;

    async fn abort_edit(&mut self) -> RaResult<()>;
}

/// Session with a repository
#[async_trait]
pub trait RepositoryAccess: Send + Sync {
    fn repos_root_url(&self) -> &str;

    /// Begin a commit anchored at `base_relpath`
    async fn open_commit_editor(
        &self,
        base_relpath: &str,
        revprops: &PropertySet,
        lock_tokens: &BTreeMap<String, String>,
        keep_locks: bool,
    ) -> RaResult<Box<dyn CommitEditor>>;
}

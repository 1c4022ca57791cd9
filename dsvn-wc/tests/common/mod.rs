//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use dsvn_core::{DeltaWindow, Md5Digest, PropertySet, Revnum};
use dsvn_wc::editor::RaResult;
use dsvn_wc::{
    CancelToken, CommitEditor, CommitInfo, CommitOptions, CommitOutcome, CommitStrategies,
    CopySource, FixedMessage, MemoryRepository, NullSink, RepositoryAccess, Seed, WorkingCopy,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// A repository with `trunk/a.txt` and `trunk/D/{x,y}` at r1
pub async fn repo() -> MemoryRepository {
    let repo = MemoryRepository::new("mem://repo").with_author("alice");
    repo.import(
        &[
            Seed::Dir("trunk"),
            Seed::File("trunk/a.txt", b"alpha\n"),
            Seed::Dir("trunk/D"),
            Seed::File("trunk/D/x", b"x\n"),
            Seed::File("trunk/D/y", b"y\n"),
        ],
        "initial import",
    )
    .await
    .unwrap();
    repo
}

pub async fn checkout(repo: &MemoryRepository, tmp: &TempDir, name: &str) -> WorkingCopy {
    repo.checkout("trunk", &tmp.path().join(name)).await.unwrap()
}

pub async fn setup() -> (TempDir, MemoryRepository, WorkingCopy) {
    let tmp = TempDir::new().unwrap();
    let repo = repo().await;
    let wc = checkout(&repo, &tmp, "wc").await;
    (tmp, repo, wc)
}

pub fn write(wc: &WorkingCopy, relpath: &str, content: &[u8]) {
    let path = wc.abspath(relpath);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

pub fn read(wc: &WorkingCopy, relpath: &str) -> Vec<u8> {
    std::fs::read(wc.abspath(relpath)).unwrap()
}

pub async fn commit_with(
    wc: &WorkingCopy,
    ra: &dyn RepositoryAccess,
    opts: &CommitOptions,
) -> dsvn_wc::Result<CommitOutcome> {
    let strategies = CommitStrategies::new(FixedMessage("test commit".into()));
    dsvn_wc::commit(wc, ra, opts, &strategies, &NullSink, &CancelToken::new()).await
}

pub async fn commit_all(wc: &WorkingCopy, ra: &dyn RepositoryAccess) -> dsvn_wc::Result<CommitOutcome> {
    commit_with(wc, ra, &CommitOptions::default()).await
}

pub fn assert_unlocked(wc: &WorkingCopy) {
    assert!(wc.db().lock_holder().unwrap().is_none());
}

pub fn pristine_dir_is_clean(admin_dir: &Path) -> bool {
    std::fs::read_dir(admin_dir.join("tmp")).unwrap().next().is_none()
}

/// Wraps a repository and records every editor call
#[derive(Clone)]
pub struct RecordingRepository {
    pub inner: MemoryRepository,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingRepository {
    pub fn new(inner: MemoryRepository) -> Self {
        Self {
            inner,
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RepositoryAccess for RecordingRepository {
    fn repos_root_url(&self) -> &str {
        self.inner.repos_root_url()
    }

    async fn open_commit_editor(
        &self,
        base_relpath: &str,
        revprops: &PropertySet,
        lock_tokens: &BTreeMap<String, String>,
        keep_locks: bool,
    ) -> RaResult<Box<dyn CommitEditor>> {
        let inner = self
            .inner
            .open_commit_editor(base_relpath, revprops, lock_tokens, keep_locks)
            .await?;
        Ok(Box::new(RecordingEditor {
            inner,
            calls: self.calls.clone(),
        }))
    }
}

pub struct RecordingEditor {
    inner: Box<dyn CommitEditor>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingEditor {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl CommitEditor for RecordingEditor {
    async fn open_root(&mut self, base: Option<Revnum>) -> RaResult<()> {
        self.record("open_root".into());
        self.inner.open_root(base).await
    }
    async fn delete_entry(&mut self, path: &str, rev: Option<Revnum>) -> RaResult<()> {
        self.record(format!("delete_entry {}", path));
        self.inner.delete_entry(path, rev).await
    }
    async fn add_directory(&mut self, path: &str, from: Option<&CopySource>) -> RaResult<()> {
        self.record(format!("add_directory {}", path));
        self.inner.add_directory(path, from).await
    }
    async fn open_directory(&mut self, path: &str, base: Option<Revnum>) -> RaResult<()> {
        self.record(format!("open_directory {}", path));
        self.inner.open_directory(path, base).await
    }
    async fn change_dir_prop(&mut self, path: &str, name: &str, value: Option<&str>) -> RaResult<()> {
        self.record(format!("change_dir_prop {} {}", path, name));
        self.inner.change_dir_prop(path, name, value).await
    }
    async fn close_directory(&mut self, path: &str) -> RaResult<()> {
        self.record(format!("close_directory {}", path));
        self.inner.close_directory(path).await
    }
    async fn add_file(&mut self, path: &str, from: Option<&CopySource>) -> RaResult<()> {
        self.record(format!("add_file {}", path));
        self.inner.add_file(path, from).await
    }
    async fn open_file(&mut self, path: &str, base: Option<Revnum>) -> RaResult<()> {
        self.record(format!("open_file {}", path));
        self.inner.open_file(path, base).await
    }
    async fn change_file_prop(&mut self, path: &str, name: &str, value: Option<&str>) -> RaResult<()> {
        self.record(format!("change_file_prop {} {}", path, name));
        self.inner.change_file_prop(path, name, value).await
    }
    async fn apply_textdelta(&mut self, path: &str, base_md5: Option<&Md5Digest>) -> RaResult<()> {
        self.record(format!("apply_textdelta {}", path));
        self.inner.apply_textdelta(path, base_md5).await
    }
    async fn send_window(&mut self, path: &str, window: &DeltaWindow) -> RaResult<()> {
        self.inner.send_window(path, window).await
    }
    async fn close_file(&mut self, path: &str, md5: Option<&Md5Digest>) -> RaResult<Option<Md5Digest>> {
        self.record(format!("close_file {}", path));
        self.inner.close_file(path, md5).await
    }
    async fn close_edit(&mut self) -> RaResult<CommitInfo> {
        self.record("close_edit".into());
        self.inner.close_edit().await
    }
    async fn abort_edit(&mut self) -> RaResult<()> {
        self.record("abort_edit".into());
        self.inner.abort_edit().await
    }
}

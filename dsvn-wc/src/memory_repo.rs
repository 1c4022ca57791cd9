//! In-process repository
//!
//! [`MemoryRepository`] keeps every revision as a full tree in memory and
//! implements [`RepositoryAccess`]. It performs the checks a real server
//! makes on a commit: out-of-date detection against base revisions, lock
//! enforcement against the supplied tokens, and verification of the base
//! and result MD5 of every text delta. It backs the tests and the examples
//! of driving a commit end to end.

use crate::editor::{CommitEditor, CommitInfo, CopySource, RaResult, RepositoryAccess};
use crate::error::{RaError, Result};
use crate::working_copy::{BaseInfo, WorkingCopy};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use dsvn_core::delta::apply_windows;
use dsvn_core::path::{dirname, is_ancestor, join, skip_ancestor};
use dsvn_core::{DeltaWindow, Md5Digest, NodeKind, PropertySet, Revnum, svn_props};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Server-assigned property returned for every committed node
pub const VERSION_URL_PROP: &str = "svn:wc:ra_dav:version-url";

#[derive(Debug, Clone)]
struct RepoNode {
    kind: NodeKind,
    content: Bytes,
    props: PropertySet,
    /// Revision that last changed this node
    created_rev: Revnum,
}

impl RepoNode {
    fn dir(created_rev: Revnum) -> Self {
        Self {
            kind: NodeKind::Dir,
            content: Bytes::new(),
            props: PropertySet::new(),
            created_rev,
        }
    }
}

type Tree = BTreeMap<String, RepoNode>;

#[derive(Debug)]
struct RevisionData {
    tree: Tree,
    revprops: PropertySet,
    date: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct RepoLock {
    token: String,
    owner: String,
}

#[derive(Debug)]
struct RepoState {
    revisions: Vec<RevisionData>,
    locks: BTreeMap<String, RepoLock>,
}

impl RepoState {
    fn head(&self) -> Revnum {
        self.revisions.len() as Revnum - 1
    }

    fn tree(&self, rev: Option<Revnum>) -> Option<&Tree> {
        let rev = rev.unwrap_or_else(|| self.head());
        self.revisions.get(rev as usize).map(|r| &r.tree)
    }

    fn push(&mut self, tree: Tree, revprops: PropertySet) -> (Revnum, DateTime<Utc>) {
        let date = Utc::now();
        let mut revprops = revprops;
        revprops.set(
            svn_props::REVPROP_DATE,
            date.to_rfc3339_opts(SecondsFormat::Micros, true),
        );
        self.revisions.push(RevisionData {
            tree,
            revprops,
            date,
        });
        (self.head(), date)
    }
}

/// Seed content for [`MemoryRepository::import`]
#[derive(Debug, Clone, Copy)]
pub enum Seed<'a> {
    Dir(&'a str),
    File(&'a str, &'a [u8]),
    Prop(&'a str, &'a str, &'a str),
}

#[derive(Clone)]
pub struct MemoryRepository {
    root_url: String,
    uuid: String,
    author: Option<String>,
    state: Arc<RwLock<RepoState>>,
}

impl MemoryRepository {
    /// An empty repository: revision 0 holds only the root directory
    pub fn new(root_url: &str) -> Self {
        let mut tree = Tree::new();
        tree.insert(String::new(), RepoNode::dir(0));
        let state = RepoState {
            revisions: vec![RevisionData {
                tree,
                revprops: PropertySet::new(),
                date: Utc::now(),
            }],
            locks: BTreeMap::new(),
        };
        Self {
            root_url: root_url.trim_end_matches('/').to_string(),
            uuid: uuid::Uuid::new_v4().to_string(),
            author: None,
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Record commits of this session under `author`
    pub fn with_author(mut self, author: &str) -> Self {
        self.author = Some(author.to_string());
        self
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn url_of(&self, relpath: &str) -> String {
        if relpath.is_empty() {
            self.root_url.clone()
        } else {
            format!("{}/{}", self.root_url, relpath)
        }
    }

    fn relpath_of<'a>(&self, url: &'a str) -> Option<&'a str> {
        if url == self.root_url {
            return Some("");
        }
        url.strip_prefix(self.root_url.as_str())?.strip_prefix('/')
    }

    pub async fn head(&self) -> Revnum {
        self.state.read().await.head()
    }

    /// Create one revision directly from `seeds`
    pub async fn import(&self, seeds: &[Seed<'_>], log: &str) -> RaResult<Revnum> {
        let mut state = self.state.write().await;
        let next = state.head() + 1;
        let mut tree = state.tree(None).cloned().unwrap_or_default();
        for seed in seeds {
            match *seed {
                Seed::Dir(path) => {
                    require_dir(&tree, dirname(path))?;
                    tree.insert(path.to_string(), RepoNode::dir(next));
                }
                Seed::File(path, content) => {
                    require_dir(&tree, dirname(path))?;
                    tree.insert(
                        path.to_string(),
                        RepoNode {
                            kind: NodeKind::File,
                            content: Bytes::copy_from_slice(content),
                            props: PropertySet::new(),
                            created_rev: next,
                        },
                    );
                }
                Seed::Prop(path, name, value) => {
                    let node = tree
                        .get_mut(path)
                        .ok_or_else(|| RaError::NotFound(path.to_string()))?;
                    node.props.set(name, value);
                    node.created_rev = next;
                }
            }
        }
        let mut revprops = PropertySet::new();
        revprops.set(svn_props::REVPROP_LOG, log);
        if let Some(author) = &self.author {
            revprops.set(svn_props::REVPROP_AUTHOR, author.as_str());
        }
        Ok(state.push(tree, revprops).0)
    }

    pub async fn kind(&self, path: &str, rev: Option<Revnum>) -> Option<NodeKind> {
        let state = self.state.read().await;
        state.tree(rev)?.get(path).map(|n| n.kind)
    }

    /// Text of a file
    pub async fn cat(&self, path: &str, rev: Option<Revnum>) -> Option<Bytes> {
        let state = self.state.read().await;
        state
            .tree(rev)?
            .get(path)
            .filter(|n| n.kind == NodeKind::File)
            .map(|n| n.content.clone())
    }

    pub async fn props(&self, path: &str, rev: Option<Revnum>) -> Option<PropertySet> {
        let state = self.state.read().await;
        state.tree(rev)?.get(path).map(|n| n.props.clone())
    }

    /// Revision that last changed `path` as of `rev`
    pub async fn created_rev(&self, path: &str, rev: Option<Revnum>) -> Option<Revnum> {
        let state = self.state.read().await;
        state.tree(rev)?.get(path).map(|n| n.created_rev)
    }

    pub async fn revprop(&self, rev: Revnum, name: &str) -> Option<String> {
        let state = self.state.read().await;
        state
            .revisions
            .get(rev as usize)
            .and_then(|r| r.revprops.get(name).cloned())
    }

    /// Lock a file and return the token
    pub async fn lock(&self, path: &str, owner: &str) -> RaResult<String> {
        let mut state = self.state.write().await;
        match state.tree(None).and_then(|t| t.get(path)) {
            Some(node) if node.kind == NodeKind::File => {}
            _ => return Err(RaError::NotFound(path.to_string())),
        }
        if let Some(lock) = state.locks.get(path) {
            return Err(RaError::Locked {
                path: path.to_string(),
                owner: lock.owner.clone(),
            });
        }
        let token = format!("opaquelocktoken:{}", uuid::Uuid::new_v4());
        state.locks.insert(
            path.to_string(),
            RepoLock {
                token: token.clone(),
                owner: owner.to_string(),
            },
        );
        Ok(token)
    }

    pub async fn lock_owner(&self, path: &str) -> Option<String> {
        self.state.read().await.locks.get(path).map(|l| l.owner.clone())
    }

    /// Check out `repos_relpath` at HEAD into a new working copy at `root`
    pub async fn checkout(&self, repos_relpath: &str, root: &Path) -> Result<WorkingCopy> {
        let state = self.state.read().await;
        let head = state.head();
        let tree = state
            .tree(None)
            .ok_or_else(|| RaError::NotFound(repos_relpath.to_string()))?;
        let base_info = |node: &RepoNode| {
            let rev = state.revisions.get(node.created_rev as usize);
            BaseInfo {
                revision: head,
                changed_rev: node.created_rev,
                changed_date: rev.map(|r| r.date.timestamp_micros()),
                changed_author: rev.and_then(|r| r.revprops.get(svn_props::REVPROP_AUTHOR).cloned()),
            }
        };
        let top = tree
            .get(repos_relpath)
            .filter(|n| n.kind == NodeKind::Dir)
            .ok_or_else(|| RaError::NotFound(repos_relpath.to_string()))?;

        let wc = WorkingCopy::create(root, &self.root_url, &self.uuid, repos_relpath, base_info(top))?;
        for (path, node) in tree.range(repos_relpath.to_string()..) {
            let Some(local) = skip_ancestor(repos_relpath, path) else {
                continue;
            };
            if local.is_empty() {
                continue;
            }
            match node.kind {
                NodeKind::Dir => wc.add_base_dir(local, base_info(node), node.props.clone())?,
                NodeKind::File => {
                    wc.add_base_file(local, &node.content, base_info(node), node.props.clone())?
                }
            }
        }
        tracing::debug!("Checked out {} at r{} into {:?}", repos_relpath, head, root);
        Ok(wc)
    }
}

fn require_dir(tree: &Tree, path: &str) -> RaResult<()> {
    match tree.get(path) {
        Some(node) if node.kind == NodeKind::Dir => Ok(()),
        _ => Err(RaError::NotFound(path.to_string())),
    }
}

#[async_trait]
impl RepositoryAccess for MemoryRepository {
    fn repos_root_url(&self) -> &str {
        &self.root_url
    }

    async fn open_commit_editor(
        &self,
        base_relpath: &str,
        revprops: &PropertySet,
        lock_tokens: &BTreeMap<String, String>,
        keep_locks: bool,
    ) -> RaResult<Box<dyn CommitEditor>> {
        let state = self.state.read().await;
        let tree = state.tree(None).cloned().unwrap_or_default();
        require_dir(&tree, base_relpath)?;

        let mut revprops = revprops.clone();
        if let Some(author) = &self.author {
            revprops.set(svn_props::REVPROP_AUTHOR, author.as_str());
        }
        let lock_tokens = lock_tokens
            .iter()
            .filter_map(|(url, token)| {
                self.relpath_of(url)
                    .map(|relpath| (relpath.to_string(), token.clone()))
            })
            .collect();
        Ok(Box::new(MemoryEditor {
            repo: self.clone(),
            base: base_relpath.to_string(),
            head: state.head(),
            txn: tree,
            revprops,
            lock_tokens,
            keep_locks,
            changed: BTreeSet::new(),
            deleted: Vec::new(),
            texts: HashMap::new(),
            finished: false,
        }))
    }
}

struct PendingText {
    base: Bytes,
    windows: Vec<DeltaWindow>,
}

/// One commit transaction against a [`MemoryRepository`]
pub struct MemoryEditor {
    repo: MemoryRepository,
    base: String,
    head: Revnum,
    txn: Tree,
    revprops: PropertySet,
    /// Repository relpath → lock token
    lock_tokens: BTreeMap<String, String>,
    keep_locks: bool,
    changed: BTreeSet<String>,
    deleted: Vec<String>,
    texts: HashMap<String, PendingText>,
    finished: bool,
}

impl MemoryEditor {
    fn relpath(&self, path: &str) -> RaResult<String> {
        if self.finished {
            return Err(RaError::InvalidCall("edit already finished".into()));
        }
        Ok(join(&self.base, path))
    }

    fn node(&self, relpath: &str, kind: NodeKind) -> RaResult<&RepoNode> {
        self.txn
            .get(relpath)
            .filter(|n| n.kind == kind)
            .ok_or_else(|| RaError::NotFound(relpath.to_string()))
    }

    fn node_mut(&mut self, relpath: &str, kind: NodeKind) -> RaResult<&mut RepoNode> {
        self.txn
            .get_mut(relpath)
            .filter(|n| n.kind == kind)
            .ok_or_else(|| RaError::NotFound(relpath.to_string()))
    }

    /// A node changed after `base_revision` cannot be modified
    fn check_current(&self, relpath: &str, kind: NodeKind, base_revision: Option<Revnum>) -> RaResult<()> {
        let node = self.node(relpath, kind)?;
        match base_revision {
            Some(base) if node.created_rev > base => Err(RaError::OutOfDate(relpath.to_string())),
            _ => Ok(()),
        }
    }

    async fn add_node(&mut self, path: &str, kind: NodeKind, copy_from: Option<&CopySource>) -> RaResult<()> {
        let relpath = self.relpath(path)?;
        require_dir(&self.txn, dirname(&relpath))?;
        if self.txn.contains_key(&relpath) {
            return Err(RaError::AlreadyExists(relpath));
        }
        match copy_from {
            Some(source) => {
                let src = self
                    .repo
                    .relpath_of(&source.url)
                    .ok_or_else(|| RaError::NotFound(source.url.clone()))?
                    .to_string();
                let state = self.repo.state.read().await;
                let src_tree = state
                    .tree(Some(source.revision))
                    .ok_or_else(|| RaError::NotFound(format!("{}@{}", src, source.revision)))?;
                match src_tree.get(&src) {
                    Some(node) if node.kind == kind => {}
                    _ => return Err(RaError::NotFound(format!("{}@{}", src, source.revision))),
                }
                let copied: Vec<(String, RepoNode)> = src_tree
                    .iter()
                    .filter_map(|(p, node)| {
                        skip_ancestor(&src, p).map(|rest| (join(&relpath, rest), node.clone()))
                    })
                    .collect();
                drop(state);
                self.txn.extend(copied);
            }
            None => {
                let node = match kind {
                    NodeKind::Dir => RepoNode::dir(0),
                    NodeKind::File => RepoNode {
                        kind,
                        content: Bytes::new(),
                        props: PropertySet::new(),
                        created_rev: 0,
                    },
                };
                self.txn.insert(relpath.clone(), node);
            }
        }
        self.changed.insert(relpath);
        Ok(())
    }

    fn change_prop(&mut self, path: &str, kind: NodeKind, name: &str, value: Option<&str>) -> RaResult<()> {
        let relpath = self.relpath(path)?;
        let node = self.node_mut(&relpath, kind)?;
        match value {
            Some(v) => node.props.set(name, v),
            None => {
                node.props.remove(name);
            }
        }
        self.changed.insert(relpath);
        Ok(())
    }

    /// Every lock on a touched path must be matched by a supplied token
    fn check_locks(&self, locks: &BTreeMap<String, RepoLock>) -> RaResult<()> {
        let touched = self.changed.iter().chain(self.deleted.iter());
        for path in touched {
            for (locked, lock) in locks.iter().filter(|(p, _)| is_ancestor(path, p)) {
                if self.lock_tokens.get(locked) != Some(&lock.token) {
                    return Err(RaError::Locked {
                        path: locked.clone(),
                        owner: lock.owner.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CommitEditor for MemoryEditor {
    async fn open_root(&mut self, base_revision: Option<Revnum>) -> RaResult<()> {
        let relpath = self.relpath("")?;
        self.check_current(&relpath, NodeKind::Dir, base_revision)
    }

    async fn delete_entry(&mut self, path: &str, revision: Option<Revnum>) -> RaResult<()> {
        let relpath = self.relpath(path)?;
        if !self.txn.contains_key(&relpath) {
            return Err(RaError::NotFound(relpath));
        }
        if let Some(base) = revision {
            let newest = self
                .txn
                .iter()
                .filter(|(p, _)| is_ancestor(&relpath, p))
                .map(|(_, n)| n.created_rev)
                .max()
                .unwrap_or(0);
            if newest > base {
                return Err(RaError::OutOfDate(relpath));
            }
        }
        self.txn.retain(|p, _| !is_ancestor(&relpath, p));
        self.changed.retain(|p| !is_ancestor(&relpath, p));
        self.deleted.push(relpath);
        Ok(())
    }

    async fn add_directory(&mut self, path: &str, copy_from: Option<&CopySource>) -> RaResult<()> {
        self.add_node(path, NodeKind::Dir, copy_from).await
    }

    async fn open_directory(&mut self, path: &str, base_revision: Option<Revnum>) -> RaResult<()> {
        let relpath = self.relpath(path)?;
        self.check_current(&relpath, NodeKind::Dir, base_revision)
    }

    async fn change_dir_prop(&mut self, path: &str, name: &str, value: Option<&str>) -> RaResult<()> {
        self.change_prop(path, NodeKind::Dir, name, value)
    }

    async fn close_directory(&mut self, path: &str) -> RaResult<()> {
        let relpath = self.relpath(path)?;
        self.node(&relpath, NodeKind::Dir).map(|_| ())
    }

    async fn add_file(&mut self, path: &str, copy_from: Option<&CopySource>) -> RaResult<()> {
        self.add_node(path, NodeKind::File, copy_from).await
    }

    async fn open_file(&mut self, path: &str, base_revision: Option<Revnum>) -> RaResult<()> {
        let relpath = self.relpath(path)?;
        self.check_current(&relpath, NodeKind::File, base_revision)
    }

    async fn change_file_prop(&mut self, path: &str, name: &str, value: Option<&str>) -> RaResult<()> {
        self.change_prop(path, NodeKind::File, name, value)
    }

    async fn apply_textdelta(&mut self, path: &str, base_md5: Option<&Md5Digest>) -> RaResult<()> {
        let relpath = self.relpath(path)?;
        let base = self.node(&relpath, NodeKind::File)?.content.clone();
        if let Some(expected) = base_md5 {
            let actual = Md5Digest::from_data(&base);
            if actual != *expected {
                return Err(RaError::ChecksumMismatch {
                    path: relpath,
                    expected: *expected,
                    actual,
                });
            }
        }
        self.texts.insert(
            relpath,
            PendingText {
                base,
                windows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn send_window(&mut self, path: &str, window: &DeltaWindow) -> RaResult<()> {
        let relpath = self.relpath(path)?;
        let pending = self
            .texts
            .get_mut(&relpath)
            .ok_or_else(|| RaError::InvalidCall(format!("no text delta open for '{}'", relpath)))?;
        pending.windows.push(window.clone());
        Ok(())
    }

    async fn close_file(&mut self, path: &str, text_md5: Option<&Md5Digest>) -> RaResult<Option<Md5Digest>> {
        let relpath = self.relpath(path)?;
        let Some(pending) = self.texts.remove(&relpath) else {
            self.node(&relpath, NodeKind::File)?;
            return Ok(None);
        };
        let text = apply_windows(&pending.base, &pending.windows)?;
        let actual = Md5Digest::from_data(&text);
        if let Some(expected) = text_md5 {
            if *expected != actual {
                return Err(RaError::ChecksumMismatch {
                    path: relpath,
                    expected: *expected,
                    actual,
                });
            }
        }
        self.node_mut(&relpath, NodeKind::File)?.content = Bytes::from(text);
        self.changed.insert(relpath);
        Ok(Some(actual))
    }

    async fn close_edit(&mut self) -> RaResult<CommitInfo> {
        if self.finished {
            return Err(RaError::InvalidCall("edit already finished".into()));
        }
        if let Some(open) = self.texts.keys().next() {
            return Err(RaError::InvalidCall(format!("file '{}' was not closed", open)));
        }

        let repo = self.repo.clone();
        let mut state = repo.state.write().await;
        if state.head() != self.head {
            return Err(RaError::OutOfDate(format!(
                "transaction based on r{} but HEAD is r{}",
                self.head,
                state.head()
            )));
        }
        self.check_locks(&state.locks)?;

        let next = self.head + 1;
        let mut dav_cache = BTreeMap::new();
        for path in &self.changed {
            if let Some(node) = self.txn.get_mut(path) {
                node.created_rev = next;
                let mut cache = PropertySet::new();
                cache.set(VERSION_URL_PROP, format!("{}/!svn/ver/{}/{}", repo.root_url, next, path));
                dav_cache.insert(path.clone(), cache);
            }
        }

        let tree = std::mem::take(&mut self.txn);
        let (revision, date) = state.push(tree, self.revprops.clone());
        if !self.keep_locks {
            for (path, token) in &self.lock_tokens {
                if state.locks.get(path).is_some_and(|l| &l.token == token) {
                    state.locks.remove(path);
                }
            }
        }
        self.finished = true;
        tracing::debug!("Repository now at r{}", revision);

        Ok(CommitInfo {
            revision,
            date,
            author: self.revprops.get(svn_props::REVPROP_AUTHOR).cloned(),
            post_commit_err: None,
            dav_cache,
        })
    }

    async fn abort_edit(&mut self) -> RaResult<()> {
        self.finished = true;
        self.txn.clear();
        self.texts.clear();
        Ok(())
    }
}

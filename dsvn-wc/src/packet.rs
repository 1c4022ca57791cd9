//! The commit packet: everything one commit will send
//!
//! A packet owns the working-copy write lock from the moment harvesting
//! starts, plus any temporary files written along the way. It must be
//! disposed on every exit path; dropping it disposes as a fallback.

use crate::editor::CopySource;
use crate::error::{CommitError, Result};
use crate::lock::WcWriteLock;
use dsvn_core::path::{compare_paths, dirname, is_strict_ancestor, longest_common_ancestor, skip_ancestor};
use dsvn_core::{ChecksumPair, EolStyle, NodeKind, PropChange, Revnum};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::path::{Path, PathBuf};

/// What a commit item changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StateFlags(u8);

impl StateFlags {
    pub const ADD: Self = Self(0x01);
    pub const DELETE: Self = Self(0x02);
    pub const TEXT_MODIFIED: Self = Self(0x04);
    pub const PROPS_MODIFIED: Self = Self(0x08);
    pub const COPY: Self = Self(0x10);
    pub const LOCK_TOKEN: Self = Self(0x20);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// One-letter summary in the style of a status listing
    pub fn status_char(self) -> char {
        if self.contains(Self::ADD | Self::DELETE) {
            'R'
        } else if self.contains(Self::ADD) {
            'A'
        } else if self.contains(Self::DELETE) {
            'D'
        } else if self.contains(Self::TEXT_MODIFIED) || self.contains(Self::PROPS_MODIFIED) {
            'M'
        } else {
            ' '
        }
    }
}

impl BitOr for StateFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for StateFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for StateFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::ADD, "add"),
            (Self::DELETE, "delete"),
            (Self::COPY, "copy"),
            (Self::TEXT_MODIFIED, "text"),
            (Self::PROPS_MODIFIED, "props"),
            (Self::LOCK_TOKEN, "lock"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", set.join("|"))
    }
}

/// One node to be committed
#[derive(Debug, Clone)]
pub struct CommitItem {
    pub local_relpath: String,
    pub repos_relpath: String,
    pub url: String,
    /// Base revision; the revision a delete or modification applies to
    pub revision: Option<Revnum>,
    pub copy_from: Option<CopySource>,
    pub kind: NodeKind,
    pub flags: StateFlags,
    pub lock_token: Option<String>,
    pub prop_changes: Vec<PropChange>,
    /// Pristine text the delta is computed against
    pub base_checksums: Option<ChecksumPair>,
    pub eol_style: Option<EolStyle>,
    /// Normal form of the working file written during harvesting
    pub spool: Option<PathBuf>,
}

impl CommitItem {
    pub fn is_add(&self) -> bool {
        self.flags.contains(StateFlags::ADD)
    }

    pub fn is_delete(&self) -> bool {
        self.flags.contains(StateFlags::DELETE)
    }

    pub fn is_replace(&self) -> bool {
        self.is_add() && self.is_delete()
    }

    pub fn is_copy(&self) -> bool {
        self.flags.contains(StateFlags::COPY)
    }

    pub fn has_text_mods(&self) -> bool {
        self.flags.contains(StateFlags::TEXT_MODIFIED)
    }

    pub fn has_prop_mods(&self) -> bool {
        self.flags.contains(StateFlags::PROPS_MODIFIED)
    }

    /// Whether the driver sends content for this item
    pub fn needs_text(&self) -> bool {
        self.kind == NodeKind::File && (self.has_text_mods() || (self.is_add() && !self.is_copy()))
    }
}

/// The set of items of one commit plus the resources held for it
pub struct CommitPacket {
    root: PathBuf,
    items: Vec<CommitItem>,
    by_repos: HashMap<String, usize>,
    by_local: HashMap<String, usize>,
    lock_tokens: BTreeMap<String, String>,
    base_relpath: String,
    lock: Option<WcWriteLock>,
    temp_files: Vec<PathBuf>,
}

impl CommitPacket {
    pub fn new(root: &Path, lock: WcWriteLock) -> Self {
        Self {
            root: root.to_path_buf(),
            items: Vec::new(),
            by_repos: HashMap::new(),
            by_local: HashMap::new(),
            lock_tokens: BTreeMap::new(),
            base_relpath: String::new(),
            lock: Some(lock),
            temp_files: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Add an item. Returns false and keeps the existing one if the
    /// repository path is already present.
    pub fn insert(&mut self, item: CommitItem) -> bool {
        if self.by_repos.contains_key(&item.repos_relpath) {
            return false;
        }
        let idx = self.items.len();
        self.by_repos.insert(item.repos_relpath.clone(), idx);
        self.by_local.insert(item.local_relpath.clone(), idx);
        self.items.push(item);
        true
    }

    pub fn add_lock_token(&mut self, url: impl Into<String>, token: impl Into<String>) {
        self.lock_tokens.insert(url.into(), token.into());
    }

    pub fn add_temp_file(&mut self, path: PathBuf) {
        self.temp_files.push(path);
    }

    /// Items in discovery order
    pub fn items(&self) -> &[CommitItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, repos_relpath: &str) -> Option<&CommitItem> {
        self.by_repos.get(repos_relpath).map(|&i| &self.items[i])
    }

    pub fn get_local(&self, local_relpath: &str) -> Option<&CommitItem> {
        self.by_local.get(local_relpath).map(|&i| &self.items[i])
    }

    /// URL → lock token of every lock the commit must present
    pub fn lock_tokens(&self) -> &BTreeMap<String, String> {
        &self.lock_tokens
    }

    pub fn temp_files(&self) -> &[PathBuf] {
        &self.temp_files
    }

    /// Repository relpath the editor is anchored at
    pub fn base_relpath(&self) -> &str {
        &self.base_relpath
    }

    /// Items ordered so that parents come before children
    pub fn sorted_items(&self) -> Vec<&CommitItem> {
        let mut sorted: Vec<&CommitItem> = self.items.iter().collect();
        sorted.sort_by(|a, b| compare_paths(&a.repos_relpath, &b.repos_relpath));
        sorted
    }

    /// Path of an item relative to the editor anchor
    pub fn editor_path<'a>(&self, repos_relpath: &'a str) -> Result<&'a str> {
        skip_ancestor(&self.base_relpath, repos_relpath).ok_or_else(|| {
            CommitError::Corrupt(format!(
                "'{}' lies outside the commit base '{}'",
                repos_relpath, self.base_relpath
            ))
        })
    }

    /// Anchor the editor at the deepest directory containing every item.
    /// An item sitting at that directory which is a file, an addition or a
    /// deletion needs its parent opened, so the anchor moves up one level.
    pub fn condense(&mut self) {
        let Some(mut base) =
            longest_common_ancestor(self.items.iter().map(|i| i.repos_relpath.as_str()))
        else {
            return;
        };
        let needs_parent = self.items.iter().any(|i| {
            i.repos_relpath == base && (i.kind == NodeKind::File || i.is_add() || i.is_delete())
        });
        if needs_parent && !base.is_empty() {
            base = dirname(&base).to_string();
        }
        tracing::debug!("Commit base is '{}'", base);
        self.base_relpath = base;
    }

    /// Drop items made redundant by the deletion of an ancestor
    pub fn remove_skipped_items(&mut self) {
        let deleted: Vec<String> = self
            .items
            .iter()
            .filter(|i| i.is_delete() && !i.is_add())
            .map(|i| i.repos_relpath.clone())
            .collect();
        if deleted.is_empty() {
            return;
        }
        let before = self.items.len();
        self.items
            .retain(|i| !deleted.iter().any(|d| is_strict_ancestor(d, &i.repos_relpath)));
        if self.items.len() == before {
            return;
        }
        self.by_repos.clear();
        self.by_local.clear();
        for (idx, item) in self.items.iter().enumerate() {
            self.by_repos.insert(item.repos_relpath.clone(), idx);
            self.by_local.insert(item.local_relpath.clone(), idx);
        }
    }

    /// Release the write lock, if still held
    pub fn unlock_wc(&mut self) -> Result<()> {
        match self.lock.take() {
            Some(lock) => lock.release(),
            None => Ok(()),
        }
    }

    /// Release the lock and remove temporary files. Safe to call repeatedly.
    pub fn dispose(&mut self) -> Result<()> {
        let unlocked = self.unlock_wc();
        for path in self.temp_files.drain(..) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove temporary file {:?}: {}", path, e),
            }
        }
        unlocked
    }
}

impl Drop for CommitPacket {
    fn drop(&mut self) {
        if self.lock.is_some() || !self.temp_files.is_empty() {
            if let Err(e) = self.dispose() {
                tracing::warn!("Failed to dispose commit packet: {}", e);
            }
        }
    }
}

impl fmt::Debug for CommitPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitPacket")
            .field("root", &self.root)
            .field("base_relpath", &self.base_relpath)
            .field("items", &self.items)
            .field("lock_tokens", &self.lock_tokens)
            .finish()
    }
}

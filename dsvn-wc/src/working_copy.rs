//! A working copy on disk
//!
//! Ties together the metadata store, the pristine store and the
//! configuration found in the admin directory `<root>/.dsvn`.

use crate::cancel::CancelToken;
use crate::config::CommitConfig;
use crate::error::{CommitError, Result};
use crate::lock::WcWriteLock;
use crate::pristine::PristineStore;
use crate::translate;
use crate::wc_db::{BaseNode, WcDb};
use crate::work_queue;
use dsvn_core::path::{basename, dirname, join};
use dsvn_core::{NodeKind, PropertySet, Revnum};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

/// Name of the admin directory at the working-copy root
pub const ADMIN_DIR: &str = ".dsvn";

/// Size and modification time (microseconds) of a file
pub(crate) fn fileinfo(path: &Path) -> io::Result<(u64, i64)> {
    let meta = fs::metadata(path)?;
    let mtime = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0);
    Ok((meta.len(), mtime))
}

/// Revision information of a node fetched from the repository
#[derive(Debug, Clone)]
pub struct BaseInfo {
    pub revision: Revnum,
    pub changed_rev: Revnum,
    pub changed_date: Option<i64>,
    pub changed_author: Option<String>,
}

impl BaseInfo {
    /// A node last changed in the revision it was fetched at
    pub fn at(revision: Revnum) -> Self {
        Self {
            revision,
            changed_rev: revision,
            changed_date: None,
            changed_author: None,
        }
    }
}

/// Result of [`WorkingCopy::cleanup`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub broke_lock: bool,
    pub work_items: usize,
    pub tmp_files: usize,
}

pub struct WorkingCopy {
    root: PathBuf,
    admin_dir: PathBuf,
    db: Arc<WcDb>,
    pristine: PristineStore,
    config: CommitConfig,
}

impl WorkingCopy {
    /// Create an empty working copy of `repos_relpath` at `revision`.
    pub fn create(
        root: &Path,
        repos_root_url: &str,
        repos_uuid: &str,
        repos_relpath: &str,
        base: BaseInfo,
    ) -> Result<Self> {
        let admin_dir = root.join(ADMIN_DIR);
        if admin_dir.join(crate::wc_db::WC_DB_FILE).exists() {
            return Err(CommitError::InvalidOperation(format!(
                "{:?} is already a working copy",
                root
            )));
        }
        fs::create_dir_all(&admin_dir)?;
        fs::create_dir_all(admin_dir.join("hooks"))?;

        let db = WcDb::open(&admin_dir)?;
        db.set_root_info(repos_root_url.trim_end_matches('/'), repos_uuid)?;
        db.insert_base_node(BaseNode {
            local_relpath: String::new(),
            kind: NodeKind::Dir,
            repos_relpath: repos_relpath.to_string(),
            revision: base.revision,
            changed_rev: base.changed_rev,
            changed_date: base.changed_date,
            changed_author: base.changed_author,
            checksums: None,
            props: PropertySet::new(),
        })?;
        tracing::info!("Created working copy at {:?} for {}/{}", root, repos_root_url, repos_relpath);
        Self::open(root)
    }

    /// Open an existing working copy rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let admin_dir = root.join(ADMIN_DIR);
        if !admin_dir.join(crate::wc_db::WC_DB_FILE).exists() {
            return Err(CommitError::NotVersioned(root.display().to_string()));
        }
        let db = Arc::new(WcDb::open(&admin_dir)?);
        let pristine = PristineStore::open(&admin_dir)?;
        let config = CommitConfig::load(&admin_dir)?;
        Ok(Self {
            root: root.to_path_buf(),
            admin_dir,
            db,
            pristine,
            config,
        })
    }

    /// Walk up from `path` to the nearest directory holding a working copy
    pub fn find_root(path: &Path) -> Option<PathBuf> {
        path.ancestors()
            .find(|dir| dir.join(ADMIN_DIR).join(crate::wc_db::WC_DB_FILE).exists())
            .map(Path::to_path_buf)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn admin_dir(&self) -> &Path {
        &self.admin_dir
    }

    pub fn db(&self) -> &Arc<WcDb> {
        &self.db
    }

    pub fn pristine(&self) -> &PristineStore {
        &self.pristine
    }

    pub fn config(&self) -> &CommitConfig {
        &self.config
    }

    /// Replace and persist the configuration
    pub fn set_config(&mut self, config: CommitConfig) -> Result<()> {
        config.save(&self.admin_dir)?;
        self.config = config;
        Ok(())
    }

    pub fn abspath(&self, relpath: &str) -> PathBuf {
        if relpath.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relpath)
        }
    }

    /// Working-copy relpath of a path inside the working copy
    pub fn relpath_of(&self, path: &Path) -> Result<String> {
        let rel = path
            .strip_prefix(&self.root)
            .map_err(|_| CommitError::NotVersioned(path.display().to_string()))?;
        let parts = rel
            .components()
            .map(|c| {
                c.as_os_str()
                    .to_str()
                    .ok_or_else(|| CommitError::NotVersioned(path.display().to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(parts.join("/"))
    }

    pub fn repos_root_url(&self) -> Result<String> {
        Ok(self.db.root_info()?.0)
    }

    /// URL of a repository relpath
    pub fn url_of(&self, repos_relpath: &str) -> Result<String> {
        let root = self.repos_root_url()?;
        Ok(if repos_relpath.is_empty() {
            root
        } else {
            format!("{}/{}", root, repos_relpath)
        })
    }

    /// Take the write lock on this working copy
    pub fn lock(&self) -> Result<WcWriteLock> {
        WcWriteLock::acquire(self.db.clone(), &self.root)
    }

    /// Recover from an interrupted operation: break a stale write lock,
    /// finish queued work and empty the temporary area.
    pub fn cleanup(&self, cancel: &CancelToken) -> Result<CleanupReport> {
        let broke_lock = self.db.break_lock()?;
        if broke_lock {
            tracing::warn!("Broke stale write lock on {:?}", self.root);
        }
        let work_items = work_queue::run(&self.db, cancel)?;
        let tmp_files = self.pristine.clean_tmp()?;
        tracing::info!(
            "Cleanup of {:?}: {} work items, {} temporary files",
            self.root,
            work_items,
            tmp_files
        );
        Ok(CleanupReport {
            broke_lock,
            work_items,
            tmp_files,
        })
    }

    // ==================== Populating ====================

    fn child_repos_relpath(&self, relpath: &str) -> Result<String> {
        let parent = self
            .db
            .read_node(dirname(relpath))?
            .ok_or_else(|| CommitError::NotVersioned(dirname(relpath).to_string()))?;
        Ok(join(&parent.repos_relpath, basename(relpath)))
    }

    /// Record a directory fetched from the repository and create it on disk
    pub fn add_base_dir(&self, relpath: &str, base: BaseInfo, props: PropertySet) -> Result<()> {
        let repos_relpath = self.child_repos_relpath(relpath)?;
        fs::create_dir_all(self.abspath(relpath))?;
        self.db.insert_base_node(BaseNode {
            local_relpath: relpath.to_string(),
            kind: NodeKind::Dir,
            repos_relpath,
            revision: base.revision,
            changed_rev: base.changed_rev,
            changed_date: base.changed_date,
            changed_author: base.changed_author,
            checksums: None,
            props,
        })
    }

    /// Record a file fetched from the repository; `content` is its normal
    /// form. The working file is written in working form.
    pub fn add_base_file(
        &self,
        relpath: &str,
        content: &[u8],
        base: BaseInfo,
        props: PropertySet,
    ) -> Result<()> {
        let repos_relpath = self.child_repos_relpath(relpath)?;
        let sums = self.pristine.write(content, &self.db)?;
        let path = self.abspath(relpath);
        fs::write(&path, translate::to_working_form(content, props.eol_style()))?;
        self.db.insert_base_node(BaseNode {
            local_relpath: relpath.to_string(),
            kind: NodeKind::File,
            repos_relpath,
            revision: base.revision,
            changed_rev: base.changed_rev,
            changed_date: base.changed_date,
            changed_author: base.changed_author,
            checksums: Some(sums),
            props,
        })?;
        let (size, mtime) = fileinfo(&path)?;
        self.db.record_fileinfo(relpath, size, mtime)
    }

    // ==================== Local edits ====================

    /// Schedule an on-disk node for addition. A missing directory is created.
    pub fn add(&self, relpath: &str, props: PropertySet) -> Result<()> {
        let path = self.abspath(relpath);
        let kind = match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => NodeKind::Dir,
            Ok(meta) if meta.is_file() => NodeKind::File,
            Ok(_) => return Err(CommitError::UnknownNodeKind(relpath.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&path)?;
                NodeKind::Dir
            }
            Err(e) => return Err(e.into()),
        };
        self.db.op_add(relpath, kind, props)
    }

    /// Schedule a node for deletion and remove it from disk
    pub fn delete(&self, relpath: &str) -> Result<()> {
        self.db.op_delete(relpath)?;
        let path = self.abspath(relpath);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path)?,
            Ok(_) => fs::remove_file(&path)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Copy a versioned subtree, including its working files
    pub fn copy(&self, src: &str, dst: &str) -> Result<()> {
        self.db.op_copy(src, dst)?;
        copy_tree(&self.abspath(src), &self.abspath(dst))?;
        Ok(())
    }

    pub fn set_props(&self, relpath: &str, props: PropertySet) -> Result<()> {
        self.db.op_set_props(relpath, props)
    }

    pub fn set_prop(&self, relpath: &str, name: &str, value: Option<&str>) -> Result<()> {
        let node = self
            .db
            .read_node(relpath)?
            .ok_or_else(|| CommitError::NotVersioned(relpath.to_string()))?;
        let mut props = node.props().clone();
        match value {
            Some(v) => props.set(name, v),
            None => {
                props.remove(name);
            }
        }
        self.db.op_set_props(relpath, props)
    }
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if meta.is_dir() {
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            if entry.file_name() == ADMIN_DIR {
                continue;
            }
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else {
        fs::copy(src, dst)?;
    }
    Ok(())
}

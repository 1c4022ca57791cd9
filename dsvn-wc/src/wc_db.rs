//! Working-copy metadata store
//!
//! One SQLite database per working copy at `<wc>/.dsvn/wc.db`, opened in WAL
//! mode. It holds one row per versioned node, the pristine text index, the
//! write lock and the work queue.
//!
//! Node rows describe the node as the working copy sees it:
//! - `schedule` says what the next commit does with it
//! - `revision` is the repository revision of the base node, if any
//! - `origin_*` is the copy source of copied nodes
//! - `checksum`/`md5` identify the pristine text a delta is computed against

use crate::error::{CommitError, Result};
use dsvn_core::path::{basename, dirname, is_ancestor, join, skip_ancestor};
use dsvn_core::{ChecksumPair, ContentId, Md5Digest, NodeKind, PropertySet, Revnum};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// File name of the database inside the admin directory
pub const WC_DB_FILE: &str = "wc.db";

const SCHEMA_FORMAT: i64 = 1;

/// What the next commit does with a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Normal,
    Add,
    Delete,
    Replace,
}

impl Schedule {
    fn as_str(&self) -> &'static str {
        match self {
            Schedule::Normal => "normal",
            Schedule::Add => "add",
            Schedule::Delete => "delete",
            Schedule::Replace => "replace",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "normal" => Ok(Schedule::Normal),
            "add" => Ok(Schedule::Add),
            "delete" => Ok(Schedule::Delete),
            "replace" => Ok(Schedule::Replace),
            other => Err(CommitError::Corrupt(format!("unknown schedule '{}'", other))),
        }
    }
}

/// Whether a node row stands for an existing node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Normal,
    /// Excluded from the working copy by depth
    Excluded,
    /// Removed in a revision the parent has not caught up with
    NotPresent,
}

impl Presence {
    fn as_str(&self) -> &'static str {
        match self {
            Presence::Normal => "normal",
            Presence::Excluded => "excluded",
            Presence::NotPresent => "not-present",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "normal" => Ok(Presence::Normal),
            "excluded" => Ok(Presence::Excluded),
            "not-present" => Ok(Presence::NotPresent),
            other => Err(CommitError::Corrupt(format!("unknown presence '{}'", other))),
        }
    }
}

/// Copy source of a copied node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOrigin {
    pub repos_relpath: String,
    pub revision: Revnum,
}

/// One row of the `nodes` table
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub local_relpath: String,
    pub kind: NodeKind,
    pub schedule: Schedule,
    pub presence: Presence,
    pub repos_relpath: String,
    pub revision: Option<Revnum>,
    pub changed_rev: Option<Revnum>,
    /// Microseconds since the Unix epoch
    pub changed_date: Option<i64>,
    pub changed_author: Option<String>,
    pub origin: Option<CopyOrigin>,
    /// Root of a copy operation
    pub op_root: bool,
    pub checksum: Option<ContentId>,
    pub md5: Option<Md5Digest>,
    pub pristine_props: PropertySet,
    /// `None` when identical to the pristine properties
    pub actual_props: Option<PropertySet>,
    pub lock_token: Option<String>,
    pub changelist: Option<String>,
    pub text_conflict: bool,
    pub prop_conflict: bool,
    pub recorded_size: Option<u64>,
    pub recorded_mtime: Option<i64>,
    pub dav_cache: Option<PropertySet>,
}

impl NodeRecord {
    /// Properties as currently set in the working copy
    pub fn props(&self) -> &PropertySet {
        self.actual_props.as_ref().unwrap_or(&self.pristine_props)
    }

    pub fn has_prop_mods(&self) -> bool {
        self.actual_props
            .as_ref()
            .is_some_and(|actual| *actual != self.pristine_props)
    }

    pub fn checksums(&self) -> Option<ChecksumPair> {
        match (self.md5, self.checksum) {
            (Some(md5), Some(sha256)) => Some(ChecksumPair { md5, sha256 }),
            _ => None,
        }
    }

    /// Revision of the repository node this row replaces or deletes
    pub fn base_revision(&self) -> Option<Revnum> {
        self.revision
            .or_else(|| self.origin.as_ref().map(|o| o.revision))
    }

    pub fn is_present(&self) -> bool {
        self.presence == Presence::Normal
    }
}

/// Input for [`WcDb::insert_base_node`]
#[derive(Debug, Clone)]
pub struct BaseNode {
    pub local_relpath: String,
    pub kind: NodeKind,
    pub repos_relpath: String,
    pub revision: Revnum,
    pub changed_rev: Revnum,
    pub changed_date: Option<i64>,
    pub changed_author: Option<String>,
    pub checksums: Option<ChecksumPair>,
    pub props: PropertySet,
}

/// Post-commit state of one node. Every field is absolute so that applying
/// it twice gives the same row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedNode {
    pub local_relpath: String,
    pub revision: Revnum,
    pub changed_rev: Revnum,
    pub changed_date: Option<i64>,
    pub changed_author: Option<String>,
    /// New pristine text; `None` keeps the recorded one
    pub checksums: Option<ChecksumPair>,
    pub dav_cache: Option<PropertySet>,
    pub unlock: bool,
    pub keep_changelist: bool,
    /// The working properties were sent and become the pristine ones
    pub props_committed: bool,
    /// Size and mtime of the working file when it matches the new pristine
    pub fileinfo: Option<(u64, i64)>,
}

const NODE_COLUMNS: &str = "local_relpath, kind, schedule, presence, repos_relpath, revision, \
     changed_rev, changed_date, changed_author, origin_relpath, origin_rev, op_root, \
     checksum, md5, pristine_props, actual_props, lock_token, changelist, \
     text_conflict, prop_conflict, recorded_size, recorded_mtime, dav_cache";

struct RawNode {
    local_relpath: String,
    kind: String,
    schedule: String,
    presence: String,
    repos_relpath: String,
    revision: Option<i64>,
    changed_rev: Option<i64>,
    changed_date: Option<i64>,
    changed_author: Option<String>,
    origin_relpath: Option<String>,
    origin_rev: Option<i64>,
    op_root: bool,
    checksum: Option<String>,
    md5: Option<String>,
    pristine_props: String,
    actual_props: Option<String>,
    lock_token: Option<String>,
    changelist: Option<String>,
    text_conflict: bool,
    prop_conflict: bool,
    recorded_size: Option<i64>,
    recorded_mtime: Option<i64>,
    dav_cache: Option<String>,
}

fn raw_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawNode> {
    Ok(RawNode {
        local_relpath: row.get(0)?,
        kind: row.get(1)?,
        schedule: row.get(2)?,
        presence: row.get(3)?,
        repos_relpath: row.get(4)?,
        revision: row.get(5)?,
        changed_rev: row.get(6)?,
        changed_date: row.get(7)?,
        changed_author: row.get(8)?,
        origin_relpath: row.get(9)?,
        origin_rev: row.get(10)?,
        op_root: row.get(11)?,
        checksum: row.get(12)?,
        md5: row.get(13)?,
        pristine_props: row.get(14)?,
        actual_props: row.get(15)?,
        lock_token: row.get(16)?,
        changelist: row.get(17)?,
        text_conflict: row.get(18)?,
        prop_conflict: row.get(19)?,
        recorded_size: row.get(20)?,
        recorded_mtime: row.get(21)?,
        dav_cache: row.get(22)?,
    })
}

fn corrupt<'a, E: std::fmt::Display>(what: &'static str, path: &'a str) -> impl FnOnce(E) -> CommitError + 'a {
    move |e| CommitError::Corrupt(format!("{} of '{}': {}", what, path, e))
}

impl TryFrom<RawNode> for NodeRecord {
    type Error = CommitError;

    fn try_from(raw: RawNode) -> Result<Self> {
        let path = raw.local_relpath.as_str();
        let kind = raw.kind.parse::<NodeKind>().map_err(corrupt("kind", path))?;
        let schedule = Schedule::parse(&raw.schedule)?;
        let presence = Presence::parse(&raw.presence)?;
        let origin = match (raw.origin_relpath, raw.origin_rev) {
            (Some(repos_relpath), Some(rev)) => Some(CopyOrigin {
                repos_relpath,
                revision: rev as Revnum,
            }),
            _ => None,
        };
        let checksum = raw
            .checksum
            .as_deref()
            .map(ContentId::from_hex)
            .transpose()
            .map_err(corrupt("checksum", path))?;
        let md5 = raw
            .md5
            .as_deref()
            .map(Md5Digest::from_hex)
            .transpose()
            .map_err(corrupt("md5", path))?;
        let pristine_props = serde_json::from_str(&raw.pristine_props)?;
        let actual_props = raw
            .actual_props
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let dav_cache = raw
            .dav_cache
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(NodeRecord {
            local_relpath: raw.local_relpath,
            kind,
            schedule,
            presence,
            repos_relpath: raw.repos_relpath,
            revision: raw.revision.map(|r| r as Revnum),
            changed_rev: raw.changed_rev.map(|r| r as Revnum),
            changed_date: raw.changed_date,
            changed_author: raw.changed_author,
            origin,
            op_root: raw.op_root,
            checksum,
            md5,
            pristine_props,
            actual_props,
            lock_token: raw.lock_token,
            changelist: raw.changelist,
            text_conflict: raw.text_conflict,
            prop_conflict: raw.prop_conflict,
            recorded_size: raw.recorded_size.map(|s| s as u64),
            recorded_mtime: raw.recorded_mtime,
            dav_cache,
        })
    }
}

fn props_json(props: &PropertySet) -> Result<String> {
    Ok(serde_json::to_string(props)?)
}

fn open_wc_db(admin_dir: &Path) -> Result<Connection> {
    let db_path = admin_dir.join(WC_DB_FILE);
    let conn = Connection::open(&db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS wcroot_info (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            repos_root_url TEXT NOT NULL,
            repos_uuid TEXT NOT NULL,
            format INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS nodes (
            local_relpath TEXT PRIMARY KEY,
            parent_relpath TEXT,
            kind TEXT NOT NULL,
            schedule TEXT NOT NULL,
            presence TEXT NOT NULL,
            repos_relpath TEXT NOT NULL,
            revision INTEGER,
            changed_rev INTEGER,
            changed_date INTEGER,
            changed_author TEXT,
            origin_relpath TEXT,
            origin_rev INTEGER,
            op_root INTEGER NOT NULL DEFAULT 0,
            checksum TEXT,
            md5 TEXT,
            pristine_props TEXT NOT NULL DEFAULT '{}',
            actual_props TEXT,
            lock_token TEXT,
            changelist TEXT,
            text_conflict INTEGER NOT NULL DEFAULT 0,
            prop_conflict INTEGER NOT NULL DEFAULT 0,
            recorded_size INTEGER,
            recorded_mtime INTEGER,
            dav_cache TEXT
        ) WITHOUT ROWID;
        CREATE INDEX IF NOT EXISTS nodes_parent ON nodes (parent_relpath);
        CREATE TABLE IF NOT EXISTS tree_conflicts (
            local_relpath TEXT PRIMARY KEY,
            description TEXT NOT NULL
        ) WITHOUT ROWID;
        CREATE TABLE IF NOT EXISTS pristine (
            checksum TEXT PRIMARY KEY,
            md5 TEXT NOT NULL,
            size INTEGER NOT NULL
        ) WITHOUT ROWID;
        CREATE TABLE IF NOT EXISTS wc_lock (
            id INTEGER PRIMARY KEY CHECK (id = 0),
            token TEXT NOT NULL,
            pid INTEGER NOT NULL,
            acquired_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS work_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            work BLOB NOT NULL
        );",
    )?;
    Ok(conn)
}

fn parent_of(relpath: &str) -> Option<&str> {
    if relpath.is_empty() {
        None
    } else {
        Some(dirname(relpath))
    }
}

pub(crate) fn conn_read_node(conn: &Connection, relpath: &str) -> Result<Option<NodeRecord>> {
    let sql = format!("SELECT {} FROM nodes WHERE local_relpath = ?1", NODE_COLUMNS);
    let raw = conn
        .prepare_cached(&sql)?
        .query_row(rusqlite::params![relpath], raw_from_row)
        .optional()?;
    raw.map(NodeRecord::try_from).transpose()
}

fn conn_query_nodes(conn: &Connection, sql: &str, arg: &str) -> Result<Vec<NodeRecord>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let raws = stmt
        .query_map(rusqlite::params![arg], raw_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raws.into_iter().map(NodeRecord::try_from).collect()
}

pub(crate) fn conn_read_children(conn: &Connection, relpath: &str) -> Result<Vec<NodeRecord>> {
    let sql = format!(
        "SELECT {} FROM nodes WHERE parent_relpath = ?1 ORDER BY local_relpath",
        NODE_COLUMNS
    );
    conn_query_nodes(conn, &sql, relpath)
}

pub(crate) fn conn_read_descendants(conn: &Connection, relpath: &str) -> Result<Vec<NodeRecord>> {
    if relpath.is_empty() {
        let sql = format!(
            "SELECT {} FROM nodes WHERE local_relpath != ?1 ORDER BY local_relpath",
            NODE_COLUMNS
        );
        return conn_query_nodes(conn, &sql, relpath);
    }
    let sql = format!(
        "SELECT {} FROM nodes WHERE substr(local_relpath, 1, length(?1) + 1) = ?1 || '/' \
         ORDER BY local_relpath",
        NODE_COLUMNS
    );
    conn_query_nodes(conn, &sql, relpath)
}

fn conn_write_node(conn: &Connection, node: &NodeRecord) -> Result<()> {
    let pristine_props = props_json(&node.pristine_props)?;
    let actual_props = node.actual_props.as_ref().map(props_json).transpose()?;
    let dav_cache = node.dav_cache.as_ref().map(props_json).transpose()?;
    conn.execute(
        "INSERT OR REPLACE INTO nodes (local_relpath, parent_relpath, kind, schedule, presence, \
         repos_relpath, revision, changed_rev, changed_date, changed_author, origin_relpath, \
         origin_rev, op_root, checksum, md5, pristine_props, actual_props, lock_token, changelist, \
         text_conflict, prop_conflict, recorded_size, recorded_mtime, dav_cache) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, \
         ?19, ?20, ?21, ?22, ?23, ?24)",
        rusqlite::params![
            node.local_relpath,
            parent_of(&node.local_relpath),
            node.kind.as_str(),
            node.schedule.as_str(),
            node.presence.as_str(),
            node.repos_relpath,
            node.revision.map(|r| r as i64),
            node.changed_rev.map(|r| r as i64),
            node.changed_date,
            node.changed_author,
            node.origin.as_ref().map(|o| o.repos_relpath.as_str()),
            node.origin.as_ref().map(|o| o.revision as i64),
            node.op_root,
            node.checksum.map(|c| c.to_hex()),
            node.md5.map(|m| m.to_hex()),
            pristine_props,
            actual_props,
            node.lock_token,
            node.changelist,
            node.text_conflict,
            node.prop_conflict,
            node.recorded_size.map(|s| s as i64),
            node.recorded_mtime,
            dav_cache,
        ],
    )?;
    Ok(())
}

fn conn_delete_subtree(conn: &Connection, relpath: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM nodes WHERE local_relpath = ?1 \
         OR substr(local_relpath, 1, length(?1) + 1) = ?1 || '/'",
        rusqlite::params![relpath],
    )?;
    Ok(())
}

/// Apply the post-commit state of one node. A missing row is not an error:
/// the item may already have been removed by a later queue entry.
pub(crate) fn conn_commit_node(conn: &Connection, committed: &CommittedNode) -> Result<()> {
    let Some(mut node) = conn_read_node(conn, &committed.local_relpath)? else {
        return Ok(());
    };

    node.schedule = Schedule::Normal;
    node.presence = Presence::Normal;
    node.revision = Some(committed.revision);
    node.changed_rev = Some(committed.changed_rev);
    node.changed_date = committed.changed_date;
    node.changed_author = committed.changed_author.clone();
    node.origin = None;
    node.op_root = false;
    if let Some(sums) = committed.checksums {
        node.checksum = Some(sums.sha256);
        node.md5 = Some(sums.md5);
    }
    if committed.props_committed {
        if let Some(actual) = node.actual_props.take() {
            node.pristine_props = actual;
        }
    }
    if committed.unlock {
        node.lock_token = None;
    }
    if !committed.keep_changelist {
        node.changelist = None;
    }
    if committed.dav_cache.is_some() {
        node.dav_cache = committed.dav_cache.clone();
    }
    match committed.fileinfo {
        Some((size, mtime)) => {
            node.recorded_size = Some(size);
            node.recorded_mtime = Some(mtime);
        }
        None if committed.checksums.is_some() => {
            node.recorded_size = None;
            node.recorded_mtime = None;
        }
        None => {}
    }
    conn_write_node(conn, &node)
}

/// Remove a committed deletion. With `not_present`, a marker row records
/// that the node is gone as of that revision.
pub(crate) fn conn_remove_node(
    conn: &Connection,
    relpath: &str,
    not_present: Option<(NodeKind, String, Revnum)>,
) -> Result<()> {
    conn_delete_subtree(conn, relpath)?;
    conn.execute(
        "DELETE FROM tree_conflicts WHERE local_relpath = ?1",
        rusqlite::params![relpath],
    )?;
    if let Some((kind, repos_relpath, revision)) = not_present {
        conn_write_node(
            conn,
            &NodeRecord {
                local_relpath: relpath.to_string(),
                kind,
                schedule: Schedule::Normal,
                presence: Presence::NotPresent,
                repos_relpath,
                revision: Some(revision),
                changed_rev: None,
                changed_date: None,
                changed_author: None,
                origin: None,
                op_root: false,
                checksum: None,
                md5: None,
                pristine_props: PropertySet::new(),
                actual_props: None,
                lock_token: None,
                changelist: None,
                text_conflict: false,
                prop_conflict: false,
                recorded_size: None,
                recorded_mtime: None,
                dav_cache: None,
            },
        )?;
    }
    Ok(())
}

/// SQLite-backed metadata store of one working copy
pub struct WcDb {
    conn: Mutex<Connection>,
}

impl WcDb {
    /// Open (creating if needed) the database in `admin_dir`.
    pub fn open(admin_dir: &Path) -> Result<Self> {
        let conn = open_wc_db(admin_dir)?;
        tracing::debug!("Opened working copy database in {:?}", admin_dir);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` inside one immediate transaction; commits only on success.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // ==================== Root ====================

    pub fn set_root_info(&self, repos_root_url: &str, repos_uuid: &str) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO wcroot_info (id, repos_root_url, repos_uuid, format) \
             VALUES (0, ?1, ?2, ?3)",
            rusqlite::params![repos_root_url, repos_uuid, SCHEMA_FORMAT],
        )?;
        Ok(())
    }

    /// Repository root URL and UUID
    pub fn root_info(&self) -> Result<(String, String)> {
        self.conn()
            .query_row(
                "SELECT repos_root_url, repos_uuid FROM wcroot_info WHERE id = 0",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| CommitError::Corrupt("missing working copy root record".into()))
    }

    // ==================== Reads ====================

    pub fn read_node(&self, relpath: &str) -> Result<Option<NodeRecord>> {
        conn_read_node(&self.conn(), relpath)
    }

    /// Direct children, ordered by path
    pub fn read_children(&self, relpath: &str) -> Result<Vec<NodeRecord>> {
        conn_read_children(&self.conn(), relpath)
    }

    /// All strict descendants, ordered by path
    pub fn read_descendants(&self, relpath: &str) -> Result<Vec<NodeRecord>> {
        conn_read_descendants(&self.conn(), relpath)
    }

    pub fn tree_conflict(&self, relpath: &str) -> Result<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT description FROM tree_conflicts WHERE local_relpath = ?1",
                rusqlite::params![relpath],
                |r| r.get(0),
            )
            .optional()?)
    }

    // ==================== Local changes ====================

    pub fn insert_base_node(&self, base: BaseNode) -> Result<()> {
        let (checksum, md5) = match base.checksums {
            Some(sums) => (Some(sums.sha256), Some(sums.md5)),
            None => (None, None),
        };
        let node = NodeRecord {
            local_relpath: base.local_relpath,
            kind: base.kind,
            schedule: Schedule::Normal,
            presence: Presence::Normal,
            repos_relpath: base.repos_relpath,
            revision: Some(base.revision),
            changed_rev: Some(base.changed_rev),
            changed_date: base.changed_date,
            changed_author: base.changed_author,
            origin: None,
            op_root: false,
            checksum,
            md5,
            pristine_props: base.props,
            actual_props: None,
            lock_token: None,
            changelist: None,
            text_conflict: false,
            prop_conflict: false,
            recorded_size: None,
            recorded_mtime: None,
            dav_cache: None,
        };
        conn_write_node(&self.conn(), &node)
    }

    /// Schedule `relpath` for addition. Adding over a scheduled deletion
    /// turns it into a replacement.
    pub fn op_add(&self, relpath: &str, kind: NodeKind, props: PropertySet) -> Result<()> {
        self.with_transaction(|conn| {
            let parent = checked_parent(conn, relpath)?;
            let existing = conn_read_node(conn, relpath)?;
            let (schedule, revision) = match &existing {
                Some(node) if node.is_present() && node.schedule != Schedule::Delete => {
                    return Err(CommitError::InvalidOperation(format!(
                        "'{}' is already under version control",
                        relpath
                    )));
                }
                Some(node) if node.is_present() && parent.schedule == Schedule::Normal => {
                    (Schedule::Replace, node.revision)
                }
                _ => (Schedule::Add, None),
            };
            if existing.as_ref().is_some_and(|n| !n.is_present() || schedule == Schedule::Add) {
                conn_delete_subtree(conn, relpath)?;
            }

            let node = NodeRecord {
                local_relpath: relpath.to_string(),
                kind,
                schedule,
                presence: Presence::Normal,
                repos_relpath: join(&parent.repos_relpath, basename(relpath)),
                revision,
                changed_rev: None,
                changed_date: None,
                changed_author: None,
                origin: None,
                op_root: false,
                checksum: None,
                md5: None,
                pristine_props: PropertySet::new(),
                actual_props: if props.is_empty() { None } else { Some(props) },
                lock_token: existing.as_ref().and_then(|n| n.lock_token.clone()),
                changelist: None,
                text_conflict: false,
                prop_conflict: false,
                recorded_size: None,
                recorded_mtime: None,
                dav_cache: None,
            };
            conn_write_node(conn, &node)
        })
    }

    /// Schedule `relpath` and its subtree for deletion. Uncommitted additions
    /// below it disappear.
    pub fn op_delete(&self, relpath: &str) -> Result<()> {
        self.with_transaction(|conn| {
            let root = conn_read_node(conn, relpath)?
                .filter(NodeRecord::is_present)
                .ok_or_else(|| CommitError::NotVersioned(relpath.to_string()))?;
            if relpath.is_empty() {
                return Err(CommitError::InvalidOperation(
                    "cannot delete the working copy root".into(),
                ));
            }

            let mut nodes = vec![root];
            nodes.extend(conn_read_descendants(conn, relpath)?);

            let mut removed: Vec<String> = Vec::new();
            for mut node in nodes {
                if removed.iter().any(|r| is_ancestor(r, &node.local_relpath)) {
                    continue;
                }
                match node.schedule {
                    Schedule::Add if node.origin.is_none() || node.op_root => {
                        conn_delete_subtree(conn, &node.local_relpath)?;
                        removed.push(node.local_relpath.clone());
                        continue;
                    }
                    Schedule::Add | Schedule::Normal => {}
                    Schedule::Replace => {
                        node.origin = None;
                        node.op_root = false;
                        node.checksum = None;
                        node.md5 = None;
                        node.pristine_props = PropertySet::new();
                    }
                    Schedule::Delete => continue,
                }
                if !node.is_present() {
                    continue;
                }
                node.schedule = Schedule::Delete;
                node.actual_props = None;
                conn_write_node(conn, &node)?;
            }
            Ok(())
        })
    }

    /// Copy the versioned subtree at `src` to `dst`, scheduled for addition
    /// with history. Copying over a scheduled deletion replaces it.
    pub fn op_copy(&self, src: &str, dst: &str) -> Result<()> {
        self.with_transaction(|conn| {
            let src_root = conn_read_node(conn, src)?
                .filter(|n| n.is_present() && n.schedule != Schedule::Delete)
                .ok_or_else(|| CommitError::NotVersioned(src.to_string()))?;
            let parent = checked_parent(conn, dst)?;
            let existing = conn_read_node(conn, dst)?;
            let replaced_revision = match &existing {
                Some(node) if node.is_present() && node.schedule != Schedule::Delete => {
                    return Err(CommitError::InvalidOperation(format!(
                        "'{}' is already under version control",
                        dst
                    )));
                }
                Some(node) if node.is_present() && parent.schedule == Schedule::Normal => {
                    node.revision
                }
                _ => None,
            };
            if existing.is_some() {
                conn_delete_subtree(conn, dst)?;
            }

            let dst_repos = join(&parent.repos_relpath, basename(dst));
            let mut nodes = vec![src_root];
            nodes.extend(conn_read_descendants(conn, src)?);

            for node in nodes {
                if !node.is_present() {
                    continue;
                }
                let suffix = skip_ancestor(src, &node.local_relpath).unwrap_or_default();
                let is_root = suffix.is_empty();
                let origin = match (&node.origin, node.revision) {
                    (Some(origin), _) => Some(origin.clone()),
                    (None, Some(rev)) => Some(CopyOrigin {
                        repos_relpath: node.repos_relpath.clone(),
                        revision: rev,
                    }),
                    (None, None) => None,
                };
                let schedule = match node.schedule {
                    Schedule::Delete => Schedule::Delete,
                    _ if is_root && replaced_revision.is_some() => Schedule::Replace,
                    _ => Schedule::Add,
                };
                let copied = NodeRecord {
                    local_relpath: join(dst, suffix),
                    kind: node.kind,
                    schedule,
                    presence: Presence::Normal,
                    repos_relpath: join(&dst_repos, suffix),
                    revision: if is_root { replaced_revision } else { None },
                    changed_rev: node.changed_rev,
                    changed_date: node.changed_date,
                    changed_author: node.changed_author.clone(),
                    origin,
                    op_root: is_root,
                    checksum: node.checksum,
                    md5: node.md5,
                    pristine_props: node.pristine_props.clone(),
                    actual_props: node.actual_props.clone(),
                    lock_token: None,
                    changelist: None,
                    text_conflict: false,
                    prop_conflict: false,
                    recorded_size: None,
                    recorded_mtime: None,
                    dav_cache: None,
                };
                conn_write_node(conn, &copied)?;
            }
            Ok(())
        })
    }

    /// Replace the working properties of `relpath`
    pub fn op_set_props(&self, relpath: &str, props: PropertySet) -> Result<()> {
        self.update_node(relpath, |node| {
            node.actual_props = if props == node.pristine_props {
                None
            } else {
                Some(props)
            };
        })
    }

    pub fn op_set_changelist(&self, relpath: &str, changelist: Option<&str>) -> Result<()> {
        self.update_node(relpath, |node| node.changelist = changelist.map(str::to_string))
    }

    pub fn set_lock_token(&self, relpath: &str, token: Option<&str>) -> Result<()> {
        self.update_node(relpath, |node| node.lock_token = token.map(str::to_string))
    }

    pub fn set_conflicted(&self, relpath: &str, text: bool, props: bool) -> Result<()> {
        self.update_node(relpath, |node| {
            node.text_conflict = text;
            node.prop_conflict = props;
        })
    }

    /// Record the size and mtime the working file had when it last matched
    /// its pristine text
    pub fn record_fileinfo(&self, relpath: &str, size: u64, mtime: i64) -> Result<()> {
        self.update_node(relpath, |node| {
            node.recorded_size = Some(size);
            node.recorded_mtime = Some(mtime);
        })
    }

    pub fn set_tree_conflict(&self, relpath: &str, description: Option<&str>) -> Result<()> {
        let conn = self.conn();
        match description {
            Some(desc) => conn.execute(
                "INSERT OR REPLACE INTO tree_conflicts (local_relpath, description) VALUES (?1, ?2)",
                rusqlite::params![relpath, desc],
            )?,
            None => conn.execute(
                "DELETE FROM tree_conflicts WHERE local_relpath = ?1",
                rusqlite::params![relpath],
            )?,
        };
        Ok(())
    }

    fn update_node<F>(&self, relpath: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut NodeRecord),
    {
        self.with_transaction(|conn| {
            let mut node = conn_read_node(conn, relpath)?
                .filter(NodeRecord::is_present)
                .ok_or_else(|| CommitError::NotVersioned(relpath.to_string()))?;
            f(&mut node);
            conn_write_node(conn, &node)
        })
    }

    // ==================== Pristine index ====================

    pub fn insert_pristine(&self, sums: &ChecksumPair, size: u64) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO pristine (checksum, md5, size) VALUES (?1, ?2, ?3)",
            rusqlite::params![sums.sha256.to_hex(), sums.md5.to_hex(), size as i64],
        )?;
        Ok(())
    }

    /// MD5 recorded for a pristine text
    pub fn pristine_md5(&self, checksum: &ContentId) -> Result<Option<Md5Digest>> {
        let hex: Option<String> = self
            .conn()
            .query_row(
                "SELECT md5 FROM pristine WHERE checksum = ?1",
                rusqlite::params![checksum.to_hex()],
                |r| r.get(0),
            )
            .optional()?;
        hex.as_deref()
            .map(Md5Digest::from_hex)
            .transpose()
            .map_err(|e| CommitError::Corrupt(format!("pristine md5 of {}: {}", checksum, e)))
    }

    // ==================== Write lock ====================

    /// Take the write lock. Returns false if someone else holds it.
    pub fn try_lock(&self, token: &str) -> Result<bool> {
        self.with_transaction(|conn| {
            let held: Option<String> = conn
                .query_row("SELECT token FROM wc_lock WHERE id = 0", [], |r| r.get(0))
                .optional()?;
            if held.is_some() {
                return Ok(false);
            }
            conn.execute(
                "INSERT INTO wc_lock (id, token, pid, acquired_at) VALUES (0, ?1, ?2, ?3)",
                rusqlite::params![
                    token,
                    std::process::id() as i64,
                    chrono::Utc::now().timestamp()
                ],
            )?;
            Ok(true)
        })
    }

    /// Release the lock if `token` holds it
    pub fn unlock(&self, token: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM wc_lock WHERE id = 0 AND token = ?1",
            rusqlite::params![token],
        )?;
        Ok(())
    }

    /// Drop the lock whoever holds it; returns whether one was held
    pub fn break_lock(&self) -> Result<bool> {
        let n = self.conn().execute("DELETE FROM wc_lock", [])?;
        Ok(n > 0)
    }

    pub fn lock_holder(&self) -> Result<Option<String>> {
        Ok(self
            .conn()
            .query_row("SELECT token FROM wc_lock WHERE id = 0", [], |r| r.get(0))
            .optional()?)
    }

    // ==================== Work queue ====================

    /// Append serialized work items in one transaction
    pub fn wq_add(&self, items: &[Vec<u8>]) -> Result<()> {
        self.with_transaction(|conn| {
            let mut stmt = conn.prepare_cached("INSERT INTO work_queue (work) VALUES (?1)")?;
            for work in items {
                stmt.execute(rusqlite::params![work])?;
            }
            Ok(())
        })
    }

    /// Oldest queued item
    pub fn wq_next(&self) -> Result<Option<(i64, Vec<u8>)>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, work FROM work_queue ORDER BY id LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?)
    }

    /// Run `f` and delete queue entry `id` in the same transaction
    pub fn wq_complete<F>(&self, id: i64, f: F) -> Result<()>
    where
        F: FnOnce(&Connection) -> Result<()>,
    {
        self.with_transaction(|conn| {
            f(conn)?;
            conn.execute("DELETE FROM work_queue WHERE id = ?1", rusqlite::params![id])?;
            Ok(())
        })
    }

    pub fn wq_len(&self) -> Result<usize> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM work_queue", [], |r| r.get(0))?;
        Ok(n as usize)
    }
}

fn checked_parent(conn: &Connection, relpath: &str) -> Result<NodeRecord> {
    let parent_path = parent_of(relpath).ok_or_else(|| {
        CommitError::InvalidOperation("the working copy root already exists".into())
    })?;
    let parent = conn_read_node(conn, parent_path)?
        .filter(|n| n.is_present() && n.schedule != Schedule::Delete)
        .ok_or_else(|| CommitError::NotVersioned(parent_path.to_string()))?;
    if parent.kind != NodeKind::Dir {
        return Err(CommitError::InvalidOperation(format!(
            "'{}' is not a directory",
            parent_path
        )));
    }
    Ok(parent)
}

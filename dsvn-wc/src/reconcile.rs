//! Post-commit reconciliation
//!
//! After the repository accepted a commit, every committed node is brought
//! to the new revision. The whole update is first written to the work queue
//! and only then executed, so a crash part way through leaves work that
//! `cleanup` can finish.

use crate::cancel::CancelToken;
use crate::driver::TransmittedTexts;
use crate::editor::CommitInfo;
use crate::error::Result;
use crate::packet::{CommitPacket, StateFlags};
use crate::wc_db::{CommittedNode, NodeRecord, Schedule};
use crate::work_queue::{self, WorkItem};
use crate::working_copy::{WorkingCopy, fileinfo};
use dsvn_core::path::{compare_paths, dirname, is_strict_ancestor};
use dsvn_core::{ChecksumPair, NodeKind, PropertySet, Revnum};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// Post-commit state of one committed node
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub local_relpath: String,
    pub kind: NodeKind,
    /// Also update the node's descendants
    pub recurse: bool,
    /// Deleted and not added back
    pub deleted: bool,
    pub revision: Revnum,
    pub changed_rev: Revnum,
    /// Microseconds since the epoch
    pub changed_date: Option<i64>,
    pub changed_author: Option<String>,
    pub checksums: Option<ChecksumPair>,
    pub dav_cache: Option<PropertySet>,
    pub unlock: bool,
    pub keep_changelist: bool,
    /// The item's property changes were sent
    pub props_committed: bool,
}

/// Counts of what [`reconcile`] did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub committed: usize,
    pub removed: usize,
    pub executed: usize,
}

/// One queue item per packet item
pub fn build_queue(
    packet: &CommitPacket,
    info: &CommitInfo,
    texts: &TransmittedTexts,
    keep_locks: bool,
    keep_changelists: bool,
) -> Vec<QueueItem> {
    let date = Some(info.date.timestamp_micros());
    packet
        .items()
        .iter()
        .map(|item| QueueItem {
            local_relpath: item.local_relpath.clone(),
            kind: item.kind,
            recurse: item.kind == NodeKind::Dir
                && item.is_add()
                && (item.is_copy() || item.is_delete()),
            deleted: item.is_delete() && !item.is_add(),
            revision: info.revision,
            changed_rev: info.revision,
            changed_date: date,
            changed_author: info.author.clone(),
            checksums: texts.get(&item.local_relpath).copied(),
            dav_cache: info.dav_cache.get(&item.repos_relpath).cloned(),
            unlock: !keep_locks && item.flags.contains(StateFlags::LOCK_TOKEN),
            keep_changelist: keep_changelists,
            props_committed: item.has_prop_mods() || (item.is_add() && !item.is_copy()),
        })
        .collect()
}

/// Sort the queue by path and split off the items covered by a recursing
/// ancestor. Returns the items to process and the covered ones by path.
pub fn apply_skip_law(mut queue: Vec<QueueItem>) -> (Vec<QueueItem>, HashMap<String, QueueItem>) {
    queue.sort_by(|a, b| compare_paths(&a.local_relpath, &b.local_relpath));
    let mut kept: Vec<QueueItem> = Vec::with_capacity(queue.len());
    let mut covered = HashMap::new();
    let mut recursing: Vec<String> = Vec::new();
    for item in queue {
        if recursing
            .iter()
            .any(|root| is_strict_ancestor(root, &item.local_relpath))
        {
            covered.insert(item.local_relpath.clone(), item);
            continue;
        }
        if item.recurse {
            recursing.push(item.local_relpath.clone());
        }
        kept.push(item);
    }
    (kept, covered)
}

fn committed_node(q: &QueueItem, wc: &WorkingCopy) -> CommittedNode {
    let fileinfo = match (q.kind, q.checksums) {
        (NodeKind::File, Some(_)) => fileinfo(&wc.abspath(&q.local_relpath)).ok(),
        _ => None,
    };
    CommittedNode {
        local_relpath: q.local_relpath.clone(),
        revision: q.revision,
        changed_rev: q.changed_rev,
        changed_date: q.changed_date,
        changed_author: q.changed_author.clone(),
        checksums: q.checksums,
        dav_cache: q.dav_cache.clone(),
        unlock: q.unlock,
        keep_changelist: q.keep_changelist,
        props_committed: q.props_committed,
        fileinfo,
    }
}

struct Plan<'a> {
    wc: &'a WorkingCopy,
    updates: Vec<WorkItem>,
    removals: Vec<WorkItem>,
}

impl Plan<'_> {
    fn remove(&mut self, local_relpath: &str, not_present: Option<(NodeKind, String, Revnum)>) {
        self.removals.push(WorkItem::RemoveNode {
            local_relpath: local_relpath.to_string(),
            not_present,
        });
    }

    /// Update the descendants of a recursing item. A copied descendant is
    /// carried when the op-root of its copy went to the repository, either
    /// as `root` itself or as a committed nested copy.
    fn walk_children(
        &mut self,
        root: &NodeRecord,
        q: &QueueItem,
        covered: &HashMap<String, QueueItem>,
        texts: &TransmittedTexts,
    ) -> Result<()> {
        let descendants = self.wc.db().read_descendants(&root.local_relpath)?;
        let op_roots: HashSet<&str> = descendants
            .iter()
            .filter(|d| d.is_present() && d.op_root)
            .map(|d| d.local_relpath.as_str())
            .collect();
        for child in &descendants {
            if !child.is_present() {
                continue;
            }
            let explicit = covered.get(&child.local_relpath);
            let carried = child.origin.is_some() && !child.op_root && {
                let op_root = nearest_op_root(&child.local_relpath, &root.local_relpath, &op_roots);
                op_root == root.local_relpath
                    || covered.get(op_root).is_some_and(|c| c.recurse && !c.deleted)
            };
            match child.schedule {
                Schedule::Delete => {
                    if child.origin.is_none() || explicit.is_some() {
                        self.remove(&child.local_relpath, None);
                    }
                    continue;
                }
                Schedule::Add | Schedule::Replace if !carried && explicit.is_none() => continue,
                _ => {}
            }

            let checksums = texts.get(&child.local_relpath).copied();
            let mut update = explicit.cloned().unwrap_or_else(|| QueueItem {
                local_relpath: child.local_relpath.clone(),
                kind: child.kind,
                recurse: false,
                deleted: false,
                checksums,
                dav_cache: None,
                unlock: false,
                props_committed: false,
                ..q.clone()
            });
            update.checksums = update.checksums.or(checksums);
            let modified = update.checksums.is_some() || update.props_committed;
            if child.kind == NodeKind::File && explicit.is_none() && !modified {
                update.changed_rev = child.changed_rev.unwrap_or(q.changed_rev);
                update.changed_date = child.changed_date;
                update.changed_author = child.changed_author.clone();
            }
            self.updates
                .push(WorkItem::PostCommit(committed_node(&update, self.wc)));
        }
        Ok(())
    }
}

/// Closest strict ancestor of `path` below `root` that is a copy op-root,
/// or `root` when there is none
fn nearest_op_root<'p>(path: &'p str, root: &'p str, op_roots: &HashSet<&str>) -> &'p str {
    let mut parent = dirname(path);
    while parent != root && !parent.is_empty() && !op_roots.contains(parent) {
        parent = dirname(parent);
    }
    if op_roots.contains(parent) { parent } else { root }
}

/// Bring the working copy in line with a successful commit.
///
/// Deletions are applied after all revision bumps. Temporary files of the
/// commit are removed as the last queued step.
pub fn reconcile(
    wc: &WorkingCopy,
    queue: Vec<QueueItem>,
    texts: &TransmittedTexts,
    temp_files: &[PathBuf],
    cancel: &CancelToken,
) -> Result<ReconcileReport> {
    let db = wc.db();
    let (queue, covered) = apply_skip_law(queue);
    let queued: HashSet<&str> = queue.iter().map(|q| q.local_relpath.as_str()).collect();
    let mut plan = Plan {
        wc,
        updates: Vec::new(),
        removals: Vec::new(),
    };

    for q in &queue {
        let Some(node) = db.read_node(&q.local_relpath)? else {
            tracing::debug!("'{}' vanished before reconciliation", q.local_relpath);
            continue;
        };
        if q.deleted {
            let parent_committed = queued.contains(dirname(&q.local_relpath));
            let not_present = if q.local_relpath.is_empty() || parent_committed {
                None
            } else {
                Some((node.kind, node.repos_relpath.clone(), q.revision))
            };
            plan.remove(&q.local_relpath, not_present);
            continue;
        }
        plan.updates
            .push(WorkItem::PostCommit(committed_node(q, wc)));
        if q.recurse {
            plan.walk_children(&node, q, &covered, texts)?;
        }
    }

    let report = ReconcileReport {
        committed: plan.updates.len(),
        removed: plan.removals.len(),
        executed: 0,
    };
    let mut work = plan.updates;
    work.extend(plan.removals);
    work.extend(
        temp_files
            .iter()
            .map(|path| WorkItem::RemoveTempFile { path: path.clone() }),
    );
    work_queue::enqueue(db, &work)?;
    tracing::debug!("Queued {} post-commit work items", work.len());

    let executed = work_queue::run(db, cancel)?;
    Ok(ReconcileReport { executed, ..report })
}

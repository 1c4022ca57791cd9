//! Crash-safe work queue
//!
//! Post-commit bookkeeping is written to the `work_queue` table as
//! serialized [`WorkItem`]s before any of it runs. Each item is executed and
//! deleted in a single transaction, so after a crash the queue holds exactly
//! the work that has not happened yet. Items carry absolute values, which
//! makes running one twice harmless.

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::wc_db::{CommittedNode, WcDb, conn_commit_node, conn_remove_node};
use dsvn_core::{NodeKind, Revnum};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;

/// One unit of deferred work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkItem {
    /// Bring a committed node up to its new revision
    PostCommit(CommittedNode),
    /// Forget a committed deletion, optionally leaving a not-present marker
    RemoveNode {
        local_relpath: String,
        not_present: Option<(NodeKind, String, Revnum)>,
    },
    /// Delete a temporary file
    RemoveTempFile { path: PathBuf },
}

impl WorkItem {
    fn execute(&self, conn: &Connection) -> Result<()> {
        match self {
            WorkItem::PostCommit(node) => conn_commit_node(conn, node),
            WorkItem::RemoveNode {
                local_relpath,
                not_present,
            } => conn_remove_node(conn, local_relpath, not_present.clone()),
            WorkItem::RemoveTempFile { path } => match fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }
}

/// Append items to the queue in one transaction
pub fn enqueue(db: &WcDb, items: &[WorkItem]) -> Result<()> {
    let encoded = items
        .iter()
        .map(|item| bincode::serialize(item))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    db.wq_add(&encoded)
}

/// Run queued items oldest first until the queue is empty. Cancellation is
/// checked before each item; whatever remains stays queued.
pub fn run(db: &WcDb, cancel: &CancelToken) -> Result<usize> {
    let mut executed = 0;
    loop {
        cancel.check()?;
        let Some((id, work)) = db.wq_next()? else {
            break;
        };
        let item: WorkItem = bincode::deserialize(&work)?;
        tracing::debug!("Running work item {}: {:?}", id, item);
        db.wq_complete(id, |conn| item.execute(conn))?;
        executed += 1;
    }
    Ok(executed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CommitError;
    use crate::wc_db::BaseNode;
    use dsvn_core::PropertySet;
    use tempfile::TempDir;

    fn setup() -> (TempDir, WcDb) {
        let tmp = TempDir::new().unwrap();
        let db = WcDb::open(tmp.path()).unwrap();
        for (path, kind) in [("", NodeKind::Dir), ("f", NodeKind::File), ("d", NodeKind::Dir)] {
            db.insert_base_node(BaseNode {
                local_relpath: path.into(),
                kind,
                repos_relpath: path.into(),
                revision: 1,
                changed_rev: 1,
                changed_date: None,
                changed_author: None,
                checksums: None,
                props: PropertySet::new(),
            })
            .unwrap();
        }
        (tmp, db)
    }

    fn post_commit(path: &str, rev: Revnum) -> WorkItem {
        WorkItem::PostCommit(CommittedNode {
            local_relpath: path.into(),
            revision: rev,
            changed_rev: rev,
            changed_date: Some(42),
            changed_author: Some("carol".into()),
            checksums: None,
            dav_cache: None,
            unlock: true,
            keep_changelist: false,
            props_committed: true,
            fileinfo: None,
        })
    }

    #[test]
    fn test_run_drains_queue() {
        let (tmp, db) = setup();
        let spool = tmp.path().join("spool.tmp");
        fs::write(&spool, b"x").unwrap();

        enqueue(
            &db,
            &[
                post_commit("f", 2),
                WorkItem::RemoveNode {
                    local_relpath: "d".into(),
                    not_present: None,
                },
                WorkItem::RemoveTempFile { path: spool.clone() },
            ],
        )
        .unwrap();
        assert_eq!(db.wq_len().unwrap(), 3);

        assert_eq!(run(&db, &CancelToken::new()).unwrap(), 3);
        assert_eq!(db.wq_len().unwrap(), 0);
        assert_eq!(db.read_node("f").unwrap().unwrap().revision, Some(2));
        assert!(db.read_node("d").unwrap().is_none());
        assert!(!spool.exists());
    }

    #[test]
    fn test_rerun_is_harmless() {
        let (_tmp, db) = setup();
        let items = [
            post_commit("f", 5),
            WorkItem::RemoveNode {
                local_relpath: "d".into(),
                not_present: Some((NodeKind::Dir, "d".into(), 5)),
            },
        ];
        enqueue(&db, &items).unwrap();
        run(&db, &CancelToken::new()).unwrap();
        let first = (db.read_node("f").unwrap(), db.read_node("d").unwrap());

        enqueue(&db, &items).unwrap();
        run(&db, &CancelToken::new()).unwrap();
        let second = (db.read_node("f").unwrap(), db.read_node("d").unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn test_cancel_leaves_work_queued() {
        let (_tmp, db) = setup();
        enqueue(&db, &[post_commit("f", 2)]).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(run(&db, &cancel), Err(CommitError::Cancelled)));
        assert_eq!(db.wq_len().unwrap(), 1);
        assert_eq!(run(&db, &CancelToken::new()).unwrap(), 1);
    }
}

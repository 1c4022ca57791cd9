//! Harvest, transmit and reconcile scenarios against an in-memory repository

mod common;

use common::*;
use dsvn_core::{ContentId, NodeKind, PropertySet};
use dsvn_wc::{
    CancelToken, CommitError, CommitOptions, HarvestOptions, StateFlags, WorkingCopy, harvest,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn harvest_all(wc: &WorkingCopy, targets: &[&str]) -> dsvn_wc::Result<dsvn_wc::CommitPacket> {
    let targets: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
    harvest(wc, &targets, &HarvestOptions::default(), &CancelToken::new())
}

#[tokio::test]
async fn test_single_added_file() {
    let (_tmp, repo, wc) = setup().await;
    write(&wc, "new.txt", b"hello\n");
    wc.add("new.txt", PropertySet::new()).unwrap();

    let mut packet = harvest_all(&wc, &["new.txt"]).unwrap();
    assert_eq!(packet.len(), 1);
    let item = &packet.items()[0];
    assert_eq!(item.local_relpath, "new.txt");
    assert_eq!(item.repos_relpath, "trunk/new.txt");
    assert_eq!(item.flags, StateFlags::ADD | StateFlags::TEXT_MODIFIED);
    assert_eq!(item.revision, None);
    assert!(packet.lock_tokens().is_empty());
    assert_eq!(packet.base_relpath(), "trunk");
    packet.dispose().unwrap();

    let recording = RecordingRepository::new(repo.clone());
    let outcome = commit_all(&wc, &recording).await.unwrap();
    assert_eq!(outcome.revision(), Some(2));
    assert_eq!(
        recording.calls(),
        vec![
            "open_root",
            "add_file new.txt",
            "close_directory ",
            "apply_textdelta new.txt",
            "close_file new.txt",
            "close_edit",
        ]
    );
    assert_eq!(repo.cat("trunk/new.txt", None).await.unwrap().as_ref(), b"hello\n");
    assert_unlocked(&wc);
}

#[tokio::test]
async fn test_deleted_dir_carries_descendant_locks() {
    let (_tmp, repo, wc) = setup().await;
    let token_x = repo.lock("trunk/D/x", "alice").await.unwrap();
    let token_y = repo.lock("trunk/D/y", "alice").await.unwrap();
    wc.db().set_lock_token("D/x", Some(&token_x)).unwrap();
    wc.db().set_lock_token("D/y", Some(&token_y)).unwrap();
    wc.delete("D").unwrap();

    let mut packet = harvest_all(&wc, &[]).unwrap();
    assert_eq!(packet.len(), 1);
    assert_eq!(packet.items()[0].local_relpath, "D");
    assert_eq!(packet.items()[0].flags, StateFlags::DELETE);
    assert!(packet.get_local("D/x").is_none());
    assert!(packet.get_local("D/y").is_none());
    assert_eq!(packet.lock_tokens().len(), 2);
    assert_eq!(packet.lock_tokens()["mem://repo/trunk/D/x"], token_x);
    assert_eq!(packet.lock_tokens()["mem://repo/trunk/D/y"], token_y);
    packet.dispose().unwrap();

    let outcome = commit_all(&wc, &repo).await.unwrap();
    assert_eq!(outcome.revision(), Some(2));
    assert_eq!(repo.kind("trunk/D", None).await, None);
    assert_eq!(repo.lock_owner("trunk/D/x").await, None);
    assert_eq!(repo.lock_owner("trunk/D/y").await, None);
}

#[tokio::test]
async fn test_delete_without_tokens_is_refused() {
    let (_tmp, repo, wc) = setup().await;
    repo.lock("trunk/D/x", "bob").await.unwrap();
    wc.delete("D").unwrap();

    let err = commit_all(&wc, &repo).await.unwrap_err();
    assert!(matches!(err, CommitError::CommitFailed(_)));
    assert_eq!(repo.head().await, 1);
    assert_eq!(repo.lock_owner("trunk/D/x").await.as_deref(), Some("bob"));
    assert_unlocked(&wc);
}

#[tokio::test]
async fn test_dangling_parent_names_both_paths() {
    let (_tmp, _repo, wc) = setup().await;
    wc.add("P", PropertySet::new()).unwrap();
    write(&wc, "P/f", b"f\n");
    wc.add("P/f", PropertySet::new()).unwrap();

    let err = harvest_all(&wc, &["P/f"]).unwrap_err();
    match err.root_cause() {
        CommitError::DanglingParent { path, parent } => {
            assert_eq!(path, "P/f");
            assert_eq!(parent, "P");
        }
        other => panic!("unexpected {:?}", other),
    }
    let message = err.to_string();
    assert!(message.contains("P/f"));
    assert_unlocked(&wc);

    // Committing the parent along with it is fine
    let mut packet = harvest_all(&wc, &["P", "P/f"]).unwrap();
    assert_eq!(packet.len(), 2);
    packet.dispose().unwrap();
}

#[tokio::test]
async fn test_modified_child_of_uncommitted_copy_is_dangling() {
    let (_tmp, repo, wc) = setup().await;
    wc.copy("D", "B").unwrap();
    write(&wc, "B/x", b"x in copy\n");

    let err = harvest_all(&wc, &["B/x"]).unwrap_err();
    match err.root_cause() {
        CommitError::DanglingParent { path, parent } => {
            assert_eq!(path, "B/x");
            assert_eq!(parent, "B");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_unlocked(&wc);

    // The commit fails before an editor is opened
    let recording = RecordingRepository::new(repo.clone());
    let opts = CommitOptions {
        targets: vec!["B/x".into()],
        ..Default::default()
    };
    let err = commit_with(&wc, &recording, &opts).await.unwrap_err();
    assert!(matches!(err.root_cause(), CommitError::DanglingParent { .. }));
    assert!(recording.calls().is_empty());
    assert_eq!(repo.head().await, 1);

    // A deletion inside the copy needs the copy as well
    wc.delete("B/y").unwrap();
    let err = harvest_all(&wc, &["B/y"]).unwrap_err();
    assert!(matches!(
        err.root_cause(),
        CommitError::DanglingParent { path, .. } if path == "B/y"
    ));

    let mut packet = harvest_all(&wc, &["B"]).unwrap();
    assert!(packet.get_local("B/x").is_some());
    packet.dispose().unwrap();
}

#[tokio::test]
async fn test_corrupt_base_leaves_pristine_store_alone() {
    let (_tmp, repo, wc) = setup().await;
    let node = wc.db().read_node("a.txt").unwrap().unwrap();
    let sha = node.checksum.unwrap();
    let hex = sha.to_hex();
    let pristine_file = wc.admin_dir().join("pristine").join(&hex[..2]).join(&hex[2..]);
    std::fs::write(&pristine_file, b"garbage\n").unwrap();

    let new_text = b"alpha\nbeta\n";
    write(&wc, "a.txt", new_text);
    let err = commit_all(&wc, &repo).await.unwrap_err();
    match err.root_cause() {
        CommitError::CorruptBase { path, .. } => assert_eq!(path, "a.txt"),
        other => panic!("unexpected {:?}", other),
    }

    assert!(!wc.pristine().contains(&ContentId::from_data(new_text)));
    assert!(pristine_dir_is_clean(wc.admin_dir()));
    assert_eq!(repo.head().await, 1);
    let after = wc.db().read_node("a.txt").unwrap().unwrap();
    assert_eq!(after.checksum, Some(sha));
    assert_eq!(after.revision, Some(1));
    assert_unlocked(&wc);
}

#[tokio::test]
async fn test_cancel_between_targets() {
    let (_tmp, _repo, wc) = setup().await;
    write(&wc, "a.txt", b"changed\n");
    write(&wc, "D/x", b"changed\n");

    let polls = Arc::new(AtomicUsize::new(0));
    let counter = polls.clone();
    let cancel = CancelToken::with_probe(move || counter.fetch_add(1, Ordering::SeqCst) >= 1);
    let targets = vec!["a.txt".to_string(), "D/x".to_string()];
    let err = harvest(&wc, &targets, &HarvestOptions::default(), &cancel).unwrap_err();

    assert!(matches!(err, CommitError::Cancelled));
    assert_eq!(polls.load(Ordering::SeqCst), 2);
    assert_unlocked(&wc);
    // The lock can be taken again
    wc.lock().unwrap().release().unwrap();
}

#[tokio::test]
async fn test_unversioned_target() {
    let (_tmp, _repo, wc) = setup().await;
    write(&wc, "stray.txt", b"?\n");
    let err = harvest_all(&wc, &["stray.txt"]).unwrap_err();
    assert!(matches!(err.root_cause(), CommitError::NotVersioned(p) if p == "stray.txt"));
    assert_unlocked(&wc);
}

#[tokio::test]
async fn test_conflicts_block_harvest() {
    let (_tmp, _repo, wc) = setup().await;
    write(&wc, "a.txt", b"mine\n");
    wc.db().set_conflicted("a.txt", true, false).unwrap();
    let err = harvest_all(&wc, &[]).unwrap_err();
    assert!(matches!(
        err.root_cause(),
        CommitError::Conflict { kind: dsvn_wc::ConflictKind::Text, .. }
    ));

    wc.db().set_conflicted("a.txt", false, false).unwrap();
    wc.db().set_tree_conflict("D", Some("incoming delete")).unwrap();
    let err = harvest_all(&wc, &["D/x"]).unwrap_err();
    assert!(matches!(
        err.root_cause(),
        CommitError::Conflict { kind: dsvn_wc::ConflictKind::Tree, .. }
    ));
    assert_unlocked(&wc);
}

#[tokio::test]
async fn test_keys_are_unique_and_deletes_carry_no_mods() {
    let (_tmp, _repo, wc) = setup().await;
    write(&wc, "a.txt", b"changed\n");
    wc.set_prop("a.txt", "color", Some("blue")).unwrap();
    wc.delete("D/x").unwrap();

    // Overlapping targets name the same nodes several times
    let mut packet = harvest_all(&wc, &["", "a.txt", "D", "D/x"]).unwrap();
    let mut keys: Vec<&str> = packet.items().iter().map(|i| i.repos_relpath.as_str()).collect();
    let total = keys.len();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), total);
    assert_eq!(total, 2);

    let deleted = packet.get_local("D/x").unwrap();
    assert_eq!(deleted.flags, StateFlags::DELETE);
    assert!(deleted.prop_changes.is_empty());
    assert_eq!(deleted.revision, Some(1));

    let modified = packet.get_local("a.txt").unwrap();
    assert_eq!(modified.flags, StateFlags::TEXT_MODIFIED | StateFlags::PROPS_MODIFIED);
    assert_eq!(modified.kind, NodeKind::File);
    assert_eq!(modified.prop_changes.len(), 1);
    packet.dispose().unwrap();
}

#[tokio::test]
async fn test_missing_added_file_is_an_error() {
    let (_tmp, _repo, wc) = setup().await;
    write(&wc, "gone.txt", b"soon gone\n");
    wc.add("gone.txt", PropertySet::new()).unwrap();
    std::fs::remove_file(wc.abspath("gone.txt")).unwrap();

    let err = harvest_all(&wc, &[]).unwrap_err();
    assert!(err.to_string().contains("gone.txt"));
    assert_unlocked(&wc);
}

#[tokio::test]
async fn test_changelist_filter() {
    let (_tmp, _repo, wc) = setup().await;
    write(&wc, "a.txt", b"changed\n");
    write(&wc, "D/x", b"changed\n");
    wc.db().op_set_changelist("D/x", Some("work")).unwrap();

    let opts = HarvestOptions {
        changelists: vec!["work".into()],
        ..Default::default()
    };
    let mut packet = harvest(&wc, &[], &opts, &CancelToken::new()).unwrap();
    assert_eq!(packet.len(), 1);
    assert!(packet.get_local("D/x").is_some());
    packet.dispose().unwrap();
}

#[tokio::test]
async fn test_depth_empty_on_directory() {
    let (_tmp, _repo, wc) = setup().await;
    write(&wc, "D/x", b"changed\n");
    wc.set_prop("D", "owner", Some("team")).unwrap();

    let opts = HarvestOptions {
        depth: dsvn_core::Depth::Empty,
        ..Default::default()
    };
    let mut packet = harvest(&wc, &["D".to_string()], &opts, &CancelToken::new()).unwrap();
    assert_eq!(packet.len(), 1);
    assert_eq!(packet.items()[0].flags, StateFlags::PROPS_MODIFIED);
    packet.dispose().unwrap();
}

#[tokio::test]
async fn test_just_locked_includes_unmodified_locked_files() {
    let (_tmp, repo, wc) = setup().await;
    let token = repo.lock("trunk/a.txt", "alice").await.unwrap();
    wc.db().set_lock_token("a.txt", Some(&token)).unwrap();

    let mut packet = harvest_all(&wc, &[]).unwrap();
    assert!(packet.is_empty());
    assert!(packet.lock_tokens().is_empty());
    packet.dispose().unwrap();

    let opts = HarvestOptions {
        just_locked: true,
        ..Default::default()
    };
    let mut packet = harvest(&wc, &[], &opts, &CancelToken::new()).unwrap();
    assert_eq!(packet.len(), 1);
    assert_eq!(packet.items()[0].flags, StateFlags::LOCK_TOKEN);
    packet.dispose().unwrap();
}

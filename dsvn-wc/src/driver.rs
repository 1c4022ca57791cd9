//! Driving a commit editor from a packet
//!
//! Items are visited in path order. The driver keeps the stack of open
//! directories, closing down to the next item's parent and opening the
//! directories in between, so every editor call is made inside its parent.
//! File texts are not sent during the tree walk: files needing content are
//! left open and receive their deltas once all directories are closed.

use crate::cancel::CancelToken;
use crate::editor::{CommitEditor, CommitInfo};
use crate::error::{CommitError, RaError, Result};
use crate::notify::{CommitEvent, NotifySink};
use crate::packet::{CommitItem, CommitPacket};
use crate::transmit::Transmitter;
use dsvn_core::path::{dirname, is_ancestor, join, skip_ancestor};
use dsvn_core::{ChecksumPair, NodeKind};
use std::collections::BTreeMap;

/// Checksums of the texts sent, by working-copy relpath
pub type TransmittedTexts = BTreeMap<String, ChecksumPair>;

/// Describe `packet` to `editor` and close the edit. On failure the edit
/// is aborted and the error is returned as [`CommitError::CommitFailed`].
pub async fn drive(
    packet: &CommitPacket,
    editor: &mut dyn CommitEditor,
    transmitter: &Transmitter<'_>,
    notify: &dyn NotifySink,
    cancel: &CancelToken,
) -> Result<(CommitInfo, TransmittedTexts)> {
    match drive_edit(packet, &mut *editor, transmitter, notify, cancel).await {
        Ok(done) => Ok(done),
        Err(e) => {
            tracing::debug!("Aborting edit: {}", e);
            if let Err(abort_err) = editor.abort_edit().await {
                tracing::warn!("Failed to abort edit: {}", abort_err);
            }
            Err(CommitError::CommitFailed(Box::new(e)))
        }
    }
}

/// Map the repository's complaint about a stale node to an out-of-date error
fn out_of_date(item: &CommitItem) -> impl FnOnce(RaError) -> CommitError + '_ {
    move |err| match err {
        RaError::NotFound(_) | RaError::OutOfDate(_) | RaError::AlreadyExists(_) => {
            CommitError::OutOfDate {
                path: item.local_relpath.clone(),
                kind: item.kind,
            }
        }
        other => CommitError::Ra(other).at_path(&item.local_relpath),
    }
}

fn notify_item(notify: &dyn NotifySink, item: &CommitItem) {
    let path = item.local_relpath.clone();
    let event = if item.is_replace() {
        CommitEvent::Replaced {
            path,
            kind: item.kind,
        }
    } else if item.is_add() {
        CommitEvent::Added {
            path,
            kind: item.kind,
            copied: item.is_copy(),
        }
    } else if item.is_delete() {
        CommitEvent::Deleted { path }
    } else if item.has_text_mods() || item.has_prop_mods() {
        CommitEvent::Modified {
            path,
            text: item.has_text_mods(),
            props: item.has_prop_mods(),
        }
    } else {
        return;
    };
    notify.notify(&event);
}

async fn drive_edit<'p>(
    packet: &'p CommitPacket,
    editor: &mut dyn CommitEditor,
    transmitter: &Transmitter<'_>,
    notify: &dyn NotifySink,
    cancel: &CancelToken,
) -> Result<(CommitInfo, TransmittedTexts)> {
    editor.open_root(None).await?;
    let mut open_dirs: Vec<String> = vec![String::new()];
    let mut deferred: Vec<(&'p CommitItem, &'p str)> = Vec::new();

    for item in packet.sorted_items() {
        cancel.check()?;
        let path = packet.editor_path(&item.repos_relpath)?;
        let parent = dirname(path);

        while let Some(top) = open_dirs.last() {
            if is_ancestor(top, parent) {
                break;
            }
            if let Some(dir) = open_dirs.pop() {
                editor.close_directory(&dir).await?;
            }
        }
        if !path.is_empty() {
            let top = open_dirs.last().cloned().unwrap_or_default();
            if let Some(rest) = skip_ancestor(&top, parent).filter(|r| !r.is_empty()) {
                let mut dir = top;
                for segment in rest.split('/') {
                    dir = join(&dir, segment);
                    editor.open_directory(&dir, None).await?;
                    open_dirs.push(dir.clone());
                }
            }
        }

        notify_item(notify, item);

        if item.is_delete() {
            editor
                .delete_entry(path, item.revision)
                .await
                .map_err(out_of_date(item))?;
        }

        let mut file_open = false;
        if item.is_add() {
            match item.kind {
                NodeKind::Dir => {
                    editor
                        .add_directory(path, item.copy_from.as_ref())
                        .await
                        .map_err(out_of_date(item))?;
                    open_dirs.push(path.to_string());
                }
                NodeKind::File => {
                    editor
                        .add_file(path, item.copy_from.as_ref())
                        .await
                        .map_err(out_of_date(item))?;
                    file_open = true;
                }
            }
        } else if item.has_prop_mods() || item.has_text_mods() {
            match item.kind {
                NodeKind::Dir => {
                    if !path.is_empty() {
                        editor
                            .open_directory(path, item.revision)
                            .await
                            .map_err(out_of_date(item))?;
                        open_dirs.push(path.to_string());
                    }
                }
                NodeKind::File => {
                    editor
                        .open_file(path, item.revision)
                        .await
                        .map_err(out_of_date(item))?;
                    file_open = true;
                }
            }
        }

        if item.has_prop_mods() {
            for change in &item.prop_changes {
                let value = change.value.as_deref();
                let sent = match item.kind {
                    NodeKind::Dir => editor.change_dir_prop(path, &change.name, value).await,
                    NodeKind::File => editor.change_file_prop(path, &change.name, value).await,
                };
                sent.map_err(out_of_date(item))?;
            }
        }

        if file_open {
            if item.needs_text() {
                deferred.push((item, path));
            } else {
                editor.close_file(path, None).await?;
            }
        }
    }

    while let Some(dir) = open_dirs.pop() {
        editor.close_directory(&dir).await?;
    }

    let mut texts = TransmittedTexts::new();
    for (item, path) in deferred {
        let sums = transmitter.transmit(editor, item, path).await?;
        texts.insert(item.local_relpath.clone(), sums);
    }

    let info = editor.close_edit().await?;
    tracing::info!("Committed revision {}", info.revision);
    Ok((info, texts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::{CopySource, RaResult};
    use crate::notify::{CollectingSink, NullSink};
    use crate::packet::StateFlags;
    use crate::working_copy::{BaseInfo, WorkingCopy};
    use async_trait::async_trait;
    use dsvn_core::{DeltaWindow, Md5Digest, PropChange, PropertySet, Revnum};
    use tempfile::TempDir;

    /// Records every call; fails the call whose description matches `fail_on`
    #[derive(Default)]
    struct RecordingEditor {
        calls: Vec<String>,
        base_md5s: Vec<Option<Md5Digest>>,
        fail_on: Option<(String, fn(String) -> RaError)>,
    }

    impl RecordingEditor {
        fn record(&mut self, call: String) -> RaResult<()> {
            if let Some((pattern, make)) = &self.fail_on {
                if call == *pattern {
                    return Err(make(call));
                }
            }
            self.calls.push(call);
            Ok(())
        }
    }

    #[async_trait]
    impl CommitEditor for RecordingEditor {
        async fn open_root(&mut self, _base: Option<Revnum>) -> RaResult<()> {
            self.record("open_root".into())
        }
        async fn delete_entry(&mut self, path: &str, rev: Option<Revnum>) -> RaResult<()> {
            self.record(format!("delete {} @{:?}", path, rev))
        }
        async fn add_directory(&mut self, path: &str, from: Option<&CopySource>) -> RaResult<()> {
            self.record(format!("add_dir {} {:?}", path, from.map(|c| c.revision)))
        }
        async fn open_directory(&mut self, path: &str, _base: Option<Revnum>) -> RaResult<()> {
            self.record(format!("open_dir {}", path))
        }
        async fn change_dir_prop(&mut self, path: &str, name: &str, _v: Option<&str>) -> RaResult<()> {
            self.record(format!("dir_prop {} {}", path, name))
        }
        async fn close_directory(&mut self, path: &str) -> RaResult<()> {
            self.record(format!("close_dir {}", path))
        }
        async fn add_file(&mut self, path: &str, _from: Option<&CopySource>) -> RaResult<()> {
            self.record(format!("add_file {}", path))
        }
        async fn open_file(&mut self, path: &str, _base: Option<Revnum>) -> RaResult<()> {
            self.record(format!("open_file {}", path))
        }
        async fn change_file_prop(&mut self, path: &str, name: &str, _v: Option<&str>) -> RaResult<()> {
            self.record(format!("file_prop {} {}", path, name))
        }
        async fn apply_textdelta(&mut self, path: &str, md5: Option<&Md5Digest>) -> RaResult<()> {
            self.base_md5s.push(md5.copied());
            self.record(format!("textdelta {}", path))
        }
        async fn send_window(&mut self, _path: &str, _window: &DeltaWindow) -> RaResult<()> {
            Ok(())
        }
        async fn close_file(&mut self, path: &str, md5: Option<&Md5Digest>) -> RaResult<Option<Md5Digest>> {
            self.record(format!("close_file {}", path))?;
            Ok(md5.copied())
        }
        async fn close_edit(&mut self) -> RaResult<CommitInfo> {
            self.record("close_edit".into())?;
            Ok(CommitInfo {
                revision: 7,
                date: chrono::Utc::now(),
                author: None,
                post_commit_err: None,
                dav_cache: BTreeMap::new(),
            })
        }
        async fn abort_edit(&mut self) -> RaResult<()> {
            self.calls.push("abort_edit".into());
            Ok(())
        }
    }

    fn item(local: &str, kind: NodeKind, flags: StateFlags) -> CommitItem {
        CommitItem {
            local_relpath: local.to_string(),
            repos_relpath: join("trunk", local),
            url: format!("mem://r/trunk/{}", local),
            revision: if flags.contains(StateFlags::ADD) { None } else { Some(1) },
            copy_from: None,
            kind,
            flags,
            lock_token: None,
            prop_changes: Vec::new(),
            base_checksums: None,
            eol_style: None,
            spool: None,
        }
    }

    fn setup() -> (TempDir, WorkingCopy) {
        let tmp = TempDir::new().unwrap();
        let wc = WorkingCopy::create(tmp.path(), "mem://r", "uuid", "trunk", BaseInfo::at(1)).unwrap();
        (tmp, wc)
    }

    #[tokio::test]
    async fn test_parents_open_before_children_and_text_comes_last() {
        let (tmp, wc) = setup();
        std::fs::create_dir_all(tmp.path().join("A/B")).unwrap();
        std::fs::write(tmp.path().join("A/B/new"), b"content").unwrap();

        let mut packet = CommitPacket::new(wc.root(), wc.lock().unwrap());
        packet.insert(item("A/B/new", NodeKind::File, StateFlags::ADD | StateFlags::TEXT_MODIFIED));
        packet.insert(item("A/gone", NodeKind::File, StateFlags::DELETE));
        let mut props = item("C", NodeKind::Dir, StateFlags::PROPS_MODIFIED);
        props.prop_changes.push(PropChange {
            name: "color".into(),
            value: Some("red".into()),
        });
        packet.insert(props);
        packet.condense();

        let cancel = CancelToken::new();
        let sink = CollectingSink::new();
        let transmitter = Transmitter::new(&wc, &sink, &cancel);
        let mut editor = RecordingEditor::default();
        let (info, texts) = drive(&packet, &mut editor, &transmitter, &sink, &cancel)
            .await
            .unwrap();

        assert_eq!(info.revision, 7);
        assert!(texts.contains_key("A/B/new"));
        assert_eq!(
            editor.calls,
            vec![
                "open_root",
                "open_dir A",
                "open_dir A/B",
                "add_file A/B/new",
                "close_dir A/B",
                "delete A/gone @Some(1)",
                "close_dir A",
                "open_dir C",
                "dir_prop C color",
                "close_dir C",
                "close_dir ",
                "textdelta A/B/new",
                "close_file A/B/new",
                "close_edit",
            ]
        );
        let events = sink.events();
        assert!(matches!(events.last(), Some(CommitEvent::DeltaSent { .. })));
        packet.dispose().unwrap();
    }

    #[tokio::test]
    async fn test_stale_delete_is_out_of_date_and_aborts() {
        let (_tmp, wc) = setup();
        let mut packet = CommitPacket::new(wc.root(), wc.lock().unwrap());
        packet.insert(item("A/gone", NodeKind::File, StateFlags::DELETE));
        packet.condense();

        let cancel = CancelToken::new();
        let transmitter = Transmitter::new(&wc, &NullSink, &cancel);
        let mut editor = RecordingEditor {
            fail_on: Some((
                "delete gone @Some(1)".into(),
                RaError::OutOfDate as fn(String) -> RaError,
            )),
            ..Default::default()
        };
        let err = drive(&packet, &mut editor, &transmitter, &NullSink, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, CommitError::CommitFailed(_)));
        assert!(matches!(
            err.root_cause(),
            CommitError::OutOfDate { path, kind: NodeKind::File } if path == "A/gone"
        ));
        assert_eq!(editor.calls.last().map(String::as_str), Some("abort_edit"));
        packet.dispose().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_aborts_edit() {
        let (_tmp, wc) = setup();
        let mut packet = CommitPacket::new(wc.root(), wc.lock().unwrap());
        packet.insert(item("f", NodeKind::File, StateFlags::DELETE));

        let cancel = CancelToken::new();
        cancel.cancel();
        let transmitter = Transmitter::new(&wc, &NullSink, &cancel);
        let mut editor = RecordingEditor::default();
        let err = drive(&packet, &mut editor, &transmitter, &NullSink, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(editor.calls, vec!["open_root", "abort_edit"]);
        packet.dispose().unwrap();
    }

    #[tokio::test]
    async fn test_base_md5_computed_when_not_recorded() {
        let (_tmp, wc) = setup();
        wc.add_base_file("f", b"old\n", BaseInfo::at(1), PropertySet::new()).unwrap();
        std::fs::write(wc.abspath("f"), b"new\n").unwrap();

        let mut packet = CommitPacket::new(wc.root(), wc.lock().unwrap());
        packet.insert(item("f", NodeKind::File, StateFlags::TEXT_MODIFIED));
        packet.condense();

        let cancel = CancelToken::new();
        let transmitter = Transmitter::new(&wc, &NullSink, &cancel);
        let mut editor = RecordingEditor::default();
        let (_, texts) = drive(&packet, &mut editor, &transmitter, &NullSink, &cancel)
            .await
            .unwrap();

        assert_eq!(editor.base_md5s, vec![Some(Md5Digest::from_data(b"old\n"))]);
        assert_eq!(texts["f"].md5, Md5Digest::from_data(b"new\n"));
        packet.dispose().unwrap();
    }
}

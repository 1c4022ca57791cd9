//! Sending file texts as deltas

use crate::cancel::CancelToken;
use crate::editor::CommitEditor;
use crate::error::{CommitError, Result};
use crate::notify::{CommitEvent, NotifySink};
use crate::packet::CommitItem;
use crate::translate;
use crate::working_copy::WorkingCopy;
use dsvn_core::delta::delta_windows;
use dsvn_core::{ChecksumPair, Md5Digest};
use std::fs;
use std::io::Write;

/// Streams working texts to the repository and stages them as the new
/// pristine texts
pub struct Transmitter<'a> {
    wc: &'a WorkingCopy,
    window_size: usize,
    notify: &'a dyn NotifySink,
    cancel: &'a CancelToken,
}

impl<'a> Transmitter<'a> {
    pub fn new(wc: &'a WorkingCopy, notify: &'a dyn NotifySink, cancel: &'a CancelToken) -> Self {
        Self {
            wc,
            window_size: wc.config().delta_window_size,
            notify,
            cancel,
        }
    }

    /// Send the text of `item`, open in `editor` at `path`, and close the
    /// file. Returns the checksums of the text now in the pristine store.
    pub async fn transmit(
        &self,
        editor: &mut dyn CommitEditor,
        item: &CommitItem,
        path: &str,
    ) -> Result<ChecksumPair> {
        self.send(editor, item, path)
            .await
            .map_err(|e| e.at_path(&item.local_relpath))
    }

    async fn send(
        &self,
        editor: &mut dyn CommitEditor,
        item: &CommitItem,
        path: &str,
    ) -> Result<ChecksumPair> {
        self.cancel.check()?;

        let working = match &item.spool {
            Some(spool) => fs::read(spool)?,
            None => translate::read_normal_form(&self.wc.abspath(&item.local_relpath), item.eol_style)?,
        };
        let mut stage = self.wc.pristine().stage()?;
        stage.write_all(&working)?;

        let (base, base_md5) = if item.is_add() && !item.is_copy() {
            (Vec::new(), None)
        } else if let Some(sums) = item.base_checksums {
            let base = self.wc.pristine().read(&sums.sha256)?;
            let actual = Md5Digest::from_data(&base);
            if actual != sums.md5 {
                return Err(CommitError::CorruptBase {
                    path: item.local_relpath.clone(),
                    recorded: sums.md5,
                    actual,
                });
            }
            (base, Some(sums.md5))
        } else {
            // No recorded MD5 for the base; hash the pristine text itself
            let sha256 = self
                .wc
                .db()
                .read_node(&item.local_relpath)?
                .and_then(|node| node.checksum)
                .ok_or_else(|| CommitError::PristineNotFound(item.local_relpath.clone()))?;
            let base = self.wc.pristine().read(&sha256)?;
            let md5 = Md5Digest::from_data(&base);
            (base, Some(md5))
        };

        editor.apply_textdelta(path, base_md5.as_ref()).await?;
        for window in delta_windows(&base, &working, self.window_size) {
            editor.send_window(path, &window).await?;
        }
        let local_md5 = Md5Digest::from_data(&working);
        if let Some(server_md5) = editor.close_file(path, Some(&local_md5)).await? {
            if server_md5 != local_md5 {
                return Err(CommitError::ChecksumMismatch {
                    path: item.local_relpath.clone(),
                    expected: local_md5,
                    actual: server_md5,
                });
            }
        }

        let sums = self.wc.pristine().install(stage, self.wc.db())?;
        tracing::debug!("Sent {} bytes of '{}'", working.len(), item.local_relpath);
        self.notify.notify(&CommitEvent::DeltaSent {
            path: item.local_relpath.clone(),
        });
        Ok(sums)
    }
}

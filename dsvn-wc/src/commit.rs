//! Commit entry points
//!
//! [`commit`] runs the whole pipeline for one working copy: harvest under
//! the write lock, ask the strategies for a log message and admission, drive
//! the repository editor, then reconcile the working copy. Once the
//! repository has accepted the commit, nothing that goes wrong locally turns
//! it into a failure; it is reported as a post-commit warning instead.

use crate::cancel::CancelToken;
use crate::driver::drive;
use crate::editor::{CommitInfo, RepositoryAccess};
use crate::error::{CommitError, Result};
use crate::harvest::{HarvestOptions, harvest};
use crate::hooks::{AdmissionRule, CommitStrategies, PreCommitHook};
use crate::notify::{CommitEvent, NotifySink};
use crate::packet::CommitPacket;
use crate::reconcile::{build_queue, reconcile};
use crate::transmit::Transmitter;
use crate::working_copy::WorkingCopy;
use dsvn_core::{Depth, PropertySet, Revnum, svn_props};

/// What to commit and how
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    /// Working-copy relpaths; empty commits the whole working copy
    pub targets: Vec<String>,
    pub depth: Depth,
    pub changelists: Vec<String>,
    pub just_locked: bool,
    /// Overrides the working copy's configuration when set
    pub keep_locks: Option<bool>,
    pub keep_changelists: Option<bool>,
    /// Extra revision properties
    pub revprops: PropertySet,
}

/// Result of a commit
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// `None` when there was nothing to commit
    pub info: Option<CommitInfo>,
    /// Working-copy relpaths of the committed items
    pub committed: Vec<String>,
    /// Local bookkeeping failed after the repository accepted the commit
    pub post_commit_warning: Option<String>,
}

impl CommitOutcome {
    fn nothing() -> Self {
        Self {
            info: None,
            committed: Vec::new(),
            post_commit_warning: None,
        }
    }

    pub fn revision(&self) -> Option<Revnum> {
        self.info.as_ref().map(|i| i.revision)
    }
}

/// Commit the local modifications of `wc`
pub async fn commit(
    wc: &WorkingCopy,
    ra: &dyn RepositoryAccess,
    opts: &CommitOptions,
    strategies: &CommitStrategies,
    notify: &dyn NotifySink,
    cancel: &CancelToken,
) -> Result<CommitOutcome> {
    let harvest_opts = HarvestOptions {
        depth: opts.depth,
        changelists: opts.changelists.clone(),
        just_locked: opts.just_locked,
    };
    let result = match harvest(wc, &opts.targets, &harvest_opts, cancel) {
        Ok(mut packet) => {
            let result = commit_packet(wc, ra, &mut packet, opts, strategies, notify, cancel).await;
            if let Err(e) = packet.dispose() {
                tracing::warn!("Failed to dispose commit packet: {}", e);
            }
            result
        }
        Err(e) => Err(e),
    };
    if let Err(e) = &result {
        notify.notify(&CommitEvent::Failed {
            message: e.to_string(),
        });
    }
    result
}

fn rejected(err: anyhow::Error) -> CommitError {
    CommitError::Rejected(format!("{:#}", err))
}

async fn commit_packet(
    wc: &WorkingCopy,
    ra: &dyn RepositoryAccess,
    packet: &mut CommitPacket,
    opts: &CommitOptions,
    strategies: &CommitStrategies,
    notify: &dyn NotifySink,
    cancel: &CancelToken,
) -> Result<CommitOutcome> {
    if packet.is_empty() {
        tracing::info!("Nothing to commit in {:?}", wc.root());
        return Ok(CommitOutcome::nothing());
    }
    let config = wc.config();

    let message = strategies
        .log_message
        .log_message(packet.items())
        .map_err(rejected)?;
    let Some(mut message) = message else {
        tracing::info!("Commit abandoned: no log message");
        return Err(CommitError::Cancelled);
    };
    if message.is_empty() {
        if let Some(default) = &config.default_log_message {
            message = default.clone();
        }
    }

    if config.run_hooks {
        PreCommitHook::new(wc.admin_dir())
            .check(packet, &message)
            .map_err(rejected)?;
    }
    for rule in &strategies.admission {
        rule.check(packet, &message).map_err(rejected)?;
    }
    cancel.check()?;

    let keep_locks = opts.keep_locks.unwrap_or(config.keep_locks);
    let keep_changelists = opts.keep_changelists.unwrap_or(config.keep_changelists);
    let mut revprops = opts.revprops.clone();
    revprops.set(svn_props::REVPROP_LOG, message);

    let mut editor = ra
        .open_commit_editor(packet.base_relpath(), &revprops, packet.lock_tokens(), keep_locks)
        .await
        .map_err(|e| CommitError::CommitFailed(Box::new(e.into())))?;
    let transmitter = Transmitter::new(wc, notify, cancel);
    let (info, texts) = drive(packet, editor.as_mut(), &transmitter, notify, cancel).await?;

    notify.notify(&CommitEvent::Completed {
        revision: info.revision,
    });
    if let Some(err) = &info.post_commit_err {
        tracing::warn!("Repository post-commit processing failed: {}", err);
        notify.notify(&CommitEvent::PostCommitWarning {
            message: err.clone(),
        });
    }

    let committed = packet.items().iter().map(|i| i.local_relpath.clone()).collect();
    let queue = build_queue(packet, &info, &texts, keep_locks, keep_changelists);
    let post_commit_warning = match reconcile(wc, queue, &texts, packet.temp_files(), cancel) {
        Ok(report) => {
            tracing::debug!("Reconciled working copy: {:?}", report);
            None
        }
        Err(e) => {
            tracing::warn!("Post-commit processing failed: {}", e);
            let message = e.to_string();
            notify.notify(&CommitEvent::PostCommitWarning {
                message: message.clone(),
            });
            Some(message)
        }
    };

    Ok(CommitOutcome {
        info: Some(info),
        committed,
        post_commit_warning,
    })
}

/// One working copy of a batch commit
pub struct BatchEntry<'a> {
    pub wc: &'a WorkingCopy,
    pub ra: &'a dyn RepositoryAccess,
    pub options: CommitOptions,
}

/// Commit several working copies one after another, each in its own
/// transaction. Every entry gets a result; only cancellation stops the
/// batch early.
pub async fn commit_batch(
    entries: &[BatchEntry<'_>],
    strategies: &CommitStrategies,
    notify: &dyn NotifySink,
    cancel: &CancelToken,
) -> Vec<Result<CommitOutcome>> {
    let mut results = Vec::with_capacity(entries.len());
    for entry in entries {
        let result = commit(entry.wc, entry.ra, &entry.options, strategies, notify, cancel).await;
        let stop = result.as_ref().is_err_and(CommitError::is_cancelled);
        if let Err(e) = &result {
            tracing::warn!("Commit of {:?} failed: {}", entry.wc.root(), e);
        }
        results.push(result);
        if stop {
            break;
        }
    }
    results
}

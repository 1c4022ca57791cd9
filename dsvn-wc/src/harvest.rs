//! Harvesting local modifications into a commit packet
//!
//! The harvester walks the requested targets under the working-copy write
//! lock and turns every node with something to commit into a
//! [`CommitItem`]. Node classification is a pure function of the metadata
//! row and the copy state inherited from the parent ([`classify`]); only the
//! text comparison touches the disk.

use crate::cancel::CancelToken;
use crate::editor::CopySource;
use crate::error::{CommitError, ConflictKind, Result, ResultExt};
use crate::packet::{CommitItem, CommitPacket, StateFlags};
use crate::translate;
use crate::wc_db::{CopyOrigin, NodeRecord, Schedule};
use crate::working_copy::{WorkingCopy, fileinfo};
use dsvn_core::path::dirname;
use dsvn_core::{ChecksumPair, ContentId, Depth, NodeKind, PropChange, PropertySet, Revnum, svn_props};
use std::borrow::Cow;
use std::fs;
use std::io;
use std::path::PathBuf;

/// What to harvest
#[derive(Debug, Clone, Default)]
pub struct HarvestOptions {
    pub depth: Depth,
    /// Only commit nodes in one of these changelists; empty means all
    pub changelists: Vec<String>,
    /// Commit nodes that hold a lock token even when unmodified
    pub just_locked: bool,
}

/// Copy state a node inherits from its parent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyContext {
    /// Revision of the copy the parent is part of
    pub origin_revision: Option<Revnum>,
    /// The parent replaces a repository node; its old children go with it
    pub under_replace: bool,
}

impl CopyContext {
    pub fn of_parent(parent: &NodeRecord) -> Self {
        Self {
            origin_revision: parent.origin.as_ref().map(|o| o.revision),
            under_replace: parent.schedule == Schedule::Replace,
        }
    }
}

/// Result of [`classify`]
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub flags: StateFlags,
    pub copy_from: Option<CopyOrigin>,
    pub prop_changes: Vec<PropChange>,
    /// Removed together with a replaced parent; nothing to send
    pub implied: bool,
    pub child_context: CopyContext,
}

impl Classification {
    /// A deletion with nothing added back
    pub fn is_delete_only(&self) -> bool {
        self.flags.contains(StateFlags::DELETE) && !self.flags.contains(StateFlags::ADD)
    }
}

/// Decide what a node contributes to a commit, apart from its text.
///
/// Rules in priority order: replacements are DELETE+ADD (+COPY when the
/// replacement is a copy); deletions are DELETE only; a copy op-root or a
/// copied node whose revision differs from the parent's copy is ADD+COPY;
/// an add without origin is a plain ADD. Everything that is not a pure
/// deletion is then checked for property modifications. Plain added files
/// always carry TEXT_MODIFIED.
pub fn classify(node: &NodeRecord, ctx: &CopyContext) -> Classification {
    let mut flags = StateFlags::empty();
    let mut copy_from = None;
    let mut implied = false;
    let mut child_context = CopyContext {
        origin_revision: node.origin.as_ref().map(|o| o.revision),
        under_replace: false,
    };
    let independent_copy = node
        .origin
        .as_ref()
        .filter(|o| node.op_root || ctx.origin_revision != Some(o.revision));

    match node.schedule {
        Schedule::Replace => {
            flags = StateFlags::DELETE | StateFlags::ADD;
            if let Some(origin) = independent_copy {
                flags |= StateFlags::COPY;
                copy_from = Some(origin.clone());
            }
            child_context.under_replace = true;
        }
        Schedule::Delete => {
            if node.origin.is_none() && ctx.under_replace {
                implied = true;
            } else {
                flags = StateFlags::DELETE;
            }
        }
        Schedule::Add => {
            if let Some(origin) = independent_copy {
                flags = StateFlags::ADD | StateFlags::COPY;
                copy_from = Some(origin.clone());
            } else if node.origin.is_none() {
                flags = StateFlags::ADD;
            }
        }
        Schedule::Normal => {}
    }

    let delete_only = flags.contains(StateFlags::DELETE) && !flags.contains(StateFlags::ADD);
    let plain_add = flags.contains(StateFlags::ADD) && !flags.contains(StateFlags::COPY);
    let mut prop_changes = Vec::new();
    if !implied && !delete_only {
        if plain_add {
            prop_changes = node.props().diff(&PropertySet::new());
        } else if node.has_prop_mods() {
            prop_changes = node.props().diff(&node.pristine_props);
        }
        prop_changes.retain(|c| svn_props::is_regular_prop(&c.name));
        if !prop_changes.is_empty() {
            flags |= StateFlags::PROPS_MODIFIED;
        }
        if plain_add && node.kind == NodeKind::File {
            flags |= StateFlags::TEXT_MODIFIED;
        }
    }

    Classification {
        flags,
        copy_from,
        prop_changes,
        implied,
        child_context,
    }
}

/// Collect the commit items under `targets` (working-copy relpaths; none
/// means the whole working copy). The write lock is taken first and moved
/// into the returned packet; on failure it is released before returning.
pub fn harvest(
    wc: &WorkingCopy,
    targets: &[String],
    opts: &HarvestOptions,
    cancel: &CancelToken,
) -> Result<CommitPacket> {
    let lock = wc.lock()?;
    let mut packet = CommitPacket::new(wc.root(), lock);
    let harvester = Harvester { wc, opts, cancel };
    match harvester.run(&mut packet, targets) {
        Ok(()) => {
            tracing::debug!(
                "Harvested {} items, {} lock tokens",
                packet.len(),
                packet.lock_tokens().len()
            );
            Ok(packet)
        }
        Err(e) => {
            if let Err(dispose_err) = packet.dispose() {
                tracing::warn!("Failed to dispose commit packet: {}", dispose_err);
            }
            Err(e)
        }
    }
}

struct Harvester<'a> {
    wc: &'a WorkingCopy,
    opts: &'a HarvestOptions,
    cancel: &'a CancelToken,
}

impl Harvester<'_> {
    fn run(&self, packet: &mut CommitPacket, targets: &[String]) -> Result<()> {
        let whole = [String::new()];
        let targets = if targets.is_empty() { &whole[..] } else { targets };
        for target in targets {
            self.harvest_target(packet, target)?;
        }
        self.check_dangling_parents(packet)?;
        packet.remove_skipped_items();
        packet.condense();
        Ok(())
    }

    fn harvest_target(&self, packet: &mut CommitPacket, target: &str) -> Result<()> {
        self.cancel.check()?;
        let db = self.wc.db();
        let node = match db.read_node(target)? {
            Some(node) if node.is_present() => node,
            _ => {
                if db.tree_conflict(target)?.is_some() {
                    return Err(CommitError::Conflict {
                        path: target.to_string(),
                        kind: ConflictKind::Tree,
                    });
                }
                return Err(CommitError::NotVersioned(target.to_string()));
            }
        };

        let mut ancestor = target;
        while !ancestor.is_empty() {
            ancestor = dirname(ancestor);
            if db.tree_conflict(ancestor)?.is_some() {
                return Err(CommitError::Conflict {
                    path: ancestor.to_string(),
                    kind: ConflictKind::Tree,
                });
            }
        }

        let ctx = if target.is_empty() {
            CopyContext::default()
        } else {
            db.read_node(dirname(target))?
                .map(|parent| CopyContext::of_parent(&parent))
                .unwrap_or_default()
        };
        self.visit(packet, &node, self.opts.depth, &ctx)
    }

    fn matches_changelist(&self, node: &NodeRecord) -> bool {
        self.opts.changelists.is_empty()
            || node
                .changelist
                .as_ref()
                .is_some_and(|cl| self.opts.changelists.contains(cl))
    }

    fn visit(
        &self,
        packet: &mut CommitPacket,
        node: &NodeRecord,
        depth: Depth,
        ctx: &CopyContext,
    ) -> Result<()> {
        let class = classify(node, ctx);
        if class.implied {
            self.sweep_locks(packet, node)?;
            return Ok(());
        }
        let delete_only = class.is_delete_only();

        if self.matches_changelist(node) {
            self.check_conflicts(node)?;
            self.harvest_node(packet, node, &class)
                .at_path(&node.local_relpath)?;
        }

        if node.kind == NodeKind::Dir && class.flags.contains(StateFlags::DELETE) {
            self.sweep_locks(packet, node)?;
        }
        if node.kind != NodeKind::Dir || delete_only || depth == Depth::Empty {
            return Ok(());
        }

        for child in self.wc.db().read_children(&node.local_relpath)? {
            if !child.is_present() || !depth.includes_child(child.kind) {
                continue;
            }
            let child_depth = match child.kind {
                NodeKind::Dir => depth.for_child_dir(),
                NodeKind::File => Depth::Empty,
            };
            self.visit(packet, &child, child_depth, &class.child_context)?;
        }
        Ok(())
    }

    fn check_conflicts(&self, node: &NodeRecord) -> Result<()> {
        let kind = if node.text_conflict {
            Some(ConflictKind::Text)
        } else if node.prop_conflict {
            Some(ConflictKind::Property)
        } else if self.wc.db().tree_conflict(&node.local_relpath)?.is_some() {
            Some(ConflictKind::Tree)
        } else {
            None
        };
        match kind {
            Some(kind) => Err(CommitError::Conflict {
                path: node.local_relpath.clone(),
                kind,
            }),
            None => Ok(()),
        }
    }

    fn harvest_node(
        &self,
        packet: &mut CommitPacket,
        node: &NodeRecord,
        class: &Classification,
    ) -> Result<()> {
        let mut flags = class.flags;
        let mut spool = None;

        if !class.is_delete_only() {
            let on_disk = self.disk_kind(node)?;
            match on_disk {
                None if flags.contains(StateFlags::ADD) => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("'{}' is scheduled for addition, but is missing", node.local_relpath),
                    )
                    .into());
                }
                Some(NodeKind::File)
                    if node.kind == NodeKind::File && !flags.contains(StateFlags::TEXT_MODIFIED) =>
                {
                    let (modified, spooled) = self.text_modified(packet, node)?;
                    if modified {
                        flags |= StateFlags::TEXT_MODIFIED;
                        spool = spooled;
                    }
                }
                _ => {}
            }
        }

        let locked = node.lock_token.is_some();
        if flags.is_empty() && !(self.opts.just_locked && locked) {
            return Ok(());
        }
        if let Some(token) = &node.lock_token {
            flags |= StateFlags::LOCK_TOKEN;
            packet.add_lock_token(self.wc.url_of(&node.repos_relpath)?, token.clone());
        }

        let copy_from = match &class.copy_from {
            Some(origin) => Some(CopySource {
                url: self.wc.url_of(&origin.repos_relpath)?,
                revision: origin.revision,
            }),
            None => None,
        };
        let revision = if flags.contains(StateFlags::ADD) && !flags.contains(StateFlags::DELETE) {
            None
        } else {
            node.base_revision()
        };
        let item = CommitItem {
            local_relpath: node.local_relpath.clone(),
            repos_relpath: node.repos_relpath.clone(),
            url: self.wc.url_of(&node.repos_relpath)?,
            revision,
            copy_from,
            kind: node.kind,
            flags,
            lock_token: node.lock_token.clone(),
            prop_changes: class.prop_changes.clone(),
            base_checksums: self.base_checksums(node)?,
            eol_style: node.props().eol_style(),
            spool,
        };
        tracing::debug!("Harvested '{}' [{}]", item.local_relpath, item.flags);
        if !packet.insert(item) {
            tracing::debug!("'{}' already harvested", node.local_relpath);
        }
        Ok(())
    }

    /// Kind of the working node on disk, `None` if missing
    fn disk_kind(&self, node: &NodeRecord) -> Result<Option<NodeKind>> {
        let kind = match fs::symlink_metadata(self.wc.abspath(&node.local_relpath)) {
            Ok(meta) if meta.is_file() => NodeKind::File,
            Ok(meta) if meta.is_dir() => NodeKind::Dir,
            Ok(_) => return Err(CommitError::UnknownNodeKind(node.local_relpath.clone())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if kind != node.kind {
            return Err(CommitError::UnknownNodeKind(node.local_relpath.clone()));
        }
        Ok(Some(kind))
    }

    /// Compare the working file with its pristine text. A translated copy
    /// made for the comparison is spooled for the transmitter.
    fn text_modified(
        &self,
        packet: &mut CommitPacket,
        node: &NodeRecord,
    ) -> Result<(bool, Option<PathBuf>)> {
        let Some(checksum) = node.checksum else {
            return Ok((true, None));
        };
        let path = self.wc.abspath(&node.local_relpath);
        let eol_changed =
            node.props().get(svn_props::EOL_STYLE) != node.pristine_props.get(svn_props::EOL_STYLE);
        if !eol_changed {
            if let (Some(size), Some(mtime)) = (node.recorded_size, node.recorded_mtime) {
                if fileinfo(&path)? == (size, mtime) {
                    return Ok((false, None));
                }
            }
        }

        let raw = fs::read(&path)?;
        let normal = translate::to_normal_form(&raw, node.props().eol_style());
        if ContentId::from_data(&normal) == checksum {
            return Ok((false, None));
        }
        let spool = match normal {
            Cow::Owned(normal) => {
                let spool = self
                    .wc
                    .pristine()
                    .tmp_dir()
                    .join(format!("{}.spool", uuid::Uuid::new_v4()));
                fs::write(&spool, &normal)?;
                packet.add_temp_file(spool.clone());
                Some(spool)
            }
            Cow::Borrowed(_) => None,
        };
        Ok((true, spool))
    }

    fn base_checksums(&self, node: &NodeRecord) -> Result<Option<ChecksumPair>> {
        if let Some(sums) = node.checksums() {
            return Ok(Some(sums));
        }
        let Some(sha256) = node.checksum else {
            return Ok(None);
        };
        Ok(self
            .wc
            .db()
            .pristine_md5(&sha256)?
            .map(|md5| ChecksumPair { md5, sha256 }))
    }

    /// Put every lock token held below a deleted directory into the packet
    fn sweep_locks(&self, packet: &mut CommitPacket, node: &NodeRecord) -> Result<()> {
        if node.kind != NodeKind::Dir {
            if let Some(token) = &node.lock_token {
                packet.add_lock_token(self.wc.url_of(&node.repos_relpath)?, token.clone());
            }
            return Ok(());
        }
        for desc in self.wc.db().read_descendants(&node.local_relpath)? {
            if let Some(token) = &desc.lock_token {
                packet.add_lock_token(self.wc.url_of(&desc.repos_relpath)?, token.clone());
            }
        }
        Ok(())
    }

    /// Every item that only exists as part of a local add or copy needs
    /// the op-root of that add to exist in the repository or to be created
    /// by this commit. Carried children of a copy count too, whatever their
    /// flags.
    fn check_dangling_parents(&self, packet: &CommitPacket) -> Result<()> {
        let db = self.wc.db();
        for item in packet.items() {
            if item.local_relpath.is_empty() {
                continue;
            }
            if !item.is_add() {
                let Some(node) = db.read_node(&item.local_relpath)? else {
                    continue;
                };
                let copied = match node.schedule {
                    Schedule::Add | Schedule::Replace => true,
                    Schedule::Delete => node.origin.is_some(),
                    Schedule::Normal => false,
                };
                if !copied {
                    continue;
                }
            }
            let mut parent = dirname(&item.local_relpath);
            loop {
                let Some(node) = db.read_node(parent)? else {
                    break;
                };
                if !matches!(node.schedule, Schedule::Add | Schedule::Replace)
                    || packet.get_local(parent).is_some()
                {
                    break;
                }
                if node.origin.is_none() || node.op_root {
                    return Err(CommitError::DanglingParent {
                        path: item.local_relpath.clone(),
                        parent: parent.to_string(),
                    });
                }
                if parent.is_empty() {
                    break;
                }
                parent = dirname(parent);
            }
        }
        Ok(())
    }
}

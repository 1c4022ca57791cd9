//! DSvn working copy
//!
//! The client side of a commit: a working copy on disk (SQLite metadata,
//! content-addressed pristine texts, a crash-safe work queue) and the
//! pipeline that turns its local modifications into a new repository
//! revision:
//! - harvest: collect the modified nodes into a [`CommitPacket`]
//! - transmit: drive a [`CommitEditor`], sending file texts as deltas
//! - reconcile: bring the working copy to the new revision

pub mod cancel;
pub mod commit;
pub mod config;
pub mod driver;
pub mod editor;
pub mod error;
pub mod harvest;
pub mod hooks;
pub mod lock;
pub mod memory_repo;
pub mod notify;
pub mod packet;
pub mod pristine;
pub mod reconcile;
pub mod translate;
pub mod transmit;
pub mod wc_db;
pub mod work_queue;
pub mod working_copy;

pub use cancel::CancelToken;
pub use commit::{BatchEntry, CommitOptions, CommitOutcome, commit, commit_batch};
pub use config::CommitConfig;
pub use editor::{CommitEditor, CommitInfo, CopySource, RepositoryAccess};
pub use error::{CommitError, ConflictKind, RaError, Result};
pub use harvest::{HarvestOptions, harvest};
pub use hooks::{AdmissionRule, CommitStrategies, FixedMessage, LogMessageProvider, PreCommitHook};
pub use memory_repo::{MemoryRepository, Seed};
pub use notify::{CollectingSink, CommitEvent, NotifySink, NullSink, TracingSink};
pub use packet::{CommitItem, CommitPacket, StateFlags};
pub use working_copy::{ADMIN_DIR, BaseInfo, CleanupReport, WorkingCopy};

//! DSvn Core Library
//!
//! Building blocks shared by the working-copy crate and the CLI:
//! - Checksums (MD5 + SHA-256 content address)
//! - Versioned properties and the standard `svn:*` names
//! - svndiff text deltas
//! - Node kind, depth and relpath helpers

pub mod checksum;
pub mod delta;
pub mod path;
pub mod properties;
pub mod types;

pub use checksum::{ChecksumPair, ContentId, DualHasher, HashingReader, HashingWriter, Md5Digest};
pub use delta::{DeltaError, DeltaOp, DeltaWindow};
pub use properties::{EolStyle, PropChange, PropertySet, PropertyValue, svn_props};
pub use types::{Depth, NodeKind, Revnum};

//! Node kind and depth primitives

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Revision number. `None` where a revision is not (yet) known.
pub type Revnum = u64;

/// Kind of a versioned node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Dir => "dir",
        }
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(NodeKind::File),
            "dir" => Ok(NodeKind::Dir),
            other => Err(format!("unknown node kind '{}'", other)),
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How far below a target an operation reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Depth {
    /// Only the target itself
    Empty,
    /// The target and its file children
    Files,
    /// The target and all of its immediate children
    Immediates,
    /// The whole subtree
    Infinity,
}

impl Depth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Depth::Empty => "empty",
            Depth::Files => "files",
            Depth::Immediates => "immediates",
            Depth::Infinity => "infinity",
        }
    }

    /// Whether a child of `kind` is reached at this depth
    pub fn includes_child(&self, kind: NodeKind) -> bool {
        match self {
            Depth::Empty => false,
            Depth::Files => kind == NodeKind::File,
            Depth::Immediates | Depth::Infinity => true,
        }
    }

    /// Depth to use when descending into a child directory
    pub fn for_child_dir(&self) -> Depth {
        match self {
            Depth::Infinity => Depth::Infinity,
            _ => Depth::Empty,
        }
    }
}

impl Default for Depth {
    fn default() -> Self {
        Depth::Infinity
    }
}

impl FromStr for Depth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "empty" => Ok(Depth::Empty),
            "files" => Ok(Depth::Files),
            "immediates" => Ok(Depth::Immediates),
            "infinity" => Ok(Depth::Infinity),
            other => Err(format!("invalid depth '{}'", other)),
        }
    }
}

impl fmt::Display for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_reach() {
        assert!(!Depth::Empty.includes_child(NodeKind::File));
        assert!(Depth::Files.includes_child(NodeKind::File));
        assert!(!Depth::Files.includes_child(NodeKind::Dir));
        assert!(Depth::Immediates.includes_child(NodeKind::Dir));
        assert_eq!(Depth::Immediates.for_child_dir(), Depth::Empty);
        assert_eq!(Depth::Infinity.for_child_dir(), Depth::Infinity);
    }

    #[test]
    fn test_parse_and_display() {
        for depth in [Depth::Empty, Depth::Files, Depth::Immediates, Depth::Infinity] {
            assert_eq!(depth.to_string().parse::<Depth>().unwrap(), depth);
        }
        assert!("deep".parse::<Depth>().is_err());
        assert_eq!("dir".parse::<NodeKind>().unwrap(), NodeKind::Dir);
        assert_eq!(NodeKind::File.to_string(), "file");
    }
}

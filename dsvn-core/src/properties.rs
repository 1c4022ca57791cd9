//! Versioned node properties
//!
//! A [`PropertySet`] holds the properties of one node. Sets are ordered by
//! name so that diffs and serialized forms are deterministic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Property value
pub type PropertyValue = String;

/// Properties of a single node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySet {
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
}

/// One outgoing property change. `value == None` deletes the property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropChange {
    pub name: String,
    pub value: Option<PropertyValue>,
}

impl PropertySet {
    /// Create a new empty property set
    pub fn new() -> Self {
        Self {
            properties: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        self.properties.remove(name)
    }

    /// List all property names in order
    pub fn list(&self) -> Vec<String> {
        self.properties.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.properties.iter()
    }

    /// Changes that turn `base` into `self`, ordered by name.
    pub fn diff(&self, base: &PropertySet) -> Vec<PropChange> {
        let mut changes = Vec::new();
        for (name, value) in &self.properties {
            if base.get(name) != Some(value) {
                changes.push(PropChange {
                    name: name.clone(),
                    value: Some(value.clone()),
                });
            }
        }
        for name in base.properties.keys() {
            if !self.properties.contains_key(name) {
                changes.push(PropChange {
                    name: name.clone(),
                    value: None,
                });
            }
        }
        changes.sort_by(|a, b| a.name.cmp(&b.name));
        changes
    }

    /// Apply changes in order
    pub fn apply(&mut self, changes: &[PropChange]) {
        for change in changes {
            match &change.value {
                Some(value) => self.set(change.name.clone(), value.clone()),
                None => {
                    self.remove(&change.name);
                }
            }
        }
    }

    /// The parsed `svn:eol-style`, if set to a recognised value
    pub fn eol_style(&self) -> Option<EolStyle> {
        self.get(svn_props::EOL_STYLE)
            .and_then(|v| v.parse().ok())
    }
}

impl Default for PropertySet {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<(String, PropertyValue)> for PropertySet {
    fn from_iter<I: IntoIterator<Item = (String, PropertyValue)>>(iter: I) -> Self {
        Self {
            properties: iter.into_iter().collect(),
        }
    }
}

/// Line-ending translation requested by `svn:eol-style`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EolStyle {
    Native,
    Lf,
    CrLf,
    Cr,
}

impl EolStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            EolStyle::Native => "native",
            EolStyle::Lf => "LF",
            EolStyle::CrLf => "CRLF",
            EolStyle::Cr => "CR",
        }
    }

    /// Line terminator written into the working file
    pub fn terminator(&self) -> &'static [u8] {
        match self {
            EolStyle::Native if cfg!(windows) => b"\r\n",
            EolStyle::Native | EolStyle::Lf => b"\n",
            EolStyle::CrLf => b"\r\n",
            EolStyle::Cr => b"\r",
        }
    }
}

impl FromStr for EolStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "native" => Ok(EolStyle::Native),
            "LF" => Ok(EolStyle::Lf),
            "CRLF" => Ok(EolStyle::CrLf),
            "CR" => Ok(EolStyle::Cr),
            other => Err(format!("unrecognized eol style '{}'", other)),
        }
    }
}

impl fmt::Display for EolStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SVN standard properties
pub mod svn_props {
    /// Executable flag
    pub const EXECUTABLE: &str = "svn:executable";

    /// MIME type
    pub const MIME_TYPE: &str = "svn:mime-type";

    /// Ignore patterns
    pub const IGNORE: &str = "svn:ignore";

    /// End-of-line style
    pub const EOL_STYLE: &str = "svn:eol-style";

    /// Keywords
    pub const KEYWORDS: &str = "svn:keywords";

    /// Needs lock
    pub const NEEDS_LOCK: &str = "svn:needs-lock";

    /// Special file (symlink)
    pub const SPECIAL: &str = "svn:special";

    /// Externals
    pub const EXTERNALS: &str = "svn:externals";

    /// Merge info
    pub const MERGE_INFO: &str = "svn:mergeinfo";

    /// Prefix of server-maintained entry properties, never sent by clients
    pub const ENTRY_PREFIX: &str = "svn:entry:";

    /// Prefix of working-copy-only properties
    pub const WC_PREFIX: &str = "svn:wc:";

    /// Value for svn:executable
    pub const EXECUTABLE_VALUE: &str = "*";

    /// Revision properties attached to a commit
    pub const REVPROP_LOG: &str = "svn:log";
    pub const REVPROP_AUTHOR: &str = "svn:author";
    pub const REVPROP_DATE: &str = "svn:date";

    /// Check if a property name is an SVN standard property
    pub fn is_svn_property(name: &str) -> bool {
        name.starts_with("svn:")
    }

    /// Regular properties are the versioned ones a client may change.
    pub fn is_regular_prop(name: &str) -> bool {
        !name.starts_with(ENTRY_PREFIX) && !name.starts_with(WC_PREFIX)
    }
}

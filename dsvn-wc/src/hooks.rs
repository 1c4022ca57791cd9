//! Strategy objects consulted before a commit is sent
//!
//! The log message is obtained from a [`LogMessageProvider`]; returning
//! `None` abandons the commit. Every [`AdmissionRule`] then gets to look at
//! the harvested packet and may reject it. [`PreCommitHook`] is the rule
//! that runs the working copy's `pre-commit` script.
//!
//! Hook scripts receive the commit description on stdin and must exit with
//! code 0 to let the commit proceed. On a non-zero exit, stderr (or stdout)
//! becomes the rejection message.

use crate::packet::{CommitItem, CommitPacket};
use anyhow::{Result, anyhow};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Supplies the log message of a commit
pub trait LogMessageProvider: Send + Sync {
    fn log_message(&self, items: &[CommitItem]) -> Result<Option<String>>;
}

impl<F> LogMessageProvider for F
where
    F: Fn(&[CommitItem]) -> Result<Option<String>> + Send + Sync,
{
    fn log_message(&self, items: &[CommitItem]) -> Result<Option<String>> {
        self(items)
    }
}

/// The same message for every commit
#[derive(Debug, Clone)]
pub struct FixedMessage(pub String);

impl LogMessageProvider for FixedMessage {
    fn log_message(&self, _items: &[CommitItem]) -> Result<Option<String>> {
        Ok(Some(self.0.clone()))
    }
}

/// A check a packet must pass before anything is sent
pub trait AdmissionRule: Send + Sync {
    fn check(&self, packet: &CommitPacket, log_message: &str) -> Result<()>;
}

/// Runs `<admin dir>/hooks/pre-commit` if it exists
pub struct PreCommitHook {
    hooks_dir: PathBuf,
}

impl PreCommitHook {
    pub const NAME: &'static str = "pre-commit";

    /// Hooks are expected in `<admin_dir>/hooks/`.
    pub fn new(admin_dir: &Path) -> Self {
        Self {
            hooks_dir: admin_dir.join("hooks"),
        }
    }

    pub fn hook_path(&self) -> PathBuf {
        self.hooks_dir.join(Self::NAME)
    }

    /// Text passed on the hook's stdin
    pub fn describe(packet: &CommitPacket, log_message: &str) -> String {
        let mut data = String::new();
        data.push_str(&format!("BASE: {}\n", packet.base_relpath()));
        data.push_str(&format!("LOG: {}\n", log_message));
        data.push_str("FILES:\n");
        for item in packet.sorted_items() {
            data.push_str(&format!("{} {}\n", item.flags.status_char(), item.repos_relpath));
        }
        if !packet.lock_tokens().is_empty() {
            data.push_str("LOCKS:\n");
            for (url, token) in packet.lock_tokens() {
                data.push_str(&format!("{} {}\n", url, token));
            }
        }
        data
    }

    fn run(&self, stdin_data: &str) -> Result<()> {
        let hook_path = self.hook_path();
        if !hook_path.exists() {
            return Ok(());
        }

        let mut child = Command::new(&hook_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("DSVN_WC", self.hooks_dir.parent().unwrap_or(Path::new(".")))
            .spawn()
            .map_err(|e| anyhow!("Failed to execute hook '{}': {}", Self::NAME, e))?;

        if let Some(mut stdin) = child.stdin.take() {
            // The script may exit without reading its input
            let _ = stdin.write_all(stdin_data.as_bytes());
        }

        let output = child
            .wait_with_output()
            .map_err(|e| anyhow!("Failed to wait for hook '{}': {}", Self::NAME, e))?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let msg = if !stderr.trim().is_empty() {
            stderr.to_string()
        } else if !stdout.trim().is_empty() {
            stdout.to_string()
        } else {
            format!(
                "Hook '{}' exited with code {}",
                Self::NAME,
                output.status.code().unwrap_or(-1)
            )
        };
        Err(anyhow!("Hook '{}' rejected the commit: {}", Self::NAME, msg.trim()))
    }
}

impl AdmissionRule for PreCommitHook {
    fn check(&self, packet: &CommitPacket, log_message: &str) -> Result<()> {
        self.run(&Self::describe(packet, log_message))
    }
}

/// Everything a caller can plug into a commit
pub struct CommitStrategies {
    pub log_message: Box<dyn LogMessageProvider>,
    pub admission: Vec<Box<dyn AdmissionRule>>,
}

impl CommitStrategies {
    pub fn new(log_message: impl LogMessageProvider + 'static) -> Self {
        Self {
            log_message: Box::new(log_message),
            admission: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: impl AdmissionRule + 'static) -> Self {
        self.admission.push(Box::new(rule));
        self
    }
}

impl Default for CommitStrategies {
    fn default() -> Self {
        Self::new(FixedMessage(String::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::WcWriteLock;
    use crate::packet::StateFlags;
    use crate::wc_db::WcDb;
    use dsvn_core::NodeKind;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn make_hook(admin_dir: &Path, script: &str) {
        let hooks_dir = admin_dir.join("hooks");
        fs::create_dir_all(&hooks_dir).unwrap();
        let hook_path = hooks_dir.join(PreCommitHook::NAME);
        fs::write(&hook_path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&hook_path, fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    fn packet(tmp: &TempDir) -> CommitPacket {
        let db = Arc::new(WcDb::open(tmp.path()).unwrap());
        let lock = WcWriteLock::acquire(db, tmp.path()).unwrap();
        let mut packet = CommitPacket::new(tmp.path(), lock);
        packet.insert(CommitItem {
            local_relpath: "a.txt".into(),
            repos_relpath: "trunk/a.txt".into(),
            url: "mem://r/trunk/a.txt".into(),
            revision: Some(1),
            copy_from: None,
            kind: NodeKind::File,
            flags: StateFlags::TEXT_MODIFIED,
            lock_token: None,
            prop_changes: Vec::new(),
            base_checksums: None,
            eol_style: None,
            spool: None,
        });
        packet.condense();
        packet
    }

    #[test]
    fn test_no_hook_allows() {
        let tmp = TempDir::new().unwrap();
        let packet = packet(&tmp);
        let hook = PreCommitHook::new(tmp.path());
        assert!(hook.check(&packet, "msg").is_ok());
    }

    #[test]
    fn test_describe() {
        let tmp = TempDir::new().unwrap();
        let packet = packet(&tmp);
        let data = PreCommitHook::describe(&packet, "fix typo");
        assert_eq!(data, "BASE: trunk\nLOG: fix typo\nFILES:\nM trunk/a.txt\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_hook_rejects() {
        let tmp = TempDir::new().unwrap();
        make_hook(tmp.path(), "#!/bin/sh\necho 'empty log message' >&2\nexit 1\n");
        let packet = packet(&tmp);
        let err = PreCommitHook::new(tmp.path())
            .check(&packet, "")
            .unwrap_err();
        assert!(err.to_string().contains("empty log message"));
    }

    #[cfg(unix)]
    #[test]
    fn test_hook_reads_stdin() {
        let tmp = TempDir::new().unwrap();
        make_hook(
            tmp.path(),
            "#!/bin/sh\ngrep -q '^M trunk/a.txt$' || { echo 'missing file' >&2; exit 1; }\n",
        );
        let packet = packet(&tmp);
        assert!(PreCommitHook::new(tmp.path()).check(&packet, "msg").is_ok());
    }

    #[test]
    fn test_log_message_providers() {
        assert_eq!(
            FixedMessage("hi".into()).log_message(&[]).unwrap(),
            Some("hi".to_string())
        );
        let abandon = |_: &[CommitItem]| -> Result<Option<String>> { Ok(None) };
        let strategies = CommitStrategies::new(abandon);
        assert_eq!(strategies.log_message.log_message(&[]).unwrap(), None);
    }
}

//! Content-addressed pristine text store
//!
//! Pristine texts live under `.dsvn/pristine/xx/rest`, keyed by the SHA-256
//! of their normal form. New texts are written into `.dsvn/tmp` through a
//! [`PristineStage`], which computes both checksums on the way, and are
//! moved into place atomically by [`PristineStore::install`].

use crate::error::{CommitError, Result};
use crate::wc_db::WcDb;
use dsvn_core::{ChecksumPair, ContentId, HashingWriter};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub struct PristineStore {
    dir: PathBuf,
    tmp_dir: PathBuf,
}

impl PristineStore {
    pub fn open(admin_dir: &Path) -> Result<Self> {
        let dir = admin_dir.join("pristine");
        let tmp_dir = admin_dir.join("tmp");
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(&tmp_dir)?;
        Ok(Self { dir, tmp_dir })
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    fn text_path(&self, id: &ContentId) -> PathBuf {
        let hex = id.to_hex();
        self.dir.join(&hex[..2]).join(&hex[2..])
    }

    /// Open a staging slot for a new text
    pub fn stage(&self) -> Result<PristineStage> {
        let path = self
            .tmp_dir
            .join(format!("{}.pristine", uuid::Uuid::new_v4()));
        let file = File::create(&path)?;
        Ok(PristineStage {
            path,
            writer: Some(HashingWriter::new(file)),
        })
    }

    /// Move a staged text into the store and index it. Identical texts are
    /// stored once.
    pub fn install(&self, mut stage: PristineStage, db: &WcDb) -> Result<ChecksumPair> {
        let writer = stage
            .writer
            .take()
            .ok_or_else(|| CommitError::Corrupt("pristine stage already consumed".into()))?;
        let size = writer.bytes_written();
        let (mut file, sums) = writer.finish();
        file.flush()?;
        file.sync_all()?;
        drop(file);

        let dest = self.text_path(&sums.sha256);
        if dest.exists() {
            fs::remove_file(&stage.path)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&stage.path, &dest)?;
        }
        db.insert_pristine(&sums, size)?;
        tracing::debug!("Installed pristine text {} ({} bytes)", sums.sha256, size);
        Ok(sums)
    }

    /// Store `data` in one step
    pub fn write(&self, data: &[u8], db: &WcDb) -> Result<ChecksumPair> {
        let mut stage = self.stage()?;
        stage.write_all(data)?;
        self.install(stage, db)
    }

    pub fn read(&self, id: &ContentId) -> Result<Vec<u8>> {
        match fs::read(self.text_path(id)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(CommitError::PristineNotFound(id.to_hex()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn contains(&self, id: &ContentId) -> bool {
        self.text_path(id).exists()
    }

    /// Remove leftover files in the temporary area
    pub fn clean_tmp(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.tmp_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Staging slot for one pristine text. The temporary file is removed on
/// drop unless the stage was installed.
pub struct PristineStage {
    path: PathBuf,
    writer: Option<HashingWriter<File>>,
}

impl Write for PristineStage {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.writer.as_mut() {
            Some(w) => w.write(buf),
            None => Err(io::Error::other("pristine stage already installed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for PristineStage {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PristineStore, WcDb) {
        let tmp = TempDir::new().unwrap();
        let store = PristineStore::open(tmp.path()).unwrap();
        let db = WcDb::open(tmp.path()).unwrap();
        (tmp, store, db)
    }

    #[test]
    fn test_install_and_read_back() {
        let (_tmp, store, db) = setup();
        let data = b"pristine text\n";
        let sums = store.write(data, &db).unwrap();

        assert_eq!(sums, ChecksumPair::from_data(data));
        assert!(store.contains(&sums.sha256));
        assert_eq!(store.read(&sums.sha256).unwrap(), data);
        assert_eq!(db.pristine_md5(&sums.sha256).unwrap(), Some(sums.md5));
    }

    #[test]
    fn test_duplicate_text_is_deduplicated() {
        let (_tmp, store, db) = setup();
        let a = store.write(b"same", &db).unwrap();
        let b = store.write(b"same", &db).unwrap();
        assert_eq!(a, b);
        assert_eq!(fs::read_dir(store.tmp_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_dropped_stage_leaves_nothing() {
        let (_tmp, store, _db) = setup();
        {
            let mut stage = store.stage().unwrap();
            stage.write_all(b"abandoned").unwrap();
        }
        assert_eq!(fs::read_dir(store.tmp_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_text() {
        let (_tmp, store, _db) = setup();
        let id = ContentId::from_data(b"never stored");
        assert!(matches!(store.read(&id), Err(CommitError::PristineNotFound(_))));
    }
}

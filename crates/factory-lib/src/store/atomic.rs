//! Write-temp-then-rename persistence
//!
//! Every file the factory persists goes through [`AtomicWriter`]: the content
//! is written to a temporary file in the destination directory and renamed
//! over the target on commit. A writer dropped before commit removes its
//! temporary file, so concurrent readers only ever see complete files.

use crate::error::{FactoryError, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Scoped temporary file that becomes `target` on commit
pub struct AtomicWriter {
    target: PathBuf,
    temp: NamedTempFile,
}

impl AtomicWriter {
    /// Open a temporary file next to `target`
    pub fn new(target: impl Into<PathBuf>) -> Result<Self> {
        let target = target.into();
        let dir = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let temp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(&dir)
            .map_err(|e| FactoryError::io(&dir, e))?;
        Ok(Self { target, temp })
    }

    pub fn write_all(&mut self, content: &[u8]) -> Result<()> {
        self.temp
            .write_all(content)
            .map_err(|e| FactoryError::io(self.temp.path(), e))
    }

    /// Rename over the target, replacing any existing file
    pub fn commit(mut self) -> Result<()> {
        self.temp
            .flush()
            .map_err(|e| FactoryError::io(self.temp.path(), e))?;
        self.temp
            .persist(&self.target)
            .map(|_| ())
            .map_err(|e| FactoryError::io(&self.target, e.error))
    }

    /// Rename onto the target only if it does not exist yet
    ///
    /// Returns `false`, leaving the existing file untouched, when the target
    /// is already present.
    pub fn commit_new(mut self) -> Result<bool> {
        self.temp
            .flush()
            .map_err(|e| FactoryError::io(self.temp.path(), e))?;
        match self.temp.persist_noclobber(&self.target) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(FactoryError::io(&self.target, e.error)),
        }
    }
}

/// Atomically replace `path` with `content`
pub fn write_atomic(path: impl AsRef<Path>, content: impl AsRef<[u8]>) -> Result<()> {
    let mut writer = AtomicWriter::new(path.as_ref())?;
    writer.write_all(content.as_ref())?;
    writer.commit()
}

/// Atomically create `path` with `content` unless it already exists
pub fn write_once(path: impl AsRef<Path>, content: impl AsRef<[u8]>) -> Result<bool> {
    let mut writer = AtomicWriter::new(path.as_ref())?;
    writer.write_all(content.as_ref())?;
    writer.commit_new()
}

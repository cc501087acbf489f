//! Private scratch directories for material that only exists in memory.
//!
//! Filename-based discovery needs real files. Uploaded content is written to
//! a fresh temporary directory that is removed when the [`ScratchDir`] is
//! dropped, on success and error paths alike.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

pub struct ScratchDir {
    dir: TempDir,
}

impl ScratchDir {
    pub fn new() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("certgate-").tempdir()?;
        debug!(path = %dir.path().display(), "Created scratch directory");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Writes `bytes` under the final component of `name` and returns the
    /// full path. Directory parts of `name` are ignored, so two names with
    /// the same final component collide; the second write fails with
    /// `AlreadyExists`.
    pub fn write(&self, name: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let file_name = Path::new(name)
            .file_name()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("invalid file name: {:?}", name))
            })?;

        let path = self.dir.path().join(file_name);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("duplicate file name: {:?}", file_name),
                ),
                _ => e,
            })?;
        file.write_all(bytes)?;
        Ok(path)
    }
}

impl std::fmt::Debug for ScratchDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchDir")
            .field("path", &self.dir.path())
            .finish()
    }
}

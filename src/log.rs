//! Append-only table file.

use crate::error::{Result, StoreError};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Suffix of the scratch file a rewrite goes through before it replaces the log.
const REWRITE_SUFFIX: &str = ".compact";

/// One table file: an append handle plus whole-file read and rewrite.
#[derive(Debug)]
pub(crate) struct LogFile {
    /// Path to the log file.
    path: PathBuf,
    /// Append handle, present while the owning store is open.
    writer: Option<File>,
    /// `fsync` after every append.
    sync_writes: bool,
}

impl LogFile {
    pub(crate) fn new(path: impl AsRef<Path>, sync_writes: bool) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: None,
            sync_writes,
        }
    }

    /// Create the file (and its parent directories) if it does not exist.
    ///
    /// Returns true when the file was freshly created.
    pub(crate) fn ensure_exists(&self) -> Result<bool> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the whole file. Invalid UTF-8 is replaced rather than rejected;
    /// the affected lines fail to parse and are dropped by the decoder.
    pub(crate) fn read_all(&self) -> Result<String> {
        let bytes = fs::read(&self.path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Open the append handle. No-op if already open.
    pub(crate) fn open(&mut self) -> Result<()> {
        if self.writer.is_none() {
            self.writer = Some(Self::open_append(&self.path)?);
        }
        Ok(())
    }

    pub(crate) fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Append `payload` and return once it has reached the file.
    ///
    /// On failure the file is truncated back to its previous length and the
    /// handle is released: nothing of a failed append may surface later, and
    /// the owner has to reopen (and replay) before appending again.
    pub(crate) fn append(&mut self, payload: &str) -> Result<()> {
        let Some(mut file) = self.writer.take() else {
            return Err(StoreError::InvalidOperation(format!(
                "{} is not open",
                self.path.display()
            )));
        };

        let len = file.metadata()?.len();
        let written = file.write_all(payload.as_bytes()).and_then(|_| {
            if self.sync_writes {
                file.sync_data()
            } else {
                Ok(())
            }
        });

        match written {
            Ok(()) => {
                self.writer = Some(file);
                Ok(())
            }
            Err(e) => {
                if let Err(truncate) = file.set_len(len) {
                    warn!(
                        path = %self.path.display(),
                        error = %truncate,
                        "Failed to roll back partial append"
                    );
                }
                Err(e.into())
            }
        }
    }

    /// Sync and release the append handle.
    pub(crate) fn close(&mut self) -> Result<()> {
        if let Some(file) = self.writer.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Replace the file's content with `content`.
    ///
    /// The new content goes to a scratch file first, is synced, and is then
    /// renamed over the log, so a failure at any point leaves either the old
    /// or the new file intact. An open append handle is re-pointed at the new
    /// file; if that fails the handle stays released. Returns the previous
    /// size in bytes.
    pub(crate) fn rewrite(&mut self, content: &str) -> Result<u64> {
        let before = fs::metadata(&self.path)?.len();
        let scratch = self.scratch_path()?;

        let written = File::create(&scratch).and_then(|mut file| {
            file.write_all(content.as_bytes())?;
            file.sync_all()
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&scratch);
            return Err(e.into());
        }

        // The old handle points at the file being replaced.
        let was_open = self.writer.take().is_some();
        if let Err(e) = fs::rename(&scratch, &self.path) {
            let _ = fs::remove_file(&scratch);
            if was_open {
                self.writer = Some(Self::open_append(&self.path)?);
            }
            return Err(e.into());
        }

        if was_open {
            self.writer = Some(Self::open_append(&self.path)?);
        }

        debug!(path = %self.path.display(), before, after = content.len(), "Log rewritten");
        Ok(before)
    }

    #[cfg(test)]
    pub(crate) fn replace_handle(&mut self, file: File) {
        self.writer = Some(file);
    }

    fn scratch_path(&self) -> Result<PathBuf> {
        let mut name = self
            .path
            .file_name()
            .ok_or_else(|| {
                StoreError::InvalidOperation(format!(
                    "{} does not name a file",
                    self.path.display()
                ))
            })?
            .to_os_string();
        name.push(REWRITE_SUFFIX);
        Ok(self.path.with_file_name(name))
    }

    fn open_append(path: &Path) -> Result<File> {
        Ok(OpenOptions::new().append(true).create(true).open(path)?)
    }
}

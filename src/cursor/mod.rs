//! Persistent ledger-version cursor.
//!
//! Stored as a plain-text integer. Writes go to a sibling temp file which is
//! then renamed over the target, so a crash mid-write leaves the previous
//! value intact. Only the monitor writes; the value never moves backwards
//! except through `reset`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum CursorError {
    #[error("failed to persist cursor to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cursor regression rejected: {requested} < {current}")]
    Regression { current: u64, requested: u64 },
}

pub struct CursorStore {
    path: PathBuf,
    current: u64,
    /// In-memory value not yet on disk (last write failed).
    dirty: bool,
}

impl CursorStore {
    /// Load the cursor from `path`, or start from `fallback` if the file is
    /// missing or unreadable.
    pub fn open(path: impl Into<PathBuf>, fallback: u64) -> Self {
        let path = path.into();
        let current = match fs::read_to_string(&path) {
            Ok(contents) => match contents.trim().parse::<u64>() {
                Ok(version) => {
                    info!(version = version, path = %path.display(), "loaded cursor");
                    version
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        fallback = fallback,
                        "cursor file is corrupt, using fallback"
                    );
                    fallback
                }
            },
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no cursor file, using fallback");
                fallback
            }
        };

        Self {
            path,
            current,
            dirty: false,
        }
    }

    pub fn get(&self) -> u64 {
        self.current
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the in-memory cursor is ahead of what is on disk.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Advance to `version`. Lower values are rejected.
    ///
    /// On a write failure the in-memory value still advances and stays
    /// authoritative; the next `set` retries the write.
    pub fn set(&mut self, version: u64) -> Result<(), CursorError> {
        if version < self.current {
            return Err(CursorError::Regression {
                current: self.current,
                requested: version,
            });
        }
        if version == self.current && !self.dirty {
            return Ok(());
        }
        self.current = version;
        self.persist()
    }

    /// Explicitly move the cursor to any value, including backwards.
    pub fn reset(&mut self, version: u64) -> Result<(), CursorError> {
        info!(from = self.current, to = version, "resetting cursor");
        self.current = version;
        self.persist()
    }

    fn persist(&mut self) -> Result<(), CursorError> {
        match write_atomic(&self.path, self.current) {
            Ok(()) => {
                self.dirty = false;
                Ok(())
            }
            Err(source) => {
                self.dirty = true;
                Err(CursorError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        }
    }
}

fn write_atomic(path: &Path, version: u64) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(version.to_string().as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

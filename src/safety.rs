//! Persistent safety marker.
//!
//! A small on-disk record consulted at startup to decide whether local
//! data can be trusted. While replication is active the stored seqno is
//! `-1`; a concrete seqno is only written at clean stop or snapshot
//! points. `safe == false` means data was mid-mutation when the marker
//! was written, so a restart must request a full snapshot regardless of
//! the seqno. Every mutator is durable before it returns.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::{SEQNO_UNDEFINED, Seqno};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyMarker {
    pub uuid: Uuid,
    pub seqno: Seqno,
    pub safe_to_bootstrap: bool,
    pub safe: bool,
    #[serde(default)]
    pub corrupt: bool,
}

impl Default for SafetyMarker {
    fn default() -> Self {
        Self {
            uuid: Uuid::nil(),
            seqno: SEQNO_UNDEFINED,
            safe_to_bootstrap: false,
            safe: true,
            corrupt: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SafetyError {
    #[error("safety file io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("safety file corrupted at {path:?}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub struct SafetyFile {
    path: PathBuf,
    marker: std::sync::Mutex<SafetyMarker>,
}

impl SafetyFile {
    /// Open an existing marker or start from the default (nil uuid,
    /// undefined seqno) when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SafetyError> {
        let path = path.into();
        let marker = match fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|source| SafetyError::Malformed {
                    path: path.clone(),
                    source,
                })?
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => SafetyMarker::default(),
            Err(source) => {
                return Err(SafetyError::Io {
                    path: path.clone(),
                    source,
                });
            }
        };
        Ok(Self {
            path,
            marker: std::sync::Mutex::new(marker),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> SafetyMarker {
        self.marker.lock().expect("safety marker lock").clone()
    }

    /// Record a clean point. Writes `safe = true` implicitly.
    pub fn set(
        &self,
        uuid: Uuid,
        seqno: Seqno,
        safe_to_bootstrap: bool,
    ) -> Result<(), SafetyError> {
        self.mutate(|marker| {
            marker.uuid = uuid;
            marker.seqno = seqno;
            marker.safe_to_bootstrap = safe_to_bootstrap;
            marker.safe = true;
        })
    }

    /// Must complete before any potentially-corrupting work begins.
    pub fn mark_unsafe(&self) -> Result<(), SafetyError> {
        self.mutate(|marker| marker.safe = false)
    }

    pub fn mark_safe(&self) -> Result<(), SafetyError> {
        self.mutate(|marker| marker.safe = true)
    }

    /// Terminal: local data needs manual recovery. Later mutators are
    /// ignored so the evidence survives until an operator intervenes.
    pub fn mark_corrupt(&self) -> Result<(), SafetyError> {
        let mut marker = self.marker.lock().expect("safety marker lock");
        if marker.corrupt {
            return Ok(());
        }
        tracing::error!("marking local state corrupt, manual recovery required");
        marker.corrupt = true;
        marker.safe = false;
        persist(&self.path, &marker)
    }

    fn mutate(&self, apply: impl FnOnce(&mut SafetyMarker)) -> Result<(), SafetyError> {
        let mut marker = self.marker.lock().expect("safety marker lock");
        if marker.corrupt {
            tracing::warn!("safety marker is corrupt, ignoring update");
            return Ok(());
        }
        let previous = marker.clone();
        apply(&mut marker);
        if *marker == previous {
            return Ok(());
        }
        persist(&self.path, &marker)
    }
}

/// Atomic replace: write a sibling temp file, fsync it, rename over the
/// target, fsync the directory. A crash at any point leaves either the
/// old or the new record, never a torn one.
fn persist(path: &Path, marker: &SafetyMarker) -> Result<(), SafetyError> {
    let io_err = |source| SafetyError::Io {
        path: path.to_path_buf(),
        source,
    };

    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).map_err(io_err)?;
    serde_json::to_writer_pretty(&mut file, marker).map_err(|source| SafetyError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;
    file.sync_all().map_err(io_err)?;
    drop(file);
    fs::rename(&tmp, path).map_err(io_err)?;

    #[cfg(unix)]
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::File::open(dir).and_then(|d| d.sync_all()).map_err(io_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn marker_path(dir: &TempDir) -> PathBuf {
        dir.path().join("state.json")
    }

    #[test]
    fn missing_file_starts_undefined() {
        let dir = TempDir::new().unwrap();
        let file = SafetyFile::open(marker_path(&dir)).unwrap();
        let marker = file.get();
        assert_eq!(marker, SafetyMarker::default());
        assert!(marker.uuid.is_nil());
        assert_eq!(marker.seqno, SEQNO_UNDEFINED);
    }

    #[test]
    fn set_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let uuid = Uuid::new_v4();
        {
            let file = SafetyFile::open(marker_path(&dir)).unwrap();
            file.set(uuid, 42, true).unwrap();
        }
        let file = SafetyFile::open(marker_path(&dir)).unwrap();
        let marker = file.get();
        assert_eq!(marker.uuid, uuid);
        assert_eq!(marker.seqno, 42);
        assert!(marker.safe_to_bootstrap);
        assert!(marker.safe);
    }

    #[test]
    fn mark_unsafe_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let uuid = Uuid::new_v4();
        {
            let file = SafetyFile::open(marker_path(&dir)).unwrap();
            file.set(uuid, 42, false).unwrap();
            file.mark_unsafe().unwrap();
        }
        // Reopen models a crash right after mark_unsafe returned.
        let file = SafetyFile::open(marker_path(&dir)).unwrap();
        let marker = file.get();
        assert!(!marker.safe);
        assert_eq!(marker.seqno, 42);

        file.mark_safe().unwrap();
        assert!(SafetyFile::open(marker_path(&dir)).unwrap().get().safe);
    }

    #[test]
    fn set_restores_safe() {
        let dir = TempDir::new().unwrap();
        let file = SafetyFile::open(marker_path(&dir)).unwrap();
        file.mark_unsafe().unwrap();
        file.set(Uuid::new_v4(), 7, false).unwrap();
        assert!(file.get().safe);
    }

    #[test]
    fn corrupt_is_terminal() {
        let dir = TempDir::new().unwrap();
        let uuid = Uuid::new_v4();
        let file = SafetyFile::open(marker_path(&dir)).unwrap();
        file.set(uuid, 9, false).unwrap();
        file.mark_corrupt().unwrap();

        file.set(Uuid::new_v4(), 100, true).unwrap();
        file.mark_safe().unwrap();

        let file = SafetyFile::open(marker_path(&dir)).unwrap();
        let marker = file.get();
        assert!(marker.corrupt);
        assert!(!marker.safe);
        assert_eq!(marker.uuid, uuid);
        assert_eq!(marker.seqno, 9);
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = marker_path(&dir);
        let file = SafetyFile::open(&path).unwrap();
        file.set(Uuid::new_v4(), 1, false).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}

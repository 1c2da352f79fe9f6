//! Write primitives shared by every on-disk structure.
//!
//! Readers must never observe a partially written file, so content is always
//! written to a sibling temporary file first and then published with a
//! single `rename` (replace) or `link` (create-if-absent).

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

pub(crate) fn ensure_directory(path: &Path) -> Result<(), StoreError> {
    if !path.is_dir() {
        fs::create_dir_all(path).map_err(|e| StoreError::CreateDirectory {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

/// Writes `bytes` to a fresh temp file next to `path` and fsyncs it.
fn write_temp(path: &Path, bytes: &[u8]) -> Result<PathBuf, StoreError> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }

    let tmp = temp_path_for(path);
    let write = || -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()
    };

    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StoreError::WriteFile {
            path: tmp.clone(),
            source: e,
        }
    })?;

    Ok(tmp)
}

/// Atomically replaces `path` with the JSON encoding of `value`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = write_temp(path, &bytes)?;

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StoreError::MoveFile {
            from: tmp.clone(),
            to: path.to_path_buf(),
            source: e,
        }
    })
}

/// Creates `path` with the JSON encoding of `value` only if it does not
/// exist yet. Returns false when another writer got there first.
///
/// The file appears fully written or not at all: content goes to a temp file
/// which is then hard-linked into place (`link` fails on an existing target).
pub fn create_json_exclusive<T: Serialize>(path: &Path, value: &T) -> Result<bool, StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = write_temp(path, &bytes)?;

    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);

    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(StoreError::WriteFile {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Exclusive-create of an empty-ish marker file (`O_CREAT | O_EXCL`).
pub fn create_marker(path: &Path, contents: &[u8]) -> Result<bool, StoreError> {
    if let Some(parent) = path.parent() {
        ensure_directory(parent)?;
    }

    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(contents)
                .and_then(|_| file.sync_all())
                .map_err(|e| StoreError::WriteFile {
                    path: path.to_path_buf(),
                    source: e,
                })?;
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(StoreError::WriteFile {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Renames `src` to `dst`; both must live on the same filesystem.
pub fn move_file(src: &Path, dst: &Path) -> Result<(), StoreError> {
    fs::rename(src, dst).map_err(|e| StoreError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source: e,
    })
}

/// Removes `path`; a file that is already gone is not an error.
pub fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::RemoveFile {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Reads and decodes `path`. `Ok(None)` when the file does not exist;
/// [`StoreError::Corrupt`] when it exists but does not decode.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StoreError::ReadFile {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

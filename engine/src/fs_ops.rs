//! Filesystem operations module.
//!
//! This module provides the small amount of filesystem work the engine does
//! itself (the external tools move the data):
//! - Sizing source files before a sender starts
//! - Measuring what a receiver wrote, file or directory tree
//! - Creating destination directories
//! - Enumerating files for directory checksums

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::EngineError;

/// Size of a sender's source file.
///
/// # Errors
/// Returns `SourceNotFound` if the file does not exist and `ReadError` for
/// any other metadata failure.
pub fn file_size(path: &Path) -> Result<u64, EngineError> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => tree_size(path),
        Ok(metadata) => Ok(metadata.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(EngineError::SourceNotFound {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(EngineError::ReadError {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Total size of all regular files below `root`.
///
/// # Errors
/// Returns `ReadError` if the root cannot be read. Unreadable entries below
/// the root are skipped.
pub fn tree_size(root: &Path) -> Result<u64, EngineError> {
    fn recurse(path: &Path) -> u64 {
        let Ok(entries) = fs::read_dir(path) else {
            return 0;
        };
        entries
            .filter_map(Result::ok)
            .map(|entry| match entry.metadata() {
                Ok(metadata) if metadata.is_dir() => recurse(&entry.path()),
                Ok(metadata) => metadata.len(),
                Err(_) => 0,
            })
            .sum()
    }

    fs::read_dir(root).map_err(|e| EngineError::ReadError {
        path: root.to_path_buf(),
        source: e,
    })?;
    Ok(recurse(root))
}

/// What a receiver has written so far: file length or tree size.
///
/// Returns `None` if the destination does not exist (yet).
pub fn transferred_size(path: &Path) -> Option<u64> {
    let metadata = fs::metadata(path).ok()?;
    if metadata.is_dir() {
        tree_size(path).ok()
    } else {
        Some(metadata.len())
    }
}

/// All regular files below `root`, sorted.
///
/// # Errors
/// Returns `ReadError` if any directory in the tree cannot be read.
pub fn list_files(root: &Path) -> Result<Vec<PathBuf>, EngineError> {
    fn recurse(path: &Path, files: &mut Vec<PathBuf>) -> Result<(), EngineError> {
        let read_error = |e| EngineError::ReadError {
            path: path.to_path_buf(),
            source: e,
        };
        for entry in fs::read_dir(path).map_err(read_error)? {
            let entry = entry.map_err(read_error)?;
            let entry_path = entry.path();
            if entry.file_type().map_err(read_error)?.is_dir() {
                recurse(&entry_path, files)?;
            } else {
                files.push(entry_path);
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    recurse(root, &mut files)?;
    files.sort();
    Ok(files)
}

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// # Errors
/// Returns `WriteError` if the parent exists but is not a directory or
/// cannot be created.
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), EngineError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::WriteError {
            path: parent.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "Parent path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(parent).map_err(|e| EngineError::WriteError {
                path: parent.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(EngineError::WriteError {
            path: parent.to_path_buf(),
            source: e,
        }),
    }
}

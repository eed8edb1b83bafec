//! JSON file persistence shared by the file-backed stores.
//!
//! Writes go to a `.tmp` sibling and are renamed into place, so a reader
//! never observes a half-written session or checkpoint.

use std::io;
use std::path::{Path, PathBuf};

use crate::error::StoreError;

/// Atomically write `data` as pretty-printed JSON, creating parent directories.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write raw bytes to `path`.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize JSON. Returns `Ok(None)` if the file does not exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// All `*.json` files directly under `dir`, sorted by name. A missing
/// directory yields an empty list.
pub fn list_json_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Map an I/O failure at `path` into a store error.
pub fn store_error(path: &Path, err: io::Error) -> StoreError {
    if err.kind() == io::ErrorKind::InvalidData {
        StoreError::Corrupt {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    } else {
        StoreError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        count: u32,
    }

    #[test]
    fn test_atomic_write_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("record.json");
        let data = Record {
            name: "hello".into(),
            count: 42,
        };

        atomic_write_json(&path, &data).unwrap();
        let loaded: Option<Record> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(data));
        assert!(!dir.path().join("nested").join("record.json.tmp").exists());
    }

    #[test]
    fn test_load_json_missing_file() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<Record> = load_json(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_load_json_corrupt_maps_to_corrupt_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = load_json::<Record>(&path).unwrap_err();
        assert!(matches!(store_error(&path, err), StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_list_json_files() {
        let dir = TempDir::new().unwrap();
        assert!(list_json_files(&dir.path().join("missing")).unwrap().is_empty());
        atomic_write(&dir.path().join("b.json"), b"{}").unwrap();
        atomic_write(&dir.path().join("a.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        let files = list_json_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.json", "b.json"]);
    }
}

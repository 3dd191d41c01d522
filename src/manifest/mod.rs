//! Directory manifests.
//!
//! A [`Manifest`] is a snapshot of one directory tree: every visible regular
//! file keyed by its `/`-separated relative path, plus the set of visible
//! empty directories. Manifests are exchanged over the wire as compressed
//! JSON and optionally persisted between runs so unchanged files keep their
//! digests without being re-read.

pub mod diff;
pub mod gitignore;
pub mod scanner;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use diff::{compute_changes, ChangeSet};
pub use gitignore::GitignoreSet;
pub use scanner::{generate_manifest, ScanOptions};

/// One regular file at scan time.
///
/// `md5` is the lowercase-hex content digest, or `None` when quick mode ran
/// and no cached digest was available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    pub last_modified: i64,
    pub md5: Option<String>,
}

/// Snapshot of one directory tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub files: BTreeMap<String, FileRecord>,
    #[serde(rename = "emptyDirectories", default)]
    pub empty_dirs: BTreeSet<String>,
}

impl Manifest {
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn empty_dir_count(&self) -> usize {
        self.empty_dirs.len()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a persisted manifest; `None` when the file is missing or stale
    /// beyond parsing (a cache miss, not an error).
    pub fn load_cached(path: &Path) -> Option<Self> {
        let json = std::fs::read_to_string(path).ok()?;
        match Self::from_json(&json) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable manifest cache");
                None
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        let mut manifest = Manifest::default();
        manifest.files.insert(
            "src/a.rs".into(),
            FileRecord {
                path: "src/a.rs".into(),
                size: 120,
                last_modified: 1_700_000_000_000,
                md5: Some("d41d8cd98f00b204e9800998ecf8427e".into()),
            },
        );
        manifest.files.insert(
            "notes.txt".into(),
            FileRecord {
                path: "notes.txt".into(),
                size: 7,
                last_modified: 1_700_000_000_500,
                md5: None,
            },
        );
        manifest.empty_dirs.insert("empty/dir".into());
        manifest
    }

    #[test]
    fn json_round_trip() {
        let manifest = sample();
        let json = manifest.to_json().unwrap();
        assert_eq!(Manifest::from_json(&json).unwrap(), manifest);
        // Re-serialisation of the parsed form is byte-identical: key order is
        // deterministic.
        let reparsed = Manifest::from_json(&json).unwrap();
        assert_eq!(reparsed.to_json().unwrap(), json);
    }

    #[test]
    fn json_uses_wire_field_names() {
        let json = sample().to_json().unwrap();
        assert!(json.contains("\"lastModified\""));
        assert!(json.contains("\"emptyDirectories\""));
        assert!(json.contains("\"md5\": null"));
    }

    #[test]
    fn empty_dirs_default_when_absent() {
        let manifest = Manifest::from_json(r#"{"files": {}}"#).unwrap();
        assert_eq!(manifest.empty_dir_count(), 0);
    }

    #[test]
    fn save_and_load_cached() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("manifest.json");
        let manifest = sample();
        manifest.save(&path).unwrap();
        assert_eq!(Manifest::load_cached(&path), Some(manifest));
        assert_eq!(Manifest::load_cached(&dir.path().join("missing.json")), None);
    }
}

//! Change-set computation between a local and a remote manifest.
//!
//! The local side is authoritative: the diff lists what must flow to the
//! remote (sends, directory creates) and, in strict mode, what the remote
//! must drop (file and empty-directory deletes).

use crate::manifest::{FileRecord, Manifest};

/// Everything one sync round has to do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// Files present locally and missing or different remotely, in manifest
    /// (path) order.
    pub to_send: Vec<FileRecord>,
    /// Empty directories to create remotely.
    pub empty_dirs_to_create: Vec<String>,
    /// Remote files absent locally (strict mode only).
    pub to_delete: Vec<String>,
    /// Remote empty directories absent locally, deepest first (strict mode
    /// only).
    pub empty_dirs_to_delete: Vec<String>,
}

impl ChangeSet {
    pub fn total_operations(&self) -> usize {
        self.to_send.len()
            + self.empty_dirs_to_create.len()
            + self.to_delete.len()
            + self.empty_dirs_to_delete.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_operations() == 0
    }
}

/// Two records describe the same content when their digests agree; without
/// two digests to compare, identical size and mtime stand in.
fn records_match(local: &FileRecord, remote: &FileRecord) -> bool {
    match (&local.md5, &remote.md5) {
        (Some(a), Some(b)) => a == b,
        _ => local.size == remote.size && local.last_modified == remote.last_modified,
    }
}

/// Diff `local` against `remote` per the sender-authoritative rules.
pub fn compute_changes(local: &Manifest, remote: &Manifest, strict: bool) -> ChangeSet {
    let to_send = local
        .files
        .values()
        .filter(|record| {
            remote
                .files
                .get(&record.path)
                .map_or(true, |other| !records_match(record, other))
        })
        .cloned()
        .collect();

    let empty_dirs_to_create = local
        .empty_dirs
        .iter()
        .filter(|dir| !remote.empty_dirs.contains(*dir))
        .cloned()
        .collect();

    let (to_delete, empty_dirs_to_delete) = if strict {
        let files = remote
            .files
            .keys()
            .filter(|path| !local.files.contains_key(*path))
            .cloned()
            .collect();
        let mut dirs: Vec<String> = remote
            .empty_dirs
            .iter()
            .filter(|dir| !local.empty_dirs.contains(*dir))
            .cloned()
            .collect();
        // Deepest first, so children are gone before their parents.
        dirs.sort_by(|a, b| b.len().cmp(&a.len()));
        (files, dirs)
    } else {
        (Vec::new(), Vec::new())
    };

    ChangeSet {
        to_send,
        empty_dirs_to_create,
        to_delete,
        empty_dirs_to_delete,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, size: u64, mtime: i64, md5: Option<&str>) -> FileRecord {
        FileRecord {
            path: path.into(),
            size,
            last_modified: mtime,
            md5: md5.map(str::to_owned),
        }
    }

    fn manifest(files: Vec<FileRecord>, empty_dirs: Vec<&str>) -> Manifest {
        Manifest {
            files: files.into_iter().map(|r| (r.path.clone(), r)).collect(),
            empty_dirs: empty_dirs.into_iter().map(str::to_owned).collect(),
        }
    }

    #[test]
    fn missing_remote_file_is_sent() {
        let local = manifest(vec![record("a.txt", 5, 100, Some("aa"))], vec![]);
        let remote = manifest(vec![], vec![]);
        let changes = compute_changes(&local, &remote, false);
        assert_eq!(changes.to_send.len(), 1);
        assert_eq!(changes.to_send[0].path, "a.txt");
    }

    #[test]
    fn matching_digests_suppress_send_despite_metadata() {
        let local = manifest(vec![record("a.txt", 5, 100, Some("same"))], vec![]);
        let remote = manifest(vec![record("a.txt", 5, 999, Some("same"))], vec![]);
        assert!(compute_changes(&local, &remote, false).is_empty());
    }

    #[test]
    fn differing_digests_force_send_despite_metadata() {
        let local = manifest(vec![record("a.txt", 5, 100, Some("aaa"))], vec![]);
        let remote = manifest(vec![record("a.txt", 5, 100, Some("bbb"))], vec![]);
        assert_eq!(compute_changes(&local, &remote, false).to_send.len(), 1);
    }

    #[test]
    fn incomparable_digests_fall_back_to_metadata() {
        let local = manifest(vec![record("a.txt", 5, 100, None)], vec![]);
        let same = manifest(vec![record("a.txt", 5, 100, Some("x"))], vec![]);
        let different = manifest(vec![record("a.txt", 6, 100, Some("x"))], vec![]);

        assert!(compute_changes(&local, &same, false).is_empty());
        assert_eq!(compute_changes(&local, &different, false).to_send.len(), 1);
    }

    #[test]
    fn strict_mode_deletes_extraneous_entries() {
        let local = manifest(vec![record("keep.txt", 1, 1, Some("k"))], vec![]);
        let remote = manifest(
            vec![
                record("keep.txt", 1, 1, Some("k")),
                record("gone.txt", 2, 2, Some("g")),
            ],
            vec!["old"],
        );

        let relaxed = compute_changes(&local, &remote, false);
        assert!(relaxed.to_delete.is_empty());
        assert!(relaxed.empty_dirs_to_delete.is_empty());

        let strict = compute_changes(&local, &remote, true);
        assert_eq!(strict.to_delete, vec!["gone.txt"]);
        assert_eq!(strict.empty_dirs_to_delete, vec!["old"]);
    }

    #[test]
    fn empty_dir_deletes_are_deepest_first() {
        let local = manifest(vec![], vec![]);
        let remote = manifest(vec![], vec!["a", "a/b/c", "a/b"]);
        let changes = compute_changes(&local, &remote, true);
        assert_eq!(changes.empty_dirs_to_delete, vec!["a/b/c", "a/b", "a"]);
    }

    #[test]
    fn empty_dirs_to_create_excludes_existing() {
        let local = manifest(vec![], vec!["fresh", "shared"]);
        let remote = manifest(vec![], vec!["shared"]);
        let changes = compute_changes(&local, &remote, false);
        assert_eq!(changes.empty_dirs_to_create, vec!["fresh"]);
    }

    #[test]
    fn diff_of_equal_manifests_is_empty() {
        let m = manifest(
            vec![
                record("a", 1, 1, Some("a")),
                record("b", 2, 2, None),
            ],
            vec!["d"],
        );
        assert!(compute_changes(&m, &m.clone(), true).is_empty());
    }
}

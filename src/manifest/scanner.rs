//! Manifest generation.
//!
//! Walks a directory tree, filters hidden and gitignored entries, and builds
//! a [`Manifest`]. Content digests are computed on a bounded worker pool and
//! reused from a prior manifest whenever a file's size and mtime are
//! unchanged, so incremental runs only hash what actually changed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use md5::{Digest, Md5};
use walkdir::WalkDir;

use crate::error::{Result, SyncError};
use crate::manifest::{FileRecord, GitignoreSet, Manifest};

const HASH_CHUNK: usize = 8192;

/// Pluggable digest function; tests inject counters.
pub type Hasher = Arc<dyn Fn(&Path) -> io::Result<String> + Send + Sync>;

/// Options controlling one manifest scan.
#[derive(Clone, Default)]
pub struct ScanOptions {
    /// Exclude entries matched by `.gitignore` files (and the `.gitignore`
    /// files themselves).
    pub respect_gitignore: bool,
    /// Skip content hashing; records carry no digest unless cached.
    pub quick_mode: bool,
    /// Prior manifest for digest reuse, overriding any persisted cache.
    pub previous: Option<Manifest>,
    /// Persisted cache location, read for warm starts and rewritten after
    /// the scan when `persist` is set.
    pub cache_path: Option<PathBuf>,
    pub persist: bool,
    /// Worker count for hashing; defaults to `max(2, cpu count)`.
    pub hash_workers: Option<usize>,
    /// Digest override for tests.
    pub hasher: Option<Hasher>,
}

impl ScanOptions {
    fn effective_workers(&self) -> usize {
        self.hash_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
                .max(2)
        })
    }
}

/// Streamed MD5 of one file, lowercase hex.
pub fn md5_file(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut chunk = [0u8; HASH_CHUNK];
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

struct HashJob {
    rel: String,
    path: PathBuf,
    size: u64,
    modified: i64,
}

/// Scan `root` and build its manifest. Blocking; callers on the runtime wrap
/// this in `spawn_blocking`.
pub fn generate_manifest(root: &Path, options: &ScanOptions) -> Result<Manifest> {
    if !root.is_dir() {
        return Err(SyncError::Config(format!(
            "invalid sync directory: {}",
            root.display()
        )));
    }

    let previous = match &options.previous {
        Some(manifest) => Some(manifest.clone()),
        None => options
            .cache_path
            .as_deref()
            .and_then(Manifest::load_cached),
    };
    let no_cache = BTreeMap::new();
    let cached_files: &BTreeMap<String, FileRecord> =
        previous.as_ref().map(|m| &m.files).unwrap_or(&no_cache);

    let gitignore = if options.respect_gitignore {
        let set = GitignoreSet::load(root)?;
        if set.is_empty() {
            None
        } else {
            Some(set)
        }
    } else {
        None
    };

    let mut files: BTreeMap<String, FileRecord> = BTreeMap::new();
    let mut dirs: BTreeSet<String> = BTreeSet::new();
    let mut dir_has_children: HashMap<String, bool> = HashMap::new();
    let mut hash_jobs: Vec<HashJob> = Vec::new();

    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        if entry.depth() == 0 {
            return true;
        }
        if is_platform_hidden(entry.path()) {
            return false;
        }
        if let Some(matcher) = &gitignore {
            if let Some(rel) = relative_path(root, entry.path()) {
                if matcher.is_ignored(&rel, entry.file_type().is_dir()) {
                    return false;
                }
            }
        }
        true
    });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            // Entries that vanish or deny access mid-walk are dropped.
            Err(e) => {
                tracing::debug!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }
        let Some(rel) = relative_path(root, entry.path()) else {
            continue;
        };

        if entry.file_type().is_dir() {
            dirs.insert(rel.clone());
            dir_has_children.entry(rel.clone()).or_insert(false);
            mark_parent_has_child(&rel, &mut dir_has_children);
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        if gitignore.is_some() && rel.ends_with(".gitignore") {
            continue;
        }

        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                tracing::debug!(path = %rel, error = %e, "file vanished during scan");
                continue;
            }
        };
        let size = meta.len();
        let modified = mtime_millis(&meta);

        let cached = cached_files.get(&rel);
        if let Some(cached_digest) = reusable_digest(cached, size, modified) {
            files.insert(
                rel.clone(),
                FileRecord {
                    path: rel.clone(),
                    size,
                    last_modified: modified,
                    md5: Some(cached_digest.to_string()),
                },
            );
        } else if options.quick_mode {
            files.insert(
                rel.clone(),
                FileRecord {
                    path: rel.clone(),
                    size,
                    last_modified: modified,
                    md5: None,
                },
            );
        } else {
            hash_jobs.push(HashJob {
                rel: rel.clone(),
                path: entry.path().to_path_buf(),
                size,
                modified,
            });
        }
        mark_parent_has_child(&rel, &mut dir_has_children);
    }

    if !hash_jobs.is_empty() {
        let hasher: Hasher = options.hasher.clone().unwrap_or_else(|| Arc::new(md5_file));
        for (rel, record) in run_hash_pool(hash_jobs, hasher, options.effective_workers())? {
            files.insert(rel, record);
        }
    }

    let empty_dirs: BTreeSet<String> = dirs
        .into_iter()
        .filter(|dir| !dir_has_children.get(dir).copied().unwrap_or(false))
        .collect();

    let manifest = Manifest { files, empty_dirs };

    if options.persist {
        if let Some(cache_path) = &options.cache_path {
            manifest.save(cache_path)?;
        }
    }

    Ok(manifest)
}

/// Hash `jobs` on a bounded pool of worker threads. Any I/O failure aborts
/// the scan and propagates.
fn run_hash_pool(
    jobs: Vec<HashJob>,
    hasher: Hasher,
    workers: usize,
) -> Result<Vec<(String, FileRecord)>> {
    let results = Mutex::new(Vec::with_capacity(jobs.len()));
    let first_error: Mutex<Option<io::Error>> = Mutex::new(None);
    let next = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for _ in 0..workers.min(jobs.len()) {
            scope.spawn(|| loop {
                let index = next.fetch_add(1, Ordering::SeqCst);
                let Some(job) = jobs.get(index) else { break };
                if first_error.lock().unwrap().is_some() {
                    break;
                }
                match hasher(&job.path) {
                    Ok(digest) => results.lock().unwrap().push((
                        job.rel.clone(),
                        FileRecord {
                            path: job.rel.clone(),
                            size: job.size,
                            last_modified: job.modified,
                            md5: Some(digest),
                        },
                    )),
                    Err(e) => {
                        let mut slot = first_error.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                        break;
                    }
                }
            });
        }
    });

    if let Some(e) = first_error.into_inner().unwrap() {
        return Err(SyncError::Io(e));
    }
    Ok(results.into_inner().unwrap())
}

fn reusable_digest<'a>(cached: Option<&'a FileRecord>, size: u64, modified: i64) -> Option<&'a str> {
    let cached = cached?;
    let digest = cached.md5.as_deref()?;
    (cached.size == size && cached.last_modified == modified).then_some(digest)
}

fn mark_parent_has_child(rel: &str, dir_has_children: &mut HashMap<String, bool>) {
    let parent = match rel.rfind('/') {
        Some(idx) => &rel[..idx],
        None => "",
    };
    dir_has_children.insert(parent.to_string(), true);
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let s = rel.to_string_lossy().replace('\\', "/");
    (!s.is_empty()).then_some(s)
}

fn mtime_millis(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Only DOS-hidden entries are skipped; Unix dotfiles are visible, matching
/// the wire peer's view of the tree.
#[cfg(windows)]
fn is_platform_hidden(path: &Path) -> bool {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
    std::fs::metadata(path)
        .map(|m| m.file_attributes() & FILE_ATTRIBUTE_HIDDEN != 0)
        .unwrap_or(false)
}

#[cfg(not(windows))]
fn is_platform_hidden(_path: &Path) -> bool {
    false
}

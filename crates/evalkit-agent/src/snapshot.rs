//! Directory snapshots
//!
//! Agents edit the project directory directly, so their output is recovered by
//! fingerprinting the tree before and after the run and diffing the two.
//! A file counts as changed only when its content hash differs; touching a
//! file without changing it never shows up as an edit. Deletions are ignored.

use evalkit_core::{EvalError, Result};
use glob::{MatchOptions, Pattern};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;
use walkdir::WalkDir;

/// Fingerprint of one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFingerprint {
    /// Hex-encoded SHA-256 of the content
    pub hash: String,
    pub modified: Option<SystemTime>,
}

#[derive(Debug, Clone)]
struct SnapshotEntry {
    fingerprint: FileFingerprint,
    content: String,
}

/// Content fingerprint of every non-ignored file under a root
#[derive(Debug, Clone)]
pub struct DirectorySnapshot {
    root: PathBuf,
    files: BTreeMap<String, SnapshotEntry>,
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compiled set of ignore globs, matched against `/`-separated relative paths
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    patterns: Vec<Pattern>,
}

impl IgnoreSet {
    pub fn new<S: AsRef<str>>(globs: &[S]) -> Result<Self> {
        let patterns = globs
            .iter()
            .map(|g| {
                Pattern::new(g.as_ref()).map_err(|e| {
                    EvalError::Config(format!("Invalid ignore pattern '{}': {}", g.as_ref(), e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_ignored(&self, relative: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| p.matches_with(relative, MATCH_OPTIONS))
    }

    /// A directory is skipped when anything directly inside it would be ignored
    /// by a `dir/**`-style pattern.
    fn is_ignored_dir(&self, relative: &str) -> bool {
        let probe = format!("{}/\u{0}", relative);
        self.is_ignored(relative) || self.is_ignored(&probe)
    }
}

impl DirectorySnapshot {
    /// Fingerprint every file under `root` not matching `ignore_globs`
    pub fn capture<S: AsRef<str>>(root: &Path, ignore_globs: &[S]) -> Result<Self> {
        let ignore = IgnoreSet::new(ignore_globs)?;
        let mut files = BTreeMap::new();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 || !entry.file_type().is_dir() {
                    return true;
                }
                match relative_key(root, entry.path()) {
                    Some(rel) => !ignore.is_ignored_dir(&rel),
                    None => true,
                }
            });

        for entry in walker {
            let entry = entry.map_err(|e| EvalError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let Some(rel) = relative_key(root, entry.path()) else {
                continue;
            };
            if ignore.is_ignored(&rel) {
                continue;
            }

            let bytes = std::fs::read(entry.path())?;
            let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
            let fingerprint = FileFingerprint {
                hash: hex::encode(Sha256::digest(&bytes)),
                modified,
            };
            files.insert(
                rel,
                SnapshotEntry {
                    fingerprint,
                    content: String::from_utf8_lossy(&bytes).into_owned(),
                },
            );
        }

        debug!("Captured snapshot of {} ({} files)", root.display(), files.len());

        Ok(Self {
            root: root.to_path_buf(),
            files,
        })
    }

    /// [`capture`](Self::capture) on the blocking thread pool; the walk reads
    /// and hashes every file.
    pub async fn capture_in_background(root: &Path, ignore_globs: &[String]) -> Result<Self> {
        let root = root.to_path_buf();
        let ignore_globs = ignore_globs.to_vec();
        tokio::task::spawn_blocking(move || Self::capture(&root, &ignore_globs))
            .await
            .map_err(|e| EvalError::Internal(format!("snapshot task failed: {}", e)))?
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn fingerprint(&self, relative: &str) -> Option<&FileFingerprint> {
        self.files.get(relative).map(|e| &e.fingerprint)
    }

    /// Files of `self` that are new or whose content differs from `before`.
    ///
    /// Returns absolute paths together with the content captured in `self`.
    pub fn changed_or_added(&self, before: &DirectorySnapshot) -> Vec<(PathBuf, String)> {
        self.files
            .iter()
            .filter(|(rel, entry)| match before.files.get(*rel) {
                Some(previous) => previous.fingerprint.hash != entry.fingerprint.hash,
                None => true,
            })
            .map(|(rel, entry)| (self.root.join(rel), entry.content.clone()))
            .collect()
    }
}

/// Diff two snapshots of the same root
pub fn diff(before: &DirectorySnapshot, after: &DirectorySnapshot) -> Vec<(PathBuf, String)> {
    after.changed_or_added(before)
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

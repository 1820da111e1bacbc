//! Directory snapshots.
//!
//! The scanner walks a subtree depth-first and produces a
//! [`DirectorySnapshot`]: an ordered map of relative path to metadata,
//! plus structured skip reasons and the per-entry errors the walk
//! survived. An incremental variant reuses entries (including their
//! checksums) from a previous snapshot when size and mtime still match.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::control::CancelFlag;
use crate::error::{Error, Result};
use crate::filter::PathFilter;

/// Metadata for one scanned entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub relative_path: String,
    pub size: u64,
    pub modified_time: DateTime<Utc>,
    pub created_time: DateTime<Utc>,
    pub permissions: u32,
    pub is_directory: bool,
    pub is_symlink: bool,
    pub checksum: Option<String>,
}

impl FileMetadata {
    /// Absolute seconds between the two modification times.
    pub fn mtime_delta_secs(&self, other: &FileMetadata) -> f64 {
        let delta = self.modified_time - other.modified_time;
        (delta.num_milliseconds() as f64 / 1000.0).abs()
    }
}

/// Why an entry was dropped from the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    TooLarge,
    Excluded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedEntry {
    pub relative_path: String,
    pub reason: SkipReason,
}

/// Point-in-time view of a filesystem subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectorySnapshot {
    pub root_path: PathBuf,
    /// Ordered by relative path for deterministic enumeration.
    pub files: BTreeMap<String, FileMetadata>,
    #[serde(default)]
    pub skipped: Vec<SkippedEntry>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl DirectorySnapshot {
    pub fn empty(root_path: PathBuf) -> Self {
        Self {
            root_path,
            files: BTreeMap::new(),
            skipped: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, relative_path: &str) -> Option<&FileMetadata> {
        self.files.get(relative_path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn absolute(&self, relative_path: &str) -> PathBuf {
        self.root_path.join(relative_path)
    }

    /// Total bytes of regular files in the snapshot.
    pub fn total_bytes(&self) -> u64 {
        self.files
            .values()
            .filter(|m| !m.is_directory)
            .map(|m| m.size)
            .sum()
    }
}

/// Scan behaviour knobs.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub follow_symlinks: bool,
    pub max_file_size: Option<u64>,
    /// Seconds of mtime drift tolerated by the incremental fast-path.
    pub time_tolerance: f64,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            follow_symlinks: false,
            max_file_size: None,
            time_tolerance: 1.0,
        }
    }
}

pub struct Scanner {
    options: ScanOptions,
    filter: PathFilter,
}

impl Scanner {
    pub fn new(options: ScanOptions, filter: PathFilter) -> Self {
        Self { options, filter }
    }

    pub fn with_defaults() -> Self {
        Self::new(ScanOptions::default(), PathFilter::empty())
    }

    /// Walk `root` depth-first into a fresh snapshot.
    pub async fn scan(&self, root: &Path, cancel: &CancelFlag) -> Result<DirectorySnapshot> {
        self.walk(root, None, cancel).await
    }

    /// Walk `root`, reusing entries from `previous` whose size matches
    /// exactly and whose mtime is within the configured tolerance. The
    /// reused entry keeps its checksum, which is what makes repeated
    /// scans of a quiet tree cheap.
    pub async fn incremental_scan(
        &self,
        root: &Path,
        previous: &DirectorySnapshot,
        cancel: &CancelFlag,
    ) -> Result<DirectorySnapshot> {
        self.walk(root, Some(previous), cancel).await
    }

    async fn walk(
        &self,
        root: &Path,
        previous: Option<&DirectorySnapshot>,
        cancel: &CancelFlag,
    ) -> Result<DirectorySnapshot> {
        let root_meta = tokio::fs::metadata(root)
            .await
            .map_err(|_| Error::NotFound(root.to_path_buf()))?;
        if !root_meta.is_dir() {
            return Err(Error::EnumerationFailed {
                path: root.to_path_buf(),
                message: "not a directory".to_owned(),
            });
        }

        let mut snapshot = DirectorySnapshot::empty(root.to_path_buf());
        let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

        while let Some(dir) = pending.pop() {
            cancel.check()?;
            let mut reader = match tokio::fs::read_dir(&dir).await {
                Ok(reader) => reader,
                Err(e) if dir == root => {
                    return Err(Error::EnumerationFailed {
                        path: dir,
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    snapshot.errors.push(format!("{}: {e}", dir.display()));
                    continue;
                }
            };

            loop {
                cancel.check()?;
                let entry = match reader.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        snapshot.errors.push(format!("{}: {e}", dir.display()));
                        break;
                    }
                };
                let path = entry.path();
                let rel = match relative_key(root, &path) {
                    Some(rel) => rel,
                    None => continue,
                };
                if self.filter.is_excluded(&rel) {
                    snapshot.skipped.push(SkippedEntry {
                        relative_path: rel,
                        reason: SkipReason::Excluded,
                    });
                    continue;
                }

                let symlink_meta = match tokio::fs::symlink_metadata(&path).await {
                    Ok(meta) => meta,
                    Err(e) => {
                        snapshot.errors.push(format!("{}: {e}", path.display()));
                        continue;
                    }
                };
                let is_symlink = symlink_meta.file_type().is_symlink();
                if is_symlink && !self.options.follow_symlinks {
                    snapshot
                        .files
                        .insert(rel.clone(), metadata_of(&rel, &symlink_meta, true));
                    continue;
                }
                let meta = if is_symlink {
                    match tokio::fs::metadata(&path).await {
                        Ok(meta) => meta,
                        Err(e) => {
                            snapshot.errors.push(format!("{}: {e}", path.display()));
                            continue;
                        }
                    }
                } else {
                    symlink_meta
                };

                if meta.is_dir() {
                    snapshot
                        .files
                        .insert(rel.clone(), metadata_of(&rel, &meta, false));
                    pending.push(path);
                    continue;
                }

                if let Some(cap) = self.options.max_file_size {
                    if meta.len() > cap {
                        snapshot.skipped.push(SkippedEntry {
                            relative_path: rel,
                            reason: SkipReason::TooLarge,
                        });
                        continue;
                    }
                }

                let fresh = metadata_of(&rel, &meta, false);
                let reused = previous.and_then(|prev| prev.get(&rel)).filter(|old| {
                    old.size == fresh.size
                        && old.mtime_delta_secs(&fresh) <= self.options.time_tolerance
                });
                match reused {
                    Some(old) => {
                        snapshot.files.insert(rel, old.clone());
                    }
                    None => {
                        snapshot.files.insert(rel, fresh);
                    }
                }
            }
        }

        debug!(
            root = %root.display(),
            files = snapshot.files.len(),
            skipped = snapshot.skipped.len(),
            errors = snapshot.errors.len(),
            "scan complete"
        );
        Ok(snapshot)
    }
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut out = String::new();
    for component in rel.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

fn metadata_of(rel: &str, meta: &std::fs::Metadata, is_symlink: bool) -> FileMetadata {
    let modified: DateTime<Utc> = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    let created: DateTime<Utc> = meta
        .created()
        .map(DateTime::<Utc>::from)
        .unwrap_or(modified);
    FileMetadata {
        relative_path: rel.to_owned(),
        size: meta.len(),
        modified_time: modified,
        created_time: created,
        permissions: permissions_of(meta),
        is_directory: meta.is_dir(),
        is_symlink,
        checksum: None,
    }
}

#[cfg(unix)]
fn permissions_of(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn permissions_of(_meta: &std::fs::Metadata) -> u32 {
    0
}

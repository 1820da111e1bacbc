//! File-entry model for the catalog.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier of one hybrid-overlay instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncPairId(pub String);

impl SyncPairId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-name-safe form: `/` replaced by `_`.
    pub fn file_stem(&self) -> String {
        self.0.replace('/', "_")
    }
}

impl fmt::Display for SyncPairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A path as seen through the mount.
///
/// Always starts with `/` and is stored normalized: no `.` or `..`
/// segments, no trailing slash, no repeated separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VirtualPath(String);

impl VirtualPath {
    /// Normalize `raw` into a virtual path. `..` segments are rejected.
    pub fn new(raw: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Err(format!("virtual path escapes root: {raw}")),
                s => segments.push(s),
            }
        }
        if segments.is_empty() {
            Ok(Self("/".to_owned()))
        } else {
            Ok(Self(format!("/{}", segments.join("/"))))
        }
    }

    /// Build from a path relative to a backing root.
    pub fn from_relative(rel: &str) -> Result<Self, String> {
        Self::new(rel)
    }

    pub fn root() -> Self {
        Self("/".to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The path without the leading slash, for joining onto a root.
    pub fn relative(&self) -> &str {
        self.0.trim_start_matches('/')
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    pub fn join_onto(&self, root: &Path) -> PathBuf {
        if self.0 == "/" {
            root.to_path_buf()
        } else {
            root.join(self.relative())
        }
    }
}

impl TryFrom<String> for VirtualPath {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        VirtualPath::new(&value)
    }
}

impl From<VirtualPath> for String {
    fn from(value: VirtualPath) -> Self {
        value.0
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    pub pair: SyncPairId,
    pub path: VirtualPath,
}

impl EntryKey {
    pub fn new(pair: SyncPairId, path: VirtualPath) -> Self {
        Self { pair, path }
    }
}

/// Where a file's bytes physically live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Location {
    LocalOnly,
    ExternalOnly,
    Both,
}

/// Advisory lock state mirrored into the persistent entry at checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LockState {
    #[default]
    None,
    ReadLocked,
    WriteLocked,
    SyncLocked,
}

/// One catalog record. Identity is `(sync_pair_id, virtual_path)`;
/// everything else is mutable through the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub sync_pair_id: SyncPairId,
    pub virtual_path: VirtualPath,
    pub local_path: Option<PathBuf>,
    pub external_path: Option<PathBuf>,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub is_directory: bool,
    pub checksum: Option<String>,
    pub location: Location,
    pub is_dirty: bool,
    #[serde(default)]
    pub lock_state: LockState,
    #[serde(default)]
    pub pending_deletion: bool,
    #[serde(default)]
    pub entry_version: u64,
}

impl FileEntry {
    /// A freshly discovered or written local-only entry.
    pub fn new_local(
        pair: SyncPairId,
        path: VirtualPath,
        local_path: PathBuf,
        size: u64,
        modified_at: DateTime<Utc>,
        is_directory: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            sync_pair_id: pair,
            virtual_path: path,
            local_path: Some(local_path),
            external_path: None,
            size,
            modified_at,
            created_at: now,
            accessed_at: now,
            is_directory,
            checksum: None,
            location: Location::LocalOnly,
            is_dirty: false,
            lock_state: LockState::None,
            pending_deletion: false,
            entry_version: 0,
        }
    }

    /// An entry discovered only on the external store.
    pub fn new_external(
        pair: SyncPairId,
        path: VirtualPath,
        external_path: PathBuf,
        size: u64,
        modified_at: DateTime<Utc>,
        is_directory: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            sync_pair_id: pair,
            virtual_path: path,
            local_path: None,
            external_path: Some(external_path),
            size,
            modified_at,
            created_at: now,
            accessed_at: now,
            is_directory,
            checksum: None,
            location: Location::ExternalOnly,
            is_dirty: false,
            lock_state: LockState::None,
            pending_deletion: false,
            entry_version: 0,
        }
    }

    pub fn key(&self) -> EntryKey {
        EntryKey::new(self.sync_pair_id.clone(), self.virtual_path.clone())
    }

    /// Check the structural invariants.
    pub fn validate(&self) -> Result<(), String> {
        let ok = match self.location {
            Location::LocalOnly => self.local_path.is_some() && self.external_path.is_none(),
            Location::ExternalOnly => self.local_path.is_none() && self.external_path.is_some(),
            Location::Both => self.local_path.is_some() && self.external_path.is_some(),
        };
        if !ok {
            return Err(format!(
                "{}: paths inconsistent with location {:?}",
                self.virtual_path, self.location
            ));
        }
        if self.is_dirty && self.location == Location::ExternalOnly {
            return Err(format!(
                "{}: external-only entry cannot be dirty",
                self.virtual_path
            ));
        }
        if self.is_directory && (self.checksum.is_some() || self.is_dirty) {
            return Err(format!(
                "{}: directories carry no checksum and are never dirty",
                self.virtual_path
            ));
        }
        Ok(())
    }

    /// LOCAL has unsynced changes, or the file only exists locally.
    pub fn needs_sync(&self) -> bool {
        !self.is_directory && (self.is_dirty || self.location == Location::LocalOnly)
    }

    /// Eligible to lose its local copy while keeping the external one.
    pub fn is_evictable(&self, now: DateTime<Utc>, min_age_secs: u64) -> bool {
        self.location == Location::Both
            && !self.is_dirty
            && !self.is_directory
            && !self.pending_deletion
            && (now - self.accessed_at).num_seconds() >= min_age_secs as i64
    }

    /// Record a write observed through the mount.
    pub fn mark_dirty(&mut self, size: u64, modified_at: DateTime<Utc>) {
        debug_assert!(!self.is_directory);
        self.is_dirty = true;
        self.size = size;
        self.modified_at = modified_at;
        self.checksum = None;
        self.accessed_at = Utc::now();
    }

    /// Record a completed sync to the external store.
    pub fn mark_synced(&mut self, external_path: PathBuf, checksum: Option<String>) {
        self.external_path = Some(external_path);
        self.location = Location::Both;
        self.is_dirty = false;
        if checksum.is_some() {
            self.checksum = checksum;
        }
    }

    /// Record removal of the local copy.
    pub fn mark_evicted(&mut self) {
        self.local_path = None;
        self.location = Location::ExternalOnly;
        self.is_dirty = false;
    }

    pub fn touch_accessed(&mut self, at: DateTime<Utc>) {
        self.accessed_at = at;
    }

    /// Carry the runtime-only fields over from a previous incarnation of
    /// the same entry, used by incremental index updates.
    pub fn preserve_runtime_state(&mut self, previous: &FileEntry) {
        self.entry_version = previous.entry_version;
        self.is_dirty = previous.is_dirty && self.location != Location::ExternalOnly;
        self.lock_state = previous.lock_state;
        self.accessed_at = previous.accessed_at;
        self.created_at = previous.created_at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> FileEntry {
        FileEntry::new_local(
            SyncPairId::new("pair"),
            VirtualPath::new("/a/b.txt").unwrap(),
            PathBuf::from("/local/a/b.txt"),
            10,
            Utc::now(),
            false,
        )
    }

    #[test]
    fn virtual_path_normalization() {
        assert_eq!(VirtualPath::new("a/b/").unwrap().as_str(), "/a/b");
        assert_eq!(VirtualPath::new("/a//b").unwrap().as_str(), "/a/b");
        assert_eq!(VirtualPath::new("./a/./b").unwrap().as_str(), "/a/b");
        assert_eq!(VirtualPath::new("").unwrap().as_str(), "/");
        assert!(VirtualPath::new("/a/../b").is_err());
    }

    #[test]
    fn virtual_path_join() {
        let vp = VirtualPath::new("/sub/f.bin").unwrap();
        assert_eq!(
            vp.join_onto(Path::new("/root")),
            PathBuf::from("/root/sub/f.bin")
        );
        assert_eq!(vp.file_name(), "f.bin");
    }

    #[test]
    fn location_invariants() {
        let mut e = entry();
        assert!(e.validate().is_ok());
        e.external_path = Some(PathBuf::from("/ext/a/b.txt"));
        assert!(e.validate().is_err());
        e.location = Location::Both;
        assert!(e.validate().is_ok());
        e.mark_evicted();
        assert!(e.validate().is_ok());
        assert_eq!(e.location, Location::ExternalOnly);
        assert!(e.local_path.is_none());
    }

    #[test]
    fn dirty_external_only_rejected() {
        let mut e = entry();
        e.is_dirty = true;
        e.local_path = None;
        e.external_path = Some(PathBuf::from("/ext/a/b.txt"));
        e.location = Location::ExternalOnly;
        assert!(e.validate().is_err());
    }

    #[test]
    fn evictable_requires_age_and_cleanliness() {
        let mut e = entry();
        e.external_path = Some(PathBuf::from("/ext/a/b.txt"));
        e.location = Location::Both;
        let now = Utc::now();
        assert!(!e.is_evictable(now, 3600), "too recently accessed");
        e.accessed_at = now - chrono::Duration::seconds(7200);
        assert!(e.is_evictable(now, 3600));
        e.is_dirty = true;
        assert!(!e.is_evictable(now, 3600), "dirty entries are pinned");
    }

    #[test]
    fn needs_sync_covers_local_only() {
        let e = entry();
        assert!(e.needs_sync(), "local-only file must reach external");
        let mut synced = e.clone();
        synced.mark_synced(PathBuf::from("/ext/a/b.txt"), Some("abc".into()));
        assert!(!synced.needs_sync());
    }
}

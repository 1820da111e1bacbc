//! Durable snapshot persistence for the catalog.
//!
//! The snapshot is one JSON document holding every entry. Writes go to a
//! sibling temp file first and are committed with a rename, so a crash
//! mid-save leaves the previous snapshot intact.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::catalog::entry::{EntryKey, FileEntry};
use crate::error::{Error, Result};

pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Load the snapshot, or an empty map when none exists yet.
    /// A snapshot that fails to decode surfaces [`Error::Corrupt`]; the
    /// caller is expected to trigger an index rebuild.
    pub async fn load(&self) -> Result<HashMap<EntryKey, FileEntry>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(Error::Unavailable(format!("{}: {e}", self.path.display()))),
        };
        let entries: Vec<FileEntry> = serde_json::from_slice(&raw)
            .map_err(|e| Error::Corrupt(format!("catalog snapshot {}: {e}", self.path.display())))?;
        let mut map = HashMap::with_capacity(entries.len());
        for entry in entries {
            entry
                .validate()
                .map_err(|msg| Error::Corrupt(format!("catalog snapshot: {msg}")))?;
            map.insert(entry.key(), entry);
        }
        Ok(map)
    }

    /// Persist the full entry set atomically.
    pub async fn save(&self, entries: &HashMap<EntryKey, FileEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut ordered: Vec<&FileEntry> = entries.values().collect();
        ordered.sort_by(|a, b| a.key().cmp(&b.key()));
        let raw = serde_json::to_vec_pretty(&ordered)
            .map_err(|e| Error::Unavailable(format!("encode catalog snapshot: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

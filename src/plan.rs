//! Sync plans: the ordered actions produced by the diff phase.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::scanner::FileMetadata;

/// How a detected conflict differs between the two sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictType {
    BothModified,
    TypeChanged,
    DeletedOnLocal,
    DeletedOnExternal,
}

/// Chosen outcome for one conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictResolution {
    KeepLocal,
    KeepExternal,
    KeepLocalWithBackup,
    KeepExternalWithBackup,
    KeepBoth,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub relative_path: String,
    pub local_meta: Option<FileMetadata>,
    pub external_meta: Option<FileMetadata>,
    pub conflict_type: ConflictType,
    pub resolution: Option<ConflictResolution>,
}

/// One step of a sync plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum SyncAction {
    Copy {
        relative_path: String,
        source: PathBuf,
        destination: PathBuf,
        size: u64,
        /// Source checksum when the run hashed it; becomes the catalog
        /// baseline for drift detection.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
    },
    Update {
        relative_path: String,
        source: PathBuf,
        destination: PathBuf,
        size: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
    },
    Delete {
        relative_path: String,
        target: PathBuf,
        is_directory: bool,
    },
    CreateDirectory {
        relative_path: String,
        destination: PathBuf,
    },
    ResolveConflict {
        conflict: ConflictInfo,
    },
    Skip {
        relative_path: String,
        reason: String,
    },
}

impl SyncAction {
    pub fn relative_path(&self) -> &str {
        match self {
            SyncAction::Copy { relative_path, .. }
            | SyncAction::Update { relative_path, .. }
            | SyncAction::Delete { relative_path, .. }
            | SyncAction::CreateDirectory { relative_path, .. }
            | SyncAction::Skip { relative_path, .. } => relative_path,
            SyncAction::ResolveConflict { conflict } => &conflict.relative_path,
        }
    }

    /// Bytes this action will transfer.
    pub fn bytes(&self) -> u64 {
        match self {
            SyncAction::Copy { size, .. } | SyncAction::Update { size, .. } => *size,
            _ => 0,
        }
    }

    /// Copy-like actions take part in the lock, copy and verify phases.
    pub fn is_copy_like(&self) -> bool {
        matches!(self, SyncAction::Copy { .. } | SyncAction::Update { .. })
    }
}

/// A copy/delete pair collapsed into a destination-side rename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveAction {
    pub from_relative: String,
    pub to_relative: String,
    pub destination_from: PathBuf,
    pub destination_to: PathBuf,
    pub checksum: String,
}

/// Ordered actions plus the conflicts awaiting resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPlan {
    pub source_root: PathBuf,
    pub destination_root: PathBuf,
    pub actions: Vec<SyncAction>,
    pub conflicts: Vec<ConflictInfo>,
    pub moves: Vec<MoveAction>,
    /// Cached: count of copy/update actions.
    pub total_files: u64,
    /// Cached: bytes across copy/update actions.
    pub total_bytes: u64,
}

impl SyncPlan {
    pub fn new(
        source_root: PathBuf,
        destination_root: PathBuf,
        actions: Vec<SyncAction>,
        conflicts: Vec<ConflictInfo>,
        moves: Vec<MoveAction>,
    ) -> Self {
        let total_files = actions.iter().filter(|a| a.is_copy_like()).count() as u64;
        let total_bytes = actions.iter().map(SyncAction::bytes).sum();
        Self {
            source_root,
            destination_root,
            actions,
            conflicts,
            moves,
            total_files,
            total_bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.moves.is_empty()
    }

    /// Number of copy/update/delete steps, the "work" actions.
    pub fn mutating_actions(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| {
                matches!(
                    a,
                    SyncAction::Copy { .. }
                        | SyncAction::Update { .. }
                        | SyncAction::Delete { .. }
                        | SyncAction::CreateDirectory { .. }
                )
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_are_cached_from_copy_like_actions() {
        let plan = SyncPlan::new(
            PathBuf::from("/src"),
            PathBuf::from("/dst"),
            vec![
                SyncAction::CreateDirectory {
                    relative_path: "sub".into(),
                    destination: PathBuf::from("/dst/sub"),
                },
                SyncAction::Copy {
                    relative_path: "f1.txt".into(),
                    source: PathBuf::from("/src/f1.txt"),
                    destination: PathBuf::from("/dst/f1.txt"),
                    size: 100,
                    checksum: None,
                },
                SyncAction::Update {
                    relative_path: "sub/f2.bin".into(),
                    source: PathBuf::from("/src/sub/f2.bin"),
                    destination: PathBuf::from("/dst/sub/f2.bin"),
                    size: 1024,
                    checksum: None,
                },
                SyncAction::Delete {
                    relative_path: "gone.txt".into(),
                    target: PathBuf::from("/dst/gone.txt"),
                    is_directory: false,
                },
            ],
            Vec::new(),
            Vec::new(),
        );
        assert_eq!(plan.total_files, 2);
        assert_eq!(plan.total_bytes, 1124);
        assert_eq!(plan.mutating_actions(), 4);
    }

    #[test]
    fn actions_round_trip_through_json() {
        let action = SyncAction::ResolveConflict {
            conflict: ConflictInfo {
                relative_path: "doc.md".into(),
                local_meta: None,
                external_meta: None,
                conflict_type: ConflictType::BothModified,
                resolution: Some(ConflictResolution::KeepLocalWithBackup),
            },
        };
        let raw = serde_json::to_string(&action).unwrap();
        assert!(raw.contains("\"resolveConflict\""));
        assert!(raw.contains("\"keepLocalWithBackup\""));
        let back: SyncAction = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, action);
    }
}

//! Snapshot comparison.
//!
//! Turns two [`DirectorySnapshot`]s into a [`SyncPlan`]. The
//! unidirectional diff mirrors source onto destination; the
//! bidirectional diff turns destination-only entries and diverging
//! files into conflicts instead of overwriting either side.

use std::collections::HashMap;

use crate::plan::{ConflictInfo, ConflictType, MoveAction, SyncAction, SyncPlan};
use crate::scanner::{DirectorySnapshot, FileMetadata};

#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// Mirror deletions from source to destination.
    pub enable_delete: bool,
    /// Seconds of mtime drift still treated as unchanged. Exactly the
    /// tolerance compares equal; strictly greater compares different.
    pub time_tolerance: f64,
    /// Consult checksums when both sides carry one.
    pub compare_checksums: bool,
    /// Pair copies and deletes sharing a checksum into renames.
    pub detect_moves: bool,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            enable_delete: true,
            time_tolerance: 1.0,
            compare_checksums: true,
            detect_moves: false,
        }
    }
}

pub struct DiffEngine {
    options: DiffOptions,
}

impl DiffEngine {
    pub fn new(options: DiffOptions) -> Self {
        Self { options }
    }

    /// Two regular files are the same when sizes match, mtimes are
    /// within tolerance, and (when enabled and available) checksums
    /// agree.
    pub fn are_files_identical(&self, a: &FileMetadata, b: &FileMetadata) -> bool {
        if a.is_directory != b.is_directory {
            return false;
        }
        if a.is_directory {
            return true;
        }
        if a.size != b.size {
            return false;
        }
        if a.mtime_delta_secs(b) > self.options.time_tolerance {
            return false;
        }
        if self.options.compare_checksums {
            if let (Some(ca), Some(cb)) = (&a.checksum, &b.checksum) {
                return ca == cb;
            }
        }
        true
    }

    /// Mirror `source` onto `destination`.
    pub fn diff(&self, source: &DirectorySnapshot, destination: &DirectorySnapshot) -> SyncPlan {
        self.build(source, destination, false)
    }

    /// Compare both sides, conflicting instead of overwriting.
    pub fn diff_bidirectional(
        &self,
        source: &DirectorySnapshot,
        destination: &DirectorySnapshot,
    ) -> SyncPlan {
        self.build(source, destination, true)
    }

    fn build(
        &self,
        source: &DirectorySnapshot,
        destination: &DirectorySnapshot,
        bidirectional: bool,
    ) -> SyncPlan {
        let mut create_dirs: Vec<String> = Vec::new();
        let mut copies: Vec<&FileMetadata> = Vec::new();
        let mut updates: Vec<&FileMetadata> = Vec::new();
        let mut deletes: Vec<&FileMetadata> = Vec::new();
        let mut conflicts: Vec<ConflictInfo> = Vec::new();

        for (rel, smeta) in &source.files {
            match destination.get(rel) {
                None => {
                    if smeta.is_directory {
                        create_dirs.push(rel.clone());
                    } else {
                        copies.push(smeta);
                    }
                }
                Some(dmeta) if smeta.is_directory != dmeta.is_directory => {
                    conflicts.push(ConflictInfo {
                        relative_path: rel.clone(),
                        local_meta: Some(smeta.clone()),
                        external_meta: Some(dmeta.clone()),
                        conflict_type: ConflictType::TypeChanged,
                        resolution: None,
                    });
                }
                Some(dmeta) => {
                    if self.are_files_identical(smeta, dmeta) {
                        continue;
                    }
                    if bidirectional {
                        conflicts.push(ConflictInfo {
                            relative_path: rel.clone(),
                            local_meta: Some(smeta.clone()),
                            external_meta: Some(dmeta.clone()),
                            conflict_type: ConflictType::BothModified,
                            resolution: None,
                        });
                    } else {
                        updates.push(smeta);
                    }
                }
            }
        }

        for (rel, dmeta) in &destination.files {
            if source.get(rel).is_some() {
                continue;
            }
            if bidirectional {
                conflicts.push(ConflictInfo {
                    relative_path: rel.clone(),
                    local_meta: None,
                    external_meta: Some(dmeta.clone()),
                    conflict_type: ConflictType::DeletedOnLocal,
                    resolution: None,
                });
            } else if self.options.enable_delete {
                deletes.push(dmeta);
            }
        }

        let moves = if self.options.detect_moves {
            detect_moves(&mut copies, &mut deletes, destination)
        } else {
            Vec::new()
        };

        let mut actions: Vec<SyncAction> = Vec::new();

        // Parents before children.
        create_dirs.sort();
        for rel in create_dirs {
            actions.push(SyncAction::CreateDirectory {
                destination: destination.absolute(&rel),
                relative_path: rel,
            });
        }

        copies.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        for meta in copies {
            actions.push(SyncAction::Copy {
                relative_path: meta.relative_path.clone(),
                source: source.absolute(&meta.relative_path),
                destination: destination.absolute(&meta.relative_path),
                size: meta.size,
                checksum: meta.checksum.clone(),
            });
        }

        updates.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        for meta in updates {
            actions.push(SyncAction::Update {
                relative_path: meta.relative_path.clone(),
                source: source.absolute(&meta.relative_path),
                destination: destination.absolute(&meta.relative_path),
                size: meta.size,
                checksum: meta.checksum.clone(),
            });
        }

        // Children before parents.
        deletes.sort_by(|a, b| b.relative_path.cmp(&a.relative_path));
        for meta in deletes {
            actions.push(SyncAction::Delete {
                relative_path: meta.relative_path.clone(),
                target: destination.absolute(&meta.relative_path),
                is_directory: meta.is_directory,
            });
        }

        for conflict in &conflicts {
            actions.push(SyncAction::ResolveConflict {
                conflict: conflict.clone(),
            });
        }

        SyncPlan::new(
            source.root_path.clone(),
            destination.root_path.clone(),
            actions,
            conflicts,
            moves,
        )
    }
}

/// Pair each pending copy with a pending delete carrying the same
/// checksum. Both drop out of their lists; the pair becomes a rename on
/// the destination side.
fn detect_moves(
    copies: &mut Vec<&FileMetadata>,
    deletes: &mut Vec<&FileMetadata>,
    destination: &DirectorySnapshot,
) -> Vec<MoveAction> {
    let mut by_checksum: HashMap<&str, &FileMetadata> = HashMap::new();
    for meta in deletes.iter().copied() {
        if let Some(checksum) = meta.checksum.as_deref() {
            if !meta.is_directory {
                by_checksum.entry(checksum).or_insert(meta);
            }
        }
    }

    let mut moves = Vec::new();
    let mut moved_to: Vec<String> = Vec::new();
    let mut moved_from: Vec<String> = Vec::new();
    for meta in copies.iter() {
        let Some(checksum) = meta.checksum.as_deref() else {
            continue;
        };
        if meta.is_directory {
            continue;
        }
        if let Some(old) = by_checksum.remove(checksum) {
            moves.push(MoveAction {
                from_relative: old.relative_path.clone(),
                to_relative: meta.relative_path.clone(),
                destination_from: destination.absolute(&old.relative_path),
                destination_to: destination.absolute(&meta.relative_path),
                checksum: checksum.to_owned(),
            });
            moved_to.push(meta.relative_path.clone());
            moved_from.push(old.relative_path.clone());
        }
    }
    copies.retain(|m| !moved_to.contains(&m.relative_path));
    deletes.retain(|m| !moved_from.contains(&m.relative_path));
    moves
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn meta(rel: &str, size: u64, mtime_offset_secs: i64, is_dir: bool) -> FileMetadata {
        let t = Utc::now() + Duration::seconds(mtime_offset_secs);
        FileMetadata {
            relative_path: rel.to_owned(),
            size,
            modified_time: t,
            created_time: t,
            permissions: 0o644,
            is_directory: is_dir,
            is_symlink: false,
            checksum: None,
        }
    }

    fn snapshot(root: &str, entries: Vec<FileMetadata>) -> DirectorySnapshot {
        let mut files = BTreeMap::new();
        for m in entries {
            files.insert(m.relative_path.clone(), m);
        }
        DirectorySnapshot {
            root_path: PathBuf::from(root),
            files,
            skipped: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn engine() -> DiffEngine {
        DiffEngine::new(DiffOptions::default())
    }

    #[test]
    fn first_time_sync_plan_shape() {
        let source = snapshot(
            "/a",
            vec![
                meta("f1.txt", 100, 0, false),
                meta("sub", 0, 0, true),
                meta("sub/f2.bin", 1024, 0, false),
            ],
        );
        let dest = snapshot("/ext", vec![]);
        let plan = engine().diff(&source, &dest);

        let kinds: Vec<&str> = plan
            .actions
            .iter()
            .map(|a| match a {
                SyncAction::CreateDirectory { .. } => "mkdir",
                SyncAction::Copy { .. } => "copy",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["mkdir", "copy", "copy"]);
        assert_eq!(plan.total_files, 2);
        assert_eq!(plan.total_bytes, 1124);
    }

    #[test]
    fn mtime_at_tolerance_is_equal_beyond_is_update() {
        let src_at = snapshot("/a", vec![meta("f", 10, 1, false)]);
        let src_over = snapshot("/a", vec![meta("f", 10, 2, false)]);
        let dest = snapshot("/b", vec![meta("f", 10, 0, false)]);

        let plan_at = engine().diff(&src_at, &dest);
        assert!(plan_at.actions.is_empty(), "exactly tolerance: unchanged");

        let plan_over = engine().diff(&src_over, &dest);
        assert_eq!(plan_over.actions.len(), 1);
        assert!(matches!(plan_over.actions[0], SyncAction::Update { .. }));
    }

    #[test]
    fn empty_source_with_delete_produces_children_first_deletes() {
        let source = snapshot("/a", vec![]);
        let dest = snapshot(
            "/b",
            vec![
                meta("d", 0, 0, true),
                meta("d/inner", 0, 0, true),
                meta("d/inner/f.txt", 5, 0, false),
            ],
        );
        let plan = engine().diff(&source, &dest);
        let rels: Vec<&str> = plan.actions.iter().map(|a| a.relative_path()).collect();
        assert_eq!(rels, vec!["d/inner/f.txt", "d/inner", "d"]);
        assert!(plan
            .actions
            .iter()
            .all(|a| matches!(a, SyncAction::Delete { .. })));
    }

    #[test]
    fn delete_disabled_keeps_destination_extras() {
        let source = snapshot("/a", vec![]);
        let dest = snapshot("/b", vec![meta("keep.txt", 5, 0, false)]);
        let plan = DiffEngine::new(DiffOptions {
            enable_delete: false,
            ..Default::default()
        })
        .diff(&source, &dest);
        assert!(plan.actions.is_empty());
    }

    #[test]
    fn type_change_is_a_conflict() {
        let source = snapshot("/a", vec![meta("thing", 5, 0, false)]);
        let dest = snapshot("/b", vec![meta("thing", 0, 0, true)]);
        let plan = engine().diff(&source, &dest);
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].conflict_type, ConflictType::TypeChanged);
    }

    #[test]
    fn bidirectional_conflicts_instead_of_overwrites() {
        let source = snapshot("/a", vec![meta("doc.md", 210, 100, false)]);
        let dest = snapshot(
            "/b",
            vec![meta("doc.md", 200, 0, false), meta("only-ext.txt", 7, 0, false)],
        );
        let plan = engine().diff_bidirectional(&source, &dest);
        assert_eq!(plan.conflicts.len(), 2);
        let types: Vec<ConflictType> =
            plan.conflicts.iter().map(|c| c.conflict_type).collect();
        assert!(types.contains(&ConflictType::BothModified));
        assert!(types.contains(&ConflictType::DeletedOnLocal));
        assert!(plan
            .actions
            .iter()
            .all(|a| matches!(a, SyncAction::ResolveConflict { .. })));
    }

    #[test]
    fn checksum_disagreement_beats_matching_stat() {
        let mut a = meta("f", 10, 0, false);
        let mut b = meta("f", 10, 0, false);
        a.checksum = Some("aaa".into());
        b.checksum = Some("bbb".into());
        assert!(!engine().are_files_identical(&a, &b));
        b.checksum = Some("aaa".into());
        assert!(engine().are_files_identical(&a, &b));
    }

    #[test]
    fn move_detection_pairs_by_checksum() {
        let mut old = meta("old/name.bin", 10, 0, false);
        old.checksum = Some("same".into());
        let mut new = meta("new/name.bin", 10, 0, false);
        new.checksum = Some("same".into());
        let source = snapshot("/a", vec![meta("new", 0, 0, true), new]);
        let dest = snapshot("/b", vec![meta("old", 0, 0, true), old]);

        let plan = DiffEngine::new(DiffOptions {
            detect_moves: true,
            ..Default::default()
        })
        .diff(&source, &dest);

        assert_eq!(plan.moves.len(), 1);
        assert_eq!(plan.moves[0].from_relative, "old/name.bin");
        assert_eq!(plan.moves[0].to_relative, "new/name.bin");
        assert!(
            !plan
                .actions
                .iter()
                .any(|a| a.relative_path().ends_with("name.bin")),
            "moved file leaves both copy and delete lists"
        );
    }
}

//! Conflict resolution strategies and their execution.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::copier::Copier;
use crate::error::{Error, Result};
use crate::plan::{ConflictInfo, ConflictResolution, ConflictType};

/// Policy applied when the two sides of a pair disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ConflictStrategy {
    /// More recent modification time wins; ties keep local with backup.
    NewerWins,
    /// Larger file wins; ties keep local.
    LargerWins,
    LocalWins,
    ExternalWins,
    #[serde(alias = "keepLocalWithBackup")]
    #[default]
    LocalWinsWithBackup,
    #[serde(alias = "keepExternalWithBackup")]
    ExternalWinsWithBackup,
    KeepBoth,
    Skip,
    /// Defer to an external callback; falls back to the per-type
    /// recommended default when none is installed.
    AskUser,
}

/// External decision hook for [`ConflictStrategy::AskUser`].
#[async_trait]
pub trait ConflictPrompt: Send + Sync {
    async fn resolve(&self, conflict: &ConflictInfo) -> Option<ConflictResolution>;
}

/// What execution did for one conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionOutcome {
    pub relative_path: String,
    pub resolution: ConflictResolution,
    pub backup_created: Option<PathBuf>,
}

pub struct ConflictResolver {
    strategy: ConflictStrategy,
    prompt: Option<std::sync::Arc<dyn ConflictPrompt>>,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self {
            strategy,
            prompt: None,
        }
    }

    pub fn with_prompt(mut self, prompt: std::sync::Arc<dyn ConflictPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Recommended fallback per conflict type, used when `askUser` has
    /// nobody to ask.
    pub fn recommended_default(conflict_type: ConflictType) -> ConflictResolution {
        match conflict_type {
            ConflictType::BothModified => ConflictResolution::KeepLocalWithBackup,
            ConflictType::TypeChanged => ConflictResolution::KeepBoth,
            ConflictType::DeletedOnLocal => ConflictResolution::KeepExternal,
            ConflictType::DeletedOnExternal => ConflictResolution::KeepLocal,
        }
    }

    /// Pick a resolution for `conflict` under the configured strategy.
    pub async fn choose(&self, conflict: &ConflictInfo) -> ConflictResolution {
        match self.strategy {
            ConflictStrategy::LocalWins => ConflictResolution::KeepLocal,
            ConflictStrategy::ExternalWins => ConflictResolution::KeepExternal,
            ConflictStrategy::LocalWinsWithBackup => ConflictResolution::KeepLocalWithBackup,
            ConflictStrategy::ExternalWinsWithBackup => ConflictResolution::KeepExternalWithBackup,
            ConflictStrategy::KeepBoth => ConflictResolution::KeepBoth,
            ConflictStrategy::Skip => ConflictResolution::Skip,
            ConflictStrategy::NewerWins => {
                match (&conflict.local_meta, &conflict.external_meta) {
                    (Some(local), Some(external)) => {
                        if local.modified_time > external.modified_time {
                            ConflictResolution::KeepLocal
                        } else if external.modified_time > local.modified_time {
                            ConflictResolution::KeepExternal
                        } else {
                            ConflictResolution::KeepLocalWithBackup
                        }
                    }
                    (Some(_), None) => ConflictResolution::KeepLocal,
                    (None, Some(_)) => ConflictResolution::KeepExternal,
                    (None, None) => ConflictResolution::Skip,
                }
            }
            ConflictStrategy::LargerWins => {
                match (&conflict.local_meta, &conflict.external_meta) {
                    (Some(local), Some(external)) => {
                        if local.size > external.size {
                            ConflictResolution::KeepLocal
                        } else if external.size > local.size {
                            ConflictResolution::KeepExternal
                        } else {
                            ConflictResolution::KeepLocal
                        }
                    }
                    (Some(_), None) => ConflictResolution::KeepLocal,
                    (None, Some(_)) => ConflictResolution::KeepExternal,
                    (None, None) => ConflictResolution::Skip,
                }
            }
            ConflictStrategy::AskUser => {
                if let Some(prompt) = &self.prompt {
                    if let Some(resolution) = prompt.resolve(conflict).await {
                        return resolution;
                    }
                }
                Self::recommended_default(conflict.conflict_type)
            }
        }
    }

    /// Apply `resolution` on disk.
    ///
    /// Backup variants first rename the losing side out of the way with
    /// a `_backup` suffix (plus a numeric discriminator until the name
    /// is free), then copy the winner across. `keepBoth` renames both
    /// sides apart and copies each to the other store.
    pub async fn execute(
        &self,
        conflict: &ConflictInfo,
        resolution: ConflictResolution,
        local_root: &Path,
        external_root: &Path,
        copier: &Copier,
    ) -> Result<ResolutionOutcome> {
        let rel = conflict.relative_path.as_str();
        let local = local_root.join(rel);
        let external = external_root.join(rel);
        let local_exists = tokio::fs::metadata(&local).await.is_ok();
        let external_exists = tokio::fs::metadata(&external).await.is_ok();
        let mut backup_created = None;

        match resolution {
            ConflictResolution::Skip => {}
            ConflictResolution::KeepLocal => {
                if local_exists {
                    copier.copy_file(&local, &external).await?;
                } else if external_exists {
                    tokio::fs::remove_file(&external).await?;
                }
            }
            ConflictResolution::KeepExternal => {
                if external_exists {
                    copier.copy_file(&external, &local).await?;
                } else if local_exists {
                    tokio::fs::remove_file(&local).await?;
                }
            }
            ConflictResolution::KeepLocalWithBackup => {
                if external_exists {
                    let backup = backup_destination(&external).await?;
                    tokio::fs::rename(&external, &backup).await?;
                    backup_created = Some(backup);
                }
                if local_exists {
                    copier.copy_file(&local, &external).await?;
                }
            }
            ConflictResolution::KeepExternalWithBackup => {
                if local_exists {
                    let backup = backup_destination(&local).await?;
                    tokio::fs::rename(&local, &backup).await?;
                    backup_created = Some(backup);
                }
                if external_exists {
                    copier.copy_file(&external, &local).await?;
                }
            }
            ConflictResolution::KeepBoth => {
                if !local_exists || !external_exists {
                    return Err(Error::NotFound(if local_exists { external } else { local }));
                }
                let local_renamed = suffixed(&local, "_local");
                let external_renamed = suffixed(&external, "_external");
                tokio::fs::rename(&local, &local_renamed).await?;
                tokio::fs::rename(&external, &external_renamed).await?;
                // Each store ends up with both variants.
                copier
                    .copy_file(&local_renamed, &suffixed(&external, "_local"))
                    .await?;
                copier
                    .copy_file(&external_renamed, &suffixed(&local, "_external"))
                    .await?;
            }
        }

        debug!(path = rel, ?resolution, "conflict resolved");
        Ok(ResolutionOutcome {
            relative_path: rel.to_owned(),
            resolution,
            backup_created,
        })
    }
}

/// `doc.md` -> `doc_backup.md`, then `doc_backup_1.md`, ... until the
/// name does not exist.
async fn backup_destination(path: &Path) -> Result<PathBuf> {
    let first = suffixed(path, "_backup");
    if tokio::fs::metadata(&first).await.is_err() {
        return Ok(first);
    }
    for n in 1..10_000u32 {
        let candidate = suffixed(path, &format!("_backup_{n}"));
        if tokio::fs::metadata(&candidate).await.is_err() {
            return Ok(candidate);
        }
    }
    Err(Error::AlreadyExists(first))
}

/// Insert `suffix` before the extension: `doc.md` + `_local` ->
/// `doc_local.md`.
fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let new_name = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}{suffix}.{ext}"),
        _ => format!("{name}{suffix}"),
    };
    path.with_file_name(new_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copier::plain_copier;
    use crate::scanner::FileMetadata;
    use chrono::{Duration, Utc};

    fn meta(rel: &str, size: u64, mtime_offset: i64) -> FileMetadata {
        let t = Utc::now() + Duration::seconds(mtime_offset);
        FileMetadata {
            relative_path: rel.into(),
            size,
            modified_time: t,
            created_time: t,
            permissions: 0o644,
            is_directory: false,
            is_symlink: false,
            checksum: None,
        }
    }

    fn conflict(rel: &str, local: Option<FileMetadata>, external: Option<FileMetadata>) -> ConflictInfo {
        ConflictInfo {
            relative_path: rel.into(),
            local_meta: local,
            external_meta: external,
            conflict_type: ConflictType::BothModified,
            resolution: None,
        }
    }

    #[tokio::test]
    async fn newer_wins_prefers_recent_side_and_backs_up_ties() {
        let resolver = ConflictResolver::new(ConflictStrategy::NewerWins);
        let c = conflict("f", Some(meta("f", 1, 100)), Some(meta("f", 1, 0)));
        assert_eq!(resolver.choose(&c).await, ConflictResolution::KeepLocal);

        let tied = meta("f", 1, 0);
        let c = conflict("f", Some(tied.clone()), Some(tied));
        assert_eq!(
            resolver.choose(&c).await,
            ConflictResolution::KeepLocalWithBackup
        );
    }

    #[tokio::test]
    async fn larger_wins_ties_keep_local() {
        let resolver = ConflictResolver::new(ConflictStrategy::LargerWins);
        let c = conflict("f", Some(meta("f", 10, 0)), Some(meta("f", 20, 0)));
        assert_eq!(resolver.choose(&c).await, ConflictResolution::KeepExternal);
        let c = conflict("f", Some(meta("f", 10, 0)), Some(meta("f", 10, 0)));
        assert_eq!(resolver.choose(&c).await, ConflictResolution::KeepLocal);
    }

    #[tokio::test]
    async fn ask_user_without_prompt_uses_recommended_default() {
        let resolver = ConflictResolver::new(ConflictStrategy::AskUser);
        let mut c = conflict("f", Some(meta("f", 1, 0)), Some(meta("f", 1, 0)));
        c.conflict_type = ConflictType::DeletedOnExternal;
        assert_eq!(resolver.choose(&c).await, ConflictResolution::KeepLocal);
    }

    #[tokio::test]
    async fn keep_local_with_backup_renames_loser_then_copies() {
        let local_root = tempfile::tempdir().unwrap();
        let external_root = tempfile::tempdir().unwrap();
        std::fs::write(local_root.path().join("doc.md"), b"local 210 bytes").unwrap();
        std::fs::write(external_root.path().join("doc.md"), b"external").unwrap();

        let resolver = ConflictResolver::new(ConflictStrategy::LocalWinsWithBackup);
        let c = conflict("doc.md", Some(meta("doc.md", 15, 10)), Some(meta("doc.md", 8, 0)));
        let outcome = resolver
            .execute(
                &c,
                ConflictResolution::KeepLocalWithBackup,
                local_root.path(),
                external_root.path(),
                &plain_copier(),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome.backup_created.as_deref(),
            Some(external_root.path().join("doc_backup.md").as_path())
        );
        assert_eq!(
            std::fs::read(external_root.path().join("doc.md")).unwrap(),
            b"local 210 bytes"
        );
        assert_eq!(
            std::fs::read(external_root.path().join("doc_backup.md")).unwrap(),
            b"external"
        );
        // Local side untouched.
        assert_eq!(
            std::fs::read(local_root.path().join("doc.md")).unwrap(),
            b"local 210 bytes"
        );
    }

    #[tokio::test]
    async fn backup_discriminator_skips_taken_names() {
        let local_root = tempfile::tempdir().unwrap();
        let external_root = tempfile::tempdir().unwrap();
        std::fs::write(local_root.path().join("doc.md"), b"local").unwrap();
        std::fs::write(external_root.path().join("doc.md"), b"external").unwrap();
        std::fs::write(external_root.path().join("doc_backup.md"), b"taken").unwrap();

        let resolver = ConflictResolver::new(ConflictStrategy::LocalWinsWithBackup);
        let c = conflict("doc.md", Some(meta("doc.md", 5, 0)), Some(meta("doc.md", 8, 0)));
        let outcome = resolver
            .execute(
                &c,
                ConflictResolution::KeepLocalWithBackup,
                local_root.path(),
                external_root.path(),
                &plain_copier(),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome.backup_created.as_deref(),
            Some(external_root.path().join("doc_backup_1.md").as_path())
        );
        assert_eq!(
            std::fs::read(external_root.path().join("doc_backup.md")).unwrap(),
            b"taken"
        );
    }

    #[tokio::test]
    async fn keep_both_leaves_both_variants_on_both_sides() {
        let local_root = tempfile::tempdir().unwrap();
        let external_root = tempfile::tempdir().unwrap();
        std::fs::write(local_root.path().join("n.txt"), b"L").unwrap();
        std::fs::write(external_root.path().join("n.txt"), b"E").unwrap();

        let resolver = ConflictResolver::new(ConflictStrategy::KeepBoth);
        let c = conflict("n.txt", Some(meta("n.txt", 1, 0)), Some(meta("n.txt", 1, 0)));
        resolver
            .execute(
                &c,
                ConflictResolution::KeepBoth,
                local_root.path(),
                external_root.path(),
                &plain_copier(),
            )
            .await
            .unwrap();

        for root in [local_root.path(), external_root.path()] {
            assert_eq!(std::fs::read(root.join("n_local.txt")).unwrap(), b"L");
            assert_eq!(std::fs::read(root.join("n_external.txt")).unwrap(), b"E");
            assert!(!root.join("n.txt").exists());
        }
    }

    #[test]
    fn suffix_respects_extensions() {
        assert_eq!(
            suffixed(Path::new("/x/doc.md"), "_backup"),
            PathBuf::from("/x/doc_backup.md")
        );
        assert_eq!(
            suffixed(Path::new("/x/Makefile"), "_backup"),
            PathBuf::from("/x/Makefile_backup")
        );
        assert_eq!(
            suffixed(Path::new("/x/.hidden"), "_backup"),
            PathBuf::from("/x/.hidden_backup")
        );
    }
}

//! Bounded ring of recent user-visible events.
//!
//! The last [`ActivityLog::DEFAULT_CAPACITY`] records are kept, newest
//! first, persisted after every append and pushed to observers through
//! the notifier. The ring loads lazily on first read.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::catalog::SyncPairId;
use crate::error::{Error, Result};
use crate::notifier::{Event, Notifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivityKind {
    SyncCompleted,
    IndexCompleted,
    EvictionCompleted,
    ConflictResolved,
    MountChanged,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub kind: ActivityKind,
    pub sync_pair_id: Option<SyncPairId>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ActivityRecord {
    pub fn new(kind: ActivityKind, pair: Option<SyncPairId>, message: impl Into<String>) -> Self {
        Self {
            kind,
            sync_pair_id: pair,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

pub struct ActivityLog {
    path: PathBuf,
    capacity: usize,
    ring: Mutex<Option<VecDeque<ActivityRecord>>>,
    notifier: Arc<Notifier>,
}

impl ActivityLog {
    pub const DEFAULT_CAPACITY: usize = 5;

    pub fn new(path: PathBuf, notifier: Arc<Notifier>) -> Self {
        Self {
            path,
            capacity: Self::DEFAULT_CAPACITY,
            ring: Mutex::new(None),
            notifier,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Append a record, trim to capacity, persist, notify.
    pub async fn append(&self, record: ActivityRecord) -> Result<()> {
        let snapshot = {
            let mut guard = self.ring.lock().await;
            let ring = self.load_if_needed(&mut guard).await;
            ring.push_front(record);
            ring.truncate(self.capacity);
            ring.iter().cloned().collect::<Vec<_>>()
        };
        self.persist(&snapshot).await?;
        self.notifier.publish(Event::ActivitiesUpdated {
            activities: snapshot,
        });
        Ok(())
    }

    /// Most recent first.
    pub async fn list(&self) -> Vec<ActivityRecord> {
        let mut guard = self.ring.lock().await;
        self.load_if_needed(&mut guard).await.iter().cloned().collect()
    }

    async fn load_if_needed<'a>(
        &self,
        guard: &'a mut Option<VecDeque<ActivityRecord>>,
    ) -> &'a mut VecDeque<ActivityRecord> {
        if guard.is_none() {
            let loaded = match tokio::fs::read(&self.path).await {
                Ok(raw) => serde_json::from_slice::<Vec<ActivityRecord>>(&raw)
                    .map(VecDeque::from)
                    .unwrap_or_default(),
                Err(_) => VecDeque::new(),
            };
            *guard = Some(loaded);
        }
        guard.as_mut().expect("ring loaded")
    }

    async fn persist(&self, records: &[ActivityRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_vec_pretty(records)
            .map_err(|e| Error::Unavailable(format!("encode activity log: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(dir: &std::path::Path) -> (ActivityLog, Arc<Notifier>) {
        let notifier = Arc::new(Notifier::new());
        (
            ActivityLog::new(dir.join("activities.json"), Arc::clone(&notifier)),
            notifier,
        )
    }

    #[tokio::test]
    async fn ring_keeps_newest_n() {
        let dir = tempfile::tempdir().unwrap();
        let (log, _notifier) = log(dir.path());
        for i in 0..8 {
            log.append(ActivityRecord::new(
                ActivityKind::SyncCompleted,
                None,
                format!("sync {i}"),
            ))
            .await
            .unwrap();
        }
        let records = log.list().await;
        assert_eq!(records.len(), ActivityLog::DEFAULT_CAPACITY);
        assert_eq!(records[0].message, "sync 7", "newest first");
        assert_eq!(records[4].message, "sync 3");
    }

    #[tokio::test]
    async fn appends_reach_observers() {
        let dir = tempfile::tempdir().unwrap();
        let (log, notifier) = log(dir.path());
        let mut rx = notifier.subscribe();
        log.append(ActivityRecord::new(ActivityKind::MountChanged, None, "mounted"))
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            Event::ActivitiesUpdated { activities } => {
                assert_eq!(activities.len(), 1);
                assert_eq!(activities[0].message, "mounted");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (log, _n) = log(dir.path());
            log.append(ActivityRecord::new(ActivityKind::Error, None, "boom"))
                .await
                .unwrap();
        }
        let (reloaded, _n) = log(dir.path());
        let records = reloaded.list().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "boom");
    }
}

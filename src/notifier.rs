//! Typed event fan-out towards the IPC adapter.
//!
//! Events broadcast to however many subscribers are attached; the wire
//! form is lossy JSON, so a slow subscriber missing events is within
//! contract. The engine itself never inspects the wire form.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::activity::ActivityRecord;
use crate::catalog::SyncPairId;
use crate::plan::ConflictInfo;
use crate::state::GlobalState;

/// Events published by engine components.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    StateChanged {
        old_state: GlobalState,
        new_state: GlobalState,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    IndexProgress {
        sync_pair_id: SyncPairId,
        phase: String,
        scanned_files: u64,
        progress: f64,
    },
    #[serde(rename_all = "camelCase")]
    IndexReady { sync_pair_id: SyncPairId },
    #[serde(rename_all = "camelCase")]
    SyncProgress {
        sync_pair_id: SyncPairId,
        processed_files: u64,
        total_files: u64,
        processed_bytes: u64,
        total_bytes: u64,
        current_file: Option<String>,
        /// Bytes per second over the run so far.
        speed: f64,
    },
    #[serde(rename_all = "camelCase")]
    SyncStatusChanged {
        sync_pair_id: SyncPairId,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SyncCompleted {
        sync_pair_id: SyncPairId,
        files_count: u64,
        bytes_count: u64,
    },
    #[serde(rename_all = "camelCase")]
    ConflictDetected { conflicts: Vec<ConflictInfo> },
    #[serde(rename_all = "camelCase")]
    EvictionProgress {
        sync_pair_id: SyncPairId,
        freed_bytes: u64,
        remaining_bytes: u64,
    },
    #[serde(rename_all = "camelCase")]
    ComponentError {
        component: String,
        code: String,
        message: String,
        recoverable: bool,
    },
    #[serde(rename_all = "camelCase")]
    DiskChanged { disk_name: String, is_connected: bool },
    #[serde(rename_all = "camelCase")]
    ActivitiesUpdated { activities: Vec<ActivityRecord> },
}

impl Event {
    /// Lossy JSON wire form handed to the IPC adapter.
    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned())
    }
}

pub struct Notifier {
    tx: broadcast::Sender<Event>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    const CHANNEL_CAPACITY: usize = 256;

    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(Self::CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish to all current subscribers. With no subscribers the
    /// event is dropped, which is fine: the wire is lossy.
    pub fn publish(&self, event: Event) {
        trace!(?event, "publish");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

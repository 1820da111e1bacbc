//! IPC command surface.
//!
//! The IPC adapter deserializes [`Command`] values straight off its
//! transport and hands them to [`crate::engine::Engine::dispatch`].
//! Commands are non-blocking: the reply acknowledges acceptance and
//! long-running effects arrive as notifier events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::activity::ActivityRecord;
use crate::plan::ConflictResolution;
use crate::state::{ComponentState, GlobalState};
use crate::vfs::MountSummary;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    #[serde(rename_all = "camelCase")]
    SyncNow { sync_pair_id: String },
    SyncAll,
    #[serde(rename_all = "camelCase")]
    PauseSync { sync_pair_id: String },
    #[serde(rename_all = "camelCase")]
    ResumeSync { sync_pair_id: String },
    #[serde(rename_all = "camelCase")]
    CancelSync { sync_pair_id: String },
    #[serde(rename_all = "camelCase")]
    RebuildIndex { sync_pair_id: String },
    #[serde(rename_all = "camelCase")]
    TriggerEviction { sync_pair_id: String },
    #[serde(rename_all = "camelCase")]
    ResolveConflict {
        sync_pair_id: String,
        relative_path: String,
        resolution: ConflictResolution,
    },
    GetFullState,
    ListActivities,
}

/// Aggregate the GUI renders from one call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceFullState {
    pub global_state: GlobalState,
    pub component_states: BTreeMap<String, ComponentState>,
    pub mounts: Vec<MountSummary>,
    pub last_sync_times: BTreeMap<String, DateTime<Utc>>,
    pub activities: Vec<ActivityRecord>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "reply", rename_all = "camelCase")]
pub enum CommandReply {
    Accepted,
    #[serde(rename_all = "camelCase")]
    Rejected { reason: String },
    #[serde(rename_all = "camelCase")]
    FullState { state: ServiceFullState },
    #[serde(rename_all = "camelCase")]
    Activities { activities: Vec<ActivityRecord> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_decode_from_camel_case_json() {
        let cmd: Command = serde_json::from_str(
            r#"{"command":"syncNow","syncPairId":"media"}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::SyncNow {
                sync_pair_id: "media".into()
            }
        );

        let cmd: Command = serde_json::from_str(
            r#"{"command":"resolveConflict","syncPairId":"media","relativePath":"doc.md","resolution":"keepBoth"}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::ResolveConflict {
                sync_pair_id: "media".into(),
                relative_path: "doc.md".into(),
                resolution: ConflictResolution::KeepBoth,
            }
        );
    }

    #[test]
    fn replies_encode_tagged() {
        let raw = serde_json::to_string(&CommandReply::Accepted).unwrap();
        assert_eq!(raw, r#"{"reply":"accepted"}"#);
        let raw = serde_json::to_string(&CommandReply::Rejected {
            reason: "unknown pair".into(),
        })
        .unwrap();
        assert!(raw.contains("\"rejected\""));
    }
}

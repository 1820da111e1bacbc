//! Global and per-component state machines.
//!
//! The global machine gates externally-triggered operations; component
//! states feed the aggregate the IPC adapter reports. Transitions are
//! validated, published on a watch channel for in-process readers, and
//! mirrored as `stateChanged` events.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::error::{Error, Result};
use crate::notifier::{Event, Notifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GlobalState {
    Starting,
    IpcReady,
    VfsMounting,
    Indexing,
    Ready,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl GlobalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GlobalState::Starting => "starting",
            GlobalState::IpcReady => "ipcReady",
            GlobalState::VfsMounting => "vfsMounting",
            GlobalState::Indexing => "indexing",
            GlobalState::Ready => "ready",
            GlobalState::Running => "running",
            GlobalState::Paused => "paused",
            GlobalState::Stopping => "stopping",
            GlobalState::Stopped => "stopped",
            GlobalState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ComponentState {
    #[default]
    NotStarted,
    Starting,
    Ready,
    Busy,
    Error,
}

/// Categories of externally-triggered calls, gated by the global state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    StatusQuery,
    ConfigRead,
    ConfigWrite,
    Filesystem,
}

pub struct StateManager {
    global: watch::Sender<GlobalState>,
    components: DashMap<String, ComponentState>,
    notifier: Arc<Notifier>,
}

impl StateManager {
    pub fn new(notifier: Arc<Notifier>) -> Self {
        let (global, _) = watch::channel(GlobalState::Starting);
        Self {
            global,
            components: DashMap::new(),
            notifier,
        }
    }

    pub fn current(&self) -> GlobalState {
        *self.global.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<GlobalState> {
        self.global.subscribe()
    }

    /// Perform a validated transition. An invalid edge is reported as
    /// `Unavailable` and leaves the state untouched.
    pub fn transition(&self, next: GlobalState) -> Result<()> {
        let current = self.current();
        if current == next {
            return Ok(());
        }
        if !Self::is_valid_transition(current, next) {
            return Err(Error::Unavailable(format!(
                "invalid state transition {} -> {}",
                current.as_str(),
                next.as_str()
            )));
        }
        let _ = self.global.send(next);
        info!(from = current.as_str(), to = next.as_str(), "state transition");
        self.notifier.publish(Event::StateChanged {
            old_state: current,
            new_state: next,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// `error` is reachable from anywhere and retryable back through
    /// `starting`; the rest follows the lifecycle order.
    fn is_valid_transition(from: GlobalState, to: GlobalState) -> bool {
        use GlobalState::*;
        if to == Error {
            return true;
        }
        matches!(
            (from, to),
            (Starting, IpcReady)
                | (IpcReady, VfsMounting)
                | (VfsMounting, Indexing)
                | (Indexing, Ready)
                | (Ready, Running)
                | (Running, Ready)
                | (Ready, Paused)
                | (Paused, Ready)
                | (Running, Paused)
                | (Paused, Running)
                | (Ready, VfsMounting)
                | (Ready, Indexing)
                | (Ready, Stopping)
                | (Running, Stopping)
                | (Paused, Stopping)
                | (IpcReady, Stopping)
                | (Stopping, Stopped)
                | (Error, Starting)
                | (Error, Stopping)
        )
    }

    pub fn set_component(&self, name: &str, state: ComponentState) {
        self.components.insert(name.to_owned(), state);
    }

    pub fn component(&self, name: &str) -> ComponentState {
        self.components
            .get(name)
            .map(|s| *s.value())
            .unwrap_or_default()
    }

    pub fn components(&self) -> BTreeMap<String, ComponentState> {
        self.components
            .iter()
            .map(|kv| (kv.key().clone(), *kv.value()))
            .collect()
    }

    /// Report a component failure and, when non-recoverable, drive the
    /// global machine to `error`.
    pub fn component_error(&self, component: &str, err: &Error) {
        self.set_component(component, ComponentState::Error);
        self.notifier.publish(Event::ComponentError {
            component: component.to_owned(),
            code: err.code().to_owned(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
        });
        if !err.is_recoverable() {
            let _ = self.transition(GlobalState::Error);
        }
    }

    /// Whether `op` is allowed in the current global state. Status
    /// queries always are; config reads need a state with config
    /// access; config writes additionally exclude `error`; filesystem
    /// operations need `ready` or `running`.
    pub fn can_perform(&self, op: Operation) -> bool {
        let state = self.current();
        match op {
            Operation::StatusQuery => true,
            Operation::ConfigRead => Self::allows_config_access(state),
            Operation::ConfigWrite => {
                Self::allows_config_access(state) && state != GlobalState::Error
            }
            Operation::Filesystem => Self::allows_operations(state),
        }
    }

    fn allows_config_access(state: GlobalState) -> bool {
        !matches!(
            state,
            GlobalState::Starting | GlobalState::Stopping | GlobalState::Stopped
        )
    }

    fn allows_operations(state: GlobalState) -> bool {
        matches!(state, GlobalState::Ready | GlobalState::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> StateManager {
        StateManager::new(Arc::new(Notifier::new()))
    }

    fn drive_to_ready(m: &StateManager) {
        for s in [
            GlobalState::IpcReady,
            GlobalState::VfsMounting,
            GlobalState::Indexing,
            GlobalState::Ready,
        ] {
            m.transition(s).unwrap();
        }
    }

    #[test]
    fn lifecycle_path_is_valid() {
        let m = manager();
        drive_to_ready(&m);
        assert_eq!(m.current(), GlobalState::Ready);
        m.transition(GlobalState::Running).unwrap();
        m.transition(GlobalState::Paused).unwrap();
        m.transition(GlobalState::Running).unwrap();
        m.transition(GlobalState::Stopping).unwrap();
        m.transition(GlobalState::Stopped).unwrap();
    }

    #[test]
    fn shortcut_transitions_rejected() {
        let m = manager();
        assert!(m.transition(GlobalState::Ready).is_err());
        assert_eq!(m.current(), GlobalState::Starting);
    }

    #[test]
    fn error_reachable_from_anywhere_and_retryable() {
        let m = manager();
        drive_to_ready(&m);
        m.transition(GlobalState::Error).unwrap();
        m.transition(GlobalState::Starting).unwrap();
    }

    #[test]
    fn operation_gating() {
        let m = manager();
        assert!(m.can_perform(Operation::StatusQuery));
        assert!(!m.can_perform(Operation::ConfigRead), "still starting");
        assert!(!m.can_perform(Operation::Filesystem));

        drive_to_ready(&m);
        assert!(m.can_perform(Operation::ConfigRead));
        assert!(m.can_perform(Operation::ConfigWrite));
        assert!(m.can_perform(Operation::Filesystem));

        m.transition(GlobalState::Error).unwrap();
        assert!(m.can_perform(Operation::ConfigRead));
        assert!(!m.can_perform(Operation::ConfigWrite), "no writes in error");
        assert!(!m.can_perform(Operation::Filesystem));
    }

    #[test]
    fn non_recoverable_error_drives_global_state() {
        let m = manager();
        drive_to_ready(&m);
        m.component_error("catalog", &Error::Corrupt("snapshot".into()));
        assert_eq!(m.current(), GlobalState::Error);
        assert_eq!(m.component("catalog"), ComponentState::Error);
    }

    #[test]
    fn recoverable_error_keeps_global_state() {
        let m = manager();
        drive_to_ready(&m);
        m.component_error("sync", &Error::DiskNotConnected("ext".into()));
        assert_eq!(m.current(), GlobalState::Ready);
        assert_eq!(m.component("sync"), ComponentState::Error);
    }
}

//! Timers and event-driven scheduling.
//!
//! Three drivers, none of which contain business logic themselves:
//! a periodic tick that fires auto-sync for pairs past their interval,
//! a per-pair debounce that coalesces write bursts into one sync, and
//! disk events that pause or resume pairs and kick a sync when dirty
//! files are waiting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::catalog::SyncPairId;
use crate::notifier::{Event, Notifier};

/// Signals routed into the scheduler from the VFS layer and the
/// platform's disk watcher.
#[derive(Debug, Clone)]
pub enum PairEvent {
    FileWritten { pair: SyncPairId },
    DiskConnected { disk_name: String },
    DiskDisconnected { disk_name: String },
}

/// Engine operations the scheduler may invoke.
#[async_trait]
pub trait SyncDriver: Send + Sync {
    fn pairs(&self) -> Vec<SyncPairId>;
    fn pairs_on_disk(&self, disk_name: &str) -> Vec<SyncPairId>;
    async fn auto_sync_due(&self, pair: &SyncPairId) -> bool;
    async fn has_dirty_files(&self, pair: &SyncPairId) -> bool;
    async fn sync_pair(&self, pair: &SyncPairId);
    async fn pause_pair(&self, pair: &SyncPairId);
    async fn resume_pair(&self, pair: &SyncPairId);
}

pub struct Scheduler {
    driver: Arc<dyn SyncDriver>,
    notifier: Arc<Notifier>,
    debounce: Duration,
    deadlines: Arc<DashMap<SyncPairId, Instant>>,
}

impl Scheduler {
    /// Auto-sync poll period.
    pub const TICK: Duration = Duration::from_secs(10);

    pub fn new(driver: Arc<dyn SyncDriver>, notifier: Arc<Notifier>, debounce: Duration) -> Self {
        Self {
            driver,
            notifier,
            debounce,
            deadlines: Arc::new(DashMap::new()),
        }
    }

    /// Spawn the tick task and the event loop. Dropping the sender side
    /// of `events` ends the event loop; the tick task runs until
    /// aborted.
    pub fn spawn(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<PairEvent>,
    ) -> Vec<JoinHandle<()>> {
        let tick = {
            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Self::TICK);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    scheduler.run_auto_sync().await;
                }
            })
        };
        let event_loop = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.handle(event).await;
            }
        });
        vec![tick, event_loop]
    }

    async fn run_auto_sync(&self) {
        for pair in self.driver.pairs() {
            if self.driver.auto_sync_due(&pair).await {
                debug!(pair = %pair, "auto-sync due");
                self.driver.sync_pair(&pair).await;
            }
        }
    }

    pub async fn handle(&self, event: PairEvent) {
        match event {
            PairEvent::FileWritten { pair } => self.debounce_sync(pair),
            PairEvent::DiskConnected { disk_name } => {
                self.notifier.publish(Event::DiskChanged {
                    disk_name: disk_name.clone(),
                    is_connected: true,
                });
                for pair in self.driver.pairs_on_disk(&disk_name) {
                    self.driver.resume_pair(&pair).await;
                    if self.driver.has_dirty_files(&pair).await {
                        debug!(pair = %pair, "disk back, dirty files waiting");
                        self.driver.sync_pair(&pair).await;
                    }
                }
            }
            PairEvent::DiskDisconnected { disk_name } => {
                self.notifier.publish(Event::DiskChanged {
                    disk_name: disk_name.clone(),
                    is_connected: false,
                });
                for pair in self.driver.pairs_on_disk(&disk_name) {
                    self.driver.pause_pair(&pair).await;
                }
            }
        }
    }

    /// Push the pair's deadline out; the first event also spawns the
    /// waiter that fires one sync once writes go quiet.
    fn debounce_sync(&self, pair: SyncPairId) {
        let deadline = Instant::now() + self.debounce;
        let first = self.deadlines.insert(pair.clone(), deadline).is_none();
        if !first {
            return;
        }
        let deadlines = Arc::clone(&self.deadlines);
        let driver = Arc::clone(&self.driver);
        tokio::spawn(async move {
            loop {
                let Some(deadline) = deadlines.get(&pair).map(|d| *d.value()) else {
                    return;
                };
                if Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep_until(deadline).await;
            }
            deadlines.remove(&pair);
            debug!(pair = %pair, "debounce elapsed, syncing");
            driver.sync_pair(&pair).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingDriver {
        syncs: AtomicUsize,
        paused: Mutex<Vec<String>>,
        resumed: Mutex<Vec<String>>,
        dirty: bool,
    }

    #[async_trait]
    impl SyncDriver for RecordingDriver {
        fn pairs(&self) -> Vec<SyncPairId> {
            vec![SyncPairId::new("p")]
        }

        fn pairs_on_disk(&self, _disk_name: &str) -> Vec<SyncPairId> {
            vec![SyncPairId::new("p")]
        }

        async fn auto_sync_due(&self, _pair: &SyncPairId) -> bool {
            false
        }

        async fn has_dirty_files(&self, _pair: &SyncPairId) -> bool {
            self.dirty
        }

        async fn sync_pair(&self, _pair: &SyncPairId) {
            self.syncs.fetch_add(1, Ordering::SeqCst);
        }

        async fn pause_pair(&self, pair: &SyncPairId) {
            self.paused.lock().await.push(pair.as_str().to_owned());
        }

        async fn resume_pair(&self, pair: &SyncPairId) {
            self.resumed.lock().await.push(pair.as_str().to_owned());
        }
    }

    fn scheduler(driver: Arc<RecordingDriver>, debounce: Duration) -> Scheduler {
        Scheduler::new(driver, Arc::new(Notifier::new()), debounce)
    }

    #[tokio::test]
    async fn write_bursts_coalesce_into_one_sync() {
        let driver = Arc::new(RecordingDriver::default());
        let scheduler = scheduler(Arc::clone(&driver), Duration::from_millis(50));
        for _ in 0..10 {
            scheduler
                .handle(PairEvent::FileWritten {
                    pair: SyncPairId::new("p"),
                })
                .await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(driver.syncs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn writes_keep_pushing_the_deadline() {
        let driver = Arc::new(RecordingDriver::default());
        let scheduler = scheduler(Arc::clone(&driver), Duration::from_millis(80));
        scheduler
            .handle(PairEvent::FileWritten {
                pair: SyncPairId::new("p"),
            })
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Still within the window: deadline moves, no sync yet.
        scheduler
            .handle(PairEvent::FileWritten {
                pair: SyncPairId::new("p"),
            })
            .await;
        assert_eq!(driver.syncs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(driver.syncs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disk_disconnect_pauses_and_reconnect_resumes() {
        let driver = Arc::new(RecordingDriver {
            dirty: true,
            ..Default::default()
        });
        let scheduler = scheduler(Arc::clone(&driver), Duration::from_millis(10));
        scheduler
            .handle(PairEvent::DiskDisconnected {
                disk_name: "ext".into(),
            })
            .await;
        assert_eq!(driver.paused.lock().await.len(), 1);

        scheduler
            .handle(PairEvent::DiskConnected {
                disk_name: "ext".into(),
            })
            .await;
        assert_eq!(driver.resumed.lock().await.len(), 1);
        assert_eq!(
            driver.syncs.load(Ordering::SeqCst),
            1,
            "dirty files kick a sync on reconnect"
        );
    }
}

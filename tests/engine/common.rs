use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use overlay_mamont::catalog::{FileEntry, SyncPairId, VirtualPath};
use overlay_mamont::config::Config;
use overlay_mamont::engine::{Engine, PairConfig};
use overlay_mamont::vfs::NullAdapterFactory;

pub const PAIR: &str = "pair-1";

pub struct Fixture {
    pub root: TempDir,
    pub engine: Arc<Engine>,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Engine over a fresh tempdir; the pair is not mounted yet so
    /// tests can pre-populate both stores.
    pub async fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let root = TempDir::new().expect("tempdir");
        std::fs::create_dir_all(root.path().join("local")).expect("local dir");
        std::fs::create_dir_all(root.path().join("external")).expect("external dir");
        let mut config = Config::default();
        config.state_dir = Some(root.path().join("state"));
        tweak(&mut config);
        let engine = Engine::new(config, Arc::new(NullAdapterFactory))
            .await
            .expect("engine");
        engine.start().await.expect("start");
        Self { root, engine }
    }

    pub async fn mount_pair(&self) {
        self.engine
            .add_pair(
                PAIR,
                PairConfig {
                    local_dir: self.local_dir(),
                    external_dir: Some(self.external_dir()),
                    target_dir: self.root.path().join("mount"),
                    disk_name: Some("ext-disk".into()),
                },
            )
            .await
            .expect("mount pair");
    }

    pub fn pair(&self) -> SyncPairId {
        SyncPairId::new(PAIR)
    }

    pub fn local_dir(&self) -> PathBuf {
        self.root.path().join("local")
    }

    pub fn external_dir(&self) -> PathBuf {
        self.root.path().join("external")
    }

    pub fn write_local(&self, rel: &str, content: &[u8]) {
        let path = self.local_dir().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("parents");
        }
        std::fs::write(path, content).expect("write local");
    }

    pub fn write_external(&self, rel: &str, content: &[u8]) {
        let path = self.external_dir().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("parents");
        }
        std::fs::write(path, content).expect("write external");
    }

    pub fn read_external(&self, rel: &str) -> Vec<u8> {
        std::fs::read(self.external_dir().join(rel)).expect("read external")
    }

    pub fn vpath(rel: &str) -> VirtualPath {
        VirtualPath::new(rel).expect("virtual path")
    }

    pub async fn entry(&self, rel: &str) -> Option<FileEntry> {
        self.engine
            .catalog()
            .get(&self.pair(), &Self::vpath(rel))
            .await
    }
}

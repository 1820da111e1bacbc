//! Filesystem-adapter contract.
//!
//! The engine drives a FUSE implementation only through [`FuseAdapter`];
//! the adapter routes user I/O back through the [`MountDelegate`] it is
//! handed at mount time. Errors the adapter must surface to user calls
//! are expressed as [`VfsErrno`] values.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::catalog::{Catalog, Location, SyncPairId, VirtualPath};
use crate::error::Result;
use crate::lock_table::LockTable;

/// Errno the adapter returns for a user call it cannot serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfsErrno {
    /// Index not ready yet.
    Busy,
    /// External store offline for an external-only file.
    Io,
    /// Path unknown to the catalog.
    NoEnt,
    /// Blocked by a conflicting sync lock; retry shortly.
    Again,
}

impl VfsErrno {
    pub fn code(&self) -> i32 {
        match self {
            VfsErrno::Busy => 16,
            VfsErrno::Io => 5,
            VfsErrno::NoEnt => 2,
            VfsErrno::Again => 11,
        }
    }
}

/// Engine-side object handed to the adapter: resolves user reads and
/// writes against the catalog and the lock table.
pub struct MountDelegate {
    pair: SyncPairId,
    catalog: Arc<Catalog>,
    locks: Arc<LockTable>,
    index_ready: AtomicBool,
    external_online: AtomicBool,
    read_only: AtomicBool,
    resolved: moka::sync::Cache<String, PathBuf>,
}

impl MountDelegate {
    const CACHE_CAPACITY: u64 = 4096;

    pub fn new(pair: SyncPairId, catalog: Arc<Catalog>, locks: Arc<LockTable>) -> Self {
        Self {
            pair,
            catalog,
            locks,
            index_ready: AtomicBool::new(false),
            external_online: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            resolved: moka::sync::Cache::new(Self::CACHE_CAPACITY),
        }
    }

    pub fn pair(&self) -> &SyncPairId {
        &self.pair
    }

    pub fn set_index_ready(&self, ready: bool) {
        self.index_ready.store(ready, Ordering::SeqCst);
        if !ready {
            self.resolved.invalidate_all();
        }
    }

    pub fn is_index_ready(&self) -> bool {
        self.index_ready.load(Ordering::SeqCst)
    }

    pub fn set_external_online(&self, online: bool) {
        self.external_online.store(online, Ordering::SeqCst);
        self.resolved.invalidate_all();
    }

    pub fn is_external_online(&self) -> bool {
        self.external_online.load(Ordering::SeqCst)
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Drop the cached resolution for one path; called on every
    /// catalog-mutating event for it.
    pub fn invalidate(&self, vpath: &VirtualPath) {
        self.resolved.invalidate(vpath.as_str());
    }

    /// Where the bytes for `vpath` are served from right now.
    ///
    /// `localOnly`/`both` entries read from the local store;
    /// `externalOnly` entries read from the external store while it is
    /// online and fail with `EIO` while it is not.
    pub async fn resolve_read(&self, vpath: &VirtualPath) -> std::result::Result<PathBuf, VfsErrno> {
        if !self.is_index_ready() {
            return Err(VfsErrno::Busy);
        }
        if let Some(path) = self.resolved.get(vpath.as_str()) {
            return Ok(path);
        }
        let entry = self
            .catalog
            .get(&self.pair, vpath)
            .await
            .ok_or(VfsErrno::NoEnt)?;
        let path = match entry.location {
            Location::LocalOnly | Location::Both => {
                entry.local_path.clone().ok_or(VfsErrno::Io)?
            }
            Location::ExternalOnly => {
                if !self.is_external_online() {
                    return Err(VfsErrno::Io);
                }
                entry.external_path.clone().ok_or(VfsErrno::Io)?
            }
        };
        self.resolved.insert(vpath.as_str().to_owned(), path.clone());
        Ok(path)
    }

    /// Whether a user write to `vpath` may proceed right now.
    pub fn check_write(&self, vpath: &VirtualPath) -> std::result::Result<(), VfsErrno> {
        if !self.is_index_ready() || self.is_read_only() {
            return Err(VfsErrno::Busy);
        }
        if self.locks.blocks_user_write(&self.pair, vpath) {
            return Err(VfsErrno::Again);
        }
        Ok(())
    }
}

/// Contract between the engine and the FUSE implementation.
#[async_trait]
pub trait FuseAdapter: Send + Sync {
    async fn mount(
        &self,
        target_dir: &Path,
        volume_name: &str,
        delegate: Arc<MountDelegate>,
    ) -> Result<()>;
    async fn unmount(&self) -> Result<()>;
    fn set_index_ready(&self, ready: bool);
    fn set_read_only(&self, read_only: bool);
    fn set_external_offline(&self, offline: bool);
    async fn update_external_dir(&self, path: &Path) -> Result<()>;
    fn is_mounted(&self) -> bool;
}

/// In-process adapter that keeps the bookkeeping honest without any
/// kernel involvement. The daemon uses it on platforms without a FUSE
/// build; tests wrap it with scripted failures.
#[derive(Default)]
pub struct NullFuseAdapter {
    mounted: AtomicBool,
    delegate: std::sync::Mutex<Option<Arc<MountDelegate>>>,
}

impl NullFuseAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delegate(&self) -> Option<Arc<MountDelegate>> {
        self.delegate.lock().expect("delegate lock").clone()
    }
}

#[async_trait]
impl FuseAdapter for NullFuseAdapter {
    async fn mount(
        &self,
        _target_dir: &Path,
        _volume_name: &str,
        delegate: Arc<MountDelegate>,
    ) -> Result<()> {
        *self.delegate.lock().expect("delegate lock") = Some(delegate);
        self.mounted.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unmount(&self) -> Result<()> {
        self.mounted.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_index_ready(&self, ready: bool) {
        if let Some(delegate) = self.delegate() {
            delegate.set_index_ready(ready);
        }
    }

    fn set_read_only(&self, read_only: bool) {
        if let Some(delegate) = self.delegate() {
            delegate.set_read_only(read_only);
        }
    }

    fn set_external_offline(&self, offline: bool) {
        if let Some(delegate) = self.delegate() {
            delegate.set_external_online(!offline);
        }
    }

    async fn update_external_dir(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }
}

/// Produces one adapter per mount; lets tests substitute scripted
/// implementations.
pub trait AdapterFactory: Send + Sync {
    fn create(&self, pair: &SyncPairId) -> Arc<dyn FuseAdapter>;
}

/// Factory for [`NullFuseAdapter`]s.
#[derive(Default)]
pub struct NullAdapterFactory;

impl AdapterFactory for NullAdapterFactory {
    fn create(&self, _pair: &SyncPairId) -> Arc<dyn FuseAdapter> {
        Arc::new(NullFuseAdapter::new())
    }
}

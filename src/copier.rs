//! Atomic single-file copies.
//!
//! A copy streams into `dest.tmp-<nonce>` in the destination directory,
//! fsyncs, then renames onto the final name. The rename is the commit
//! point: a crash before it leaves only a temp file, a crash after it
//! leaves the complete destination. Pause and cancel are honoured
//! between chunks; a cancelled copy removes its temp file before
//! surfacing `Cancelled`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_queue::ArrayQueue;
use filetime::FileTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::control::{CancelFlag, PauseFlag};
use crate::error::{classify_io, Error, Result};
use crate::hasher::Hasher;
use crate::plan::SyncAction;

#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub overwrite_existing: bool,
    pub verify_after_copy: bool,
    pub preserve_times: bool,
    pub buffer_size: usize,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            overwrite_existing: true,
            verify_after_copy: true,
            preserve_times: true,
            buffer_size: crate::hasher::DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Observer for per-file copy progress. All methods default to no-ops.
pub trait CopyObserver: Send + Sync {
    fn on_file_started(&self, _relative_path: &str) {}
    fn on_bytes_copied(&self, _relative_path: &str, _chunk: u64) {}
    fn on_file_finished(&self, _relative_path: &str, _bytes: u64) {}
    fn on_file_failed(&self, _relative_path: &str, _message: &str) {}
}

pub struct NoopObserver;

impl CopyObserver for NoopObserver {}

/// Outcome of a batch copy.
#[derive(Debug, Default)]
pub struct CopyBatchResult {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub bytes_copied: u64,
}

pub struct Copier {
    options: CopyOptions,
    verifier: Hasher,
    pause: PauseFlag,
    cancel: CancelFlag,
    buffers: ArrayQueue<Vec<u8>>,
}

impl Copier {
    pub fn new(
        options: CopyOptions,
        verifier: Hasher,
        pause: PauseFlag,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            options,
            verifier,
            pause,
            cancel,
            buffers: ArrayQueue::new(4),
        }
    }

    fn take_buffer(&self) -> Vec<u8> {
        self.buffers
            .pop()
            .unwrap_or_else(|| vec![0u8; self.options.buffer_size])
    }

    fn return_buffer(&self, buf: Vec<u8>) {
        let _ = self.buffers.push(buf);
    }

    /// Copy one file according to the protocol, returning bytes written.
    pub async fn copy_file(&self, source: &Path, dest: &Path) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| classify_io(parent, e))?;
        }
        if !self.options.overwrite_existing {
            if tokio::fs::metadata(dest).await.is_ok() {
                return Err(Error::AlreadyExists(dest.to_path_buf()));
            }
        }

        let mut src_file = tokio::fs::File::open(source)
            .await
            .map_err(|e| classify_io(source, e))?;
        let src_meta = src_file.metadata().await.map_err(|e| classify_io(source, e))?;

        let tmp = tmp_path(dest);
        let mut out = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| classify_io(&tmp, e))?;

        let mut buf = self.take_buffer();
        let mut written: u64 = 0;
        let copy_loop = async {
            loop {
                self.pause.wait_if_paused(&self.cancel).await?;
                let n = src_file
                    .read(&mut buf)
                    .await
                    .map_err(|e| classify_io(source, e))?;
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n])
                    .await
                    .map_err(|e| classify_io(&tmp, e))?;
                written += n as u64;
            }
            out.sync_all().await.map_err(|e| classify_io(&tmp, e))?;
            Ok::<_, Error>(())
        };
        let outcome = copy_loop.await;
        self.return_buffer(buf);
        drop(out);
        if let Err(err) = outcome {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err);
        }

        // Commit point.
        tokio::fs::rename(&tmp, dest)
            .await
            .map_err(|e| classify_io(dest, e))?;

        if self.options.preserve_times {
            let mtime = FileTime::from_last_modification_time(&src_meta);
            let atime = FileTime::from_last_access_time(&src_meta);
            if let Err(e) = filetime::set_file_times(dest, atime, mtime) {
                debug!(dest = %dest.display(), %e, "could not preserve file times");
            }
            let _ = tokio::fs::set_permissions(dest, src_meta.permissions()).await;
        }

        if self.options.verify_after_copy {
            self.verify(source, dest).await?;
        }
        Ok(written)
    }

    /// Re-hash both sides; on mismatch the destination is removed so a
    /// retry starts from a clean slate.
    pub async fn verify(&self, source: &Path, dest: &Path) -> Result<()> {
        let expected = self.verifier.hash_file(source, &self.cancel).await?;
        let actual = self.verifier.hash_file(dest, &self.cancel).await?;
        if expected != actual {
            let _ = tokio::fs::remove_file(dest).await;
            return Err(Error::VerificationFailed { expected, actual });
        }
        Ok(())
    }

    /// Run the copy/update actions of a plan sequentially. Per-file
    /// failures are collected; the batch continues. Locks are the
    /// caller's responsibility.
    pub async fn copy_files(
        &self,
        actions: &[SyncAction],
        observer: &dyn CopyObserver,
    ) -> Result<CopyBatchResult> {
        let mut result = CopyBatchResult::default();
        for action in actions {
            self.cancel.check()?;
            let (rel, source, dest) = match action {
                SyncAction::Copy {
                    relative_path,
                    source,
                    destination,
                    ..
                }
                | SyncAction::Update {
                    relative_path,
                    source,
                    destination,
                    ..
                } => (relative_path, source, destination),
                _ => continue,
            };
            observer.on_file_started(rel);
            match self.copy_file(source, dest).await {
                Ok(bytes) => {
                    result.bytes_copied += bytes;
                    result.succeeded.push(rel.clone());
                    observer.on_file_finished(rel, bytes);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    observer.on_file_failed(rel, &err.to_string());
                    result.failed.push((rel.clone(), err.to_string()));
                }
            }
        }
        Ok(result)
    }
}

fn tmp_path(dest: &Path) -> PathBuf {
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_owned());
    dest.with_file_name(format!("{name}.tmp-{nonce:016x}"))
}

/// Copier with default options, used by conflict execution and tests.
pub fn plain_copier() -> Arc<Copier> {
    Arc::new(Copier::new(
        CopyOptions {
            verify_after_copy: false,
            ..Default::default()
        },
        Hasher::default(),
        PauseFlag::new(),
        CancelFlag::new(),
    ))
}

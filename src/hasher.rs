//! Streaming file checksums.
//!
//! Three algorithms are supported: MD5 and SHA-256 for verification,
//! xxHash64 for cheap change detection only. Files are read in
//! configurable chunks so memory stays bounded regardless of file size,
//! and batch hashing fans out to a small worker pool fed through an
//! MPMC channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use xxhash_rust::xxh64::Xxh64;

use crate::control::CancelFlag;
use crate::error::{classify_io, Result};

/// Default streaming buffer: 1 MiB.
pub const DEFAULT_BUFFER_SIZE: usize = 1_048_576;

/// Default worker count for batch hashing.
pub const DEFAULT_PARALLELISM: usize = 4;

/// Supported checksum algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Md5,
    Sha256,
    /// Non-cryptographic; change detection only.
    #[serde(rename = "xxhash64")]
    XxHash64,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::XxHash64 => "xxhash64",
        }
    }
}

enum HashState {
    Md5(Md5),
    Sha256(Sha256),
    Xxh64(Xxh64),
}

impl HashState {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Md5 => HashState::Md5(Md5::new()),
            HashAlgorithm::Sha256 => HashState::Sha256(Sha256::new()),
            HashAlgorithm::XxHash64 => HashState::Xxh64(Xxh64::new(0)),
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        match self {
            HashState::Md5(h) => h.update(chunk),
            HashState::Sha256(h) => h.update(chunk),
            HashState::Xxh64(h) => h.update(chunk),
        }
    }

    fn finish(self) -> String {
        match self {
            HashState::Md5(h) => hex(&h.finalize()),
            HashState::Sha256(h) => hex(&h.finalize()),
            HashState::Xxh64(h) => format!("{:016x}", h.digest()),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// File hasher with a fixed algorithm and chunk size.
#[derive(Debug, Clone)]
pub struct Hasher {
    algorithm: HashAlgorithm,
    buffer_size: usize,
    parallelism: usize,
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new(HashAlgorithm::Md5)
    }
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            buffer_size: DEFAULT_BUFFER_SIZE,
            parallelism: DEFAULT_PARALLELISM,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Hash one file, checking for cancellation between chunks.
    pub async fn hash_file(&self, path: &Path, cancel: &CancelFlag) -> Result<String> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| classify_io(path, e))?;
        let mut state = HashState::new(self.algorithm);
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            cancel.check()?;
            let n = file.read(&mut buf).await.map_err(|e| classify_io(path, e))?;
            if n == 0 {
                break;
            }
            state.update(&buf[..n]);
        }
        Ok(state.finish())
    }

    /// Hash a batch of files with bounded parallelism.
    ///
    /// The result vector is index-aligned with `paths`; a file that
    /// fails to hash yields `None` and the batch continues.
    pub async fn hash_files_parallel(
        &self,
        paths: &[PathBuf],
        cancel: &CancelFlag,
    ) -> Vec<Option<String>> {
        if paths.is_empty() {
            return Vec::new();
        }
        let (tx, rx) = async_channel::bounded::<(usize, PathBuf)>(paths.len());
        for item in paths.iter().cloned().enumerate() {
            // Channel is sized to the batch, send cannot block here.
            let _ = tx.send(item).await;
        }
        tx.close();

        let results = Arc::new(Mutex::new(vec![None; paths.len()]));
        let workers = self.parallelism.min(paths.len());
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let rx = rx.clone();
            let results = Arc::clone(&results);
            let hasher = self.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                while let Ok((index, path)) = rx.recv().await {
                    if cancel.is_cancelled() {
                        break;
                    }
                    match hasher.hash_file(&path, &cancel).await {
                        Ok(digest) => {
                            results.lock().await[index] = Some(digest);
                        }
                        Err(err) => {
                            tracing::debug!(path = %path.display(), %err, "hash failed");
                        }
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        let out = results.lock().await.clone();
        out
    }
}

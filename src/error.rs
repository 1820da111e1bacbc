//! Error kinds shared by every engine component.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result of engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine.
///
/// Per-file errors inside batch operations are collected and the batch
/// continues; phase-level errors abort the current run. Non-recoverable
/// kinds additionally push the global state to `Error`.
#[derive(Debug, Error)]
pub enum Error {
    /// The named file or directory does not exist.
    #[error("not found: {0}")]
    NotFound(PathBuf),

    /// The operation was refused by the operating system.
    #[error("permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// Destination already exists and overwriting was not requested.
    #[error("already exists: {0}")]
    AlreadyExists(PathBuf),

    /// The target directory is already served by a live mount.
    #[error("already mounted: {0}")]
    AlreadyMounted(PathBuf),

    /// Both the backing directory and the mount target are populated.
    #[error("conflicting paths: local {local} and target {target} are both populated")]
    ConflictingPaths { local: PathBuf, target: PathBuf },

    /// Cooperative cancellation was observed.
    #[error("operation cancelled")]
    Cancelled,

    /// A bounded wait elapsed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Post-copy verification found differing checksums.
    #[error("verification failed: expected {expected}, got {actual}")]
    VerificationFailed { expected: String, actual: String },

    /// Not enough room on the local store.
    #[error("insufficient space: required {required} bytes, available {available}")]
    InsufficientSpace { required: u64, available: u64 },

    /// The filesystem adapter could not establish the mount.
    #[error("mount failed: {0}")]
    MountFailed(String),

    /// The index builder cannot read one of the backing directories.
    #[error("index permission denied: {0}")]
    IndexPermissionDenied(PathBuf),

    /// The external store is offline.
    #[error("disk not connected: {0}")]
    DiskNotConnected(String),

    /// Persistent state failed to decode; the surrounding subsystem
    /// triggers a rebuild.
    #[error("corrupt state: {0}")]
    Corrupt(String),

    /// The backing store refused service.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Directory enumeration failed below the root; the walk could not
    /// continue.
    #[error("enumeration failed at {path}: {message}")]
    EnumerationFailed { path: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the scheduler may retry the failed operation on a later
    /// tick. Corrupt state, exhausted mounts and index permission
    /// failures require operator intervention instead.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Error::Corrupt(_) | Error::MountFailed(_) | Error::IndexPermissionDenied(_)
        )
    }

    /// Short stable code used in `componentError` payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "notFound",
            Error::PermissionDenied(_) => "permissionDenied",
            Error::AlreadyExists(_) => "alreadyExists",
            Error::AlreadyMounted(_) => "alreadyMounted",
            Error::ConflictingPaths { .. } => "conflictingPaths",
            Error::Cancelled => "cancelled",
            Error::Timeout(_) => "timeout",
            Error::VerificationFailed { .. } => "verificationFailed",
            Error::InsufficientSpace { .. } => "insufficientSpace",
            Error::MountFailed(_) => "mountFailed",
            Error::IndexPermissionDenied(_) => "indexPermissionDenied",
            Error::DiskNotConnected(_) => "diskNotConnected",
            Error::Corrupt(_) => "corrupt",
            Error::Unavailable(_) => "unavailable",
            Error::EnumerationFailed { .. } => "enumerationFailed",
            Error::Io(_) => "io",
        }
    }
}

/// Map an I/O error for `path` into the closest engine kind.
pub fn classify_io(path: &std::path::Path, err: std::io::Error) -> Error {
    match err.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(path.to_path_buf()),
        std::io::ErrorKind::PermissionDenied => Error::PermissionDenied(path.to_path_buf()),
        std::io::ErrorKind::AlreadyExists => Error::AlreadyExists(path.to_path_buf()),
        _ => Error::Io(err),
    }
}

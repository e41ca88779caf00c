//! Error types for the runtime.
//!
//! `StorageError` is the storage taxonomy surfaced by every key-value
//! call. Merge conflicts and unknown triggers are not errors: they are
//! resolved by policy (merge report, empty candidate set).

use boundary_kernel::arbiter::InstanceId;
use boundary_kernel::invariants::InvariantViolation;
use boundary_kernel::transitions::TransitionError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The backing store cannot be reached at all.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A write would exceed the quota. Nothing was written.
    #[error("storage exhausted writing {key:?}: needed {needed} bytes, {available} available")]
    Exhausted {
        key: String,
        needed: usize,
        available: usize,
    },

    /// A value could not be encoded or decoded.
    #[error("serialization failure for {key:?}: {message}")]
    Serialization { key: String, message: String },
}

/// What `Session` operations return.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// The instance is neither mounted nor queued.
    #[error("unknown instrument instance {0}")]
    UnknownInstance(InstanceId),

    /// The instance is waiting in the queue and cannot be completed yet.
    #[error("instrument instance {0} is queued, not mounted")]
    NotMounted(InstanceId),

    /// The bundle was written by a newer exporter.
    #[error("bundle version {found} is newer than supported version {supported}")]
    BundleVersion { found: u32, supported: u32 },

    /// An imported bundle would leave the store inconsistent.
    #[error("import rejected: {0}")]
    InvalidImport(#[from] InvariantViolation),

    #[error("bundle file error: {0}")]
    Io(String),
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

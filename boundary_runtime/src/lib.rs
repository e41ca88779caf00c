#![forbid(unsafe_code)]

//! Boundary Runtime
//!
//! Wraps the deterministic kernel with persistence, the receipt ledger,
//! export/import, configuration and the session that drives it all.
//!
//! No boundary logic lives here; rules, arbitration, transitions and
//! invariants are delegated to the kernel.

pub mod error;
pub mod config;
pub mod clock;
pub mod store;
pub mod persistence;
pub mod ledger;
pub mod bundle;
pub mod session;

pub use error::{EngineError, StorageError};
pub use session::{CompletionOutcome, Session, SharedSession};

#![forbid(unsafe_code)]

//! Boundary Kernel v1
//!
//! Pure, deterministic core of the constitutional boundary engine:
//! state, trigger rules, instrument arbitration, committed transitions,
//! invariants and receipts. No I/O, no clocks, no logging; callers pass
//! time in and persist what comes out.

/// Kernel v1. Bumping this changes every constitution hash.
pub const KERNEL_VERSION: u32 = 1;

pub mod domain;
pub mod state;
pub mod events;
pub mod instruments;
pub mod rules;
pub mod arbiter;
pub mod transitions;
pub mod invariants;
pub mod hashing;
pub mod receipt;

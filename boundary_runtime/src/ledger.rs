//! Receipt Ledger — append-only audit trail.
//!
//! Storage: the whole ledger is one JSON array under the `receipts` key,
//! so an append is a single-key write: fully written or not at all.
//!
//! Rules:
//!   - Append only; entries are never edited
//!   - Sequence strictly increasing, ids unique (validated on load)
//!   - Memory is updated only after the write succeeded
//!   - Only clear-all may purge, and it leaves its own receipt behind

use boundary_kernel::receipt::{Receipt, ReceiptDraft};
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::persistence::{encode, keys, Persistence};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerViolation {
    #[error("receipt {index} has sequence {found}, expected more than {previous}")]
    NonMonotonic { index: usize, previous: u64, found: u64 },

    #[error("receipt id {0:?} appears more than once")]
    DuplicateId(String),
}

/// Sequence monotonicity and id uniqueness.
pub fn verify_ledger(entries: &[Receipt]) -> Result<(), LedgerViolation> {
    let mut ids = std::collections::BTreeSet::new();
    let mut previous = 0;
    for (index, receipt) in entries.iter().enumerate() {
        if receipt.sequence <= previous {
            return Err(LedgerViolation::NonMonotonic {
                index,
                previous,
                found: receipt.sequence,
            });
        }
        previous = receipt.sequence;
        if !ids.insert(receipt.id.as_str()) {
            return Err(LedgerViolation::DuplicateId(receipt.id.clone()));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct ReceiptLedger {
    entries: Vec<Receipt>,
}

impl ReceiptLedger {
    /// Load and verify. A corrupt or inconsistent ledger starts empty.
    pub fn load(persistence: &Persistence) -> Self {
        let entries: Vec<Receipt> = persistence.get(keys::RECEIPTS, Vec::new());
        if let Err(violation) = verify_ledger(&entries) {
            tracing::warn!(error = %violation, "Receipt ledger failed verification, starting empty");
            return Self::default();
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[Receipt] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last(&self) -> Option<&Receipt> {
        self.entries.last()
    }

    pub fn next_sequence(&self) -> u64 {
        self.entries.last().map_or(1, |r| r.sequence + 1)
    }

    /// Give a draft its identity and the next ledger position.
    pub fn seal(&self, draft: ReceiptDraft, id: String, now: DateTime<Utc>) -> Receipt {
        draft.seal(id, self.next_sequence(), now)
    }

    /// Raw ledger value once `receipt` is appended.
    pub fn staged_append(&self, receipt: &Receipt) -> Result<String, StorageError> {
        let mut next = self.entries.clone();
        next.push(receipt.clone());
        encode(keys::RECEIPTS, &next)
    }

    /// Raw ledger value once everything is purged except `receipt`.
    pub fn staged_purge(&self, receipt: &Receipt) -> Result<String, StorageError> {
        encode(keys::RECEIPTS, std::slice::from_ref(receipt))
    }

    /// Record an append whose staged value has been written.
    pub(crate) fn commit_append(&mut self, receipt: Receipt) {
        self.entries.push(receipt);
    }

    /// Record a purge whose staged value has been written.
    pub(crate) fn commit_purge(&mut self, receipt: Receipt) {
        self.entries = vec![receipt];
    }

    /// Standalone append: write, then remember.
    pub fn append(
        &mut self,
        persistence: &mut Persistence,
        receipt: Receipt,
    ) -> Result<(), StorageError> {
        let raw = self.staged_append(&receipt)?;
        persistence.write_batch(&[(keys::RECEIPTS, raw)])?;
        tracing::info!(receipt_id = %receipt.id, sequence = receipt.sequence, "Receipt appended");
        self.commit_append(receipt);
        Ok(())
    }
}

/// Boundary Kernel — Receipts
///
/// Immutable record that a boundary-crossing action happened.
/// Wire shape: `{type, timestamp, from_state, to_state,
/// constitution_set_hash, license_id?, user_signature?}` plus `id`
/// and the ledger `sequence`.

use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Layer, RecognitionStatus, UserSettings};
use crate::hashing::constitution_hash;
use crate::state::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReceiptKind {
    LayerSwitch,
    LicenseAcknowledged,
    ForkEntered,
    ForkExited,
    RecognitionDowngraded,
    IdentityLearningEnabled,
    ConstitutionBound,
    WorldPostPublished,
    DataExported,
    DataCleared,
    ConsentRevoked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub reflections: usize,
    pub threads: usize,
    pub identity_nodes: usize,
    pub world_posts: usize,
}

/// Boundary-relevant projection of the State Store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundaryState {
    pub layer: Layer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork_id: Option<String>,
    pub constitution: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recognition: Option<RecognitionStatus>,
    #[serde(default)]
    pub licenses: Vec<String>,
    pub settings: UserSettings,
    pub entity_counts: EntityCounts,
}

impl BoundaryState {
    pub fn capture(store: &StateStore) -> Self {
        Self {
            layer: store.session.layer,
            fork_id: store.session.fork.as_ref().map(|f| f.fork_id.clone()),
            constitution: store.constitution_version().to_string(),
            recognition: store.session.recognition.as_ref().map(|r| r.status),
            licenses: store.session.acknowledged_licenses.iter().cloned().collect(),
            settings: store.data.settings.clone(),
            entity_counts: EntityCounts {
                reflections: store.data.reflections.len(),
                threads: store.data.threads.len(),
                identity_nodes: store.data.identity_nodes.len(),
                world_posts: store.data.world_posts.len(),
            },
        }
    }
}

/// Everything about a receipt except its identity and ledger position.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptDraft {
    pub kind: ReceiptKind,
    pub from_state: BoundaryState,
    pub to_state: BoundaryState,
    pub constitution_set_hash: String,
    pub license_id: Option<String>,
    pub user_signature: Option<String>,
}

impl ReceiptDraft {
    /// Draft a receipt for the move `before → after`. The hash binds the
    /// constitution in force once the action has taken effect.
    pub fn between(
        kind: ReceiptKind,
        before: &StateStore,
        after: &StateStore,
        license_id: Option<String>,
    ) -> Self {
        Self {
            kind,
            from_state: BoundaryState::capture(before),
            to_state: BoundaryState::capture(after),
            constitution_set_hash: constitution_hash(&after.data.constitution),
            license_id,
            user_signature: None,
        }
    }

    pub fn with_signature(mut self, signature: Option<String>) -> Self {
        self.user_signature = signature;
        self
    }

    pub fn seal(self, id: String, sequence: u64, timestamp: DateTime<Utc>) -> Receipt {
        Receipt {
            id,
            sequence,
            kind: self.kind,
            timestamp,
            from_state: self.from_state,
            to_state: self.to_state,
            constitution_set_hash: self.constitution_set_hash,
            license_id: self.license_id,
            user_signature: self.user_signature,
        }
    }
}

/// Sealed ledger entry. Identity is the `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub id: String,
    pub sequence: u64,
    #[serde(rename = "type")]
    pub kind: ReceiptKind,
    pub timestamp: DateTime<Utc>,
    pub from_state: BoundaryState,
    pub to_state: BoundaryState,
    pub constitution_set_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_signature: Option<String>,
}

impl PartialEq for Receipt {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Receipt {}

impl Hash for Receipt {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

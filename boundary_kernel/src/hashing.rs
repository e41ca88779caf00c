/// Boundary Kernel — Canonical Hashing
///
/// Deterministic canonical serialization + SHA-256 hashing.
/// Produces byte-identical output across platforms.
///
/// Rules:
///   - Fixed field order, kernel_version first
///   - Amendments kept in adoption order (they are a history)
///   - Speech domains and worldviews sorted and de-duplicated (they are sets)
///   - UTF-8 JSON, no whitespace

use std::collections::BTreeSet;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::domain::ConstitutionalState;
use crate::state::StateStore;
use crate::KERNEL_VERSION;

/// Canonical serialization of a ConstitutionalState to UTF-8 JSON bytes.
pub fn canonical_serialize(constitution: &ConstitutionalState) -> Vec<u8> {
    build_canonical_value(constitution).to_string().into_bytes()
}

/// SHA-256 of the canonical serialization. Lowercase hex.
/// This is the `constitution_set_hash` stamped on every receipt.
pub fn constitution_hash(constitution: &ConstitutionalState) -> String {
    hex::encode(Sha256::digest(canonical_serialize(constitution)))
}

/// SHA-256 over the full State Store serialization.
///
/// Used to detect state deltas: re-evaluation after a commit only
/// happens when the fingerprint moved.
pub fn state_fingerprint(store: &StateStore) -> String {
    let bytes = serde_json::to_vec(store).expect("state_fingerprint: StateStore is always serializable");
    hex::encode(Sha256::digest(&bytes))
}

/// Field order: kernel_version, active_constitution, amendments,
///              speech_domains, worldviews
fn build_canonical_value(constitution: &ConstitutionalState) -> Value {
    let amendments: Vec<Value> = constitution
        .amendments
        .iter()
        .map(|a| {
            let mut m = Map::new();
            m.insert("id".to_string(), Value::String(a.id.clone()));
            m.insert("summary".to_string(), Value::String(a.summary.clone()));
            m.insert(
                "adopted_at".to_string(),
                Value::String(a.adopted_at.to_rfc3339()),
            );
            Value::Object(m)
        })
        .collect();

    let mut root = Map::new();
    root.insert(
        "kernel_version".to_string(),
        Value::Number((KERNEL_VERSION as i64).into()),
    );
    root.insert(
        "active_constitution".to_string(),
        Value::String(constitution.active_constitution.clone()),
    );
    root.insert("amendments".to_string(), Value::Array(amendments));
    root.insert(
        "speech_domains".to_string(),
        sorted_set(&constitution.speech_domains),
    );
    root.insert("worldviews".to_string(), sorted_set(&constitution.worldviews));

    Value::Object(root)
}

fn sorted_set(items: &[String]) -> Value {
    let set: BTreeSet<&String> = items.iter().collect();
    Value::Array(set.into_iter().map(|s| Value::String(s.clone())).collect())
}

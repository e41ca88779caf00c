/// Boundary Kernel — Core Domain Types
///
/// Pure data. No behaviour, no transition logic.
/// Persisted field names are camelCase to match the stored JSON shapes.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Layers ─────────────────────────────────────────────────────────

/// What the system is permitted to do with a user's data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    #[default]
    Sovereign,
    Commons,
    Builder,
}

impl Layer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Sovereign => "sovereign",
            Layer::Commons => "commons",
            Layer::Builder => "builder",
        }
    }

    /// Sovereign data never leaves the device, so it carries no license.
    pub fn requires_license(&self) -> bool {
        !matches!(self, Layer::Sovereign)
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Entities ───────────────────────────────────────────────────────

/// Flags on a reflection. Everything not modelled lands in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflectionMetadata {
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A single written reflection. Immutable after creation apart from
/// `thread_id` linkage and metadata flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reflection {
    pub id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub layer: Layer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub worldviews: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirrorback: Option<String>,
    #[serde(default)]
    pub metadata: ReflectionMetadata,
}

/// A named sequence of reflections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub reflection_ids: Vec<String>,
    #[serde(default)]
    pub tensions: Vec<String>,
    #[serde(default)]
    pub contradictions: Vec<String>,
}

/// Weighted edge to another identity node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConnection {
    pub node_id: String,
    pub strength: f64,
}

/// One node of the identity graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityNode {
    pub id: String,
    pub label: String,
    pub strength: f64,
    pub learning_enabled: bool,
    #[serde(default)]
    pub related_reflection_ids: Vec<String>,
    #[serde(default)]
    pub connections: Vec<NodeConnection>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// A reflection shared into the commons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldPost {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection_id: Option<String>,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub anonymous: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Amendment {
    pub id: String,
    pub summary: String,
    pub adopted_at: DateTime<Utc>,
}

/// Process-wide constitutional singleton. Replaced only as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstitutionalState {
    pub active_constitution: String,
    #[serde(default)]
    pub amendments: Vec<Amendment>,
    #[serde(default)]
    pub speech_domains: Vec<String>,
    #[serde(default)]
    pub worldviews: Vec<String>,
}

impl Default for ConstitutionalState {
    fn default() -> Self {
        Self {
            active_constitution: "core-v1".to_string(),
            amendments: Vec::new(),
            speech_domains: Vec::new(),
            worldviews: Vec::new(),
        }
    }
}

/// Independently revocable user flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    #[serde(default)]
    pub crisis_mode: bool,
    #[serde(default)]
    pub commons_participation: bool,
    #[serde(default)]
    pub anonymity_default: bool,
    #[serde(default)]
    pub auto_archive: bool,
    #[serde(default)]
    pub identity_learning: bool,
}

/// Settings flags that grant the system something and can be revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentFlag {
    CommonsParticipation,
    IdentityLearning,
}

impl ConsentFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentFlag::CommonsParticipation => "commons_participation",
            ConsentFlag::IdentityLearning => "identity_learning",
        }
    }

    pub fn is_set(&self, settings: &UserSettings) -> bool {
        match self {
            ConsentFlag::CommonsParticipation => settings.commons_participation,
            ConsentFlag::IdentityLearning => settings.identity_learning,
        }
    }

    pub fn set(&self, settings: &mut UserSettings, value: bool) {
        match self {
            ConsentFlag::CommonsParticipation => settings.commons_participation = value,
            ConsentFlag::IdentityLearning => settings.identity_learning = value,
        }
    }
}

// ── Session context ────────────────────────────────────────────────

/// Rule-modifying context the user has entered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkContext {
    pub fork_id: String,
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecognitionStatus {
    Verified,
    Provisional,
    Revoked,
}

impl RecognitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecognitionStatus::Verified => "verified",
            RecognitionStatus::Provisional => "provisional",
            RecognitionStatus::Revoked => "revoked",
        }
    }
}

/// Trust status attached to the current layer or fork, with a TTL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recognition {
    pub status: RecognitionStatus,
    pub expires_at: DateTime<Utc>,
}

impl Recognition {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

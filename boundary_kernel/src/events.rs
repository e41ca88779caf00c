/// Boundary Kernel — Trigger Event Symbols
///
/// Events are opaque symbols supplied by the surrounding UI layer
/// (shortcuts, palette selections, detected state changes).
/// They carry intent and payload only. ZERO transition logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ConstitutionalState, Layer};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TriggerEvent {
    LayerSwitchRequested { to: Layer },
    /// Emitted by the engine after a layer switch commits.
    LayerSwitched { from: Layer, to: Layer },
    ForkEnterRequested { fork_id: String },
    /// Emitted by the engine after a fork entry commits.
    ForkEntered { fork_id: String },
    ForkExitRequested,
    ExportRequested,
    ClearAllDataRequested,
    CrisisSignal,
    RefusalIssued { code: String },
    IdentityLearningRequested,
    ConstitutionBindRequested { constitution: ConstitutionalState },
    ShareToCommonsRequested { reflection_id: String },
    RecognitionRevoked,
    Tick { now: DateTime<Utc> },
    FailureObserved { code: String },
}

/// Payload-free discriminant, used as the rule table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LayerSwitchRequested,
    LayerSwitched,
    ForkEnterRequested,
    ForkEntered,
    ForkExitRequested,
    ExportRequested,
    ClearAllDataRequested,
    CrisisSignal,
    RefusalIssued,
    IdentityLearningRequested,
    ConstitutionBindRequested,
    ShareToCommonsRequested,
    RecognitionRevoked,
    Tick,
    FailureObserved,
}

impl TriggerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TriggerEvent::LayerSwitchRequested { .. } => EventKind::LayerSwitchRequested,
            TriggerEvent::LayerSwitched { .. } => EventKind::LayerSwitched,
            TriggerEvent::ForkEnterRequested { .. } => EventKind::ForkEnterRequested,
            TriggerEvent::ForkEntered { .. } => EventKind::ForkEntered,
            TriggerEvent::ForkExitRequested => EventKind::ForkExitRequested,
            TriggerEvent::ExportRequested => EventKind::ExportRequested,
            TriggerEvent::ClearAllDataRequested => EventKind::ClearAllDataRequested,
            TriggerEvent::CrisisSignal => EventKind::CrisisSignal,
            TriggerEvent::RefusalIssued { .. } => EventKind::RefusalIssued,
            TriggerEvent::IdentityLearningRequested => EventKind::IdentityLearningRequested,
            TriggerEvent::ConstitutionBindRequested { .. } => EventKind::ConstitutionBindRequested,
            TriggerEvent::ShareToCommonsRequested { .. } => EventKind::ShareToCommonsRequested,
            TriggerEvent::RecognitionRevoked => EventKind::RecognitionRevoked,
            TriggerEvent::Tick { .. } => EventKind::Tick,
            TriggerEvent::FailureObserved { .. } => EventKind::FailureObserved,
        }
    }
}

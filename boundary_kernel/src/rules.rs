/// Boundary Kernel — Trigger Rule Table
///
/// Declarative mapping from (event × state predicate) to
/// {instrument, required gates, receipt, priority class}.
///
/// Evaluation is a pure function of (event, state): no side effects,
/// deterministic, idempotent. Overlapping rules for one event are
/// allowed; the arbiter disambiguates.

use crate::domain::{Layer, RecognitionStatus};
use crate::events::{EventKind, TriggerEvent};
use crate::instruments::{Gate, Instrument, PriorityClass};
use crate::receipt::ReceiptKind;
use crate::state::StateStore;

pub type Predicate = fn(&TriggerEvent, &StateStore) -> bool;
pub type InstrumentFactory = fn(&TriggerEvent, &StateStore) -> Option<Instrument>;

/// One row of the table.
#[derive(Clone)]
pub struct TriggerRule {
    pub id: &'static str,
    pub event: EventKind,
    pub predicate: Predicate,
    pub instrument: InstrumentFactory,
    pub required_gates: &'static [Gate],
    pub receipt: Option<ReceiptKind>,
    pub priority: PriorityClass,
}

impl TriggerRule {
    pub fn receipt_required(&self) -> bool {
        self.receipt.is_some()
    }
}

impl std::fmt::Debug for TriggerRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerRule")
            .field("id", &self.id)
            .field("event", &self.event)
            .field("priority", &self.priority)
            .finish()
    }
}

/// A rule that fired: what to mount and under which terms.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub rule_id: &'static str,
    pub event: TriggerEvent,
    pub instrument: Instrument,
    pub gates: Vec<Gate>,
    pub receipt: Option<ReceiptKind>,
    pub priority: PriorityClass,
}

impl Candidate {
    pub fn receipt_required(&self) -> bool {
        self.receipt.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<TriggerRule>,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl RuleTable {
    pub fn from_rules(rules: Vec<TriggerRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[TriggerRule] {
        &self.rules
    }

    pub fn rule(&self, id: &str) -> Option<&TriggerRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Every rule keyed on `event` whose predicate holds, in table order.
    /// Unknown or unmatched events yield an empty set.
    pub fn evaluate(&self, event: &TriggerEvent, store: &StateStore) -> Vec<Candidate> {
        let kind = event.kind();
        self.rules
            .iter()
            .filter(|rule| rule.event == kind && (rule.predicate)(event, store))
            .filter_map(|rule| {
                (rule.instrument)(event, store).map(|instrument| Candidate {
                    rule_id: rule.id,
                    event: event.clone(),
                    instrument,
                    gates: rule.required_gates.to_vec(),
                    receipt: rule.receipt,
                    priority: rule.priority,
                })
            })
            .collect()
    }

    /// Re-check a previously fired candidate against the current state.
    /// Returns the refreshed candidate if its rule still fires.
    pub fn reconfirm(&self, candidate: &Candidate, store: &StateStore) -> Option<Candidate> {
        self.evaluate(&candidate.event, store)
            .into_iter()
            .find(|c| c.rule_id == candidate.rule_id)
    }

    /// The built-in instrument summon table.
    pub fn standard() -> Self {
        Self::from_rules(vec![
            TriggerRule {
                id: "crisis_support",
                event: EventKind::CrisisSignal,
                predicate: |_, _| true,
                instrument: |_, _| Some(Instrument::CrisisSupport),
                required_gates: &[],
                receipt: None,
                priority: PriorityClass::Safety,
            },
            TriggerRule {
                id: "recognition_expired",
                event: EventKind::Tick,
                predicate: |event, store| match (event, &store.session.recognition) {
                    (TriggerEvent::Tick { now }, Some(rec)) => {
                        rec.status == RecognitionStatus::Verified && rec.is_expired(*now)
                    }
                    _ => false,
                },
                instrument: |_, _| {
                    Some(Instrument::RecognitionDowngrade {
                        from: RecognitionStatus::Verified,
                        to: RecognitionStatus::Provisional,
                    })
                },
                required_gates: &[],
                receipt: Some(ReceiptKind::RecognitionDowngraded),
                priority: PriorityClass::RecognitionDowngrade,
            },
            TriggerRule {
                id: "recognition_revoked",
                event: EventKind::RecognitionRevoked,
                predicate: |_, store| {
                    store
                        .session
                        .recognition
                        .as_ref()
                        .is_some_and(|r| r.status != RecognitionStatus::Revoked)
                },
                instrument: |_, store| {
                    store.session.recognition.as_ref().map(|r| Instrument::RecognitionDowngrade {
                        from: r.status,
                        to: RecognitionStatus::Revoked,
                    })
                },
                required_gates: &[],
                receipt: Some(ReceiptKind::RecognitionDowngraded),
                priority: PriorityClass::RecognitionDowngrade,
            },
            TriggerRule {
                id: "refusal_issued",
                event: EventKind::RefusalIssued,
                predicate: |_, _| true,
                instrument: |event, _| match event {
                    TriggerEvent::RefusalIssued { code } => {
                        Some(Instrument::ConstitutionalRefusal { code: code.clone() })
                    }
                    _ => None,
                },
                required_gates: &[],
                receipt: None,
                priority: PriorityClass::ConstitutionalRefusal,
            },
            TriggerRule {
                id: "commons_share_refused",
                event: EventKind::ShareToCommonsRequested,
                predicate: |event, store| commons_refusal(event, store).is_some(),
                instrument: |event, store| {
                    commons_refusal(event, store).map(|code| Instrument::ConstitutionalRefusal {
                        code: code.to_string(),
                    })
                },
                required_gates: &[],
                receipt: None,
                priority: PriorityClass::ConstitutionalRefusal,
            },
            TriggerRule {
                id: "layer_consent_delta",
                event: EventKind::LayerSwitchRequested,
                predicate: |event, store| {
                    matches!(event, TriggerEvent::LayerSwitchRequested { to } if *to != store.layer())
                },
                instrument: |event, store| match event {
                    TriggerEvent::LayerSwitchRequested { to } => Some(Instrument::ConsentDelta {
                        from: store.layer(),
                        to: *to,
                    }),
                    _ => None,
                },
                required_gates: &[Gate::ConsentAcknowledged],
                receipt: Some(ReceiptKind::LayerSwitch),
                priority: PriorityClass::ConsentDelta,
            },
            TriggerRule {
                id: "fork_entry",
                event: EventKind::ForkEnterRequested,
                predicate: |event, store| match event {
                    TriggerEvent::ForkEnterRequested { fork_id } => store
                        .session
                        .fork
                        .as_ref()
                        .map_or(true, |f| &f.fork_id != fork_id),
                    _ => false,
                },
                instrument: |event, _| match event {
                    TriggerEvent::ForkEnterRequested { fork_id } => Some(Instrument::ForkEntry {
                        fork_id: fork_id.clone(),
                    }),
                    _ => None,
                },
                required_gates: &[Gate::ConsentAcknowledged],
                receipt: Some(ReceiptKind::ForkEntered),
                priority: PriorityClass::ConsentDelta,
            },
            TriggerRule {
                id: "identity_learning_consent",
                event: EventKind::IdentityLearningRequested,
                predicate: |_, store| !store.data.settings.identity_learning,
                instrument: |_, _| Some(Instrument::IdentityLearningConsent),
                required_gates: &[Gate::ConsentAcknowledged],
                receipt: Some(ReceiptKind::IdentityLearningEnabled),
                priority: PriorityClass::ConsentDelta,
            },
            TriggerRule {
                id: "constitution_bind",
                event: EventKind::ConstitutionBindRequested,
                predicate: |event, store| {
                    matches!(event, TriggerEvent::ConstitutionBindRequested { constitution }
                        if *constitution != store.data.constitution)
                },
                instrument: |event, _| match event {
                    TriggerEvent::ConstitutionBindRequested { constitution } => {
                        Some(Instrument::ConstitutionBind {
                            constitution: constitution.clone(),
                        })
                    }
                    _ => None,
                },
                required_gates: &[Gate::ConstitutionReviewed],
                receipt: Some(ReceiptKind::ConstitutionBound),
                priority: PriorityClass::ConsentDelta,
            },
            TriggerRule {
                id: "layer_license_gate",
                event: EventKind::LayerSwitched,
                predicate: |event, store| match event {
                    TriggerEvent::LayerSwitched { to, .. } => {
                        *to == store.layer() && pending_license(*to, store).is_some()
                    }
                    _ => false,
                },
                instrument: |event, store| match event {
                    TriggerEvent::LayerSwitched { to, .. } => {
                        pending_license(*to, store).map(|license_id| Instrument::LicenseGate {
                            license_id,
                            layer: *to,
                        })
                    }
                    _ => None,
                },
                required_gates: &[Gate::LicenseAccepted],
                receipt: Some(ReceiptKind::LicenseAcknowledged),
                priority: PriorityClass::LicenseGate,
            },
            TriggerRule {
                id: "commons_publish",
                event: EventKind::ShareToCommonsRequested,
                predicate: |event, store| commons_refusal(event, store).is_none(),
                instrument: |event, _| match event {
                    TriggerEvent::ShareToCommonsRequested { reflection_id } => {
                        Some(Instrument::CommonsPublish {
                            reflection_id: reflection_id.clone(),
                        })
                    }
                    _ => None,
                },
                required_gates: &[],
                receipt: Some(ReceiptKind::WorldPostPublished),
                priority: PriorityClass::UserRequested,
            },
            TriggerRule {
                id: "export_dialog",
                event: EventKind::ExportRequested,
                predicate: |_, _| true,
                instrument: |_, _| Some(Instrument::ExportDialog),
                required_gates: &[],
                receipt: Some(ReceiptKind::DataExported),
                priority: PriorityClass::UserRequested,
            },
            TriggerRule {
                id: "clear_data_confirm",
                event: EventKind::ClearAllDataRequested,
                predicate: |_, _| true,
                instrument: |_, _| Some(Instrument::ClearDataConfirm),
                required_gates: &[Gate::DataLossAcknowledged],
                receipt: Some(ReceiptKind::DataCleared),
                priority: PriorityClass::UserRequested,
            },
            TriggerRule {
                id: "fork_exit",
                event: EventKind::ForkExitRequested,
                predicate: |_, store| store.in_fork(),
                instrument: |_, store| {
                    store.session.fork.as_ref().map(|f| Instrument::ForkExit {
                        fork_id: f.fork_id.clone(),
                    })
                },
                required_gates: &[],
                receipt: Some(ReceiptKind::ForkExited),
                priority: PriorityClass::UserRequested,
            },
            TriggerRule {
                id: "layer_indicator",
                event: EventKind::LayerSwitched,
                predicate: |event, store| {
                    matches!(event, TriggerEvent::LayerSwitched { to, .. } if *to == store.layer())
                },
                instrument: |event, _| match event {
                    TriggerEvent::LayerSwitched { to, .. } => {
                        Some(Instrument::LayerIndicator { layer: *to })
                    }
                    _ => None,
                },
                required_gates: &[],
                receipt: None,
                priority: PriorityClass::AutomaticContext,
            },
            TriggerRule {
                id: "fork_banner",
                event: EventKind::ForkEntered,
                predicate: |event, store| match (event, &store.session.fork) {
                    (TriggerEvent::ForkEntered { fork_id }, Some(fork)) => &fork.fork_id == fork_id,
                    _ => false,
                },
                instrument: |event, _| match event {
                    TriggerEvent::ForkEntered { fork_id } => Some(Instrument::ForkBanner {
                        fork_id: fork_id.clone(),
                    }),
                    _ => None,
                },
                required_gates: &[],
                receipt: None,
                priority: PriorityClass::AutomaticContext,
            },
            TriggerRule {
                id: "failure_notice",
                event: EventKind::FailureObserved,
                predicate: |_, _| true,
                instrument: |event, _| match event {
                    TriggerEvent::FailureObserved { code } => {
                        Some(Instrument::FailureNotice { code: code.clone() })
                    }
                    _ => None,
                },
                required_gates: &[],
                receipt: None,
                priority: PriorityClass::FailurePhenomenology,
            },
        ])
    }
}

/// License still owed for `layer`, if any.
fn pending_license(layer: Layer, store: &StateStore) -> Option<String> {
    store
        .license_for(layer)
        .filter(|license| !store.has_acknowledged(license))
}

/// Why sharing a reflection into the commons must be refused, if it must.
fn commons_refusal(event: &TriggerEvent, store: &StateStore) -> Option<&'static str> {
    let TriggerEvent::ShareToCommonsRequested { reflection_id } = event else {
        return None;
    };
    let Some(reflection) = store.data.reflection(reflection_id) else {
        return Some("reflection-not-found");
    };
    if reflection.metadata.deleted {
        return Some("reflection-not-found");
    }
    if store.layer() != Layer::Commons {
        return Some("not-in-commons");
    }
    if !store.data.settings.commons_participation {
        return Some("commons-participation-disabled");
    }
    if store.data.settings.crisis_mode {
        return Some("crisis-mode-active");
    }
    if store.session.recognition.is_none() {
        return Some("recognition-required");
    }
    None
}

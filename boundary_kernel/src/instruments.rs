/// Boundary Kernel — Instrument Catalogue
///
/// Closed set of instruments the engine can ask the UI to mount.
/// One variant per instrument, carrying exactly the data its renderer
/// and its committed transition need.

use serde::{Deserialize, Serialize};

use crate::domain::{ConstitutionalState, Layer, RecognitionStatus};

/// Strictly ordered priority classes. Lower discriminant wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriorityClass {
    Safety = 1,
    RecognitionDowngrade = 2,
    ConstitutionalRefusal = 3,
    ConsentDelta = 4,
    LicenseGate = 5,
    UserRequested = 6,
    AutomaticContext = 7,
    FailurePhenomenology = 8,
}

impl PriorityClass {
    pub fn rank(&self) -> u8 {
        *self as u8
    }

    /// True when `self` strictly outranks `other`.
    pub fn outranks(&self, other: PriorityClass) -> bool {
        self.rank() < other.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presentation {
    Modal,
    Overlay,
}

/// Acknowledgements the user must give before a completion is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    ConsentAcknowledged,
    LicenseAccepted,
    ConstitutionReviewed,
    DataLossAcknowledged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "instrument", rename_all = "snake_case")]
pub enum Instrument {
    CrisisSupport,
    RecognitionDowngrade {
        from: RecognitionStatus,
        to: RecognitionStatus,
    },
    ConstitutionalRefusal {
        code: String,
    },
    ConsentDelta {
        from: Layer,
        to: Layer,
    },
    ForkEntry {
        fork_id: String,
    },
    IdentityLearningConsent,
    ConstitutionBind {
        constitution: ConstitutionalState,
    },
    LicenseGate {
        license_id: String,
        layer: Layer,
    },
    CommonsPublish {
        reflection_id: String,
    },
    ExportDialog,
    ClearDataConfirm,
    ForkExit {
        fork_id: String,
    },
    LayerIndicator {
        layer: Layer,
    },
    ForkBanner {
        fork_id: String,
    },
    FailureNotice {
        code: String,
    },
}

impl Instrument {
    pub fn name(&self) -> &'static str {
        match self {
            Instrument::CrisisSupport => "crisis_support",
            Instrument::RecognitionDowngrade { .. } => "recognition_downgrade",
            Instrument::ConstitutionalRefusal { .. } => "constitutional_refusal",
            Instrument::ConsentDelta { .. } => "consent_delta",
            Instrument::ForkEntry { .. } => "fork_entry",
            Instrument::IdentityLearningConsent => "identity_learning_consent",
            Instrument::ConstitutionBind { .. } => "constitution_bind",
            Instrument::LicenseGate { .. } => "license_gate",
            Instrument::CommonsPublish { .. } => "commons_publish",
            Instrument::ExportDialog => "export_dialog",
            Instrument::ClearDataConfirm => "clear_data_confirm",
            Instrument::ForkExit { .. } => "fork_exit",
            Instrument::LayerIndicator { .. } => "layer_indicator",
            Instrument::ForkBanner { .. } => "fork_banner",
            Instrument::FailureNotice { .. } => "failure_notice",
        }
    }

    pub fn presentation(&self) -> Presentation {
        match self {
            Instrument::LayerIndicator { .. }
            | Instrument::ForkBanner { .. }
            | Instrument::FailureNotice { .. } => Presentation::Overlay,
            _ => Presentation::Modal,
        }
    }

    pub fn is_modal(&self) -> bool {
        self.presentation() == Presentation::Modal
    }

    /// Pinned overlays are never evicted by the per-layer cap.
    pub fn pinned_by_default(&self) -> bool {
        matches!(self, Instrument::ForkBanner { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_classes_are_strictly_ordered() {
        let ordered = [
            PriorityClass::Safety,
            PriorityClass::RecognitionDowngrade,
            PriorityClass::ConstitutionalRefusal,
            PriorityClass::ConsentDelta,
            PriorityClass::LicenseGate,
            PriorityClass::UserRequested,
            PriorityClass::AutomaticContext,
            PriorityClass::FailurePhenomenology,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0].outranks(pair[1]));
            assert!(!pair[1].outranks(pair[0]));
        }
        assert_eq!(PriorityClass::ConstitutionalRefusal.rank(), 3);
        assert_eq!(PriorityClass::UserRequested.rank(), 6);
    }

    #[test]
    fn overlays_and_modals_are_partitioned() {
        assert!(Instrument::ExportDialog.is_modal());
        assert!(!Instrument::LayerIndicator { layer: Layer::Commons }.is_modal());
        assert!(Instrument::ForkBanner { fork_id: "f".into() }.pinned_by_default());
        assert!(!Instrument::FailureNotice { code: "x".into() }.pinned_by_default());
    }
}

//! Integration tests for boundary_runtime.
//!
//! Sessions run over in-memory or temp-dir stores; fault injection goes
//! through a test-local `KvStore`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use boundary_kernel::arbiter::{InstanceId, MountInstruction};
use boundary_kernel::domain::{
    ConsentFlag, Layer, Recognition, RecognitionStatus, Reflection, Thread,
};
use boundary_kernel::events::TriggerEvent;
use boundary_kernel::instruments::{Gate, PriorityClass};
use boundary_kernel::receipt::ReceiptKind;
use boundary_kernel::transitions::{Completion, SettingsPatch, TransitionError};
use chrono::{DateTime, Duration, Utc};

use boundary_runtime::bundle::ExportBundle;
use boundary_runtime::clock::FixedClock;
use boundary_runtime::config::EngineConfig;
use boundary_runtime::store::{FileStore, KvStore, MemoryStore};
use boundary_runtime::{EngineError, Session, StorageError};

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn session() -> Session {
    Session::open(
        Box::new(MemoryStore::new()),
        EngineConfig::default(),
        Box::new(FixedClock::new(t0())),
    )
}

fn reflection(id: &str, text: &str) -> Reflection {
    Reflection {
        id: id.into(),
        text: text.into(),
        timestamp: t0(),
        layer: Layer::Sovereign,
        thread_id: None,
        worldviews: vec![],
        mirrorback: None,
        metadata: Default::default(),
    }
}

fn modal(session: &Session) -> InstanceId {
    session.mounts().modal().expect("a modal is mounted").instance
}

/// Accept the mounted modal, acknowledging whatever it gates on.
fn accept(session: &mut Session) -> boundary_runtime::CompletionOutcome {
    let mounted = session.mounts().modal().expect("a modal is mounted");
    let instance = mounted.instance;
    let completion = Completion::acknowledging(&mounted.candidate.gates);
    session.complete(instance, completion).expect("completion succeeds")
}

/// Sovereign → commons, accepting consent and license.
fn enter_commons(session: &mut Session) {
    session.dispatch(TriggerEvent::LayerSwitchRequested { to: Layer::Commons });
    accept(session);
    accept(session);
}

/// Fails writes to `reflections` while armed.
struct FaultyStore {
    inner: MemoryStore,
    armed: Arc<AtomicBool>,
}

impl KvStore for FaultyStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.get_raw(key)
    }
    fn set_raw(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        if key == "reflections" && self.armed.load(Ordering::SeqCst) {
            return Err(StorageError::Exhausted {
                key: key.to_string(),
                needed: value.len(),
                available: 0,
            });
        }
        self.inner.set_raw(key, value)
    }
    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        self.inner.remove(key)
    }
    fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.inner.keys()
    }
}

// ─────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────

#[test]
fn scenario_a_layer_switch_is_receipted_and_followed_by_license_gate() {
    let mut s = session();
    let out = s.dispatch(TriggerEvent::LayerSwitchRequested { to: Layer::Commons });
    assert_eq!(out.len(), 1);
    let mounted = s.mounts().modal().unwrap();
    assert_eq!(mounted.candidate.priority, PriorityClass::ConsentDelta);

    let outcome = accept(&mut s);
    let receipt = outcome.receipt.unwrap();
    assert_eq!(receipt.kind, ReceiptKind::LayerSwitch);
    assert_eq!(receipt.from_state.layer, Layer::Sovereign);
    assert_eq!(receipt.to_state.layer, Layer::Commons);
    assert_eq!(receipt.constitution_set_hash.len(), 64);

    let license_gates = outcome
        .instructions
        .iter()
        .filter(|i| matches!(i, MountInstruction::Mount { instrument, .. } if instrument.name() == "license_gate"))
        .count();
    assert_eq!(license_gates, 1);
    assert_eq!(s.mounts().modal().unwrap().candidate.rule_id, "layer_license_gate");
    assert_eq!(s.mounts().overlays()[0].candidate.rule_id, "layer_indicator");

    let license = accept(&mut s).receipt.unwrap();
    assert_eq!(license.kind, ReceiptKind::LicenseAcknowledged);
    assert_eq!(license.license_id.as_deref(), Some("commons-license@core-v1"));
    assert!(s.mounts().modal().is_none());
}

#[test]
fn scenario_b_refusal_preempts_export_which_mounts_after_dismissal() {
    let mut s = session();
    s.dispatch_batch(vec![
        TriggerEvent::RefusalIssued { code: "speech-domain-closed".into() },
        TriggerEvent::ExportRequested,
    ]);
    let refusal = s.mounts().modal().unwrap();
    assert_eq!(refusal.candidate.priority, PriorityClass::ConstitutionalRefusal);
    let refusal = refusal.instance;
    assert_eq!(s.mounts().queue()[0].candidate.rule_id, "export_dialog");

    let out = s.dismiss(refusal).unwrap();
    assert!(matches!(
        &out[1],
        MountInstruction::Mount { instrument, .. } if instrument.name() == "export_dialog"
    ));
    assert_eq!(s.mounts().modal().unwrap().candidate.rule_id, "export_dialog");
    assert_eq!(s.receipt_count(), 0);
}

#[test]
fn scenario_c_exhausted_write_rolls_back_completion() {
    let armed = Arc::new(AtomicBool::new(false));
    let mut s = Session::open(
        Box::new(FaultyStore { inner: MemoryStore::new(), armed: armed.clone() }),
        EngineConfig::default(),
        Box::new(FixedClock::new(t0())),
    );
    s.add_reflection(reflection("r1", "keep me")).unwrap();
    let before = serde_json::to_vec(s.state()).unwrap();

    s.dispatch(TriggerEvent::ClearAllDataRequested);
    let instance = modal(&s);
    armed.store(true, Ordering::SeqCst);

    let err = s
        .complete(instance, Completion::acknowledging(&[Gate::DataLossAcknowledged]))
        .unwrap_err();
    assert!(matches!(err, EngineError::Storage(StorageError::Exhausted { .. })));

    assert_eq!(serde_json::to_vec(s.state()).unwrap(), before);
    assert_eq!(s.receipt_count(), 0);
    assert!(s.export_all().receipts.is_empty());
    assert_eq!(modal(&s), instance, "instrument stays open");

    armed.store(false, Ordering::SeqCst);
    let outcome = s
        .complete(instance, Completion::acknowledging(&[Gate::DataLossAcknowledged]))
        .unwrap();
    assert_eq!(outcome.receipt.unwrap().kind, ReceiptKind::DataCleared);
    assert!(s.state().data.reflections.is_empty());
}

#[test]
fn scenario_d_import_keeps_local_copy_and_adds_new_ids() {
    let mut s = session();
    s.add_reflection(reflection("r1", "local")).unwrap();

    let mut incoming = s.state().data.clone();
    incoming.reflections = vec![reflection("r1", "remote"), reflection("r2", "new")];
    let bundle = ExportBundle::capture(&incoming, &[], t0(), 1);

    let report = s.import_merge(&bundle).unwrap();
    assert_eq!(report.reflections.added, 1);
    assert_eq!(report.reflections.kept_local, 1);
    let data = &s.state().data;
    assert_eq!(data.reflections.len(), 2);
    assert_eq!(data.reflection("r1").unwrap().text, "local");
    assert_eq!(data.reflection("r2").unwrap().text, "new");
}

// ─────────────────────────────────────────────────────────────
// Properties
// ─────────────────────────────────────────────────────────────

#[test]
fn export_then_import_is_a_no_op() {
    let mut s = session();
    s.add_reflection(reflection("r1", "one")).unwrap();
    enter_commons(&mut s);
    let before = serde_json::to_vec(s.state()).unwrap();
    let receipts = s.receipt_count();

    let bundle = s.export_all();
    let report = s.import_merge(&bundle).unwrap();
    assert_eq!(report.added(), 0);
    assert_eq!(serde_json::to_vec(s.state()).unwrap(), before);
    assert_eq!(s.receipt_count(), receipts, "receipts are never imported");
}

#[test]
fn imported_constitution_replaces_the_local_one() {
    let mut s = session();
    let mut incoming = s.state().data.clone();
    incoming.constitution.active_constitution = "core-v2".into();
    s.import_merge(&ExportBundle::capture(&incoming, &[], t0(), 1)).unwrap();
    assert_eq!(s.state().constitution_version(), "core-v2");
}

#[test]
fn dismissal_restores_state_byte_for_byte() {
    let mut s = session();
    s.add_reflection(reflection("r1", "one")).unwrap();
    let before = serde_json::to_vec(s.state()).unwrap();

    for event in [
        TriggerEvent::LayerSwitchRequested { to: Layer::Builder },
        TriggerEvent::ClearAllDataRequested,
        TriggerEvent::IdentityLearningRequested,
        TriggerEvent::ForkEnterRequested { fork_id: "dawn".into() },
    ] {
        s.dispatch(event);
        let instance = modal(&s);
        s.begin_interaction(instance).unwrap();
        s.dismiss(instance).unwrap();
        assert_eq!(serde_json::to_vec(s.state()).unwrap(), before);
    }
    assert_eq!(s.receipt_count(), 0);
}

#[test]
fn receipt_required_completion_appends_exactly_one_entry() {
    let mut s = session();
    for event in [
        TriggerEvent::ExportRequested,
        TriggerEvent::IdentityLearningRequested,
        TriggerEvent::ForkEnterRequested { fork_id: "dawn".into() },
        TriggerEvent::ForkExitRequested,
    ] {
        s.dispatch(event);
        let receipt_required = s.mounts().modal().unwrap().candidate.receipt_required();
        let count = s.receipt_count();
        accept(&mut s);
        assert!(receipt_required);
        assert_eq!(s.receipt_count(), count + 1);
    }
    let seqs: Vec<u64> = s.export_all().receipts.iter().map(|r| r.sequence).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
}

#[test]
fn at_most_one_modal_is_ever_mounted() {
    let mut s = session();
    let out = s.dispatch_batch(vec![
        TriggerEvent::ExportRequested,
        TriggerEvent::ClearAllDataRequested,
        TriggerEvent::RefusalIssued { code: "x".into() },
        TriggerEvent::CrisisSignal,
        TriggerEvent::LayerSwitchRequested { to: Layer::Commons },
    ]);
    let mut mounted_modals = 0i32;
    for instruction in &out {
        match instruction {
            MountInstruction::Mount { instrument, .. } if instrument.is_modal() => mounted_modals += 1,
            MountInstruction::Unmount { .. } => mounted_modals -= 1,
            _ => {}
        }
        assert!(mounted_modals <= 1);
    }
    assert_eq!(s.mounts().modal().unwrap().candidate.priority, PriorityClass::Safety);
    assert_eq!(s.mounts().queue().len(), 4);
}

#[test]
fn queued_crisis_outranks_follow_up_license_gate() {
    let mut s = session();
    s.dispatch(TriggerEvent::LayerSwitchRequested { to: Layer::Commons });
    let consent = modal(&s);
    s.begin_interaction(consent).unwrap();
    s.dispatch(TriggerEvent::CrisisSignal);
    assert_eq!(s.mounts().queue()[0].candidate.priority, PriorityClass::Safety);

    accept(&mut s);
    let mounted = s.mounts().modal().unwrap();
    assert_eq!(mounted.candidate.priority, PriorityClass::Safety);
    let queued: Vec<_> = s.mounts().queue().iter().map(|m| m.candidate.rule_id).collect();
    assert_eq!(queued, vec!["layer_license_gate"]);

    let crisis = mounted.instance;
    s.dismiss(crisis).unwrap();
    assert_eq!(s.mounts().modal().unwrap().candidate.rule_id, "layer_license_gate");
}

// ─────────────────────────────────────────────────────────────
// Failure handling
// ─────────────────────────────────────────────────────────────

#[test]
fn missing_gate_keeps_instrument_open() {
    let mut s = session();
    s.dispatch(TriggerEvent::LayerSwitchRequested { to: Layer::Commons });
    let instance = modal(&s);
    let err = s.complete(instance, Completion::default()).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Transition(TransitionError::GateNotSatisfied(Gate::ConsentAcknowledged))
    ));
    assert_eq!(modal(&s), instance);
    assert_eq!(s.state().layer(), Layer::Sovereign);
    assert_eq!(s.receipt_count(), 0);
}

#[test]
fn queued_and_unknown_instances_are_rejected() {
    let mut s = session();
    s.dispatch_batch(vec![
        TriggerEvent::RefusalIssued { code: "x".into() },
        TriggerEvent::ExportRequested,
    ]);
    let queued = s.mounts().queue()[0].instance;
    assert!(matches!(
        s.complete(queued, Completion::default()),
        Err(EngineError::NotMounted(_))
    ));
    assert!(matches!(
        s.complete(InstanceId(999), Completion::default()),
        Err(EngineError::UnknownInstance(_))
    ));
}

#[test]
fn inconsistent_import_is_rejected_without_writes() {
    let mut s = session();
    let before = serde_json::to_vec(s.state()).unwrap();
    let mut incoming = s.state().data.clone();
    incoming.threads.push(Thread {
        id: "t9".into(),
        name: "orphans".into(),
        created_at: t0(),
        last_updated: t0(),
        reflection_ids: vec!["ghost".into()],
        tensions: vec![],
        contradictions: vec![],
    });
    let err = s
        .import_merge(&ExportBundle::capture(&incoming, &[], t0(), 1))
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidImport(_)));
    assert_eq!(serde_json::to_vec(s.state()).unwrap(), before);

    let mut future = s.export_all();
    future.version = 99;
    assert!(matches!(
        s.import_merge(&future),
        Err(EngineError::BundleVersion { found: 99, .. })
    ));
}

#[test]
fn unreachable_data_dir_degrades_with_one_warning() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("occupied");
    std::fs::write(&blocker, "x").unwrap();

    let mut s = Session::from_config(EngineConfig {
        data_dir: Some(blocker),
        ..EngineConfig::default()
    });
    assert!(s.is_degraded());
    assert!(s.take_storage_warning().is_some());
    assert!(s.take_storage_warning().is_none());

    s.dispatch(TriggerEvent::ExportRequested);
    assert!(accept(&mut s).receipt.is_some());
}

#[test]
fn data_dir_lost_mid_session_continues_in_memory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data");
    let mut s = Session::open(
        Box::new(FileStore::open(&path).unwrap()),
        EngineConfig::default(),
        Box::new(FixedClock::new(t0())),
    );
    s.add_reflection(reflection("r1", "saved")).unwrap();
    s.dispatch(TriggerEvent::ExportRequested);
    accept(&mut s);
    assert!(!s.is_degraded());

    std::fs::remove_dir_all(&path).unwrap();

    s.add_reflection(reflection("r2", "kept in memory")).unwrap();
    assert!(s.is_degraded());
    assert!(s.take_storage_warning().is_some());
    assert!(s.take_storage_warning().is_none());
    assert!(!path.exists());

    s.dispatch(TriggerEvent::ExportRequested);
    let receipt = accept(&mut s).receipt.unwrap();
    assert_eq!(receipt.sequence, 2);
    let bundle = s.export_all();
    assert_eq!(bundle.reflections.unwrap().len(), 2);
    assert_eq!(bundle.receipts.len(), 2);
}

#[test]
fn cascade_depth_bounds_follow_up_evaluation() {
    let mut s = Session::open(
        Box::new(MemoryStore::new()),
        EngineConfig { max_cascade_depth: 0, ..EngineConfig::default() },
        Box::new(FixedClock::new(t0())),
    );
    s.dispatch(TriggerEvent::LayerSwitchRequested { to: Layer::Commons });
    accept(&mut s);
    assert_eq!(s.state().layer(), Layer::Commons);
    assert!(s.mounts().modal().is_none());
}

// ─────────────────────────────────────────────────────────────
// Supplemented flows
// ─────────────────────────────────────────────────────────────

#[test]
fn file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let open = |path: &PathBuf| {
        Session::open(
            Box::new(FileStore::open(path).unwrap()),
            EngineConfig::default(),
            Box::new(FixedClock::new(t0())),
        )
    };
    let path = dir.path().to_path_buf();
    {
        let mut s = open(&path);
        s.add_reflection(reflection("r1", "persisted")).unwrap();
        enter_commons(&mut s);
    }
    let s = open(&path);
    assert_eq!(s.state().layer(), Layer::Commons);
    assert!(s.state().has_acknowledged("commons-license@core-v1"));
    assert_eq!(s.state().data.reflections.len(), 1);
    assert_eq!(s.receipt_count(), 2);
}

#[test]
fn clear_all_purges_ledger_but_keeps_its_own_receipt() {
    let mut s = session();
    s.add_reflection(reflection("r1", "one")).unwrap();
    s.dispatch(TriggerEvent::ExportRequested);
    accept(&mut s);
    s.dispatch(TriggerEvent::ClearAllDataRequested);
    let outcome = accept(&mut s);

    let cleared = outcome.receipt.unwrap();
    assert_eq!(cleared.from_state.entity_counts.reflections, 1);
    assert_eq!(cleared.to_state.entity_counts.reflections, 0);
    assert_eq!(s.receipt_count(), 1);
    assert_eq!(s.last_receipt().unwrap().kind, ReceiptKind::DataCleared);
    assert_eq!(s.last_receipt().unwrap().sequence, 2);
}

#[test]
fn export_dialog_returns_bundle_with_its_receipt() {
    let mut s = session();
    s.add_reflection(reflection("r1", "one")).unwrap();
    s.dispatch(TriggerEvent::ExportRequested);
    let outcome = accept(&mut s);
    let bundle = outcome.export.unwrap();
    assert_eq!(bundle.reflections.unwrap().len(), 1);
    assert_eq!(bundle.receipts, vec![outcome.receipt.unwrap()]);
}

#[test]
fn bundle_files_round_trip_through_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backup.json");

    let mut source = session();
    source.add_reflection(reflection("r1", "carried over")).unwrap();
    source.export_bundle_file(&path).unwrap();

    let mut target = session();
    let report = target.import_bundle_file(&path).unwrap();
    assert_eq!(report.reflections.added, 1);
    assert_eq!(target.state().data.reflection("r1").unwrap().text, "carried over");
}

#[test]
fn commons_publish_requires_recognition_and_calm() {
    let mut s = session();
    enter_commons(&mut s);
    s.add_reflection(reflection("r1", "to the commons")).unwrap();

    s.dispatch(TriggerEvent::ShareToCommonsRequested { reflection_id: "r1".into() });
    let refusal = s.mounts().modal().unwrap();
    assert_eq!(refusal.candidate.rule_id, "commons_share_refused");
    let refusal = refusal.instance;
    s.dismiss(refusal).unwrap();

    s.grant_recognition(Recognition {
        status: RecognitionStatus::Verified,
        expires_at: t0() + Duration::hours(1),
    })
    .unwrap();
    s.update_settings(SettingsPatch { anonymity_default: Some(true), ..Default::default() })
        .unwrap();
    s.dispatch(TriggerEvent::ShareToCommonsRequested { reflection_id: "r1".into() });
    let outcome = accept(&mut s);
    assert_eq!(outcome.receipt.unwrap().kind, ReceiptKind::WorldPostPublished);
    let post = &s.state().data.world_posts[0];
    assert_eq!(post.reflection_id.as_deref(), Some("r1"));
    assert!(post.anonymous);
}

#[test]
fn expired_recognition_is_downgraded_on_tick() {
    let clock = Arc::new(FixedClock::new(t0()));
    let mut s = Session::open(
        Box::new(MemoryStore::new()),
        EngineConfig::default(),
        Box::new(clock.clone()),
    );
    s.grant_recognition(Recognition {
        status: RecognitionStatus::Verified,
        expires_at: t0() + Duration::hours(1),
    })
    .unwrap();

    assert!(s.dispatch(TriggerEvent::Tick { now: t0() + Duration::minutes(30) }).is_empty());

    clock.advance(Duration::hours(2));
    s.dispatch(TriggerEvent::Tick { now: t0() + Duration::hours(2) });
    let outcome = accept(&mut s);
    assert_eq!(outcome.receipt.unwrap().kind, ReceiptKind::RecognitionDowngraded);
    assert_eq!(
        s.state().session.recognition.as_ref().unwrap().status,
        RecognitionStatus::Provisional
    );
    assert!(s.dispatch(TriggerEvent::Tick { now: t0() + Duration::hours(3) }).is_empty());
}

#[test]
fn revoking_consent_is_immediate_and_receipted_once() {
    let mut s = session();
    enter_commons(&mut s);
    assert!(s.state().data.settings.commons_participation);

    let outcome = s.revoke_consent(ConsentFlag::CommonsParticipation).unwrap();
    assert_eq!(outcome.receipt.unwrap().kind, ReceiptKind::ConsentRevoked);
    assert!(!s.state().data.settings.commons_participation);

    let again = s.revoke_consent(ConsentFlag::CommonsParticipation).unwrap();
    assert!(again.receipt.is_none());
}

#[test]
fn fork_banner_is_pinned_and_leaves_with_the_fork() {
    let mut s = session();
    s.dispatch(TriggerEvent::ForkEnterRequested { fork_id: "dawn".into() });
    accept(&mut s);
    let banner = &s.mounts().overlays()[0];
    assert_eq!(banner.candidate.rule_id, "fork_banner");
    assert!(banner.pinned);

    s.dispatch(TriggerEvent::ForkExitRequested);
    let outcome = accept(&mut s);
    assert_eq!(outcome.receipt.unwrap().kind, ReceiptKind::ForkExited);
    assert!(s.mounts().overlays().is_empty());
}

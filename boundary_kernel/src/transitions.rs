/// Boundary Kernel — Committed Transitions
///
/// ALL state-mutation logic lives here.
/// Every function takes the current store by reference and returns a
/// new one; the input is never mutated. Nothing reaches the State Store
/// until the caller installs the returned value, so an abandoned
/// transition leaves no trace.

use chrono::{DateTime, Utc};

use crate::domain::{
    ConsentFlag, ForkContext, IdentityNode, NodeConnection, Recognition, Reflection, Thread,
    WorldPost,
};
use crate::events::TriggerEvent;
use crate::instruments::{Gate, Instrument};
use crate::invariants::{validate_invariants, InvariantViolation};
use crate::receipt::{ReceiptDraft, ReceiptKind};
use crate::rules::Candidate;
use crate::state::StateStore;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("required gate not acknowledged: {0:?}")]
    GateNotSatisfied(Gate),

    #[error("{kind} {id:?} already exists")]
    DuplicateId { kind: &'static str, id: String },

    #[error("{kind} {id:?} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("identity node {0:?} cannot connect to itself")]
    SelfLoop(String),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

/// What the user supplied when completing an instrument.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub acknowledged: Vec<Gate>,
    pub user_signature: Option<String>,
}

impl Completion {
    pub fn acknowledging(gates: &[Gate]) -> Self {
        Self {
            acknowledged: gates.to_vec(),
            user_signature: None,
        }
    }

    pub fn signed(mut self, signature: impl Into<String>) -> Self {
        self.user_signature = Some(signature.into());
        self
    }
}

/// Side effects the runtime must perform alongside the state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitEffect {
    None,
    ExportData,
    ClearAllData,
}

/// Outcome of a committed instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub store: StateStore,
    pub receipt: Option<ReceiptDraft>,
    pub follow_up: Vec<TriggerEvent>,
    pub effect: CommitEffect,
}

// ---------------------------------------------------------------------------
// Instrument completion
// ---------------------------------------------------------------------------

/// Apply the change an instrument stands for.
pub fn commit(
    store: &StateStore,
    candidate: &Candidate,
    completion: &Completion,
    now: DateTime<Utc>,
) -> Result<Commit, TransitionError> {
    if let Some(missing) = candidate
        .gates
        .iter()
        .find(|g| !completion.acknowledged.contains(g))
    {
        return Err(TransitionError::GateNotSatisfied(*missing));
    }

    let mut next = store.clone();
    let mut follow_up = Vec::new();
    let mut effect = CommitEffect::None;
    let mut license_id = None;

    match &candidate.instrument {
        Instrument::CrisisSupport
        | Instrument::ConstitutionalRefusal { .. }
        | Instrument::LayerIndicator { .. }
        | Instrument::ForkBanner { .. }
        | Instrument::FailureNotice { .. } => {}

        Instrument::RecognitionDowngrade { to, .. } => {
            if let Some(rec) = next.session.recognition.as_mut() {
                rec.status = *to;
            }
        }

        Instrument::ConsentDelta { to, .. } => {
            let from = store.layer();
            next.session.layer = *to;
            next.session.consented_layers.insert(*to);
            if *to == crate::domain::Layer::Commons {
                next.data.settings.commons_participation = true;
            }
            follow_up.push(TriggerEvent::LayerSwitched { from, to: *to });
        }

        Instrument::ForkEntry { fork_id } => {
            next.session.fork = Some(ForkContext {
                fork_id: fork_id.clone(),
                entered_at: now,
            });
            follow_up.push(TriggerEvent::ForkEntered {
                fork_id: fork_id.clone(),
            });
        }

        Instrument::ForkExit { .. } => {
            next.session.fork = None;
        }

        Instrument::IdentityLearningConsent => {
            next.data.settings.identity_learning = true;
        }

        Instrument::ConstitutionBind { constitution } => {
            next.data.constitution = constitution.clone();
        }

        Instrument::LicenseGate { license_id: id, .. } => {
            next.session.acknowledged_licenses.insert(id.clone());
            license_id = Some(id.clone());
        }

        Instrument::CommonsPublish { reflection_id } => {
            let reflection = live_reflection(store, reflection_id)?;
            next.data.world_posts.push(WorldPost {
                id: next_post_id(store, reflection_id),
                reflection_id: Some(reflection_id.clone()),
                text: reflection.text.clone(),
                created_at: now,
                anonymous: store.data.settings.anonymity_default,
            });
        }

        Instrument::ExportDialog => {
            effect = CommitEffect::ExportData;
        }

        Instrument::ClearDataConfirm => {
            next.data.reflections.clear();
            next.data.threads.clear();
            next.data.identity_nodes.clear();
            next.data.world_posts.clear();
            effect = CommitEffect::ClearAllData;
        }
    }

    validate_invariants(&next.data)?;

    let receipt = candidate.receipt.map(|kind| {
        ReceiptDraft::between(kind, store, &next, license_id)
            .with_signature(completion.user_signature.clone())
    });

    Ok(Commit {
        store: next,
        receipt,
        follow_up,
        effect,
    })
}

/// Withdraw a previously granted consent. Always allowed; receipted
/// only when the flag was actually set.
pub fn revoke_consent(store: &StateStore, flag: ConsentFlag) -> Commit {
    if !flag.is_set(&store.data.settings) {
        return Commit {
            store: store.clone(),
            receipt: None,
            follow_up: Vec::new(),
            effect: CommitEffect::None,
        };
    }
    let mut next = store.clone();
    flag.set(&mut next.data.settings, false);
    let receipt = ReceiptDraft::between(ReceiptKind::ConsentRevoked, store, &next, None);
    Commit {
        store: next,
        receipt: Some(receipt),
        follow_up: Vec::new(),
        effect: CommitEffect::None,
    }
}

// ---------------------------------------------------------------------------
// Entity operations (not boundary crossings, never receipted)
// ---------------------------------------------------------------------------

/// Settings that can change without a consent instrument.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsPatch {
    pub crisis_mode: Option<bool>,
    pub anonymity_default: Option<bool>,
    pub auto_archive: Option<bool>,
}

pub fn update_settings(store: &StateStore, patch: SettingsPatch) -> StateStore {
    let mut next = store.clone();
    let s = &mut next.data.settings;
    if let Some(v) = patch.crisis_mode {
        s.crisis_mode = v;
    }
    if let Some(v) = patch.anonymity_default {
        s.anonymity_default = v;
    }
    if let Some(v) = patch.auto_archive {
        s.auto_archive = v;
    }
    next
}

/// Record recognition granted by an external verifier. Downgrades go
/// through the recognition-downgrade instrument instead.
pub fn grant_recognition(store: &StateStore, recognition: Recognition) -> StateStore {
    let mut next = store.clone();
    next.session.recognition = Some(recognition);
    next
}

pub fn add_reflection(
    store: &StateStore,
    reflection: Reflection,
    now: DateTime<Utc>,
) -> Result<StateStore, TransitionError> {
    if store.data.reflection(&reflection.id).is_some() {
        return Err(TransitionError::DuplicateId {
            kind: "reflection",
            id: reflection.id,
        });
    }
    let mut next = store.clone();
    let thread_id = reflection.thread_id.clone();
    let reflection_id = reflection.id.clone();
    next.data.reflections.push(reflection);
    if let Some(tid) = thread_id {
        let thread = thread_mut(&mut next, &tid)?;
        thread.reflection_ids.push(reflection_id);
        touch(thread, now);
    }
    validate_invariants(&next.data)?;
    Ok(next)
}

pub fn create_thread(
    store: &StateStore,
    thread: Thread,
) -> Result<StateStore, TransitionError> {
    if store.data.thread(&thread.id).is_some() {
        return Err(TransitionError::DuplicateId {
            kind: "thread",
            id: thread.id,
        });
    }
    let mut next = store.clone();
    for rid in &thread.reflection_ids {
        let previous = reflection_mut(&mut next, rid)?.thread_id.replace(thread.id.clone());
        if let Some(old) = previous {
            if let Some(old_thread) = next.data.threads.iter_mut().find(|t| t.id == old) {
                old_thread.reflection_ids.retain(|r| r != rid);
            }
        }
    }
    next.data.threads.push(thread);
    validate_invariants(&next.data)?;
    Ok(next)
}

/// Move a reflection into `thread_id`, unlinking it from any previous thread.
pub fn link_reflection(
    store: &StateStore,
    reflection_id: &str,
    thread_id: &str,
    now: DateTime<Utc>,
) -> Result<StateStore, TransitionError> {
    let mut next = store.clone();
    thread_mut(&mut next, thread_id)?;
    let previous = reflection_mut(&mut next, reflection_id)?
        .thread_id
        .replace(thread_id.to_string());

    if let Some(old) = previous {
        if old == thread_id {
            return Ok(store.clone());
        }
        if let Some(old_thread) = next.data.threads.iter_mut().find(|t| t.id == old) {
            old_thread.reflection_ids.retain(|r| r != reflection_id);
            touch(old_thread, now);
        }
    }
    let thread = thread_mut(&mut next, thread_id)?;
    thread.reflection_ids.push(reflection_id.to_string());
    touch(thread, now);

    validate_invariants(&next.data)?;
    Ok(next)
}

pub fn set_archived(
    store: &StateStore,
    reflection_id: &str,
    archived: bool,
) -> Result<StateStore, TransitionError> {
    let mut next = store.clone();
    reflection_mut(&mut next, reflection_id)?.metadata.archived = archived;
    Ok(next)
}

/// Soft delete: the reflection stays, flagged as deleted.
pub fn soft_delete_reflection(
    store: &StateStore,
    reflection_id: &str,
) -> Result<StateStore, TransitionError> {
    let mut next = store.clone();
    reflection_mut(&mut next, reflection_id)?.metadata.deleted = true;
    Ok(next)
}

/// Hard delete: removes the reflection and its thread memberships.
pub fn hard_delete_reflection(
    store: &StateStore,
    reflection_id: &str,
    now: DateTime<Utc>,
) -> Result<StateStore, TransitionError> {
    let mut next = store.clone();
    let before = next.data.reflections.len();
    next.data.reflections.retain(|r| r.id != reflection_id);
    if next.data.reflections.len() == before {
        return Err(TransitionError::NotFound {
            kind: "reflection",
            id: reflection_id.to_string(),
        });
    }
    for thread in next.data.threads.iter_mut() {
        let len = thread.reflection_ids.len();
        thread.reflection_ids.retain(|r| r != reflection_id);
        if thread.reflection_ids.len() != len {
            touch(thread, now);
        }
    }
    validate_invariants(&next.data)?;
    Ok(next)
}

pub fn add_identity_node(
    store: &StateStore,
    node: IdentityNode,
) -> Result<StateStore, TransitionError> {
    if store.data.identity_node(&node.id).is_some() {
        return Err(TransitionError::DuplicateId {
            kind: "identity node",
            id: node.id,
        });
    }
    let mut next = store.clone();
    next.data.identity_nodes.push(node);
    validate_invariants(&next.data)?;
    Ok(next)
}

/// Add or re-weight the edge `from → to`.
pub fn connect_identity_nodes(
    store: &StateStore,
    from: &str,
    to: &str,
    strength: f64,
    now: DateTime<Utc>,
) -> Result<StateStore, TransitionError> {
    if from == to {
        return Err(TransitionError::SelfLoop(from.to_string()));
    }
    if store.data.identity_node(to).is_none() {
        return Err(TransitionError::NotFound {
            kind: "identity node",
            id: to.to_string(),
        });
    }
    let mut next = store.clone();
    let node = next
        .data
        .identity_nodes
        .iter_mut()
        .find(|n| n.id == from)
        .ok_or_else(|| TransitionError::NotFound {
            kind: "identity node",
            id: from.to_string(),
        })?;
    match node.connections.iter_mut().find(|c| c.node_id == to) {
        Some(conn) => conn.strength = strength,
        None => node.connections.push(NodeConnection {
            node_id: to.to_string(),
            strength,
        }),
    }
    if now > node.last_updated {
        node.last_updated = now;
    }
    validate_invariants(&next.data)?;
    Ok(next)
}

// ---------------------------------------------------------------------------
// Helpers (private)
// ---------------------------------------------------------------------------

fn live_reflection<'a>(
    store: &'a StateStore,
    reflection_id: &str,
) -> Result<&'a Reflection, TransitionError> {
    store
        .data
        .reflection(reflection_id)
        .filter(|r| !r.metadata.deleted)
        .ok_or_else(|| TransitionError::NotFound {
            kind: "reflection",
            id: reflection_id.to_string(),
        })
}

fn reflection_mut<'a>(
    store: &'a mut StateStore,
    reflection_id: &str,
) -> Result<&'a mut Reflection, TransitionError> {
    store
        .data
        .reflections
        .iter_mut()
        .find(|r| r.id == reflection_id)
        .ok_or_else(|| TransitionError::NotFound {
            kind: "reflection",
            id: reflection_id.to_string(),
        })
}

fn thread_mut<'a>(
    store: &'a mut StateStore,
    thread_id: &str,
) -> Result<&'a mut Thread, TransitionError> {
    store
        .data
        .threads
        .iter_mut()
        .find(|t| t.id == thread_id)
        .ok_or_else(|| TransitionError::NotFound {
            kind: "thread",
            id: thread_id.to_string(),
        })
}

/// First free `post-<reflection>-<n>` id.
fn next_post_id(store: &StateStore, reflection_id: &str) -> String {
    (1u64..)
        .map(|n| format!("post-{reflection_id}-{n}"))
        .find(|id| store.data.world_posts.iter().all(|p| &p.id != id))
        .unwrap_or_default()
}

/// `last_updated` never moves backwards.
fn touch(thread: &mut Thread, now: DateTime<Utc>) {
    if now > thread.last_updated {
        thread.last_updated = now;
    }
}

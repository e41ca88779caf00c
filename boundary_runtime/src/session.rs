//! Session — the only writer of the State Store and the Receipt Ledger.
//!
//! Single-threaded, event-driven. Every state change goes through a
//! kernel transition on a copy, then persistence, then the live copy.
//!
//! Commit order for a completed instrument:
//!   1. kernel commit on a copy       — gate or invariant failure aborts
//!   2. one write batch               — receipt first, then changed keys
//!   3. install the new state         — only if step 2 succeeded
//!   4. unmount, prune, re-evaluate   — only when the state moved
//!
//! A failed step leaves the instrument mounted, the State Store and the
//! ledger exactly as they were. Losing the backend is not a failure: the
//! session carries on in memory and raises the storage warning once.

use std::path::Path;
use std::sync::Mutex;

use boundary_kernel::arbiter::{self, InstanceId, MountInstruction, MountTable, UnmountReason};
use boundary_kernel::domain::{ConsentFlag, IdentityNode, Recognition, Reflection, Thread};
use boundary_kernel::events::TriggerEvent;
use boundary_kernel::hashing::state_fingerprint;
use boundary_kernel::invariants::validate_invariants;
use boundary_kernel::receipt::{Receipt, ReceiptKind};
use boundary_kernel::rules::RuleTable;
use boundary_kernel::state::StateStore;
use boundary_kernel::transitions::{self, Commit, CommitEffect, Completion, SettingsPatch};

use crate::bundle::{merge_bundle, ExportBundle, MergeReport};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{EngineError, StorageError};
use crate::ledger::ReceiptLedger;
use crate::persistence::{self, changed_keys, keys, Persistence};
use crate::store::{FileStore, KvStore, MemoryStore};

/// Result of completing an instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOutcome {
    pub receipt: Option<Receipt>,
    pub instructions: Vec<MountInstruction>,
    /// Present when the completed instrument was the export dialog.
    pub export: Option<ExportBundle>,
}

pub struct Session {
    config: EngineConfig,
    rules: RuleTable,
    clock: Box<dyn Clock>,
    persistence: Persistence,
    ledger: ReceiptLedger,
    store: StateStore,
    mounts: MountTable,
}

impl Session {
    /// Open a session over `backend`. An unreachable backend degrades to
    /// memory; see `take_storage_warning`.
    pub fn open(backend: Box<dyn KvStore>, config: EngineConfig, clock: Box<dyn Clock>) -> Self {
        Self::with_persistence(Persistence::open(backend), config, clock)
    }

    /// Open the store the config names: files under `data_dir`, else memory.
    pub fn from_config(config: EngineConfig) -> Self {
        let persistence = match &config.data_dir {
            Some(dir) => match FileStore::open(dir) {
                Ok(store) => {
                    let store = match config.storage_quota_bytes {
                        Some(quota) => store.with_quota(quota),
                        None => store,
                    };
                    Persistence::open(Box::new(store))
                }
                Err(err) => Persistence::degraded(err),
            },
            None => {
                let store = match config.storage_quota_bytes {
                    Some(quota) => MemoryStore::with_quota(quota),
                    None => MemoryStore::new(),
                };
                Persistence::open(Box::new(store))
            }
        };
        Self::with_persistence(persistence, config, Box::new(SystemClock))
    }

    fn with_persistence(persistence: Persistence, config: EngineConfig, clock: Box<dyn Clock>) -> Self {
        let mut store = persistence.load_state();
        if let Err(violation) = validate_invariants(&store.data) {
            tracing::warn!(error = %violation, "Persisted data is inconsistent, starting empty");
            store.data = Default::default();
        }
        let ledger = ReceiptLedger::load(&persistence);
        Self {
            config,
            rules: RuleTable::standard(),
            clock,
            persistence,
            ledger,
            store,
            mounts: MountTable::default(),
        }
    }

    pub fn with_rules(mut self, rules: RuleTable) -> Self {
        self.rules = rules;
        self
    }

    // ── Read side ──────────────────────────────────────────────────

    pub fn state(&self) -> &StateStore {
        &self.store
    }

    pub fn mounts(&self) -> &MountTable {
        &self.mounts
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn receipt_count(&self) -> usize {
        self.ledger.len()
    }

    pub fn last_receipt(&self) -> Option<&Receipt> {
        self.ledger.last()
    }

    pub fn is_degraded(&self) -> bool {
        self.persistence.is_degraded()
    }

    /// The degraded-storage warning, surfaced once.
    pub fn take_storage_warning(&mut self) -> Option<String> {
        self.persistence.take_warning()
    }

    // ── Events and instruments ─────────────────────────────────────

    /// Evaluate one event and arbitrate its candidates.
    pub fn dispatch(&mut self, event: TriggerEvent) -> Vec<MountInstruction> {
        self.dispatch_batch(vec![event])
    }

    /// Evaluate events that arrived in the same tick and arbitrate all
    /// their candidates together.
    pub fn dispatch_batch(&mut self, events: Vec<TriggerEvent>) -> Vec<MountInstruction> {
        let out = self.arbitrate_events(&events);
        log_instructions(&out);
        out
    }

    fn arbitrate_events(&mut self, events: &[TriggerEvent]) -> Vec<MountInstruction> {
        let candidates: Vec<_> = events
            .iter()
            .flat_map(|e| self.rules.evaluate(e, &self.store))
            .collect();
        if candidates.is_empty() {
            tracing::debug!(count = events.len(), "No rule matched");
            return Vec::new();
        }
        let (mounts, out) = arbiter::arbitrate(
            &self.mounts,
            candidates,
            self.store.layer(),
            &self.config.overlay_caps,
        );
        self.mounts = mounts;
        out
    }

    /// The user started working in a mounted instrument; it can no longer
    /// be preempted.
    pub fn begin_interaction(&mut self, instance: InstanceId) -> Result<(), EngineError> {
        self.mounts = arbiter::begin_interaction(&self.mounts, instance)
            .ok_or_else(|| self.missing(instance))?;
        Ok(())
    }

    pub fn pin(&mut self, instance: InstanceId, pinned: bool) -> Result<(), EngineError> {
        self.mounts = arbiter::set_pinned(&self.mounts, instance, pinned)
            .ok_or_else(|| self.missing(instance))?;
        Ok(())
    }

    /// Complete a mounted instrument with what the user acknowledged.
    pub fn complete(
        &mut self,
        instance: InstanceId,
        completion: Completion,
    ) -> Result<CompletionOutcome, EngineError> {
        let mounted = self.mounts.find(instance).ok_or_else(|| self.missing(instance))?;
        let now = self.clock.now();
        let mut commit = transitions::commit(&self.store, &mounted.candidate, &completion, now)?;
        let follow_up = std::mem::take(&mut commit.follow_up);

        let (receipt, export) = self.apply_commit(commit)?;

        let (mounts, _, mut out) = arbiter::release(&self.mounts, instance, UnmountReason::Completed)
            .ok_or(EngineError::UnknownInstance(instance))?;
        self.mounts = mounts;
        out.extend(self.settle(follow_up));
        log_instructions(&out);

        Ok(CompletionOutcome {
            receipt,
            instructions: out,
            export,
        })
    }

    /// Cancel a mounted or queued instrument. Nothing is written.
    pub fn dismiss(&mut self, instance: InstanceId) -> Result<Vec<MountInstruction>, EngineError> {
        let (mounts, _, mut out) = arbiter::release(&self.mounts, instance, UnmountReason::Dismissed)
            .ok_or(EngineError::UnknownInstance(instance))?;
        self.mounts = mounts;
        out.extend(self.replay());
        log_instructions(&out);
        Ok(out)
    }

    fn missing(&self, instance: InstanceId) -> EngineError {
        if self.mounts.is_queued(instance) {
            EngineError::NotMounted(instance)
        } else {
            EngineError::UnknownInstance(instance)
        }
    }

    // ── Commit plumbing ────────────────────────────────────────────

    /// Persist a kernel commit (receipt first, then changed keys) and
    /// install it. Nothing changes in memory unless every write landed.
    fn apply_commit(
        &mut self,
        commit: Commit,
    ) -> Result<(Option<Receipt>, Option<ExportBundle>), EngineError> {
        let now = self.clock.now();
        let receipt = commit
            .receipt
            .map(|draft| self.ledger.seal(draft, uuid::Uuid::new_v4().to_string(), now));

        let mut writes = Vec::new();
        if let Some(receipt) = &receipt {
            let raw = match commit.effect {
                CommitEffect::ClearAllData => self.ledger.staged_purge(receipt)?,
                _ => self.ledger.staged_append(receipt)?,
            };
            writes.push((keys::RECEIPTS, raw));
        }
        writes.extend(changed_keys(&self.store, &commit.store)?);

        self.persist(&writes)?;

        self.store = commit.store;
        if let Some(receipt) = &receipt {
            tracing::info!(
                receipt_id = %receipt.id,
                kind = ?receipt.kind,
                sequence = receipt.sequence,
                "Receipt appended"
            );
            match commit.effect {
                CommitEffect::ClearAllData => {
                    tracing::info!("All data cleared");
                    self.ledger.commit_purge(receipt.clone());
                }
                _ => self.ledger.commit_append(receipt.clone()),
            }
        }

        let export = match commit.effect {
            CommitEffect::ExportData => Some(self.export_all()),
            _ => None,
        };
        Ok((receipt, export))
    }

    /// Write one batch. A backend lost mid-session is replaced by memory
    /// holding the live state, and the batch goes there instead.
    fn persist(&mut self, writes: &[(&str, String)]) -> Result<(), EngineError> {
        match self.persistence.write_batch(writes) {
            Err(lost @ StorageError::Unavailable(_)) => {
                let baseline = persistence::snapshot(&self.store, self.ledger.entries())?;
                self.persistence.fall_back_to_memory(&lost, &baseline)?;
                self.persistence.write_batch(writes)?;
                Ok(())
            }
            result => Ok(result?),
        }
    }

    /// Re-evaluate after a state change: drop stale overlays, re-apply the
    /// overlay cap, replay the queue, then dispatch follow-up events.
    /// Only state deltas trigger another round, and never more than
    /// `max_cascade_depth` rounds.
    fn settle(&mut self, follow_up: Vec<TriggerEvent>) -> Vec<MountInstruction> {
        let mut out = Vec::new();
        let mut pending = follow_up;
        let mut seen: Option<String> = None;
        let mut depth = 0;

        loop {
            let fingerprint = state_fingerprint(&self.store);
            if seen.as_deref() == Some(fingerprint.as_str()) && pending.is_empty() {
                break;
            }
            if depth >= self.config.max_cascade_depth {
                tracing::warn!(depth, dropped = pending.len(), "Cascade depth exceeded");
                break;
            }
            depth += 1;
            seen = Some(fingerprint);

            let (mounts, pruned) = arbiter::prune_overlays(&self.mounts, &self.store, &self.rules);
            self.mounts = mounts;
            out.extend(pruned);

            let (mounts, evicted) =
                arbiter::rebalance(&self.mounts, self.store.layer(), &self.config.overlay_caps);
            self.mounts = mounts;
            out.extend(evicted);

            // Queued modals get the free slot before any follow-up does.
            out.extend(self.replay());

            if !pending.is_empty() {
                out.extend(self.arbitrate_events(&std::mem::take(&mut pending)));
            }
        }

        out.extend(self.replay());
        out
    }

    fn replay(&mut self) -> Vec<MountInstruction> {
        let (mounts, out, dropped) = arbiter::replay_queue(&self.mounts, &self.store, &self.rules);
        self.mounts = mounts;
        for entry in dropped {
            tracing::debug!(
                instance = %entry.instance,
                rule = entry.candidate.rule_id,
                "Queued trigger no longer holds, dropped"
            );
        }
        out
    }

    /// Persist and install a plain state change (no receipt).
    fn apply_state(&mut self, next: StateStore) -> Result<Vec<MountInstruction>, EngineError> {
        let writes = changed_keys(&self.store, &next)?;
        if writes.is_empty() {
            return Ok(Vec::new());
        }
        self.persist(&writes)?;
        self.store = next;
        Ok(self.settle(Vec::new()))
    }

    // ── Entity operations ──────────────────────────────────────────

    pub fn add_reflection(&mut self, reflection: Reflection) -> Result<Vec<MountInstruction>, EngineError> {
        let next = transitions::add_reflection(&self.store, reflection, self.clock.now())?;
        self.apply_state(next)
    }

    pub fn create_thread(&mut self, thread: Thread) -> Result<Vec<MountInstruction>, EngineError> {
        let next = transitions::create_thread(&self.store, thread)?;
        self.apply_state(next)
    }

    pub fn link_reflection(
        &mut self,
        reflection_id: &str,
        thread_id: &str,
    ) -> Result<Vec<MountInstruction>, EngineError> {
        let next =
            transitions::link_reflection(&self.store, reflection_id, thread_id, self.clock.now())?;
        self.apply_state(next)
    }

    pub fn set_archived(
        &mut self,
        reflection_id: &str,
        archived: bool,
    ) -> Result<Vec<MountInstruction>, EngineError> {
        let next = transitions::set_archived(&self.store, reflection_id, archived)?;
        self.apply_state(next)
    }

    pub fn soft_delete_reflection(&mut self, reflection_id: &str) -> Result<Vec<MountInstruction>, EngineError> {
        let next = transitions::soft_delete_reflection(&self.store, reflection_id)?;
        self.apply_state(next)
    }

    pub fn hard_delete_reflection(&mut self, reflection_id: &str) -> Result<Vec<MountInstruction>, EngineError> {
        let next = transitions::hard_delete_reflection(&self.store, reflection_id, self.clock.now())?;
        self.apply_state(next)
    }

    pub fn add_identity_node(&mut self, node: IdentityNode) -> Result<Vec<MountInstruction>, EngineError> {
        let next = transitions::add_identity_node(&self.store, node)?;
        self.apply_state(next)
    }

    pub fn connect_identity_nodes(
        &mut self,
        from: &str,
        to: &str,
        strength: f64,
    ) -> Result<Vec<MountInstruction>, EngineError> {
        let next =
            transitions::connect_identity_nodes(&self.store, from, to, strength, self.clock.now())?;
        self.apply_state(next)
    }

    pub fn update_settings(&mut self, patch: SettingsPatch) -> Result<Vec<MountInstruction>, EngineError> {
        let next = transitions::update_settings(&self.store, patch);
        self.apply_state(next)
    }

    pub fn grant_recognition(&mut self, recognition: Recognition) -> Result<Vec<MountInstruction>, EngineError> {
        let next = transitions::grant_recognition(&self.store, recognition);
        self.apply_state(next)
    }

    /// Withdraw a consent immediately. Receipted when it was granted.
    pub fn revoke_consent(&mut self, flag: ConsentFlag) -> Result<CompletionOutcome, EngineError> {
        let commit = transitions::revoke_consent(&self.store, flag);
        if commit.receipt.is_none() {
            return Ok(CompletionOutcome {
                receipt: None,
                instructions: Vec::new(),
                export: None,
            });
        }
        tracing::info!(flag = flag.as_str(), "Consent revoked");
        let (receipt, export) = self.apply_commit(commit)?;
        let instructions = self.settle(Vec::new());
        log_instructions(&instructions);
        Ok(CompletionOutcome {
            receipt,
            instructions,
            export,
        })
    }

    // ── Export / import ────────────────────────────────────────────

    /// Versioned bundle of every collection, both singletons and the ledger.
    pub fn export_all(&self) -> ExportBundle {
        ExportBundle::capture(
            &self.store.data,
            self.ledger.entries(),
            self.clock.now(),
            self.config.bundle_version,
        )
    }

    /// Merge a bundle into the local data. Rejected before any write if
    /// the version is unsupported or the merged data is inconsistent.
    pub fn import_merge(&mut self, bundle: &ExportBundle) -> Result<MergeReport, EngineError> {
        bundle.check_version()?;
        let (merged, report) = merge_bundle(&self.store.data, bundle);
        validate_invariants(&merged)?;

        let mut next = self.store.clone();
        next.data = merged;
        self.apply_state(next)?;

        tracing::info!(
            added = report.added(),
            kept_local = report.conflicts(),
            "Bundle imported"
        );
        Ok(report)
    }

    pub fn import_bundle_file(&mut self, path: &Path) -> Result<MergeReport, EngineError> {
        let bundle = crate::bundle::import_bundle_from_file(path)?;
        self.import_merge(&bundle)
    }

    pub fn export_bundle_file(&self, path: &Path) -> Result<(), EngineError> {
        crate::bundle::export_bundle_to_file(&self.export_all(), path)
    }

    /// Receipts of one kind, oldest first.
    pub fn receipts_of(&self, kind: ReceiptKind) -> impl Iterator<Item = &Receipt> {
        self.ledger.entries().iter().filter(move |r| r.kind == kind)
    }
}

fn log_instructions(out: &[MountInstruction]) {
    for instruction in out {
        match instruction {
            MountInstruction::Mount { instance, instrument, presentation } => {
                tracing::debug!(%instance, instrument = instrument.name(), ?presentation, "Mount");
            }
            MountInstruction::Unmount { instance, reason } => {
                tracing::debug!(%instance, ?reason, "Unmount");
            }
        }
    }
}

/// Thread-safe session handle using Mutex.
pub struct SharedSession {
    inner: Mutex<Session>,
}

impl SharedSession {
    pub fn new(session: Session) -> Self {
        Self {
            inner: Mutex::new(session),
        }
    }

    /// Run `f` with exclusive access to the session.
    pub fn with<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut session = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut session)
    }

    pub fn dispatch(&self, event: TriggerEvent) -> Vec<MountInstruction> {
        self.with(|s| s.dispatch(event))
    }

    pub fn complete(
        &self,
        instance: InstanceId,
        completion: Completion,
    ) -> Result<CompletionOutcome, EngineError> {
        self.with(|s| s.complete(instance, completion))
    }

    pub fn dismiss(&self, instance: InstanceId) -> Result<Vec<MountInstruction>, EngineError> {
        self.with(|s| s.dismiss(instance))
    }
}

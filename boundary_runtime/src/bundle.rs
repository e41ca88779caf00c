//! Export bundle and merge-import.
//!
//! - `ExportBundle::capture`: State Store + ledger → versioned bundle
//! - `merge_bundle`: pure merge of a bundle into local domain data
//! - `export_bundle_to_file` / `import_bundle_from_file`: file I/O
//!
//! Merge policy: entity collections are union-by-id, keep-existing on
//! conflict; the constitution and settings singletons are replace-wins.
//! A collection absent from the bundle leaves the local one untouched.
//! Receipts travel with an export but are never imported.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use boundary_kernel::domain::{
    ConstitutionalState, IdentityNode, Reflection, Thread, UserSettings, WorldPost,
};
use boundary_kernel::receipt::Receipt;
use boundary_kernel::state::DomainData;

use crate::config::SUPPORTED_BUNDLE_VERSION;
use crate::error::{EngineError, StorageError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBundle {
    #[serde(default = "legacy_version")]
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflections: Option<Vec<Reflection>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<Vec<Thread>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_nodes: Option<Vec<IdentityNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_posts: Option<Vec<WorldPost>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constitutional_state: Option<ConstitutionalState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<UserSettings>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub receipts: Vec<Receipt>,
}

/// Bundles written before versioning are version 1.
fn legacy_version() -> u32 {
    1
}

impl ExportBundle {
    pub fn capture(
        data: &DomainData,
        receipts: &[Receipt],
        exported_at: DateTime<Utc>,
        version: u32,
    ) -> Self {
        Self {
            version,
            exported_at,
            reflections: Some(data.reflections.clone()),
            threads: Some(data.threads.clone()),
            identity_nodes: Some(data.identity_nodes.clone()),
            world_posts: Some(data.world_posts.clone()),
            constitutional_state: Some(data.constitution.clone()),
            settings: Some(data.settings.clone()),
            receipts: receipts.to_vec(),
        }
    }

    pub fn check_version(&self) -> Result<(), EngineError> {
        if self.version > SUPPORTED_BUNDLE_VERSION {
            return Err(EngineError::BundleVersion {
                found: self.version,
                supported: SUPPORTED_BUNDLE_VERSION,
            });
        }
        Ok(())
    }
}

/// Per-collection merge outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeCount {
    pub added: usize,
    /// Imported entities dropped because the id already existed.
    pub kept_local: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub reflections: MergeCount,
    pub threads: MergeCount,
    pub identity_nodes: MergeCount,
    pub world_posts: MergeCount,
    pub constitution_replaced: bool,
    pub settings_replaced: bool,
}

impl MergeReport {
    pub fn added(&self) -> usize {
        self.reflections.added + self.threads.added + self.identity_nodes.added + self.world_posts.added
    }

    pub fn conflicts(&self) -> usize {
        self.reflections.kept_local
            + self.threads.kept_local
            + self.identity_nodes.kept_local
            + self.world_posts.kept_local
    }
}

trait HasId {
    fn id(&self) -> &str;
}

impl HasId for Reflection {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasId for Thread {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasId for IdentityNode {
    fn id(&self) -> &str {
        &self.id
    }
}

impl HasId for WorldPost {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Append every imported entity whose id is not yet present.
fn union_by_id<T: HasId + Clone>(local: &mut Vec<T>, imported: Option<&Vec<T>>) -> MergeCount {
    let mut count = MergeCount::default();
    let Some(imported) = imported else {
        return count;
    };
    let mut seen: BTreeSet<String> = local.iter().map(|e| e.id().to_string()).collect();
    for entity in imported {
        if seen.insert(entity.id().to_string()) {
            local.push(entity.clone());
            count.added += 1;
        } else {
            count.kept_local += 1;
        }
    }
    count
}

/// Merge `bundle` into a copy of `local`. Pure; validation is the
/// caller's job.
pub fn merge_bundle(local: &DomainData, bundle: &ExportBundle) -> (DomainData, MergeReport) {
    let mut merged = local.clone();
    let mut report = MergeReport {
        reflections: union_by_id(&mut merged.reflections, bundle.reflections.as_ref()),
        threads: union_by_id(&mut merged.threads, bundle.threads.as_ref()),
        identity_nodes: union_by_id(&mut merged.identity_nodes, bundle.identity_nodes.as_ref()),
        world_posts: union_by_id(&mut merged.world_posts, bundle.world_posts.as_ref()),
        ..MergeReport::default()
    };
    if let Some(constitution) = &bundle.constitutional_state {
        merged.constitution = constitution.clone();
        report.constitution_replaced = true;
    }
    if let Some(settings) = &bundle.settings {
        merged.settings = settings.clone();
        report.settings_replaced = true;
    }
    (merged, report)
}

// ---------------------------------------------------------------------------
// File I/O
// ---------------------------------------------------------------------------

pub fn export_bundle_to_file(bundle: &ExportBundle, path: &Path) -> Result<(), EngineError> {
    let json = serde_json::to_string_pretty(bundle).map_err(|e| StorageError::Serialization {
        key: path.display().to_string(),
        message: e.to_string(),
    })?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, json.as_bytes())?;
    Ok(())
}

/// Read and version-check a bundle. Nothing is merged here.
pub fn import_bundle_from_file(path: &Path) -> Result<ExportBundle, EngineError> {
    let content = fs::read_to_string(path)?;
    let bundle: ExportBundle =
        serde_json::from_str(&content).map_err(|e| StorageError::Serialization {
            key: path.display().to_string(),
            message: e.to_string(),
        })?;
    bundle.check_version()?;
    Ok(bundle)
}

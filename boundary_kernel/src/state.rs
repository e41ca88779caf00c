/// Boundary Kernel — State Store
///
/// Canonical, synchronously readable snapshot of the session.
/// Pure data; every mutation is made on a clone by `transitions`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::{
    ConstitutionalState, ForkContext, IdentityNode, Layer, Recognition, Reflection, Thread,
    UserSettings, WorldPost,
};

/// Boundary-relevant context of the running session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    #[serde(default)]
    pub layer: Layer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork: Option<ForkContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recognition: Option<Recognition>,
    /// License ids the user has accepted.
    #[serde(default)]
    pub acknowledged_licenses: BTreeSet<String>,
    /// Layers the user has consented to enter at least once.
    #[serde(default)]
    pub consented_layers: BTreeSet<Layer>,
}

/// Domain collections plus the two singletons.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainData {
    #[serde(default)]
    pub reflections: Vec<Reflection>,
    #[serde(default)]
    pub threads: Vec<Thread>,
    #[serde(default)]
    pub identity_nodes: Vec<IdentityNode>,
    #[serde(default)]
    pub world_posts: Vec<WorldPost>,
    #[serde(default)]
    pub constitution: ConstitutionalState,
    #[serde(default)]
    pub settings: UserSettings,
}

impl DomainData {
    pub fn reflection(&self, id: &str) -> Option<&Reflection> {
        self.reflections.iter().find(|r| r.id == id)
    }

    pub fn thread(&self, id: &str) -> Option<&Thread> {
        self.threads.iter().find(|t| t.id == id)
    }

    pub fn identity_node(&self, id: &str) -> Option<&IdentityNode> {
        self.identity_nodes.iter().find(|n| n.id == id)
    }
}

/// The live working copy: session context plus domain data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateStore {
    pub session: SessionState,
    pub data: DomainData,
}

impl StateStore {
    pub fn new(session: SessionState, data: DomainData) -> Self {
        Self { session, data }
    }

    pub fn layer(&self) -> Layer {
        self.session.layer
    }

    /// Identifier of the bound constitution.
    pub fn constitution_version(&self) -> &str {
        &self.data.constitution.active_constitution
    }

    pub fn in_fork(&self) -> bool {
        self.session.fork.is_some()
    }

    pub fn has_acknowledged(&self, license_id: &str) -> bool {
        self.session.acknowledged_licenses.contains(license_id)
    }

    /// License that gates entry into `layer` under the bound constitution.
    /// `None` for layers that carry no license.
    pub fn license_for(&self, layer: Layer) -> Option<String> {
        if !layer.requires_license() {
            return None;
        }
        Some(format!("{}-license@{}", layer.as_str(), self.constitution_version()))
    }
}

/// Boundary Kernel — Invariant Checks
///
/// Non-panicking validation of domain data. Returns the first violation.
/// Run after every committed transition and on every import merge.

use std::collections::BTreeSet;

use crate::state::DomainData;

/// A violated invariant, tagged for log filtering.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[INVARIANT:{tag}] {detail}")]
pub struct InvariantViolation {
    pub tag: &'static str,
    pub detail: String,
}

impl InvariantViolation {
    fn new(tag: &'static str, detail: String) -> Self {
        Self { tag, detail }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn validate_invariants(data: &DomainData) -> Result<(), InvariantViolation> {
    check_unique_ids(data)?;
    check_thread_refs(data)?;
    check_reflection_thread_links(data)?;
    check_thread_timestamps(data)?;
    check_identity_connection_refs(data)?;
    check_identity_self_loops(data)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Individual checks (private)
// ---------------------------------------------------------------------------

fn check_unique_ids(data: &DomainData) -> Result<(), InvariantViolation> {
    fn first_duplicate<'a>(ids: impl Iterator<Item = &'a str>) -> Option<&'a str> {
        let mut seen = BTreeSet::new();
        ids.into_iter().find(|id| !seen.insert(*id))
    }

    let collections: [(&str, Option<&str>); 4] = [
        ("reflection", first_duplicate(data.reflections.iter().map(|r| r.id.as_str()))),
        ("thread", first_duplicate(data.threads.iter().map(|t| t.id.as_str()))),
        ("identity node", first_duplicate(data.identity_nodes.iter().map(|n| n.id.as_str()))),
        ("world post", first_duplicate(data.world_posts.iter().map(|p| p.id.as_str()))),
    ];
    for (kind, dup) in collections {
        if let Some(id) = dup {
            return Err(InvariantViolation::new(
                "duplicate_ids",
                format!("Duplicate {} id {:?}", kind, id),
            ));
        }
    }
    Ok(())
}

/// Every id in a thread's `reflection_ids` references an existing reflection.
fn check_thread_refs(data: &DomainData) -> Result<(), InvariantViolation> {
    let ids: BTreeSet<&str> = data.reflections.iter().map(|r| r.id.as_str()).collect();
    for thread in &data.threads {
        for rid in &thread.reflection_ids {
            if !ids.contains(rid.as_str()) {
                return Err(InvariantViolation::new(
                    "thread_refs",
                    format!("Thread {:?} references missing reflection {:?}", thread.id, rid),
                ));
            }
        }
    }
    Ok(())
}

/// A reflection's `thread_id`, when set, names an existing thread.
fn check_reflection_thread_links(data: &DomainData) -> Result<(), InvariantViolation> {
    let ids: BTreeSet<&str> = data.threads.iter().map(|t| t.id.as_str()).collect();
    for reflection in &data.reflections {
        if let Some(tid) = &reflection.thread_id {
            if !ids.contains(tid.as_str()) {
                return Err(InvariantViolation::new(
                    "reflection_thread_link",
                    format!("Reflection {:?} linked to missing thread {:?}", reflection.id, tid),
                ));
            }
        }
    }
    Ok(())
}

fn check_thread_timestamps(data: &DomainData) -> Result<(), InvariantViolation> {
    for thread in &data.threads {
        if thread.last_updated < thread.created_at {
            return Err(InvariantViolation::new(
                "thread_timestamps",
                format!("Thread {:?} last_updated precedes created_at", thread.id),
            ));
        }
    }
    Ok(())
}

fn check_identity_connection_refs(data: &DomainData) -> Result<(), InvariantViolation> {
    let ids: BTreeSet<&str> = data.identity_nodes.iter().map(|n| n.id.as_str()).collect();
    for node in &data.identity_nodes {
        for conn in &node.connections {
            if !ids.contains(conn.node_id.as_str()) {
                return Err(InvariantViolation::new(
                    "identity_connection_refs",
                    format!("Node {:?} connects to missing node {:?}", node.id, conn.node_id),
                ));
            }
        }
    }
    Ok(())
}

fn check_identity_self_loops(data: &DomainData) -> Result<(), InvariantViolation> {
    for node in &data.identity_nodes {
        if node.connections.iter().any(|c| c.node_id == node.id) {
            return Err(InvariantViolation::new(
                "identity_self_loop",
                format!("Node {:?} connects to itself", node.id),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::domain::{IdentityNode, Layer, NodeConnection, Reflection, Thread};

    fn reflection(id: &str) -> Reflection {
        Reflection {
            id: id.into(),
            text: "t".into(),
            timestamp: Utc::now(),
            layer: Layer::Sovereign,
            thread_id: None,
            worldviews: vec![],
            mirrorback: None,
            metadata: Default::default(),
        }
    }

    fn node(id: &str, connects_to: &[&str]) -> IdentityNode {
        let now = Utc::now();
        IdentityNode {
            id: id.into(),
            label: id.into(),
            strength: 0.5,
            learning_enabled: false,
            related_reflection_ids: vec![],
            connections: connects_to
                .iter()
                .map(|n| NodeConnection { node_id: n.to_string(), strength: 1.0 })
                .collect(),
            created_at: now,
            last_updated: now,
        }
    }

    #[test]
    fn empty_data_is_valid() {
        assert!(validate_invariants(&DomainData::default()).is_ok());
    }

    #[test]
    fn dangling_thread_reference_is_rejected() {
        let now = Utc::now();
        let mut data = DomainData::default();
        data.threads.push(Thread {
            id: "t1".into(),
            name: "n".into(),
            created_at: now,
            last_updated: now,
            reflection_ids: vec!["missing".into()],
            tensions: vec![],
            contradictions: vec![],
        });
        let err = validate_invariants(&data).unwrap_err();
        assert_eq!(err.tag, "thread_refs");
        assert!(err.to_string().starts_with("[INVARIANT:thread_refs]"));
    }

    #[test]
    fn thread_clock_must_not_run_backwards() {
        let now = Utc::now();
        let mut data = DomainData::default();
        data.threads.push(Thread {
            id: "t1".into(),
            name: "n".into(),
            created_at: now,
            last_updated: now - Duration::seconds(5),
            reflection_ids: vec![],
            tensions: vec![],
            contradictions: vec![],
        });
        assert_eq!(validate_invariants(&data).unwrap_err().tag, "thread_timestamps");
    }

    #[test]
    fn duplicate_reflection_ids_are_rejected() {
        let mut data = DomainData::default();
        data.reflections = vec![reflection("r1"), reflection("r1")];
        assert_eq!(validate_invariants(&data).unwrap_err().tag, "duplicate_ids");
    }

    #[test]
    fn identity_graph_checks() {
        let mut data = DomainData::default();
        data.identity_nodes = vec![node("a", &["b"])];
        assert_eq!(
            validate_invariants(&data).unwrap_err().tag,
            "identity_connection_refs"
        );

        data.identity_nodes = vec![node("a", &["a"])];
        assert_eq!(validate_invariants(&data).unwrap_err().tag, "identity_self_loop");

        data.identity_nodes = vec![node("a", &["b"]), node("b", &[])];
        assert!(validate_invariants(&data).is_ok());
    }
}

//! Konverge core types: resource identity, graphs inputs, change-sets, errors.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a managed resource. Unique within a graph.
///
/// `kind` is the full kind key as the managed system names it, e.g.
/// `v1/Namespace` or `apps/v1/Deployment`. `namespace` is `None` for
/// cluster-scoped kinds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: namespace.map(|s| s.to_string()), name: name.into() }
    }

    /// Stable string key, `kind/ns/name` or `kind/name` for cluster-scoped.
    pub fn key(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}/{}", self.kind, ns, self.name),
            None => format!("{}/{}", self.kind, self.name),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// A declared resource: identity plus opaque desired-state payload.
/// Reference expressions may be embedded in payload string values as
/// `${kind/[ns/]name:output.path}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub payload: Json,
}

/// Directed edge from a consuming attribute to a producing resource's
/// output attribute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reference {
    /// Resource whose payload consumes the value.
    pub from: ResourceId,
    /// Resource that produces the value.
    pub to: ResourceId,
    /// Dotted path into the producer's observed payload, e.g. `metadata.uid`.
    pub output: String,
    /// Dotted path of the consuming attribute inside `from`'s payload.
    pub attr_path: String,
}

/// Snapshot of what currently exists in the managed system. Read at the
/// start of a pass, discarded after diffing. Iteration order is by id, so
/// passes over the same state are deterministic.
#[derive(Debug, Clone, Default)]
pub struct ObservedState {
    entries: BTreeMap<ResourceId, Json>,
}

impl ObservedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ResourceId, payload: Json) {
        self.entries.insert(id, payload);
    }

    pub fn get(&self, id: &ResourceId) -> Option<&Json> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn remove(&mut self, id: &ResourceId) -> Option<Json> {
        self.entries.remove(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ResourceId> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceId, &Json)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(ResourceId, Json)> for ObservedState {
    fn from_iter<T: IntoIterator<Item = (ResourceId, Json)>>(iter: T) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

/// Per-resource action decided by the diff engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Action {
    Create,
    /// In-place update; `delta` maps dotted paths to `{from, to}` pairs.
    Update { delta: Json },
    /// An immutable field differs: delete-then-create, never patched.
    Replace { delta: Json },
    Delete,
    NoOp,
}

impl Action {
    pub fn symbol(&self) -> &'static str {
        match self {
            Action::Create => "+",
            Action::Update { .. } => "~",
            Action::Replace { .. } => "±",
            Action::Delete => "-",
            Action::NoOp => " ",
        }
    }
}

/// One entry of a change-set: the action plus the resolved desired payload
/// (absent for Delete/NoOp where nothing is sent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub id: ResourceId,
    pub action: Action,
    pub desired: Option<Json>,
}

/// Ordered list of per-resource actions. Creates/updates come first in
/// dependency order; drift-cleanup deletes follow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    pub changes: Vec<Change>,
}

impl ChangeSet {
    /// True when every entry is a NoOp, i.e. observed already matches desired.
    pub fn is_converged(&self) -> bool {
        self.changes.iter().all(|c| matches!(c.action, Action::NoOp))
    }

    pub fn counts(&self) -> ChangeCounts {
        let mut n = ChangeCounts::default();
        for c in &self.changes {
            match c.action {
                Action::Create => n.create += 1,
                Action::Update { .. } => n.update += 1,
                Action::Replace { .. } => n.replace += 1,
                Action::Delete => n.delete += 1,
                Action::NoOp => n.noop += 1,
            }
        }
        n
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeCounts {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub delete: usize,
    pub noop: usize,
}

/// Terminal status of one resource within a pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Outcome {
    /// Action applied (or nothing to do).
    Success,
    /// Transient failure; eligible for another pass.
    Retrying,
    /// Permanent failure, or retry budget exhausted.
    Failed,
    /// Not attempted because a dependency failed or the pass was cancelled.
    Skipped,
}

/// Per-resource result row in the final report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceOutcome {
    pub id: ResourceId,
    pub outcome: Outcome,
    pub attempts: u32,
    pub message: Option<String>,
}

/// Final status of a reconciliation run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunStatus {
    Converged,
    Failed,
}

/// One pass's bookkeeping: audit trail, never mutated after the run ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationRun {
    pub target: String,
    pub started_ts: i64,
    pub finished_ts: i64,
    pub status: RunStatus,
    /// Number of diff/apply passes driven by the loop.
    pub passes: u32,
    pub outcomes: Vec<ResourceOutcome>,
}

// ---- errors ----

/// Graph-build-time failures. Fatal, never retried.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("reference cycle involving {0}")]
    Cycle(ResourceId),
    #[error("{from} references unknown resource {to}")]
    UnknownReference { from: ResourceId, to: ResourceId },
    #[error("duplicate resource identity {0}")]
    DuplicateIdentity(ResourceId),
    #[error("malformed reference expression `{expr}` in {id}")]
    MalformedReference { id: ResourceId, expr: String },
}

/// Managed-system API failures, classified for retry policy.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ApiError {
    /// Network/rate-limit style failure; retried with backoff.
    #[error("transient api error: {0}")]
    Transient(String),
    /// Invalid payload, malformed identity, rejected request. No retry;
    /// fails the resource and its transitive dependents.
    #[error("permanent api error: {0}")]
    Permanent(String),
    /// Observed state changed between observation and apply. Forces a
    /// re-diff before the next attempt.
    #[error("drift conflict: {0}")]
    DriftConflict(String),
}

impl ApiError {
    /// Whether another pass may succeed without operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Transient(_) | ApiError::DriftConflict(_))
    }
}

pub mod prelude {
    pub use super::{
        Action, ApiError, BuildError, Change, ChangeSet, ObservedState, Outcome,
        ReconciliationRun, Reference, Resource, ResourceId, ResourceOutcome, RunStatus,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_key_includes_namespace_when_present() {
        let a = ResourceId::new("v1/Namespace", None, "main");
        assert_eq!(a.key(), "v1/Namespace/main");
        let b = ResourceId::new("apps/v1/Deployment", Some("main"), "api");
        assert_eq!(b.key(), "apps/v1/Deployment/main/api");
    }

    #[test]
    fn changeset_convergence_and_counts() {
        let id = |n: &str| ResourceId::new("v1/ConfigMap", Some("ns"), n);
        let cs = ChangeSet {
            changes: vec![
                Change { id: id("a"), action: Action::NoOp, desired: None },
                Change { id: id("b"), action: Action::NoOp, desired: None },
            ],
        };
        assert!(cs.is_converged());

        let cs = ChangeSet {
            changes: vec![
                Change { id: id("a"), action: Action::Create, desired: Some(serde_json::json!({})) },
                Change { id: id("b"), action: Action::Delete, desired: None },
                Change { id: id("c"), action: Action::NoOp, desired: None },
            ],
        };
        assert!(!cs.is_converged());
        let n = cs.counts();
        assert_eq!((n.create, n.delete, n.noop), (1, 1, 1));
    }

    #[test]
    fn api_error_retry_classes() {
        assert!(ApiError::Transient("timeout".into()).is_retryable());
        assert!(ApiError::DriftConflict("rv moved".into()).is_retryable());
        assert!(!ApiError::Permanent("bad payload".into()).is_retryable());
    }
}

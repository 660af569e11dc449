//! Konverge diff engine: compares a desired resource graph against an
//! observed snapshot and produces the per-resource change-set.
//!
//! Comparison is structural and desired-side only: the managed system is free
//! to populate defaults and server-owned fields, so only attributes the
//! declaration actually sets participate in the diff. Noisy server bookkeeping
//! (`status`, `metadata.resourceVersion`, ...) is stripped from both sides
//! first.

#![forbid(unsafe_code)]

use konverge_core::{Action, Change, ChangeSet, ObservedState, ResourceId};
use konverge_graph::{refs, ResourceGraph};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde_json::{json, Map, Value as Json};
use tracing::debug;

/// Per-kind comparison rules: which attribute paths are immutable (a change
/// forces delete-then-create) and which array paths compare as unordered
/// sets. Paths are dotted and index-free (`spec.accessModes`).
#[derive(Debug, Clone, Default)]
pub struct DiffPolicy {
    immutable: FxHashMap<String, Vec<String>>,
    unordered: FxHashMap<String, Vec<String>>,
}

impl DiffPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules for the builtin kinds this reconciler is typically pointed at.
    pub fn kubernetes_defaults() -> Self {
        Self::new()
            .with_immutable("v1/PersistentVolume", "spec.capacity")
            .with_immutable("v1/PersistentVolume", "spec.accessModes")
            .with_immutable("apps/v1/Deployment", "spec.selector")
            .with_immutable("v1/Service", "spec.clusterIP")
            .with_unordered("v1/PersistentVolume", "spec.accessModes")
            .with_unordered("v1/Service", "spec.ports")
            .with_unordered("apps/v1/Deployment", "spec.template.spec.containers")
    }

    pub fn with_immutable(mut self, kind: &str, path: &str) -> Self {
        self.immutable.entry(kind.to_string()).or_default().push(path.to_string());
        self
    }

    pub fn with_unordered(mut self, kind: &str, path: &str) -> Self {
        self.unordered.entry(kind.to_string()).or_default().push(path.to_string());
        self
    }

    /// A path is immutable when it is, or sits under, a configured root.
    fn is_immutable(&self, kind: &str, path: &str) -> bool {
        self.immutable.get(kind).is_some_and(|roots| {
            roots.iter().any(|r| path == r || path.starts_with(&format!("{r}.")) || path.starts_with(&format!("{r}[")))
        })
    }

    fn is_unordered(&self, kind: &str, path: &str) -> bool {
        self.unordered.get(kind).is_some_and(|ps| ps.iter().any(|p| p == path))
    }
}

/// Compare the graph against observed state. Creates/updates come out in the
/// graph's topological order; drift-cleanup deletes for observed resources the
/// graph no longer declares are appended after, sorted by id.
pub fn diff(graph: &ResourceGraph, observed: &ObservedState, policy: &DiffPolicy) -> ChangeSet {
    let mut changes = Vec::with_capacity(graph.len());
    for res in graph.topo() {
        // References to producers that already exist resolve from observed
        // state here; references into resources created in this same pass
        // stay pending and are satisfied by the executor.
        let desired = refs::substitute(&res.payload, &|e| {
            observed.get(&e.target).and_then(|obs| refs::resolve_path(obs, &e.output)).cloned()
        });
        let action = match observed.get(&res.id) {
            None => Action::Create,
            Some(obs) => {
                let delta = payload_delta(&res.id.kind, &desired, obs, policy);
                if delta.paths.is_empty() {
                    Action::NoOp
                } else if delta.immutable_touched {
                    Action::Replace { delta: delta.to_json() }
                } else {
                    Action::Update { delta: delta.to_json() }
                }
            }
        };
        let desired = match action {
            Action::NoOp | Action::Delete => None,
            _ => Some(desired),
        };
        changes.push(Change { id: res.id.clone(), action, desired });
    }

    // Drift cleanup: observed but no longer declared. Ordered after all
    // creates/updates so nothing still referencing them is applied later.
    let mut stray: Vec<&ResourceId> = observed.ids().filter(|id| !graph.contains(id)).collect();
    stray.sort();
    for id in stray {
        changes.push(Change { id: id.clone(), action: Action::Delete, desired: None });
    }

    let cs = ChangeSet { changes };
    let n = cs.counts();
    counter!("diff_runs_total", 1u64);
    debug!(create = n.create, update = n.update, replace = n.replace, delete = n.delete, noop = n.noop, "diff computed");
    cs
}

/// Delete-only change-set for every declared resource that still exists, in
/// reverse dependency order (dependents first).
pub fn destroy(graph: &ResourceGraph, observed: &ObservedState) -> ChangeSet {
    let mut changes: Vec<Change> = graph
        .topo()
        .filter(|r| observed.contains(&r.id))
        .map(|r| Change { id: r.id.clone(), action: Action::Delete, desired: None })
        .collect();
    changes.reverse();
    ChangeSet { changes }
}

struct Delta {
    paths: Vec<(String, Json, Json)>,
    immutable_touched: bool,
}

impl Delta {
    fn to_json(&self) -> Json {
        let mut map = Map::new();
        for (p, from, to) in &self.paths {
            map.insert(p.clone(), json!({ "from": from, "to": to }));
        }
        Json::Object(map)
    }
}

fn payload_delta(kind: &str, desired: &Json, observed: &Json, policy: &DiffPolicy) -> Delta {
    let desired = strip_noisy(desired.clone());
    let observed = strip_noisy(observed.clone());
    let mut paths = Vec::new();
    walk(kind, &desired, &observed, String::new(), policy, &mut paths);
    let immutable_touched = paths.iter().any(|(p, _, _)| policy.is_immutable(kind, p));
    Delta { paths, immutable_touched }
}

fn walk(
    kind: &str,
    desired: &Json,
    observed: &Json,
    path: String,
    policy: &DiffPolicy,
    out: &mut Vec<(String, Json, Json)>,
) {
    match (desired, observed) {
        (Json::Object(d), Json::Object(o)) => {
            for (k, dv) in d {
                let p = if path.is_empty() { k.clone() } else { format!("{path}.{k}") };
                match o.get(k) {
                    Some(ov) => walk(kind, dv, ov, p, policy, out),
                    None => out.push((p, Json::Null, dv.clone())),
                }
            }
            // Observed-only fields are server-owned; not diffed.
        }
        (Json::Array(d), Json::Array(o)) => {
            if policy.is_unordered(kind, &path) {
                if !set_equal(d, o) {
                    out.push((path, Json::Array(o.clone()), Json::Array(d.clone())));
                }
                return;
            }
            let min = d.len().min(o.len());
            for i in 0..min {
                walk(kind, &d[i], &o[i], format!("{path}[{i}]"), policy, out);
            }
            for (i, dv) in d.iter().enumerate().skip(min) {
                out.push((format!("{path}[{i}]"), Json::Null, dv.clone()));
            }
            for (i, ov) in o.iter().enumerate().skip(min) {
                out.push((format!("{path}[{i}]"), ov.clone(), Json::Null));
            }
        }
        (dv, ov) => {
            if dv != ov {
                out.push((path, ov.clone(), dv.clone()));
            }
        }
    }
}

/// Order-insensitive array comparison (multiset over canonical rendering).
fn set_equal(a: &[Json], b: &[Json]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut ka: Vec<String> = a.iter().map(|v| v.to_string()).collect();
    let mut kb: Vec<String> = b.iter().map(|v| v.to_string()).collect();
    ka.sort();
    kb.sort();
    ka == kb
}

/// Drop server bookkeeping before comparison.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("uid");
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use konverge_core::Resource;

    fn res(kind: &str, ns: Option<&str>, name: &str, payload: Json) -> Resource {
        Resource { id: ResourceId::new(kind, ns, name), payload }
    }

    fn gateway_graph() -> ResourceGraph {
        ResourceGraph::build(vec![
            res("v1/Namespace", None, "main", json!({"metadata": {"name": "main"}})),
            res(
                "v1/PersistentVolume",
                None,
                "cfg",
                json!({"metadata": {"name": "cfg"}, "spec": {"capacity": {"storage": "1Gi"}}}),
            ),
            res(
                "apps/v1/Deployment",
                Some("main"),
                "api",
                json!({
                    "metadata": {"name": "api", "namespace": "${v1/Namespace/main:metadata.name}"},
                    "spec": {
                        "replicas": 2,
                        "volumeId": "${v1/PersistentVolume/cfg:metadata.uid}"
                    }
                }),
            ),
            res(
                "v1/Service",
                Some("main"),
                "api",
                json!({
                    "metadata": {"name": "api", "namespace": "main"},
                    "spec": {"selector": {"app": "${apps/v1/Deployment/main/api:spec.selector.app}"}}
                }),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn empty_observed_yields_creates_in_dependency_order() {
        let g = gateway_graph();
        let cs = diff(&g, &ObservedState::new(), &DiffPolicy::kubernetes_defaults());
        let order: Vec<String> = cs.changes.iter().map(|c| c.id.key()).collect();
        assert!(cs.changes.iter().all(|c| matches!(c.action, Action::Create)));
        let pos = |k: &str| order.iter().position(|o| o == k).unwrap();
        assert!(pos("v1/Namespace/main") < pos("apps/v1/Deployment/main/api"));
        assert!(pos("v1/PersistentVolume/cfg") < pos("apps/v1/Deployment/main/api"));
        assert!(pos("apps/v1/Deployment/main/api") < pos("v1/Service/main/api"));
    }

    #[test]
    fn replica_drift_yields_single_update() {
        let g = gateway_graph();
        let mut observed = ObservedState::new();
        observed.insert(
            ResourceId::new("v1/Namespace", None, "main"),
            json!({"metadata": {"name": "main"}}),
        );
        observed.insert(
            ResourceId::new("v1/PersistentVolume", None, "cfg"),
            json!({"metadata": {"name": "cfg", "uid": "pv-1"}, "spec": {"capacity": {"storage": "1Gi"}}}),
        );
        observed.insert(
            ResourceId::new("apps/v1/Deployment", Some("main"), "api"),
            json!({
                "metadata": {"name": "api", "namespace": "main"},
                "spec": {"replicas": 5, "volumeId": "pv-1", "selector": {"app": "gw"}}
            }),
        );
        observed.insert(
            ResourceId::new("v1/Service", Some("main"), "api"),
            json!({"metadata": {"name": "api", "namespace": "main"}, "spec": {"selector": {"app": "gw"}}}),
        );

        let cs = diff(&g, &observed, &DiffPolicy::kubernetes_defaults());
        let by_id: FxHashMap<String, &Change> =
            cs.changes.iter().map(|c| (c.id.key(), c)).collect();
        assert!(matches!(by_id["v1/Namespace/main"].action, Action::NoOp));
        assert!(matches!(by_id["v1/PersistentVolume/cfg"].action, Action::NoOp));
        assert!(matches!(by_id["v1/Service/main/api"].action, Action::NoOp));
        match &by_id["apps/v1/Deployment/main/api"].action {
            Action::Update { delta } => {
                assert_eq!(delta["spec.replicas"], json!({"from": 5, "to": 2}));
                assert_eq!(delta.as_object().unwrap().len(), 1);
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn diff_against_own_output_is_all_noop() {
        let g = gateway_graph();
        let mut observed = ObservedState::new();
        // Model what the system looks like after a clean apply, including
        // server-populated noise the diff must ignore.
        observed.insert(
            ResourceId::new("v1/Namespace", None, "main"),
            json!({"metadata": {"name": "main", "resourceVersion": "41", "uid": "ns-1"}, "status": {"phase": "Active"}}),
        );
        observed.insert(
            ResourceId::new("v1/PersistentVolume", None, "cfg"),
            json!({"metadata": {"name": "cfg", "uid": "pv-1"}, "spec": {"capacity": {"storage": "1Gi"}}}),
        );
        observed.insert(
            ResourceId::new("apps/v1/Deployment", Some("main"), "api"),
            json!({
                "metadata": {"name": "api", "namespace": "main"},
                "spec": {"replicas": 2, "volumeId": "pv-1", "selector": {"app": "gw"}}
            }),
        );
        observed.insert(
            ResourceId::new("v1/Service", Some("main"), "api"),
            json!({"metadata": {"name": "api", "namespace": "main"}, "spec": {"selector": {"app": "gw"}}}),
        );
        let cs = diff(&g, &observed, &DiffPolicy::kubernetes_defaults());
        assert!(cs.is_converged(), "changes: {:?}", cs.changes);
    }

    #[test]
    fn immutable_field_change_requires_replace() {
        let g = ResourceGraph::build(vec![res(
            "v1/PersistentVolume",
            None,
            "cfg",
            json!({"metadata": {"name": "cfg"}, "spec": {"capacity": {"storage": "2Gi"}}}),
        )])
        .unwrap();
        let mut observed = ObservedState::new();
        observed.insert(
            ResourceId::new("v1/PersistentVolume", None, "cfg"),
            json!({"metadata": {"name": "cfg"}, "spec": {"capacity": {"storage": "1Gi"}}}),
        );
        let cs = diff(&g, &observed, &DiffPolicy::kubernetes_defaults());
        assert!(matches!(cs.changes[0].action, Action::Replace { .. }), "got {:?}", cs.changes[0].action);
    }

    #[test]
    fn unordered_arrays_compare_as_sets() {
        let policy = DiffPolicy::new().with_unordered("v1/Service", "spec.ports");
        let g = ResourceGraph::build(vec![res(
            "v1/Service",
            Some("main"),
            "api",
            json!({"spec": {"ports": [{"port": 80}, {"port": 443}]}}),
        )])
        .unwrap();
        let mut observed = ObservedState::new();
        observed.insert(
            ResourceId::new("v1/Service", Some("main"), "api"),
            json!({"spec": {"ports": [{"port": 443}, {"port": 80}]}}),
        );
        let cs = diff(&g, &observed, &policy);
        assert!(cs.is_converged(), "changes: {:?}", cs.changes);

        // Same shape but positional comparison flags it.
        let cs = diff(&g, &observed, &DiffPolicy::new());
        assert!(!cs.is_converged());
    }

    #[test]
    fn undeclared_observed_resources_are_deleted_last() {
        let g = ResourceGraph::build(vec![res("v1/Namespace", None, "main", json!({}))]).unwrap();
        let mut observed = ObservedState::new();
        observed.insert(ResourceId::new("v1/ConfigMap", Some("main"), "stray"), json!({}));
        let cs = diff(&g, &observed, &DiffPolicy::new());
        assert_eq!(cs.changes.len(), 2);
        assert!(matches!(cs.changes[0].action, Action::Create));
        assert!(matches!(cs.changes[1].action, Action::Delete));
        assert_eq!(cs.changes[1].id.key(), "v1/ConfigMap/main/stray");
    }

    #[test]
    fn destroy_is_reverse_dependency_order() {
        let g = gateway_graph();
        let mut observed = ObservedState::new();
        for r in g.topo() {
            observed.insert(r.id.clone(), json!({}));
        }
        let cs = destroy(&g, &observed);
        let order: Vec<String> = cs.changes.iter().map(|c| c.id.key()).collect();
        let pos = |k: &str| order.iter().position(|o| o == k).unwrap();
        assert!(cs.changes.iter().all(|c| matches!(c.action, Action::Delete)));
        assert!(pos("v1/Service/main/api") < pos("apps/v1/Deployment/main/api"));
        assert!(pos("apps/v1/Deployment/main/api") < pos("v1/Namespace/main"));
        assert!(pos("apps/v1/Deployment/main/api") < pos("v1/PersistentVolume/cfg"));
    }
}

//! Konverge resource graph: reference extraction, cycle detection and
//! build-time topological ordering. The graph is immutable once built; later
//! stages never re-derive ordering.

#![forbid(unsafe_code)]

pub mod refs;

use konverge_core::{BuildError, Reference, Resource, ResourceId};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeSet, VecDeque};
use tracing::debug;

/// Immutable DAG of resources keyed by identity. Node storage is sorted by
/// id and the topological order breaks ties lexicographically, so two builds
/// from the same declarations are identical.
#[derive(Debug)]
pub struct ResourceGraph {
    nodes: Vec<Resource>,
    index: FxHashMap<ResourceId, usize>,
    references: Vec<Reference>,
    /// Direct dependencies per node (edges in), deduplicated.
    deps: Vec<Vec<usize>>,
    /// Direct dependents per node (edges out), deduplicated.
    rdeps: Vec<Vec<usize>>,
    topo: Vec<usize>,
}

impl ResourceGraph {
    /// Register every resource as a node, resolve reference expressions into
    /// edges, then topologically sort. Fails on duplicate identity, unknown
    /// reference targets and cycles.
    pub fn build(mut resources: Vec<Resource>) -> Result<Self, BuildError> {
        resources.sort_by(|a, b| a.id.cmp(&b.id));

        let mut index: FxHashMap<ResourceId, usize> = FxHashMap::default();
        for (i, r) in resources.iter().enumerate() {
            if index.insert(r.id.clone(), i).is_some() {
                return Err(BuildError::DuplicateIdentity(r.id.clone()));
            }
        }

        let mut references = Vec::new();
        let n = resources.len();
        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut rdeps: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut seen_edges: FxHashSet<(usize, usize)> = FxHashSet::default();

        for (i, r) in resources.iter().enumerate() {
            for (attr_path, expr) in refs::extract(&r.id, &r.payload)? {
                let j = *index.get(&expr.target).ok_or_else(|| BuildError::UnknownReference {
                    from: r.id.clone(),
                    to: expr.target.clone(),
                })?;
                if j == i {
                    // Self-reference is the smallest possible cycle.
                    return Err(BuildError::Cycle(r.id.clone()));
                }
                if seen_edges.insert((j, i)) {
                    deps[i].push(j);
                    rdeps[j].push(i);
                }
                references.push(Reference {
                    from: r.id.clone(),
                    to: expr.target,
                    output: expr.output,
                    attr_path,
                });
            }
        }

        let topo = topo_sort(&deps, &rdeps).map_err(|stuck| {
            // Report the lexicographically first node still on the cycle.
            BuildError::Cycle(resources[stuck].id.clone())
        })?;

        debug!(nodes = n, edges = seen_edges.len(), "resource graph built");
        Ok(Self { nodes: resources, index, references, deps, rdeps, topo })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &ResourceId) -> Option<&Resource> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// All ids, sorted.
    pub fn ids(&self) -> impl Iterator<Item = &ResourceId> {
        self.nodes.iter().map(|r| &r.id)
    }

    /// Resources in dependency order: every node after all its dependencies.
    pub fn topo(&self) -> impl Iterator<Item = &Resource> {
        self.topo.iter().map(move |&i| &self.nodes[i])
    }

    /// Position of a node in the topological order.
    pub fn topo_position(&self, id: &ResourceId) -> Option<usize> {
        let i = *self.index.get(id)?;
        self.topo.iter().position(|&j| j == i)
    }

    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    /// References whose consuming side is `id`.
    pub fn references_from(&self, id: &ResourceId) -> Vec<&Reference> {
        self.references.iter().filter(|r| &r.from == id).collect()
    }

    /// Direct dependencies of `id`.
    pub fn dependencies_of(&self, id: &ResourceId) -> Vec<&ResourceId> {
        match self.index.get(id) {
            Some(&i) => self.deps[i].iter().map(|&j| &self.nodes[j].id).collect(),
            None => Vec::new(),
        }
    }

    /// Direct dependents of `id`.
    pub fn dependents_of(&self, id: &ResourceId) -> Vec<&ResourceId> {
        match self.index.get(id) {
            Some(&i) => self.rdeps[i].iter().map(|&j| &self.nodes[j].id).collect(),
            None => Vec::new(),
        }
    }

    /// Everything reachable via dependent edges from `id`, i.e. the subtree
    /// that must be skipped when `id` fails. Sorted.
    pub fn transitive_dependents(&self, id: &ResourceId) -> Vec<ResourceId> {
        let Some(&start) = self.index.get(id) else { return Vec::new() };
        let mut seen: FxHashSet<usize> = FxHashSet::default();
        let mut q = VecDeque::from([start]);
        while let Some(i) = q.pop_front() {
            for &j in &self.rdeps[i] {
                if seen.insert(j) {
                    q.push_back(j);
                }
            }
        }
        let mut out: Vec<ResourceId> = seen.into_iter().map(|i| self.nodes[i].id.clone()).collect();
        out.sort();
        out
    }
}

/// Kahn's algorithm with a sorted ready-set so ties break by node index
/// (nodes are pre-sorted by id). Returns the index of a node stuck on a
/// cycle on failure.
fn topo_sort(deps: &[Vec<usize>], rdeps: &[Vec<usize>]) -> Result<Vec<usize>, usize> {
    let n = deps.len();
    let mut indegree: Vec<usize> = deps.iter().map(|d| d.len()).collect();
    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut out = Vec::with_capacity(n);
    while let Some(&i) = ready.iter().next() {
        ready.remove(&i);
        out.push(i);
        for &j in &rdeps[i] {
            indegree[j] -= 1;
            if indegree[j] == 0 {
                ready.insert(j);
            }
        }
    }
    if out.len() < n {
        let stuck = (0..n).find(|&i| indegree[i] > 0).unwrap_or(0);
        return Err(stuck);
    }
    Ok(out)
}

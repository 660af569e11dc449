//! Dependency-ordered change-set execution.
//!
//! Each graph node gets a write-once completion signal (a watch channel).
//! A worker waits for the signals of everything it depends on, then runs its
//! action under a bounded semaphore. Independent subtrees interleave freely;
//! dependents observe a strict happens-before on their prerequisites. A
//! failure blocks the failing node's transitive dependents without touching
//! sibling subtrees.

use crate::cancel::CancelToken;
use konverge_client::ResourceClient;
use konverge_core::{Action, ApiError, Change, ChangeSet, Outcome, ResourceId};
use konverge_graph::{refs, ResourceGraph};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    /// Upper bound on concurrently running actions.
    pub concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}

/// Direction of the dependency gate. Applying waits on dependencies;
/// destroying waits on dependents (delete leaves before roots).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Apply,
    Destroy,
}

/// Per-node completion signal. `Done` carries the observed payload after the
/// action, so dependents can resolve references into outputs that only exist
/// post-create.
#[derive(Debug, Clone)]
enum NodeSignal {
    Done(Arc<Json>),
    Blocked,
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub id: ResourceId,
    pub outcome: Outcome,
    pub error: Option<ApiError>,
}

#[derive(Debug, Default)]
pub struct ExecReport {
    pub outcomes: Vec<ExecOutcome>,
}

impl ExecReport {
    pub fn all_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.outcome == Outcome::Success)
    }

    pub fn has_permanent_failure(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.outcome == Outcome::Failed && !o.error.as_ref().is_some_and(ApiError::is_retryable))
    }

    pub fn has_retryable(&self) -> bool {
        self.outcomes.iter().any(|o| o.outcome == Outcome::Retrying)
    }

    pub fn get(&self, id: &ResourceId) -> Option<&ExecOutcome> {
        self.outcomes.iter().find(|o| &o.id == id)
    }
}

/// Apply a change-set. Graph-node actions are gated on their prerequisites'
/// signals; drift-cleanup deletes (entries not in the graph) run after every
/// graph action has settled.
pub async fn execute(
    graph: &ResourceGraph,
    changeset: ChangeSet,
    client: Arc<dyn ResourceClient>,
    cfg: ExecutorConfig,
    mode: ExecMode,
    cancel: CancelToken,
) -> ExecReport {
    let t0 = std::time::Instant::now();
    let (node_changes, stray): (Vec<Change>, Vec<Change>) =
        changeset.changes.into_iter().partition(|c| graph.contains(&c.id));

    // One write-once signal per participating node.
    let mut receivers: FxHashMap<ResourceId, watch::Receiver<Option<NodeSignal>>> = FxHashMap::default();
    let mut pending: Vec<(Change, watch::Sender<Option<NodeSignal>>)> = Vec::with_capacity(node_changes.len());
    for c in node_changes {
        let (tx, rx) = watch::channel(None);
        receivers.insert(c.id.clone(), rx);
        pending.push((c, tx));
    }

    let sem = Arc::new(Semaphore::new(cfg.concurrency.max(1)));
    let mut tasks: JoinSet<ExecOutcome> = JoinSet::new();

    for (change, tx) in pending {
        let gate_ids: Vec<ResourceId> = match mode {
            ExecMode::Apply => graph.dependencies_of(&change.id).into_iter().cloned().collect(),
            ExecMode::Destroy => graph.dependents_of(&change.id).into_iter().cloned().collect(),
        };
        // Nodes without a change entry this pass (destroy of a partially
        // existing graph) gate nothing.
        let gates: Vec<(ResourceId, watch::Receiver<Option<NodeSignal>>)> = gate_ids
            .into_iter()
            .filter_map(|id| receivers.get(&id).map(|rx| (id, rx.clone())))
            .collect();
        let client = Arc::clone(&client);
        let sem = Arc::clone(&sem);
        let cancel = cancel.clone();
        tasks.spawn(run_node(change, gates, tx, client, sem, cancel));
    }

    let mut report = ExecReport::default();
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(outcome) => report.outcomes.push(outcome),
            Err(e) => warn!(error = %e, "executor task aborted"),
        }
    }

    // Drift cleanup runs strictly after the declared graph settles, so nothing
    // that still references a stray is applied afterwards.
    let mut cleanup: JoinSet<ExecOutcome> = JoinSet::new();
    for change in stray {
        let client = Arc::clone(&client);
        let sem = Arc::clone(&sem);
        let cancel = cancel.clone();
        cleanup.spawn(async move {
            if cancel.is_cancelled() {
                return ExecOutcome { id: change.id, outcome: Outcome::Skipped, error: None };
            }
            let _permit = sem.acquire_owned().await.expect("semaphore open");
            match client.delete(&change.id).await {
                Ok(()) => ExecOutcome { id: change.id, outcome: Outcome::Success, error: None },
                Err(e) => ExecOutcome {
                    id: change.id,
                    outcome: if e.is_retryable() { Outcome::Retrying } else { Outcome::Failed },
                    error: Some(e),
                },
            }
        });
    }
    while let Some(res) = cleanup.join_next().await {
        match res {
            Ok(outcome) => report.outcomes.push(outcome),
            Err(e) => warn!(error = %e, "cleanup task aborted"),
        }
    }

    histogram!("execute_pass_ms", t0.elapsed().as_secs_f64() * 1000.0);
    report
}

async fn run_node(
    change: Change,
    gates: Vec<(ResourceId, watch::Receiver<Option<NodeSignal>>)>,
    tx: watch::Sender<Option<NodeSignal>>,
    client: Arc<dyn ResourceClient>,
    sem: Arc<Semaphore>,
    cancel: CancelToken,
) -> ExecOutcome {
    // Phase 1: wait for every prerequisite to settle.
    let mut outputs: FxHashMap<ResourceId, Arc<Json>> = FxHashMap::default();
    for (dep_id, mut rx) in gates {
        let signal = loop {
            let cur = rx.borrow().clone();
            if let Some(sig) = cur {
                break sig;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without signalling: treat as blocked.
                break NodeSignal::Blocked;
            }
        };
        match signal {
            NodeSignal::Done(payload) => {
                outputs.insert(dep_id, payload);
            }
            NodeSignal::Blocked => {
                debug!(id = %change.id, dep = %dep_id, "skipped: prerequisite did not complete");
                counter!("execute_skipped_total", 1u64);
                let _ = tx.send(Some(NodeSignal::Blocked));
                return ExecOutcome { id: change.id, outcome: Outcome::Skipped, error: None };
            }
        }
    }

    // NoOps complete without touching the API or the semaphore.
    if matches!(change.action, Action::NoOp) {
        let _ = tx.send(Some(NodeSignal::Done(Arc::new(Json::Null))));
        return ExecOutcome { id: change.id, outcome: Outcome::Success, error: None };
    }

    // Phase 2: cancellation gate. Already-dispatched actions finish; nothing
    // new starts.
    if cancel.is_cancelled() {
        let _ = tx.send(Some(NodeSignal::Blocked));
        return ExecOutcome { id: change.id, outcome: Outcome::Skipped, error: None };
    }

    let _permit = sem.acquire_owned().await.expect("semaphore open");
    if cancel.is_cancelled() {
        let _ = tx.send(Some(NodeSignal::Blocked));
        return ExecOutcome { id: change.id, outcome: Outcome::Skipped, error: None };
    }

    // Phase 3: resolve references deferred to this pass (producers created
    // just now) from the prerequisites' outputs.
    let desired = change.desired.as_ref().map(|d| {
        refs::substitute(d, &|e| {
            outputs.get(&e.target).and_then(|o| refs::resolve_path(o, &e.output)).cloned()
        })
    });

    let missing = || ApiError::Permanent("change carries no desired payload".into());
    let result: Result<Json, ApiError> = match &change.action {
        Action::Create => match desired.as_ref() {
            Some(p) => client.create(&change.id, p).await,
            None => Err(missing()),
        },
        Action::Update { .. } => match desired.as_ref() {
            Some(p) => client.update(&change.id, p).await,
            None => Err(missing()),
        },
        Action::Replace { .. } => {
            // Delete-then-create, never atomic. A crash in between leaves the
            // resource absent, which the next pass diffs as a plain Create.
            match desired.as_ref() {
                Some(p) => match client.delete(&change.id).await {
                    Ok(()) => client.create(&change.id, p).await,
                    Err(e) => Err(e),
                },
                None => Err(missing()),
            }
        }
        Action::Delete => client.delete(&change.id).await.map(|()| Json::Null),
        Action::NoOp => unreachable!("handled above"),
    };

    match result {
        Ok(observed) => {
            counter!("execute_applied_total", 1u64);
            let _ = tx.send(Some(NodeSignal::Done(Arc::new(observed))));
            ExecOutcome { id: change.id, outcome: Outcome::Success, error: None }
        }
        Err(e) => {
            counter!("execute_failed_total", 1u64);
            warn!(id = %change.id, error = %e, "action failed");
            let _ = tx.send(Some(NodeSignal::Blocked));
            ExecOutcome {
                id: change.id,
                outcome: if e.is_retryable() { Outcome::Retrying } else { Outcome::Failed },
                error: Some(e),
            }
        }
    }
}

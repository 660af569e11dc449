//! The state reconciliation loop: `Pending → Diffing → Applying →
//! {Converged | Retrying | Failed}`. The loop is the only place that decides
//! when to stop; it owns the retry budget and the exit status.

use crate::cancel::CancelToken;
use crate::executor::{self, ExecMode, ExecutorConfig};
use konverge_client::ResourceClient;
use konverge_core::{
    ChangeSet, ObservedState, Outcome, ReconciliationRun, ResourceId, ResourceOutcome, RunStatus,
};
use konverge_diff::{destroy as destroy_changeset, diff, DiffPolicy};
use konverge_graph::ResourceGraph;
use konverge_persist::{now_ts, Store};
use metrics::counter;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Identity of the reconciliation target; keys the persisted snapshot.
    pub target: String,
    /// Maximum diff/apply passes before a still-diverged target fails.
    pub max_attempts: u32,
    /// Base delay between retrying passes; doubles per attempt, capped at 60s.
    pub backoff: Duration,
    pub concurrency: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            target: "default".into(),
            max_attempts: 5,
            backoff: Duration::from_millis(500),
            concurrency: 4,
        }
    }
}

/// Converge toward the declared graph, or tear it down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    Apply,
    Destroy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassState {
    Pending,
    Diffing,
    Applying,
    Converged,
    Retrying,
    Failed,
}

/// Drive passes until convergence, terminal failure, cancellation or an
/// exhausted retry budget. On success the observed snapshot is persisted;
/// every run is appended to the audit trail either way.
pub async fn reconcile(
    graph: &ResourceGraph,
    policy: &DiffPolicy,
    client: Arc<dyn ResourceClient>,
    store: Option<&dyn Store>,
    cfg: &ReconcileConfig,
    cancel: CancelToken,
    mode: ReconcileMode,
) -> anyhow::Result<ReconciliationRun> {
    let started_ts = now_ts();
    let mut cancel = cancel;
    let mut passes: u32 = 0;
    let mut attempts: FxHashMap<ResourceId, u32> = FxHashMap::default();
    let mut last_outcomes: Vec<ResourceOutcome> = Vec::new();

    let mut state = PassState::Pending;
    debug!(run = %cfg.target, ?state, "run accepted");

    let observe_ids = observation_scope(graph, store, &cfg.target)?;
    let fail = |passes: u32,
                    attempts: &FxHashMap<ResourceId, u32>,
                    last: &[ResourceOutcome],
                    note: Option<String>| {
        finish(graph, cfg, store, started_ts, passes, attempts, last, RunStatus::Failed, note)
    };

    loop {
        state = PassState::Diffing;
        debug!(run = %cfg.target, pass = passes, ?state, "observing");
        let observed = match client.observe(&observe_ids).await {
            Ok(o) => o,
            Err(e) if e.is_retryable() && passes < cfg.max_attempts => {
                warn!(error = %e, "observe failed; backing off");
                passes += 1;
                if !backoff_or_cancel(cfg, passes, &mut cancel).await {
                    return fail(passes, &attempts, &last_outcomes, Some("cancelled".into()));
                }
                continue;
            }
            Err(e) => return fail(passes, &attempts, &last_outcomes, Some(e.to_string())),
        };

        let changeset: ChangeSet = match mode {
            ReconcileMode::Apply => diff(graph, &observed, policy),
            ReconcileMode::Destroy => destroy_changeset(graph, &observed),
        };
        let converged = match mode {
            ReconcileMode::Apply => changeset.is_converged(),
            ReconcileMode::Destroy => changeset.changes.is_empty(),
        };
        if converged {
            state = PassState::Converged;
            info!(run = %cfg.target, passes, ?state, "converged");
            counter!("reconcile_converged_total", 1u64);
            if let Some(store) = store {
                store.put_snapshot(&cfg.target, &observed)?;
            }
            return finish(
                graph, cfg, store, started_ts, passes, &attempts, &last_outcomes,
                RunStatus::Converged, None,
            );
        }

        if cancel.is_cancelled() {
            return fail(passes, &attempts, &last_outcomes, Some("cancelled".into()));
        }
        if passes >= cfg.max_attempts {
            warn!(run = %cfg.target, passes, "retry budget exhausted");
            counter!("reconcile_exhausted_total", 1u64);
            return fail(passes, &attempts, &last_outcomes, Some("retry budget exhausted".into()));
        }

        state = PassState::Applying;
        passes += 1;
        counter!("reconcile_passes_total", 1u64);
        debug!(run = %cfg.target, pass = passes, ?state, "applying change-set");
        let exec_mode = match mode {
            ReconcileMode::Apply => ExecMode::Apply,
            ReconcileMode::Destroy => ExecMode::Destroy,
        };
        let report = executor::execute(
            graph,
            changeset,
            Arc::clone(&client),
            ExecutorConfig { concurrency: cfg.concurrency },
            exec_mode,
            cancel.clone(),
        )
        .await;

        last_outcomes.clear();
        for o in &report.outcomes {
            if o.outcome != Outcome::Skipped {
                *attempts.entry(o.id.clone()).or_insert(0) += 1;
            }
            last_outcomes.push(ResourceOutcome {
                id: o.id.clone(),
                outcome: o.outcome,
                attempts: attempts.get(&o.id).copied().unwrap_or(0),
                message: o.error.as_ref().map(|e| e.to_string()),
            });
        }

        if report.has_permanent_failure() {
            state = PassState::Failed;
            counter!("reconcile_failed_total", 1u64);
            debug!(run = %cfg.target, ?state, "permanent failure; stopping");
            return fail(passes, &attempts, &last_outcomes, None);
        }
        if cancel.is_cancelled() {
            return fail(passes, &attempts, &last_outcomes, Some("cancelled".into()));
        }

        if report.has_retryable() {
            // DriftConflict lands here too: the next iteration starts with a
            // fresh observation, so a stale delta is never reapplied.
            state = PassState::Retrying;
            debug!(run = %cfg.target, ?state, "transient failures; will re-diff");
            if !backoff_or_cancel(cfg, passes, &mut cancel).await {
                return fail(passes, &attempts, &last_outcomes, Some("cancelled".into()));
            }
        }
        // All-success passes re-enter Diffing immediately; convergence is
        // only declared off a fresh observation.
    }
}

/// Diff-only entry point used by `plan`: observes and computes the change-set
/// without applying anything.
pub async fn plan(
    graph: &ResourceGraph,
    policy: &DiffPolicy,
    client: Arc<dyn ResourceClient>,
    store: Option<&dyn Store>,
    target: &str,
) -> anyhow::Result<(ObservedState, ChangeSet)> {
    let ids = observation_scope(graph, store, target)?;
    let observed = client.observe(&ids).await?;
    let changeset = diff(graph, &observed, policy);
    Ok((observed, changeset))
}

/// Everything declared plus whatever the last successful pass saw, so drift
/// cleanup can find strays.
fn observation_scope(
    graph: &ResourceGraph,
    store: Option<&dyn Store>,
    target: &str,
) -> anyhow::Result<Vec<ResourceId>> {
    let mut ids: BTreeSet<ResourceId> = graph.ids().cloned().collect();
    if let Some(store) = store {
        if let Some(snap) = store.get_snapshot(target)? {
            ids.extend(snap.ids().cloned());
        }
    }
    Ok(ids.into_iter().collect())
}

/// Exponential backoff, capped, interruptible. Returns false when cancelled.
async fn backoff_or_cancel(cfg: &ReconcileConfig, attempt: u32, cancel: &mut CancelToken) -> bool {
    let factor = 1u32 << attempt.saturating_sub(1).min(6);
    let delay = cfg.backoff.saturating_mul(factor).min(Duration::from_secs(60));
    info!(delay_ms = delay.as_millis() as u64, attempt, "backing off before next pass");
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

#[allow(clippy::too_many_arguments)]
fn finish(
    graph: &ResourceGraph,
    cfg: &ReconcileConfig,
    store: Option<&dyn Store>,
    started_ts: i64,
    passes: u32,
    attempts: &FxHashMap<ResourceId, u32>,
    last_outcomes: &[ResourceOutcome],
    status: RunStatus,
    note: Option<String>,
) -> anyhow::Result<ReconciliationRun> {
    let by_id: FxHashMap<&ResourceId, &ResourceOutcome> =
        last_outcomes.iter().map(|o| (&o.id, o)).collect();
    let mut outcomes: Vec<ResourceOutcome> = graph
        .topo()
        .map(|r| match (status, by_id.get(&r.id)) {
            (RunStatus::Converged, _) => ResourceOutcome {
                id: r.id.clone(),
                outcome: Outcome::Success,
                attempts: attempts.get(&r.id).copied().unwrap_or(0),
                message: None,
            },
            (RunStatus::Failed, Some(o)) => {
                // Retrying at the end of the budget is a failure.
                let outcome = match o.outcome {
                    Outcome::Retrying => Outcome::Failed,
                    other => other,
                };
                ResourceOutcome { outcome, ..(*o).clone() }
            }
            (RunStatus::Failed, None) => ResourceOutcome {
                id: r.id.clone(),
                outcome: Outcome::Skipped,
                attempts: attempts.get(&r.id).copied().unwrap_or(0),
                message: note.clone(),
            },
        })
        .collect();
    // Strays acted on in the last pass show up in the report too.
    for o in last_outcomes {
        if !graph.contains(&o.id) {
            outcomes.push(o.clone());
        }
    }

    let run = ReconciliationRun {
        target: cfg.target.clone(),
        started_ts,
        finished_ts: now_ts(),
        status,
        passes,
        outcomes,
    };
    if let Some(store) = store {
        if let Err(e) = store.put_run(&run) {
            warn!(error = %e, "failed to record run in audit trail");
        }
    }
    Ok(run)
}

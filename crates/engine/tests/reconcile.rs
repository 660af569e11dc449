#![forbid(unsafe_code)]

use konverge_client::{MemoryClient, ResourceClient};
use konverge_core::{ApiError, Outcome, Resource, ResourceId, RunStatus};
use konverge_diff::DiffPolicy;
use konverge_engine::{cancel::cancel_channel, CancelToken, ReconcileConfig, ReconcileMode};
use konverge_graph::ResourceGraph;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn res(kind: &str, ns: Option<&str>, name: &str, payload: serde_json::Value) -> Resource {
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
                    "selector": {"app": "gw"},
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

fn fast_cfg() -> ReconcileConfig {
    ReconcileConfig {
        target: "test".into(),
        max_attempts: 5,
        backoff: Duration::from_millis(1),
        concurrency: 4,
    }
}

fn id_ns() -> ResourceId {
    ResourceId::new("v1/Namespace", None, "main")
}
fn id_pv() -> ResourceId {
    ResourceId::new("v1/PersistentVolume", None, "cfg")
}
fn id_dep() -> ResourceId {
    ResourceId::new("apps/v1/Deployment", Some("main"), "api")
}
fn id_svc() -> ResourceId {
    ResourceId::new("v1/Service", Some("main"), "api")
}

async fn run(
    graph: &ResourceGraph,
    client: Arc<MemoryClient>,
    cfg: &ReconcileConfig,
    mode: ReconcileMode,
) -> konverge_core::ReconciliationRun {
    konverge_engine::reconcile(
        graph,
        &DiffPolicy::kubernetes_defaults(),
        client,
        None,
        cfg,
        CancelToken::never(),
        mode,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn empty_system_converges_in_dependency_order() {
    let graph = gateway_graph();
    let client = Arc::new(MemoryClient::new());
    let report = run(&graph, Arc::clone(&client), &fast_cfg(), ReconcileMode::Apply).await;

    assert_eq!(report.status, RunStatus::Converged);
    assert_eq!(report.passes, 1);
    assert_eq!(client.contents().len(), 4);

    let creates: Vec<ResourceId> = client
        .mutations()
        .into_iter()
        .filter(|(op, _)| op == "create")
        .map(|(_, id)| id)
        .collect();
    assert_eq!(creates.len(), 4);
    let pos = |id: &ResourceId| creates.iter().position(|c| c == id).unwrap();
    assert!(pos(&id_ns()) < pos(&id_dep()));
    assert!(pos(&id_pv()) < pos(&id_dep()));
    assert!(pos(&id_dep()) < pos(&id_svc()));
}

#[tokio::test]
async fn deferred_references_resolve_from_created_outputs() {
    let graph = gateway_graph();
    let client = Arc::new(MemoryClient::new());
    run(&graph, Arc::clone(&client), &fast_cfg(), ReconcileMode::Apply).await;

    let contents = client.contents();
    let pv_uid = contents[&id_pv()].pointer("/metadata/uid").unwrap().clone();
    let dep_volume = contents[&id_dep()].pointer("/spec/volumeId").unwrap().clone();
    // The deployment consumed the volume's server-generated id, which did not
    // exist until the create completed.
    assert_eq!(pv_uid, dep_volume);
    assert_eq!(contents[&id_svc()].pointer("/spec/selector/app"), Some(&json!("gw")));
}

#[tokio::test]
async fn second_run_is_all_noop() {
    let graph = gateway_graph();
    let client = Arc::new(MemoryClient::new());
    run(&graph, Arc::clone(&client), &fast_cfg(), ReconcileMode::Apply).await;
    let before = client.mutations().len();

    let report = run(&graph, Arc::clone(&client), &fast_cfg(), ReconcileMode::Apply).await;
    assert_eq!(report.status, RunStatus::Converged);
    assert_eq!(report.passes, 0);
    assert_eq!(client.mutations().len(), before, "idempotent re-run made mutations");
}

#[tokio::test]
async fn permanent_failure_skips_dependents_without_api_calls() {
    let graph = gateway_graph();
    let client = Arc::new(MemoryClient::new());
    client.inject_failure(id_pv(), ApiError::Permanent("quota denied".into()));

    let report = run(&graph, Arc::clone(&client), &fast_cfg(), ReconcileMode::Apply).await;
    assert_eq!(report.status, RunStatus::Failed);

    let outcome = |id: &ResourceId| report.outcomes.iter().find(|o| &o.id == id).unwrap().outcome;
    assert_eq!(outcome(&id_pv()), Outcome::Failed);
    assert_eq!(outcome(&id_dep()), Outcome::Skipped);
    assert_eq!(outcome(&id_svc()), Outcome::Skipped);
    // The independent sibling subtree is not aborted.
    assert_eq!(outcome(&id_ns()), Outcome::Success);

    let touched: Vec<ResourceId> = client.mutations().into_iter().map(|(_, id)| id).collect();
    assert!(!touched.contains(&id_dep()), "skipped resource was called");
    assert!(!touched.contains(&id_svc()), "skipped resource was called");
}

#[tokio::test]
async fn transient_failure_retries_to_convergence() {
    let graph = gateway_graph();
    let client = Arc::new(MemoryClient::new());
    client.inject_failure(id_dep(), ApiError::Transient("connection reset".into()));

    let report = run(&graph, Arc::clone(&client), &fast_cfg(), ReconcileMode::Apply).await;
    assert_eq!(report.status, RunStatus::Converged);
    assert_eq!(report.passes, 2);
    let dep = report.outcomes.iter().find(|o| o.id == id_dep()).unwrap();
    assert_eq!(dep.attempts, 2);
}

#[tokio::test]
async fn retry_budget_exhaustion_fails_the_run() {
    let graph = gateway_graph();
    let client = Arc::new(MemoryClient::new());
    for _ in 0..10 {
        client.inject_failure(id_ns(), ApiError::Transient("still flaky".into()));
    }
    let cfg = ReconcileConfig { max_attempts: 2, ..fast_cfg() };

    let report = run(&graph, Arc::clone(&client), &cfg, ReconcileMode::Apply).await;
    assert_eq!(report.status, RunStatus::Failed);
    let ns = report.outcomes.iter().find(|o| o.id == id_ns()).unwrap();
    assert_eq!(ns.outcome, Outcome::Failed);
    assert_eq!(ns.attempts, 2);
}

#[tokio::test]
async fn drift_conflict_forces_rediff_and_converges() {
    let graph = gateway_graph();
    let client = Arc::new(MemoryClient::new());
    // First create attempt hits a conflict, as if something raced us; the
    // loop must re-observe before trying again.
    client.inject_failure(id_ns(), ApiError::DriftConflict("resource version moved".into()));

    let report = run(&graph, Arc::clone(&client), &fast_cfg(), ReconcileMode::Apply).await;
    assert_eq!(report.status, RunStatus::Converged);
    assert!(report.passes >= 2);
}

#[tokio::test]
async fn cancellation_prevents_new_actions() {
    let graph = gateway_graph();
    let client = Arc::new(MemoryClient::new());
    let (handle, token) = cancel_channel();
    handle.cancel();

    let report = konverge_engine::reconcile(
        &graph,
        &DiffPolicy::kubernetes_defaults(),
        Arc::clone(&client) as Arc<dyn ResourceClient>,
        None,
        &fast_cfg(),
        token,
        ReconcileMode::Apply,
    )
    .await
    .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert!(client.mutations().is_empty(), "cancelled run still mutated");
}

#[tokio::test]
async fn replace_runs_as_delete_then_create() {
    let graph = ResourceGraph::build(vec![res(
        "v1/PersistentVolume",
        None,
        "cfg",
        json!({"metadata": {"name": "cfg"}, "spec": {"capacity": {"storage": "2Gi"}}}),
    )])
    .unwrap();
    let client = Arc::new(MemoryClient::new());
    client.seed(id_pv(), json!({"metadata": {"name": "cfg"}, "spec": {"capacity": {"storage": "1Gi"}}}));

    let report = run(&graph, Arc::clone(&client), &fast_cfg(), ReconcileMode::Apply).await;
    assert_eq!(report.status, RunStatus::Converged);

    let muts = client.mutations();
    let ops: Vec<&str> = muts.iter().map(|(op, _)| op.as_str()).collect();
    assert_eq!(ops, vec!["delete", "create"]);
    assert_eq!(
        client.contents()[&id_pv()].pointer("/spec/capacity/storage"),
        Some(&json!("2Gi"))
    );
}

#[tokio::test]
async fn destroy_deletes_in_reverse_dependency_order() {
    let graph = gateway_graph();
    let client = Arc::new(MemoryClient::new());
    run(&graph, Arc::clone(&client), &fast_cfg(), ReconcileMode::Apply).await;
    let applied = client.mutations().len();

    let report = run(&graph, Arc::clone(&client), &fast_cfg(), ReconcileMode::Destroy).await;
    assert_eq!(report.status, RunStatus::Converged);
    assert!(client.contents().is_empty());

    let deletes: Vec<ResourceId> = client
        .mutations()
        .into_iter()
        .skip(applied)
        .filter(|(op, _)| op == "delete")
        .map(|(_, id)| id)
        .collect();
    assert_eq!(deletes.len(), 4);
    let pos = |id: &ResourceId| deletes.iter().position(|c| c == id).unwrap();
    assert!(pos(&id_svc()) < pos(&id_dep()));
    assert!(pos(&id_dep()) < pos(&id_ns()));
    assert!(pos(&id_dep()) < pos(&id_pv()));
}

#[tokio::test]
async fn stray_resources_are_cleaned_up_via_snapshot() {
    let dir = std::env::temp_dir().join(format!(
        "konverge-engine-test-{}.db",
        std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
    ));
    let store = konverge_persist::SqliteStore::open(dir.to_str().unwrap()).unwrap();
    let policy = DiffPolicy::kubernetes_defaults();
    let client = Arc::new(MemoryClient::new());

    // First generation declares namespace + volume.
    let gen1 = ResourceGraph::build(vec![
        res("v1/Namespace", None, "main", json!({"metadata": {"name": "main"}})),
        res("v1/PersistentVolume", None, "cfg", json!({"metadata": {"name": "cfg"}})),
    ])
    .unwrap();
    let report = konverge_engine::reconcile(
        &gen1,
        &policy,
        Arc::clone(&client) as Arc<dyn ResourceClient>,
        Some(&store),
        &fast_cfg(),
        CancelToken::never(),
        ReconcileMode::Apply,
    )
    .await
    .unwrap();
    assert_eq!(report.status, RunStatus::Converged);

    // Second generation drops the volume; the snapshot remembers it, so the
    // reconciler deletes the stray.
    let gen2 = ResourceGraph::build(vec![res(
        "v1/Namespace",
        None,
        "main",
        json!({"metadata": {"name": "main"}}),
    )])
    .unwrap();
    let report = konverge_engine::reconcile(
        &gen2,
        &policy,
        Arc::clone(&client) as Arc<dyn ResourceClient>,
        Some(&store),
        &fast_cfg(),
        CancelToken::never(),
        ReconcileMode::Apply,
    )
    .await
    .unwrap();
    assert_eq!(report.status, RunStatus::Converged);
    assert!(!client.contents().contains_key(&id_pv()), "stray volume survived");
    assert!(client.contents().contains_key(&id_ns()));
}

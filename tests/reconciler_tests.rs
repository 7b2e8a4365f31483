//! Integration tests for the WebApp reconcile engine
//!
//! These tests drive full reconcile passes against in-memory stores and check
//! the children, the status and the requeue decision after each pass.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;
use tokio::sync::Barrier;
use webapp_operator::config::OperatorConfig;
use webapp_operator::crd::{WebApp, WebAppSpec};
use webapp_operator::error::{Error, StoreError};
use webapp_operator::reconcilers::children::{self, EnsureAction};
use webapp_operator::reconcilers::desired;
use webapp_operator::reconcilers::{Outcome, ReconcileEngine, REVERIFY_INTERVAL};
use webapp_operator::store::{
    MemoryStore, ObjectKey, ObjectStore, Operation, StoreResult, Stores, WriteCounts,
};

// ============================================================================
// Test Helpers
// ============================================================================

const NAMESPACE: &str = "default";

fn webapp(name: &str, replicas: i32, image: &str, port: i32) -> WebApp {
    let mut app = WebApp::new(
        name,
        WebAppSpec {
            replicas,
            image: image.to_string(),
            port,
        },
    );
    app.metadata.namespace = Some(NAMESPACE.to_string());
    app
}

fn key(name: &str) -> ObjectKey {
    ObjectKey::new(NAMESPACE, name)
}

struct Harness {
    webapps: Arc<MemoryStore<WebApp>>,
    deployments: Arc<MemoryStore<Deployment>>,
    services: Arc<MemoryStore<Service>>,
    engine: ReconcileEngine,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(OperatorConfig::default())
    }

    fn with_config(config: OperatorConfig) -> Self {
        let webapps = Arc::new(MemoryStore::new());
        let deployments = Arc::new(MemoryStore::new());
        let services = Arc::new(MemoryStore::new());
        let stores = Stores::memory(webapps.clone(), deployments.clone(), services.clone());
        Self {
            webapps,
            deployments,
            services,
            engine: ReconcileEngine::new(stores, &config),
        }
    }

    fn writes(&self) -> (WriteCounts, WriteCounts, WriteCounts) {
        (
            self.webapps.writes(),
            self.deployments.writes(),
            self.services.writes(),
        )
    }

    fn deployment(&self, name: &str) -> Deployment {
        self.deployments.object(&key(name)).expect("deployment exists")
    }

    fn service(&self, name: &str) -> Service {
        self.services
            .object(&key(&desired::service_name(name)))
            .expect("service exists")
    }
}

fn assert_converged(outcome: &Outcome) {
    match outcome {
        Outcome::Converged(after) => assert_eq!(*after, REVERIFY_INTERVAL),
        other => panic!("expected Converged, got {:?}", other),
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn new_webapp_gets_deployment_and_service() {
    let h = Harness::new();
    h.webapps.insert(webapp("shop", 3, "app:v1", 8080));

    let outcome = h.engine.reconcile(&key("shop")).await;
    assert_converged(&outcome);

    let deployment = h.deployment("shop");
    let spec = deployment.spec.as_ref().unwrap();
    assert_eq!(spec.replicas, Some(3));
    let container = &spec.template.spec.as_ref().unwrap().containers[0];
    assert_eq!(container.image.as_deref(), Some("app:v1"));
    assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 8080);

    let service = h.service("shop");
    assert_eq!(service.metadata.name.as_deref(), Some("shop-service"));
    let port = &service.spec.as_ref().unwrap().ports.as_ref().unwrap()[0];
    assert_eq!(port.port, 80);
    assert_eq!(port.target_port, Some(IntOrString::Int(8080)));

    let labels = desired::selector_labels("shop");
    assert_eq!(deployment.metadata.labels.as_ref(), Some(&labels));
    assert_eq!(service.metadata.labels.as_ref(), Some(&labels));
    assert_eq!(service.spec.as_ref().unwrap().selector.as_ref(), Some(&labels));
}

#[tokio::test]
async fn children_are_owned_by_the_webapp() {
    let h = Harness::new();
    let parent = h.webapps.insert(webapp("shop", 1, "app:v1", 8080));

    h.engine.reconcile(&key("shop")).await;

    let owners = h.deployment("shop").metadata.owner_references.unwrap();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].uid, parent.meta().uid.clone().unwrap());
    assert_eq!(owners[0].controller, Some(true));
}

#[tokio::test]
async fn second_pass_issues_no_writes() {
    let h = Harness::new();
    h.webapps.insert(webapp("shop", 3, "app:v1", 8080));

    assert_converged(&h.engine.reconcile(&key("shop")).await);
    let writes_after_first = h.writes();
    let deployment_after_first = h.deployment("shop");
    let service_after_first = h.service("shop");

    assert_converged(&h.engine.reconcile(&key("shop")).await);

    assert_eq!(h.writes(), writes_after_first);
    assert_eq!(h.deployment("shop"), deployment_after_first);
    assert_eq!(h.service("shop"), service_after_first);
}

#[tokio::test]
async fn replica_change_updates_only_the_deployment() {
    let h = Harness::new();
    h.webapps.insert(webapp("shop", 2, "app:v1", 8080));
    h.engine.reconcile(&key("shop")).await;
    let (_, deployments_before, services_before) = h.writes();

    h.webapps.modify(&key("shop"), |app| app.spec.replicas = 5);
    assert_converged(&h.engine.reconcile(&key("shop")).await);

    let (_, deployments_after, services_after) = h.writes();
    assert_eq!(deployments_after.replaces, deployments_before.replaces + 1);
    assert_eq!(services_after, services_before);

    let deployment = h.deployment("shop");
    let spec = deployment.spec.as_ref().unwrap();
    assert_eq!(spec.replicas, Some(5));
    assert_eq!(
        spec.template.spec.as_ref().unwrap().containers[0].image.as_deref(),
        Some("app:v1")
    );
}

#[tokio::test]
async fn image_change_updates_container_image() {
    let h = Harness::new();
    h.webapps.insert(webapp("shop", 2, "app:v1", 8080));
    h.engine.reconcile(&key("shop")).await;

    h.webapps
        .modify(&key("shop"), |app| app.spec.image = "app:v2".to_string());
    assert_converged(&h.engine.reconcile(&key("shop")).await);

    let deployment = h.deployment("shop");
    let spec = deployment.spec.as_ref().unwrap();
    assert_eq!(spec.replicas, Some(2));
    assert_eq!(
        spec.template.spec.as_ref().unwrap().containers[0].image.as_deref(),
        Some("app:v2")
    );
}

#[tokio::test]
async fn port_change_updates_both_children() {
    let h = Harness::new();
    h.webapps.insert(webapp("shop", 1, "app:v1", 8080));
    h.engine.reconcile(&key("shop")).await;

    h.webapps.modify(&key("shop"), |app| app.spec.port = 9090);
    assert_converged(&h.engine.reconcile(&key("shop")).await);

    let container_port = h.deployment("shop").spec.unwrap().template.spec.unwrap().containers[0]
        .ports
        .as_ref()
        .unwrap()[0]
        .container_port;
    assert_eq!(container_port, 9090);

    let service = h.service("shop");
    let port = &service.spec.as_ref().unwrap().ports.as_ref().unwrap()[0];
    assert_eq!(port.port, 80);
    assert_eq!(port.target_port, Some(IntOrString::Int(9090)));
}

#[tokio::test]
async fn deleted_webapp_is_a_no_op() {
    let h = Harness::new();

    let outcome = h.engine.reconcile(&key("gone")).await;

    assert!(matches!(outcome, Outcome::Deleted));
    assert_eq!(h.writes(), Default::default());
    assert!(h.deployments.is_empty());
    assert!(h.services.is_empty());
}

#[tokio::test]
async fn deleted_webapp_leaves_children_to_garbage_collection() {
    let h = Harness::new();
    h.webapps.insert(webapp("shop", 1, "app:v1", 8080));
    h.engine.reconcile(&key("shop")).await;
    let writes_before = h.writes();

    h.webapps.remove(&key("shop"));
    let outcome = h.engine.reconcile(&key("shop")).await;

    assert!(matches!(outcome, Outcome::Deleted));
    assert_eq!(h.writes(), writes_before);
    assert_eq!(h.deployments.len(), 1);
    assert_eq!(h.services.len(), 1);
}

#[tokio::test]
async fn unchanged_availability_is_not_written() {
    let h = Harness::new();
    h.webapps.insert(webapp("shop", 3, "app:v1", 8080));
    h.engine.reconcile(&key("shop")).await;
    assert_eq!(h.webapps.writes().status_replaces, 1);

    // Pods become ready
    h.deployments.modify(&key("shop"), |deployment| {
        deployment.status = Some(DeploymentStatus {
            replicas: Some(3),
            ready_replicas: Some(3),
            ..Default::default()
        });
    });

    h.engine.reconcile(&key("shop")).await;
    assert_eq!(h.webapps.writes().status_replaces, 2);
    let status = h.webapps.object(&key("shop")).unwrap().status.unwrap();
    assert_eq!(status.available_replicas, 3);

    h.engine.reconcile(&key("shop")).await;
    assert_eq!(h.webapps.writes().status_replaces, 2);
    // Child status changes alone are not drift
    assert_eq!(h.deployments.writes().replaces, 0);
}

#[tokio::test]
async fn stale_deployment_with_conflicting_token_retries_now() {
    let h = Harness::new();
    h.webapps.insert(webapp("shop", 5, "app:v1", 8080));
    let stale = desired::build(&webapp("shop", 1, "app:v0", 8080)).deployment;
    h.deployments.insert(stale);

    // Someone else writes the Deployment between our read and our replace
    h.deployments.fail_next(
        Operation::Replace,
        StoreError::conflict("Deployment", key("shop"), "object has been modified"),
    );

    let outcome = h.engine.reconcile(&key("shop")).await;
    assert!(matches!(outcome, Outcome::RetryNow), "got {:?}", outcome);
    assert_eq!(h.engine.failures(&key("shop")), 0);
    assert_eq!(h.webapps.writes().status_replaces, 0);

    assert_converged(&h.engine.reconcile(&key("shop")).await);
    assert_eq!(h.deployment("shop").spec.unwrap().replicas, Some(5));
}

#[tokio::test]
async fn child_created_concurrently_with_other_fields_is_repaired_right_away() {
    let h = Harness::new();
    h.webapps.insert(webapp("shop", 5, "app:v2", 8080));
    h.deployments
        .insert(desired::build(&webapp("shop", 1, "app:v1", 8080)).deployment);

    // Our read misses the Deployment another writer is creating
    h.deployments.fail_next(
        Operation::Get,
        StoreError::not_found("Deployment", key("shop")),
    );
    h.deployments.fail_next(
        Operation::Create,
        StoreError::already_exists("Deployment", key("shop")),
    );

    let outcome = h.engine.reconcile(&key("shop")).await;
    assert!(matches!(outcome, Outcome::RetryNow), "got {:?}", outcome);
    assert_eq!(h.webapps.writes().status_replaces, 0);

    assert_converged(&h.engine.reconcile(&key("shop")).await);
    let spec = h.deployment("shop").spec.unwrap();
    assert_eq!(spec.replicas, Some(5));
    assert_eq!(
        spec.template.spec.unwrap().containers[0].image.as_deref(),
        Some("app:v2")
    );
}

#[tokio::test]
async fn status_conflict_retries_now_without_error() {
    let h = Harness::new();
    h.webapps.insert(webapp("shop", 1, "app:v1", 8080));
    h.webapps.fail_next(
        Operation::ReplaceStatus,
        StoreError::conflict("WebApp", key("shop"), "object has been modified"),
    );

    let outcome = h.engine.reconcile(&key("shop")).await;
    assert!(matches!(outcome, Outcome::RetryNow), "got {:?}", outcome);
    assert_eq!(h.engine.failures(&key("shop")), 0);

    assert_converged(&h.engine.reconcile(&key("shop")).await);
    assert_eq!(h.webapps.writes().status_replaces, 1);
}

#[tokio::test]
async fn manual_edit_of_service_is_repaired() {
    let h = Harness::new();
    h.webapps.insert(webapp("shop", 1, "app:v1", 8080));
    h.engine.reconcile(&key("shop")).await;

    let service_key = key(&desired::service_name("shop"));
    h.services.modify(&service_key, |service| {
        let spec = service.spec.as_mut().unwrap();
        spec.selector = Some(desired::selector_labels("other"));
        spec.cluster_ip = Some("10.96.0.20".to_string());
    });

    assert_converged(&h.engine.reconcile(&key("shop")).await);

    let service = h.service("shop");
    let spec = service.spec.as_ref().unwrap();
    assert_eq!(spec.selector, Some(desired::selector_labels("shop")));
    assert_eq!(spec.cluster_ip.as_deref(), Some("10.96.0.20"));
    assert_eq!(h.services.writes().replaces, 1);
}

// ============================================================================
// Failure Handling
// ============================================================================

#[tokio::test]
async fn transient_errors_back_off_exponentially_and_reset_on_success() {
    let h = Harness::new();
    h.webapps.insert(webapp("shop", 1, "app:v1", 8080));

    for expected in [5, 10, 20] {
        h.webapps
            .fail_next(Operation::Get, StoreError::transient("connection refused"));
        match h.engine.reconcile(&key("shop")).await {
            Outcome::Backoff { delay, error } => {
                assert_eq!(delay, Duration::from_secs(expected));
                assert!(matches!(error, Error::Store(StoreError::Transient(_))));
            }
            other => panic!("expected Backoff, got {:?}", other),
        }
    }
    assert_eq!(h.engine.failures(&key("shop")), 3);

    assert_converged(&h.engine.reconcile(&key("shop")).await);
    assert_eq!(h.engine.failures(&key("shop")), 0);
}

#[tokio::test]
async fn backoff_is_capped() {
    let config = OperatorConfig {
        backoff_base: Duration::from_secs(10),
        backoff_max: Duration::from_secs(30),
        ..Default::default()
    };
    let h = Harness::with_config(config);
    h.webapps.insert(webapp("shop", 1, "app:v1", 8080));

    let mut delays = Vec::new();
    for _ in 0..4 {
        h.webapps
            .fail_next(Operation::Get, StoreError::transient("timeout"));
        if let Outcome::Backoff { delay, .. } = h.engine.reconcile(&key("shop")).await {
            delays.push(delay.as_secs());
        }
    }

    assert_eq!(delays, vec![10, 20, 30, 30]);
}

#[tokio::test]
async fn failed_service_create_leaves_status_unwritten() {
    let h = Harness::new();
    h.webapps.insert(webapp("shop", 2, "app:v1", 8080));
    h.services
        .fail_next(Operation::Create, StoreError::transient("etcd unavailable"));

    let outcome = h.engine.reconcile(&key("shop")).await;
    assert!(matches!(outcome, Outcome::Backoff { .. }), "got {:?}", outcome);
    assert_eq!(h.deployments.len(), 1);
    assert!(h.services.is_empty());
    assert_eq!(h.webapps.writes().status_replaces, 0);

    assert_converged(&h.engine.reconcile(&key("shop")).await);
    assert_eq!(h.deployments.writes().creates, 1);
    assert_eq!(h.deployments.writes().replaces, 0);
    assert_eq!(h.services.len(), 1);
    assert_eq!(h.webapps.writes().status_replaces, 1);
}

#[tokio::test]
async fn invalid_spec_fails_without_touching_children() {
    let h = Harness::new();
    h.webapps.insert(webapp("shop", 1, "app:v1", 0));

    match h.engine.reconcile(&key("shop")).await {
        Outcome::Failed(Error::Validation(message)) => assert!(message.contains("port")),
        other => panic!("expected Failed, got {:?}", other),
    }
    assert!(h.deployments.is_empty());
    assert!(h.services.is_empty());
    assert_eq!(h.engine.failures(&key("shop")), 0);
}

/// Store whose reads never complete
struct StallingStore<K> {
    inner: Arc<MemoryStore<K>>,
}

#[async_trait]
impl<K> ObjectStore<K> for StallingStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn get(&self, _key: &ObjectKey) -> StoreResult<K> {
        std::future::pending().await
    }

    async fn create(&self, obj: &K) -> StoreResult<K> {
        self.inner.create(obj).await
    }

    async fn replace(&self, obj: &K) -> StoreResult<K> {
        self.inner.replace(obj).await
    }
}

#[tokio::test(start_paused = true)]
async fn pass_exceeding_deadline_backs_off() {
    let config = OperatorConfig {
        reconcile_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let webapps = Arc::new(MemoryStore::new());
    webapps.insert(webapp("shop", 1, "app:v1", 8080));
    let stores = Stores {
        webapps,
        deployments: Arc::new(StallingStore {
            inner: Arc::new(MemoryStore::<Deployment>::new()),
        }),
        services: Arc::new(MemoryStore::<Service>::new()),
    };
    let engine = ReconcileEngine::new(stores, &config);

    match engine.reconcile(&key("shop")).await {
        Outcome::Backoff { error, .. } => assert!(matches!(error, Error::Timeout { .. })),
        other => panic!("expected Backoff, got {:?}", other),
    }
}

// ============================================================================
// Concurrent Duplicates
// ============================================================================

/// Store whose first `racers` reads all complete before any of them returns
struct RacingStore<K> {
    inner: Arc<MemoryStore<K>>,
    barrier: Barrier,
    reads: AtomicUsize,
    racers: usize,
}

impl<K> RacingStore<K> {
    fn new(inner: Arc<MemoryStore<K>>, racers: usize) -> Self {
        Self {
            inner,
            barrier: Barrier::new(racers),
            reads: AtomicUsize::new(0),
            racers,
        }
    }
}

#[async_trait]
impl<K> ObjectStore<K> for RacingStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> StoreResult<K> {
        let result = self.inner.get(key).await;
        if self.reads.fetch_add(1, Ordering::SeqCst) < self.racers {
            self.barrier.wait().await;
        }
        result
    }

    async fn create(&self, obj: &K) -> StoreResult<K> {
        self.inner.create(obj).await
    }

    async fn replace(&self, obj: &K) -> StoreResult<K> {
        self.inner.replace(obj).await
    }
}

#[tokio::test]
async fn racing_ensures_create_exactly_once() {
    let memory = Arc::new(MemoryStore::<Deployment>::new());
    let store = RacingStore::new(memory.clone(), 2);
    let mut parent = webapp("shop", 2, "app:v1", 8080);
    parent.metadata.uid = Some("uid-shop".to_string());
    let desired = desired::build(&parent).deployment;

    let (first, second) = tokio::join!(
        children::ensure(&store, &desired),
        children::ensure(&store, &desired)
    );

    let mut actions = vec![first.unwrap().action, second.unwrap().action];
    actions.sort_by_key(|action| action.as_str());
    assert_eq!(actions, vec![EnsureAction::AlreadyExists, EnsureAction::Created]);
    assert_eq!(memory.writes().creates, 1);
    assert_eq!(memory.len(), 1);
}

#[tokio::test]
async fn racing_reconciles_never_fail() {
    let webapps = Arc::new(MemoryStore::new());
    let deployments = Arc::new(MemoryStore::<Deployment>::new());
    let services = Arc::new(MemoryStore::<Service>::new());
    webapps.insert(webapp("shop", 2, "app:v1", 8080));

    let stores = Stores {
        webapps: webapps.clone(),
        deployments: Arc::new(RacingStore::new(deployments.clone(), 2)),
        services: services.clone(),
    };
    let engine = ReconcileEngine::new(stores, &OperatorConfig::default());

    let (key_a, key_b) = (key("shop"), key("shop"));
    let (first, second) = tokio::join!(engine.reconcile(&key_a), engine.reconcile(&key_b));

    for outcome in [&first, &second] {
        assert!(
            matches!(outcome, Outcome::Converged(_) | Outcome::RetryNow),
            "got {:?}",
            outcome
        );
    }
    assert_eq!(deployments.writes().creates, 1);
    assert_eq!(services.writes().creates, 1);
}

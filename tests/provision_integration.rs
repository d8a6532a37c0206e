use std::time::Duration;
use vllm_deployer::provision::memory::{InMemoryProvider, Operation};
use vllm_deployer::provision::{
    Orchestrator, OrchestratorOptions, PlanError, PlannedAction, ProviderError, RepositorySpec, ResourceKind,
    ResourceSpec, SessionState, StepFailure, StepOutcome, VpcSpec,
};
use vllm_deployer::{DeploymentManifest, EnvSettings, ResourceDescriptor};

fn default_graph() -> Vec<ResourceDescriptor> {
    DeploymentManifest::default().resource_graph(&EnvSettings::default())
}

fn fast() -> OrchestratorOptions {
    OrchestratorOptions {
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        ..OrchestratorOptions::default()
    }
}

#[tokio::test]
async fn test_deploy_reuses_existing_repository() {
    let provider = InMemoryProvider::new();
    let existing = provider.seed("vllm-poc", ResourceSpec::Repository(RepositorySpec { scan_on_push: true }));
    let orchestrator = Orchestrator::with_options(provider.clone(), fast());

    let session = orchestrator.ensure(default_graph()).await.unwrap();
    assert!(session.is_success(), "{}", session.summary());
    assert_eq!(session.created(), 5);
    assert_eq!(session.already_existed(), 1);
    assert_eq!(session.remote_id("vllm-poc"), Some(existing.id.as_str()));
    assert_eq!(session.summary(), "5 created, 1 already existed, 0 updated: success");
    assert_eq!(provider.resource_count(), 6);

    let names: Vec<&str> = session.steps.iter().map(|s| s.logical_name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "vllm-poc-vpc",
            "vllm-poc-subnet-1",
            "vllm-poc-sg",
            "vllm-poc",
            "vllm-poc-cluster",
            "vllm-poc-service",
        ]
    );
}

#[tokio::test]
async fn test_second_deploy_changes_nothing() {
    let provider = InMemoryProvider::new();
    let orchestrator = Orchestrator::with_options(provider.clone(), fast());

    let first = orchestrator.ensure(default_graph()).await.unwrap();
    assert_eq!(first.created(), 6);
    let creates = provider.calls_of(Operation::Create);

    let second = orchestrator.ensure(default_graph()).await.unwrap();
    assert!(second.is_success());
    assert_eq!(second.already_existed(), 6);
    assert_eq!(provider.calls_of(Operation::Create), creates);
    assert_eq!(provider.calls_of(Operation::Update), 0);
    assert_eq!(provider.resource_count(), 6);
    for (a, b) in first.steps.iter().zip(&second.steps) {
        assert_eq!(a.remote_id, b.remote_id);
    }
}

#[tokio::test]
async fn test_dependencies_provisioned_first_whatever_the_input_order() {
    let provider = InMemoryProvider::new();
    let orchestrator = Orchestrator::with_options(provider.clone(), fast());

    let mut graph = default_graph();
    graph.reverse();
    let session = orchestrator.ensure(graph).await.unwrap();
    assert!(session.is_success());

    let kinds: Vec<ResourceKind> = session.steps.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ResourceKind::Vpc,
            ResourceKind::Subnet,
            ResourceKind::SecurityGroup,
            ResourceKind::Repository,
            ResourceKind::Cluster,
            ResourceKind::Service,
        ]
    );
    let order: Vec<String> = provider
        .calls()
        .into_iter()
        .filter(|c| c.op == Operation::Create)
        .map(|c| c.logical_name)
        .collect();
    assert_eq!(order.first().map(String::as_str), Some("vllm-poc-vpc"));
    assert_eq!(order.last().map(String::as_str), Some("vllm-poc-service"));
}

#[tokio::test]
async fn test_immutable_mismatch_aborts_before_any_create() {
    let provider = InMemoryProvider::new();
    provider.seed(
        "vllm-poc-vpc",
        ResourceSpec::Vpc(VpcSpec {
            cidr_block: "172.16.0.0/16".to_string(),
        }),
    );
    let orchestrator = Orchestrator::with_options(provider.clone(), fast());

    let session = orchestrator.ensure(default_graph()).await.unwrap();
    assert!(!session.is_success());
    match &session.state {
        SessionState::Aborted {
            failed_step,
            not_attempted,
        } => {
            assert_eq!(failed_step, "vllm-poc-vpc");
            assert_eq!(not_attempted.len(), 5);
        }
        other => panic!("expected abort, got {:?}", other),
    }
    match &session.steps[0].outcome {
        StepOutcome::Failed {
            failure: StepFailure::Conflict { changes, .. },
        } => {
            assert_eq!(changes[0].field, "cidr_block");
            assert!(changes[0].observed.contains("172.16.0.0/16"));
            assert!(!changes[0].mutable);
        }
        other => panic!("expected conflict, got {:?}", other),
    }
    // Conflicts are not transient.
    assert_eq!(session.steps[0].attempts, 1);
    assert_eq!(provider.calls_of(Operation::Create), 0);
    assert_eq!(provider.resource_count(), 1);
}

#[tokio::test]
async fn test_scaling_updates_only_the_service() {
    let provider = InMemoryProvider::new();
    let orchestrator = Orchestrator::with_options(provider.clone(), fast());
    orchestrator.ensure(default_graph()).await.unwrap();

    let mut manifest = DeploymentManifest::default();
    manifest.service.desired_count = 2;
    let session = orchestrator.ensure(manifest.resource_graph(&EnvSettings::default())).await.unwrap();

    assert!(session.is_success());
    assert_eq!(session.already_existed(), 5);
    assert_eq!(session.updated(), 1);
    match &session.steps[5].outcome {
        StepOutcome::Updated { changes } => {
            assert_eq!(changes.len(), 1);
            assert_eq!(changes[0].field, "desired_count");
            assert_eq!(changes[0].desired, "2");
        }
        other => panic!("expected update, got {:?}", other),
    }
    match provider.get(ResourceKind::Service, "vllm-poc-service").unwrap().spec {
        ResourceSpec::Service(s) => assert_eq!(s.desired_count, 2),
        other => panic!("expected service, got {:?}", other),
    }
}

#[tokio::test]
async fn test_transient_create_failure_is_retried() {
    let provider = InMemoryProvider::new();
    provider.fail_next(Operation::Create, ProviderError::RateLimited("Throttling".to_string()));
    let orchestrator = Orchestrator::with_options(provider.clone(), fast());

    let session = orchestrator.ensure(default_graph()).await.unwrap();
    assert!(session.is_success());
    assert_eq!(session.steps[0].attempts, 2);
    assert!(session.steps[1..].iter().all(|s| s.attempts == 1));
    assert_eq!(provider.resource_count(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_provider_call_times_out() {
    let provider = InMemoryProvider::new();
    provider.set_latency(Duration::from_secs(600));
    let orchestrator = Orchestrator::with_options(
        provider.clone(),
        OrchestratorOptions {
            call_timeout: Duration::from_secs(1),
            ..fast()
        },
    );

    let session = orchestrator.ensure(default_graph()).await.unwrap();
    assert_eq!(session.steps.len(), 1);
    assert_eq!(session.steps[0].attempts, 3);
    assert!(matches!(
        session.steps[0].outcome,
        StepOutcome::Failed {
            failure: StepFailure::Provider {
                error: ProviderError::Timeout(_)
            }
        }
    ));
    assert_eq!(provider.calls_of(Operation::Query), 3);
    assert_eq!(provider.resource_count(), 0);
}

#[tokio::test]
async fn test_gpu_service_without_placement_is_rejected_up_front() {
    let provider = InMemoryProvider::new();
    let orchestrator = Orchestrator::new(provider.clone());

    let mut graph = default_graph();
    if let ResourceSpec::Service(ref mut s) = graph[5].desired {
        s.placement_constraints.clear();
    }
    let err = orchestrator.ensure(graph).await.unwrap_err();
    assert_eq!(err, PlanError::MissingPlacementConstraint("vllm-poc-service".to_string()));
    assert!(provider.calls().is_empty());
}

#[tokio::test]
async fn test_plan_reports_pending_work_without_changes() {
    let provider = InMemoryProvider::new();
    provider.seed("vllm-poc", ResourceSpec::Repository(RepositorySpec { scan_on_push: true }));
    let orchestrator = Orchestrator::with_options(provider.clone(), fast());

    let plan = orchestrator.plan(default_graph()).await.unwrap();
    let actions: Vec<&PlannedAction> = plan.iter().map(|p| &p.action).collect();
    assert_eq!(
        actions,
        vec![
            &PlannedAction::Create,
            &PlannedAction::Create,
            &PlannedAction::Create,
            &PlannedAction::NoChange,
            &PlannedAction::Create,
            &PlannedAction::Create,
        ]
    );
    assert!(plan[3].remote_id.is_some());
    assert_eq!(provider.calls_of(Operation::Create), 0);
    assert_eq!(provider.resource_count(), 1);

    orchestrator.ensure(default_graph()).await.unwrap();
    let plan = orchestrator.plan(default_graph()).await.unwrap();
    assert!(plan.iter().all(|p| p.action == PlannedAction::NoChange));
}

use super::resource::{FieldChange, RemoteResource, ResourceKind, ResourceSpec};
use super::{CloudProvider, PlanError, ProviderError, ResourceDescriptor};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Retry and timeout policy for remote calls.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Attempts per step, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on a single provider call.
    pub call_timeout: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl OrchestratorOptions {
    /// Delay after failed attempt number `attempt` (1-based): doubles each time, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Why a step failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum StepFailure {
    Provider { error: ProviderError },
    /// The resource exists but differs in fields that cannot be changed in place.
    Conflict { remote_id: String, changes: Vec<FieldChange> },
    UnresolvedReference { reference: String },
}

impl StepFailure {
    fn is_transient(&self) -> bool {
        matches!(self, StepFailure::Provider { error } if error.is_transient())
    }
}

impl From<ProviderError> for StepFailure {
    fn from(error: ProviderError) -> Self {
        StepFailure::Provider { error }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepFailure::Provider { error } => write!(f, "{}", error),
            StepFailure::Conflict { remote_id, changes } => {
                let fields: Vec<String> = changes.iter().map(ToString::to_string).collect();
                write!(
                    f,
                    "{} exists with immutable differences ({}); operator action required",
                    remote_id,
                    fields.join("; ")
                )
            }
            StepFailure::UnresolvedReference { reference } => {
                write!(f, "dependency '{}' was not provisioned", reference)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum StepOutcome {
    Created,
    AlreadyExisted,
    Updated { changes: Vec<FieldChange> },
    Failed { failure: StepFailure },
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Created => "created",
            StepOutcome::AlreadyExisted => "already-existed",
            StepOutcome::Updated { .. } => "updated",
            StepOutcome::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub logical_name: String,
    pub kind: ResourceKind,
    pub outcome: StepOutcome,
    pub remote_id: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum SessionState {
    Success,
    Aborted {
        failed_step: String,
        not_attempted: Vec<String>,
    },
}

/// Record of one `ensure` run, in execution order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentSession {
    pub steps: Vec<StepRecord>,
    pub state: SessionState,
}

impl DeploymentSession {
    pub fn is_success(&self) -> bool {
        self.state == SessionState::Success
    }

    fn count(&self, label: &str) -> usize {
        self.steps.iter().filter(|s| s.outcome.as_str() == label).count()
    }

    pub fn created(&self) -> usize {
        self.count("created")
    }

    pub fn already_existed(&self) -> usize {
        self.count("already-existed")
    }

    pub fn updated(&self) -> usize {
        self.count("updated")
    }

    pub fn failed_step(&self) -> Option<&StepRecord> {
        self.steps
            .iter()
            .find(|s| matches!(s.outcome, StepOutcome::Failed { .. }))
    }

    pub fn remote_id(&self, logical_name: &str) -> Option<&str> {
        self.steps
            .iter()
            .find(|s| s.logical_name == logical_name)
            .and_then(|s| s.remote_id.as_deref())
    }

    pub fn summary(&self) -> String {
        let state = match &self.state {
            SessionState::Success => "success".to_string(),
            SessionState::Aborted { failed_step, .. } => format!("aborted at '{}'", failed_step),
        };
        format!(
            "{} created, {} already existed, {} updated: {}",
            self.created(),
            self.already_existed(),
            self.updated(),
            state
        )
    }
}

/// What `ensure` would do for one resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum PlannedAction {
    Create,
    NoChange,
    Update { changes: Vec<FieldChange> },
    Conflict { changes: Vec<FieldChange> },
    /// The remote query failed; nothing can be said about this resource.
    Unknown { error: ProviderError },
    /// Depends on a resource whose state is unknown.
    Blocked { on: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedStep {
    pub logical_name: String,
    pub kind: ResourceKind,
    pub action: PlannedAction,
    pub remote_id: Option<String>,
}

/// Order `graph` so every resource follows the resources it references.
///
/// Among resources that are ready at the same time, lower tiers go first (network,
/// registry, cluster, service), then input order. Duplicate names, dangling
/// references and cycles are rejected.
pub fn sort_graph(graph: Vec<ResourceDescriptor>) -> Result<Vec<ResourceDescriptor>, PlanError> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, d) in graph.iter().enumerate() {
        d.validate()?;
        if index.insert(d.logical_name.as_str(), i).is_some() {
            return Err(PlanError::DuplicateName(d.logical_name.clone()));
        }
    }

    let mut deps: Vec<Vec<usize>> = Vec::with_capacity(graph.len());
    for (i, d) in graph.iter().enumerate() {
        let mut mine = Vec::new();
        for reference in d.desired.references() {
            let j = *index.get(reference).ok_or_else(|| PlanError::UnknownReference {
                resource: d.logical_name.clone(),
                reference: reference.to_string(),
            })?;
            if j == i {
                return Err(PlanError::Cycle(vec![d.logical_name.clone()]));
            }
            mine.push(j);
        }
        mine.sort_unstable();
        mine.dedup();
        deps.push(mine);
    }

    let n = graph.len();
    let mut done = vec![false; n];
    let mut order = Vec::with_capacity(n);
    while order.len() < n {
        let next = (0..n)
            .filter(|&i| !done[i] && deps[i].iter().all(|&j| done[j]))
            .min_by_key(|&i| (graph[i].kind().tier(), i));
        match next {
            Some(i) => {
                done[i] = true;
                order.push(i);
            }
            None => {
                let stuck = (0..n)
                    .filter(|&i| !done[i])
                    .map(|i| graph[i].logical_name.clone())
                    .collect();
                return Err(PlanError::Cycle(stuck));
            }
        }
    }

    let mut slots: Vec<Option<ResourceDescriptor>> = graph.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

/// Reconciles a resource graph against a [CloudProvider], one step at a time.
pub struct Orchestrator<P> {
    provider: P,
    options: OrchestratorOptions,
}

impl<P: CloudProvider> Orchestrator<P> {
    pub fn new(provider: P) -> Self {
        Self::with_options(provider, OrchestratorOptions::default())
    }

    pub fn with_options(provider: P, options: OrchestratorOptions) -> Self {
        Self { provider, options }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Make every resource in `graph` exist with its desired state.
    ///
    /// Stops at the first failed step; the session records which step failed and which
    /// were never attempted. Graph errors are returned before any remote call.
    pub async fn ensure(&self, graph: Vec<ResourceDescriptor>) -> Result<DeploymentSession, PlanError> {
        let ordered = sort_graph(graph)?;
        log::info!(
            "Reconciling {} resources via {}",
            ordered.len(),
            self.provider.name()
        );

        let mut provisioned: HashMap<String, RemoteResource> = HashMap::new();
        let mut steps = Vec::with_capacity(ordered.len());
        for (i, descriptor) in ordered.iter().enumerate() {
            let (record, remote) = self.reconcile(descriptor, &provisioned).await;
            let failed = matches!(record.outcome, StepOutcome::Failed { .. });
            steps.push(record);
            if let Some(remote) = remote {
                provisioned.insert(descriptor.logical_name.clone(), remote);
            }
            if failed {
                let not_attempted: Vec<String> = ordered[i + 1..]
                    .iter()
                    .map(|d| d.logical_name.clone())
                    .collect();
                if !not_attempted.is_empty() {
                    log::error!("Aborting; not attempted: {}", not_attempted.join(", "));
                }
                return Ok(DeploymentSession {
                    steps,
                    state: SessionState::Aborted {
                        failed_step: descriptor.logical_name.clone(),
                        not_attempted,
                    },
                });
            }
        }

        let session = DeploymentSession {
            steps,
            state: SessionState::Success,
        };
        log::info!("Provisioning finished: {}", session.summary());
        Ok(session)
    }

    /// Query and diff every resource without changing anything.
    pub async fn plan(&self, graph: Vec<ResourceDescriptor>) -> Result<Vec<PlannedStep>, PlanError> {
        let ordered = sort_graph(graph)?;
        let mut known: HashMap<String, RemoteResource> = HashMap::new();
        let mut unknown: HashSet<String> = HashSet::new();
        let mut planned = Vec::with_capacity(ordered.len());

        for d in &ordered {
            let name = d.logical_name.as_str();
            let step = |action, remote_id| PlannedStep {
                logical_name: d.logical_name.clone(),
                kind: d.kind(),
                action,
                remote_id,
            };

            let desired = match d.desired.resolve(|n| known.get(n)) {
                Ok(spec) => spec,
                Err(reference) if unknown.contains(&reference) => {
                    unknown.insert(d.logical_name.clone());
                    planned.push(step(PlannedAction::Blocked { on: reference }, None));
                    continue;
                }
                // The dependency will be created first, so this resource cannot exist yet.
                Err(_) => {
                    planned.push(step(PlannedAction::Create, None));
                    continue;
                }
            };

            let desired_ref = &desired;
            let (result, _) = self
                .retrying(name, move || async move {
                    self.call("query", name, self.provider.query(name, desired_ref))
                        .await
                        .map_err(StepFailure::from)
                })
                .await;

            match result {
                Ok(None) => planned.push(step(PlannedAction::Create, None)),
                Ok(Some(current)) => {
                    let diff = desired.diff(&current.spec);
                    let action = if diff.is_empty() {
                        PlannedAction::NoChange
                    } else if diff.has_conflicts() {
                        PlannedAction::Conflict { changes: diff.conflicts() }
                    } else {
                        PlannedAction::Update { changes: diff.changes }
                    };
                    planned.push(step(action, Some(current.id.clone())));
                    known.insert(d.logical_name.clone(), current);
                }
                Err(StepFailure::Provider { error }) => {
                    unknown.insert(d.logical_name.clone());
                    planned.push(step(PlannedAction::Unknown { error }, None));
                }
                Err(other) => {
                    unknown.insert(d.logical_name.clone());
                    planned.push(step(
                        PlannedAction::Unknown {
                            error: ProviderError::UnknownError(other.to_string()),
                        },
                        None,
                    ));
                }
            }
        }
        Ok(planned)
    }

    async fn reconcile(
        &self,
        descriptor: &ResourceDescriptor,
        provisioned: &HashMap<String, RemoteResource>,
    ) -> (StepRecord, Option<RemoteResource>) {
        let name = descriptor.logical_name.as_str();
        let kind = descriptor.kind();
        let record = |outcome, remote_id, attempts| StepRecord {
            logical_name: descriptor.logical_name.clone(),
            kind,
            outcome,
            remote_id,
            attempts,
        };

        let desired = match descriptor.desired.resolve(|n| provisioned.get(n)) {
            Ok(spec) => spec,
            Err(reference) => {
                let failure = StepFailure::UnresolvedReference { reference };
                log::error!("{} '{}' failed: {}", kind, name, failure);
                return (record(StepOutcome::Failed { failure }, None, 0), None);
            }
        };

        let desired_ref = &desired;
        let (result, attempts) = self
            .retrying(name, move || self.reconcile_once(name, desired_ref))
            .await;

        match result {
            Ok((outcome, remote)) => {
                match &outcome {
                    StepOutcome::Created => log::info!("Created {} '{}' ({})", kind, name, remote.id),
                    StepOutcome::Updated { changes } => log::info!(
                        "Updated {} '{}' ({}): {}",
                        kind,
                        name,
                        remote.id,
                        changes.iter().map(|c| c.field).collect::<Vec<_>>().join(", ")
                    ),
                    _ => log::info!("{} '{}' already exists ({})", kind, name, remote.id),
                }
                (record(outcome, Some(remote.id.clone()), attempts), Some(remote))
            }
            Err(failure) => {
                log::error!("{} '{}' failed after {} attempt(s): {}", kind, name, attempts, failure);
                (record(StepOutcome::Failed { failure }, None, attempts), None)
            }
        }
    }

    /// One query / create-or-update pass. Re-running it after a transient error is
    /// safe: a create that landed before the error is found by the next query.
    async fn reconcile_once(
        &self,
        name: &str,
        desired: &ResourceSpec,
    ) -> Result<(StepOutcome, RemoteResource), StepFailure> {
        let observed = self.call("query", name, self.provider.query(name, desired)).await?;
        let current = match observed {
            None => {
                let created = self.call("create", name, self.provider.create(name, desired)).await?;
                return Ok((StepOutcome::Created, created));
            }
            Some(current) => current,
        };

        let diff = desired.diff(&current.spec);
        if diff.is_empty() {
            return Ok((StepOutcome::AlreadyExisted, current));
        }
        if diff.has_conflicts() {
            return Err(StepFailure::Conflict {
                remote_id: current.id,
                changes: diff.conflicts(),
            });
        }
        let updated = self
            .call("update", name, self.provider.update(&current, desired, &diff))
            .await?;
        Ok((StepOutcome::Updated { changes: diff.changes }, updated))
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of attempts.
    /// Returns the last result and the number of attempts made.
    async fn retrying<T, F, Fut>(&self, name: &str, mut op: F) -> (Result<T, StepFailure>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StepFailure>>,
    {
        let max = self.options.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < max => {
                    let delay = self.options.backoff(attempt);
                    log::warn!(
                        "'{}': {} (attempt {}/{}), retrying in {:?}",
                        name,
                        e,
                        attempt,
                        max,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return (result, attempt),
            }
        }
    }

    async fn call<T, F>(&self, op: &str, name: &str, fut: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        log::debug!("{} '{}' via {}", op, name, self.provider.name());
        match tokio::time::timeout(self.options.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(format!(
                "{} '{}' did not finish within {:?}",
                op, name, self.options.call_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::memory::{InMemoryProvider, Operation};
    use crate::provision::resource::{RepositorySpec, SubnetSpec, VpcSpec};

    fn fast() -> OrchestratorOptions {
        OrchestratorOptions {
            max_attempts: 3,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            call_timeout: Duration::from_secs(5),
        }
    }

    fn vpc(name: &str, cidr: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(name, ResourceSpec::Vpc(VpcSpec { cidr_block: cidr.to_string() }))
    }

    fn subnet(name: &str, vpc: &str, cidr: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(
            name,
            ResourceSpec::Subnet(SubnetSpec {
                vpc: vpc.to_string(),
                cidr_block: cidr.to_string(),
                availability_zone: None,
            }),
        )
    }

    fn repo(name: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(name, ResourceSpec::Repository(RepositorySpec { scan_on_push: true }))
    }

    fn names(graph: &[ResourceDescriptor]) -> Vec<&str> {
        graph.iter().map(|d| d.logical_name.as_str()).collect()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let opts = OrchestratorOptions {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            ..OrchestratorOptions::default()
        };
        assert_eq!(opts.backoff(1), Duration::from_millis(100));
        assert_eq!(opts.backoff(2), Duration::from_millis(200));
        assert_eq!(opts.backoff(3), Duration::from_millis(350));
    }

    #[test]
    fn test_sort_puts_dependencies_first() {
        let sorted = sort_graph(vec![
            repo("registry"),
            subnet("subnet-a", "net", "10.0.1.0/24"),
            vpc("net", "10.0.0.0/16"),
        ])
        .unwrap();
        assert_eq!(names(&sorted), vec!["net", "subnet-a", "registry"]);
    }

    #[test]
    fn test_sort_rejects_bad_graphs() {
        assert_eq!(
            sort_graph(vec![vpc("net", "10.0.0.0/16"), vpc("net", "10.1.0.0/16")]).unwrap_err(),
            PlanError::DuplicateName("net".to_string())
        );
        assert!(matches!(
            sort_graph(vec![subnet("s", "missing", "10.0.1.0/24")]).unwrap_err(),
            PlanError::UnknownReference { .. }
        ));
        assert!(matches!(
            sort_graph(vec![subnet("s", "s", "10.0.1.0/24")]).unwrap_err(),
            PlanError::Cycle(_)
        ));
    }

    #[tokio::test]
    async fn test_transient_query_errors_are_retried() {
        let provider = InMemoryProvider::new();
        provider.fail_next(Operation::Query, ProviderError::RateLimited("slow down".to_string()));
        provider.fail_next(Operation::Query, ProviderError::Unreachable("reset".to_string()));
        let orchestrator = Orchestrator::with_options(provider, fast());

        let session = orchestrator.ensure(vec![vpc("net", "10.0.0.0/16")]).await.unwrap();
        assert!(session.is_success());
        assert_eq!(session.steps[0].attempts, 3);
        assert_eq!(session.created(), 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_aborts_remaining_graph() {
        let provider = InMemoryProvider::new();
        for _ in 0..3 {
            provider.fail_next(Operation::Query, ProviderError::Timeout("slow".to_string()));
        }
        let orchestrator = Orchestrator::with_options(provider, fast());

        let session = orchestrator
            .ensure(vec![vpc("net", "10.0.0.0/16"), subnet("subnet-a", "net", "10.0.1.0/24")])
            .await
            .unwrap();
        assert_eq!(
            session.state,
            SessionState::Aborted {
                failed_step: "net".to_string(),
                not_attempted: vec!["subnet-a".to_string()],
            }
        );
        assert_eq!(session.steps.len(), 1);
        assert_eq!(session.steps[0].attempts, 3);
        assert_eq!(orchestrator.provider().resource_count(), 0);
    }

    #[tokio::test]
    async fn test_auth_errors_are_not_retried() {
        let provider = InMemoryProvider::new();
        provider.fail_next(Operation::Query, ProviderError::AuthFailed("expired token".to_string()));
        let orchestrator = Orchestrator::with_options(provider, fast());

        let session = orchestrator.ensure(vec![vpc("net", "10.0.0.0/16")]).await.unwrap();
        assert!(!session.is_success());
        assert_eq!(session.steps[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_create_that_landed_is_not_duplicated() {
        let provider = InMemoryProvider::new();
        provider.fail_after_commit(Operation::Create, ProviderError::Unreachable("connection reset".to_string()));
        let orchestrator = Orchestrator::with_options(provider, fast());

        let session = orchestrator.ensure(vec![vpc("net", "10.0.0.0/16")]).await.unwrap();
        assert!(session.is_success());
        assert_eq!(session.steps[0].outcome, StepOutcome::AlreadyExisted);
        assert_eq!(orchestrator.provider().resource_count(), 1);
        assert_eq!(orchestrator.provider().calls_of(Operation::Create), 1);
    }

    #[tokio::test]
    async fn test_plan_does_not_mutate() {
        let provider = InMemoryProvider::new();
        provider.seed("registry", ResourceSpec::Repository(RepositorySpec { scan_on_push: false }));
        let orchestrator = Orchestrator::with_options(provider, fast());

        let plan = orchestrator
            .plan(vec![
                vpc("net", "10.0.0.0/16"),
                subnet("subnet-a", "net", "10.0.1.0/24"),
                repo("registry"),
            ])
            .await
            .unwrap();
        assert_eq!(plan[0].action, PlannedAction::Create);
        assert_eq!(plan[1].action, PlannedAction::Create);
        assert!(matches!(plan[2].action, PlannedAction::Update { .. }));
        assert_eq!(orchestrator.provider().calls_of(Operation::Create), 0);
        assert_eq!(orchestrator.provider().calls_of(Operation::Update), 0);
        assert_eq!(orchestrator.provider().resource_count(), 1);
    }

    #[tokio::test]
    async fn test_plan_blocks_dependents_of_unknown() {
        let provider = InMemoryProvider::new();
        provider.fail_next(Operation::Query, ProviderError::AuthFailed("denied".to_string()));
        let orchestrator = Orchestrator::with_options(provider, fast());

        let plan = orchestrator
            .plan(vec![vpc("net", "10.0.0.0/16"), subnet("subnet-a", "net", "10.0.1.0/24")])
            .await
            .unwrap();
        assert!(matches!(plan[0].action, PlannedAction::Unknown { .. }));
        assert_eq!(plan[1].action, PlannedAction::Blocked { on: "net".to_string() });
    }

    #[test]
    fn test_session_summary() {
        let session = DeploymentSession {
            steps: vec![StepRecord {
                logical_name: "net".to_string(),
                kind: ResourceKind::Vpc,
                outcome: StepOutcome::Created,
                remote_id: Some("vpc-1".to_string()),
                attempts: 1,
            }],
            state: SessionState::Success,
        };
        assert_eq!(session.summary(), "1 created, 0 already existed, 0 updated: success");
        assert_eq!(session.remote_id("net"), Some("vpc-1"));
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["state"]["state"], "success");
        assert_eq!(json["steps"][0]["outcome"]["outcome"], "created");
    }
}

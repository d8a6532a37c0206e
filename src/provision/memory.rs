//! In-process provider. Backs the `--provider memory` dry runs and the
//! orchestrator tests; failures can be scripted per operation.

use super::resource::{RemoteResource, ResourceKind, ResourceSpec, SecurityGroupSpec};
use super::{CloudProvider, ProviderError, SpecDiff};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

const ACCOUNT: &str = "000000000000";
const REGION: &str = "local";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Query,
    Create,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    pub op: Operation,
    pub logical_name: String,
}

#[derive(Debug)]
struct Injected {
    op: Operation,
    error: ProviderError,
    /// Apply the operation, then report the error anyway.
    after_commit: bool,
}

#[derive(Debug, Default)]
struct State {
    resources: BTreeMap<(ResourceKind, String), RemoteResource>,
    next_id: u64,
    calls: Vec<ProviderCall>,
    failures: VecDeque<Injected>,
    latency: Option<Duration>,
}

impl State {
    fn mint_id(&mut self, name: &str, kind: ResourceKind) -> String {
        self.next_id += 1;
        let n = self.next_id;
        match kind {
            ResourceKind::Vpc => format!("vpc-{:017x}", n),
            ResourceKind::Subnet => format!("subnet-{:017x}", n),
            ResourceKind::SecurityGroup => format!("sg-{:017x}", n),
            ResourceKind::Repository => format!("{}.dkr.ecr.{}.amazonaws.com/{}", ACCOUNT, REGION, name),
            ResourceKind::Cluster => format!("arn:aws:ecs:{}:{}:cluster/{}", REGION, ACCOUNT, name),
            ResourceKind::Service => format!("arn:aws:ecs:{}:{}:service/{}", REGION, ACCOUNT, name),
        }
    }

    fn take_failure(&mut self, op: Operation) -> Option<Injected> {
        let pos = self.failures.iter().position(|f| f.op == op)?;
        self.failures.remove(pos)
    }
}

/// Provider that keeps resources in memory, keyed by kind and logical name.
/// Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProvider {
    state: Arc<Mutex<State>>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = Some(latency);
    }

    /// Fail the next `op` call with `error` before it takes effect.
    pub fn fail_next(&self, op: Operation, error: ProviderError) {
        self.state.lock().failures.push_back(Injected {
            op,
            error,
            after_commit: false,
        });
    }

    /// Let the next `op` call take effect, then report `error`, like a response lost
    /// on the way back.
    pub fn fail_after_commit(&self, op: Operation, error: ProviderError) {
        self.state.lock().failures.push_back(Injected {
            op,
            error,
            after_commit: true,
        });
    }

    /// Insert a resource as if it had been created out of band.
    pub fn seed(&self, logical_name: &str, spec: ResourceSpec) -> RemoteResource {
        let mut state = self.state.lock();
        let kind = spec.kind();
        let resource = RemoteResource {
            id: state.mint_id(logical_name, kind),
            logical_name: logical_name.to_string(),
            spec,
        };
        state
            .resources
            .insert((kind, logical_name.to_string()), resource.clone());
        resource
    }

    pub fn get(&self, kind: ResourceKind, logical_name: &str) -> Option<RemoteResource> {
        self.state
            .lock()
            .resources
            .get(&(kind, logical_name.to_string()))
            .cloned()
    }

    pub fn resource_count(&self) -> usize {
        self.state.lock().resources.len()
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.state.lock().calls.clone()
    }

    pub fn calls_of(&self, op: Operation) -> usize {
        self.state.lock().calls.iter().filter(|c| c.op == op).count()
    }

    /// Record the call and pop any scripted failure for it.
    async fn enter(&self, op: Operation, logical_name: &str) -> Option<Injected> {
        let (latency, injected) = {
            let mut state = self.state.lock();
            state.calls.push(ProviderCall {
                op,
                logical_name: logical_name.to_string(),
            });
            (state.latency, state.take_failure(op))
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        injected
    }
}

fn merge_ingress(current: &ResourceSpec, desired: &ResourceSpec) -> ResourceSpec {
    match (current, desired) {
        (ResourceSpec::SecurityGroup(have), ResourceSpec::SecurityGroup(want)) => {
            let rules: BTreeSet<_> = have.ingress.iter().chain(want.ingress.iter()).cloned().collect();
            ResourceSpec::SecurityGroup(SecurityGroupSpec {
                ingress: rules.into_iter().collect(),
                ..have.clone()
            })
        }
        _ => desired.clone(),
    }
}

impl CloudProvider for InMemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn query(&self, logical_name: &str, desired: &ResourceSpec) -> Result<Option<RemoteResource>, ProviderError> {
        if let Some(injected) = self.enter(Operation::Query, logical_name).await {
            return Err(injected.error);
        }
        Ok(self.get(desired.kind(), logical_name))
    }

    async fn create(&self, logical_name: &str, desired: &ResourceSpec) -> Result<RemoteResource, ProviderError> {
        let injected = self.enter(Operation::Create, logical_name).await;
        if let Some(Injected {
            error,
            after_commit: false,
            ..
        }) = injected
        {
            return Err(error);
        }
        let key = (desired.kind(), logical_name.to_string());
        if self.state.lock().resources.contains_key(&key) {
            return Err(ProviderError::BadRequest(format!(
                "{} '{}' already exists",
                desired.kind(),
                logical_name
            )));
        }
        let created = self.seed(logical_name, desired.clone());
        match injected {
            Some(Injected { error, .. }) => Err(error),
            None => Ok(created),
        }
    }

    async fn update(
        &self,
        current: &RemoteResource,
        desired: &ResourceSpec,
        _diff: &SpecDiff,
    ) -> Result<RemoteResource, ProviderError> {
        let injected = self.enter(Operation::Update, &current.logical_name).await;
        if let Some(Injected {
            error,
            after_commit: false,
            ..
        }) = injected
        {
            return Err(error);
        }
        let updated = {
            let mut state = self.state.lock();
            let key = (current.kind(), current.logical_name.clone());
            let existing = state.resources.get_mut(&key).ok_or_else(|| {
                ProviderError::BadRequest(format!("{} '{}' does not exist", current.kind(), current.logical_name))
            })?;
            existing.spec = merge_ingress(&existing.spec, desired);
            existing.clone()
        };
        match injected {
            Some(Injected { error, .. }) => Err(error),
            None => Ok(updated),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::resource::{IngressRule, RepositorySpec, VpcSpec};

    fn vpc() -> ResourceSpec {
        ResourceSpec::Vpc(VpcSpec {
            cidr_block: "10.0.0.0/16".to_string(),
        })
    }

    #[tokio::test]
    async fn test_create_then_query() {
        let provider = InMemoryProvider::new();
        assert_eq!(provider.query("net", &vpc()).await.unwrap(), None);
        let created = provider.create("net", &vpc()).await.unwrap();
        assert!(created.id.starts_with("vpc-"));
        let found = provider.query("net", &vpc()).await.unwrap().unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(provider.calls_of(Operation::Query), 2);
    }

    #[tokio::test]
    async fn test_duplicate_create_is_rejected() {
        let provider = InMemoryProvider::new();
        provider.create("net", &vpc()).await.unwrap();
        assert!(matches!(
            provider.create("net", &vpc()).await,
            Err(ProviderError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_same_name_different_kind() {
        let provider = InMemoryProvider::new();
        provider.create("vllm-poc", &vpc()).await.unwrap();
        let repo = ResourceSpec::Repository(RepositorySpec { scan_on_push: true });
        assert_eq!(provider.query("vllm-poc", &repo).await.unwrap(), None);
        let created = provider.create("vllm-poc", &repo).await.unwrap();
        assert_eq!(created.id, "000000000000.dkr.ecr.local.amazonaws.com/vllm-poc");
    }

    #[tokio::test]
    async fn test_failure_after_commit_still_creates() {
        let provider = InMemoryProvider::new();
        provider.fail_after_commit(Operation::Create, ProviderError::Unreachable("reset".to_string()));
        assert!(provider.create("net", &vpc()).await.is_err());
        assert_eq!(provider.resource_count(), 1);
    }

    #[tokio::test]
    async fn test_update_unions_ingress() {
        let provider = InMemoryProvider::new();
        let have = provider.seed(
            "sg",
            ResourceSpec::SecurityGroup(SecurityGroupSpec {
                vpc: "vpc-1".to_string(),
                description: "d".to_string(),
                ingress: vec![IngressRule::tcp(22, "10.0.0.0/8")],
            }),
        );
        let want = ResourceSpec::SecurityGroup(SecurityGroupSpec {
            vpc: "vpc-1".to_string(),
            description: "d".to_string(),
            ingress: vec![IngressRule::tcp(8000, "0.0.0.0/0")],
        });
        let diff = want.diff(&have.spec);
        let updated = provider.update(&have, &want, &diff).await.unwrap();
        match updated.spec {
            ResourceSpec::SecurityGroup(sg) => assert_eq!(sg.ingress.len(), 2),
            other => panic!("unexpected spec {:?}", other),
        }
    }
}

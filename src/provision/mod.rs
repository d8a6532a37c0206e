//! Provisioning module: common types and the provider trait, plus the orchestrator
//! and the AWS CLI and in-memory providers.

use serde::Serialize;
use std::fmt;

pub mod aws;
pub mod memory;
mod orchestrator;
mod resource;

pub use orchestrator::{
    sort_graph, DeploymentSession, Orchestrator, OrchestratorOptions, PlannedAction, PlannedStep,
    SessionState, StepFailure, StepOutcome, StepRecord,
};
pub use resource::{
    ClusterSpec, FieldChange, HealthCheckSpec, ImageRef, IngressRule, PlacementConstraint,
    RemoteResource, RepositorySpec, ResourceKind, ResourceSpec, SecurityGroupSpec, ServiceSpec,
    SpecDiff, SubnetSpec, VpcSpec,
};

/// One resource the orchestrator should make exist.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDescriptor {
    /// Stable name used to find the resource on later runs.
    pub logical_name: String,
    /// Desired attributes; references to other resources use their logical names.
    pub desired: ResourceSpec,
}

impl ResourceDescriptor {
    pub fn new(logical_name: impl Into<String>, desired: ResourceSpec) -> Self {
        Self {
            logical_name: logical_name.into(),
            desired,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.desired.kind()
    }

    /// Structural checks that do not need the provider.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.logical_name.trim().is_empty() {
            return Err(PlanError::Invalid {
                resource: self.logical_name.clone(),
                reason: "logical name is empty".to_string(),
            });
        }
        if let ResourceSpec::Service(ref s) = self.desired {
            if s.gpu_count > 0 && !s.placement_constraints.iter().any(|c| c.is_attribute_constraint()) {
                return Err(PlanError::MissingPlacementConstraint(self.logical_name.clone()));
            }
            if s.subnets.is_empty() {
                return Err(PlanError::Invalid {
                    resource: self.logical_name.clone(),
                    reason: "service needs at least one subnet".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Errors reported by a cloud provider.
/// 1. AuthFailed(String) - credentials missing, expired or not allowed
/// 2. Unreachable(String) - provider endpoint could not be reached
/// 3. BadRequest(String) - provider rejected the request
/// 4. Timeout(String) - call did not finish within the per-call timeout
/// 5. RateLimited(String) - provider throttled the request
/// 6. InternalError(String) - provider-side failure
/// 7. Ambiguous(String) - more than one remote resource carries the logical name
/// 8. CliUnavailable(String) - the provider tooling could not be started
/// 9. UnknownError(String) - anything else
/// Variants 2, 4, 5 and 6 are transient and retried by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ProviderError {
    AuthFailed(String),
    Unreachable(String),
    BadRequest(String),
    Timeout(String),
    RateLimited(String),
    InternalError(String),
    Ambiguous(String),
    CliUnavailable(String),
    UnknownError(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Unreachable(_)
                | ProviderError::Timeout(_)
                | ProviderError::RateLimited(_)
                | ProviderError::InternalError(_)
        )
    }

    pub fn message(&self) -> &str {
        match self {
            ProviderError::AuthFailed(m)
            | ProviderError::Unreachable(m)
            | ProviderError::BadRequest(m)
            | ProviderError::Timeout(m)
            | ProviderError::RateLimited(m)
            | ProviderError::InternalError(m)
            | ProviderError::Ambiguous(m)
            | ProviderError::CliUnavailable(m)
            | ProviderError::UnknownError(m) => m,
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::AuthFailed(msg) => write!(f, "provider auth failed: {}", msg),
            ProviderError::Unreachable(msg) => write!(f, "provider unreachable: {}", msg),
            ProviderError::BadRequest(msg) => write!(f, "provider bad request: {}", msg),
            ProviderError::Timeout(msg) => write!(f, "provider timeout: {}", msg),
            ProviderError::RateLimited(msg) => write!(f, "provider rate limited: {}", msg),
            ProviderError::InternalError(msg) => write!(f, "provider server error: {}", msg),
            ProviderError::Ambiguous(msg) => write!(f, "ambiguous remote state: {}", msg),
            ProviderError::CliUnavailable(msg) => write!(f, "provider CLI unavailable: {}", msg),
            ProviderError::UnknownError(msg) => write!(f, "Unknown error: {}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Graph problems detected before any remote call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PlanError {
    DuplicateName(String),
    UnknownReference { resource: String, reference: String },
    Cycle(Vec<String>),
    MissingPlacementConstraint(String),
    Invalid { resource: String, reason: String },
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::DuplicateName(name) => write!(f, "logical name '{}' is used more than once", name),
            PlanError::UnknownReference { resource, reference } => {
                write!(f, "'{}' references unknown resource '{}'", resource, reference)
            }
            PlanError::Cycle(names) => write!(f, "dependency cycle between {}", names.join(", ")),
            PlanError::MissingPlacementConstraint(name) => write!(
                f,
                "service '{}' requests GPUs but has no placement constraint on an accelerator attribute",
                name
            ),
            PlanError::Invalid { resource, reason } => write!(f, "invalid resource '{}': {}", resource, reason),
        }
    }
}

impl std::error::Error for PlanError {}

/// Remote side of reconciliation: find, create and update resources by logical name.
/// All methods are async; each call is bounded by the orchestrator's per-call timeout.
#[allow(async_fn_in_trait)]
pub trait CloudProvider {
    fn name(&self) -> &str;

    /// Look up the resource called `logical_name`. `desired` is already resolved, so
    /// scoped lookups (subnet within a VPC, service within a cluster) can use its ids.
    /// `Ok(None)` means the provider positively reported absence.
    async fn query(&self, logical_name: &str, desired: &ResourceSpec) -> Result<Option<RemoteResource>, ProviderError>;

    async fn create(&self, logical_name: &str, desired: &ResourceSpec) -> Result<RemoteResource, ProviderError>;

    /// Apply the mutable changes in `diff` to `current`.
    async fn update(
        &self,
        current: &RemoteResource,
        desired: &ResourceSpec,
        diff: &SpecDiff,
    ) -> Result<RemoteResource, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_provider_error_debug_display() {
        let e = ProviderError::BadRequest("msg".to_string());
        let s = format!("{:?}", e);
        assert!(s.contains("BadRequest"));
        assert!(s.contains("msg"));
        assert!(format!("{}", e).contains("bad request"));
        assert!(e.source().is_none());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::RateLimited("slow down".to_string()).is_transient());
        assert!(ProviderError::Timeout("t".to_string()).is_transient());
        assert!(!ProviderError::AuthFailed("expired".to_string()).is_transient());
        assert!(!ProviderError::BadRequest("bad".to_string()).is_transient());
        assert!(!ProviderError::Ambiguous("two vpcs".to_string()).is_transient());
    }

    #[test]
    fn test_gpu_service_requires_placement_constraint() {
        let service = ServiceSpec {
            cluster: "c".to_string(),
            subnets: vec!["s".to_string()],
            security_groups: vec![],
            image: ImageRef::Uri("img".to_string()),
            container_port: 8000,
            desired_count: 1,
            gpu_count: 1,
            memory_mib: 1024,
            environment: Default::default(),
            health_check: HealthCheckSpec {
                command: vec![],
                interval_secs: 30,
                timeout_secs: 5,
                retries: 3,
                start_period_secs: 0,
            },
            placement_constraints: vec![],
        };
        let d = ResourceDescriptor::new("svc", ResourceSpec::Service(service.clone()));
        assert_eq!(d.validate(), Err(PlanError::MissingPlacementConstraint("svc".to_string())));

        let constrained = ServiceSpec {
            placement_constraints: vec![PlacementConstraint::requires_attribute("accelerator", "nvidia-gpu")],
            ..service
        };
        assert!(ResourceDescriptor::new("svc", ResourceSpec::Service(constrained)).validate().is_ok());
    }
}

//! Typed desired-state descriptions for every resource kind, and the diff between
//! a desired and an observed spec.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Infrastructure primitive handled by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Vpc,
    Subnet,
    SecurityGroup,
    Repository,
    Cluster,
    Service,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Vpc => "vpc",
            ResourceKind::Subnet => "subnet",
            ResourceKind::SecurityGroup => "security-group",
            ResourceKind::Repository => "repository",
            ResourceKind::Cluster => "cluster",
            ResourceKind::Service => "service",
        }
    }

    /// Provisioning tier: network, then registry, then cluster, then service.
    pub fn tier(&self) -> u8 {
        match self {
            ResourceKind::Vpc | ResourceKind::Subnet | ResourceKind::SecurityGroup => 0,
            ResourceKind::Repository => 1,
            ResourceKind::Cluster => 2,
            ResourceKind::Service => 3,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpcSpec {
    pub cidr_block: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetSpec {
    /// VPC reference: logical name before resolution, VPC id after.
    pub vpc: String,
    pub cidr_block: String,
    /// `None` lets the provider pick a zone.
    pub availability_zone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IngressRule {
    pub protocol: String,
    pub port: u16,
    pub cidr: String,
}

impl IngressRule {
    pub fn tcp(port: u16, cidr: impl Into<String>) -> Self {
        Self {
            protocol: "tcp".to_string(),
            port,
            cidr: cidr.into(),
        }
    }
}

impl fmt::Display for IngressRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} from {}", self.protocol, self.port, self.cidr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupSpec {
    pub vpc: String,
    pub description: String,
    pub ingress: Vec<IngressRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySpec {
    pub scan_on_push: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub instance_type: String,
    /// Attributes container instances register with (e.g. `accelerator=nvidia-gpu`).
    pub instance_attributes: BTreeMap<String, String>,
}

impl ClusterSpec {
    /// `ECS_INSTANCE_ATTRIBUTES` value for the ECS agent on this cluster's instances,
    /// so the attributes exist from the moment an instance registers.
    pub fn agent_instance_attributes(&self) -> String {
        serde_json::Value::Object(
            self.instance_attributes
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect(),
        )
        .to_string()
    }
}

/// Container image for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageRef {
    /// Image pushed to a managed repository, named by the repository's logical name.
    Repository { repository: String, tag: String },
    /// Fully qualified image URI.
    Uri(String),
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRef::Repository { repository, tag } => write!(f, "{}:{}", repository, tag),
            ImageRef::Uri(uri) => f.write_str(uri),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub command: Vec<String>,
    pub interval_secs: u32,
    pub timeout_secs: u32,
    pub retries: u32,
    pub start_period_secs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlacementConstraint {
    #[serde(rename = "type")]
    pub constraint_type: String,
    pub expression: String,
}

impl PlacementConstraint {
    /// `memberOf` constraint on a registered container instance attribute.
    pub fn requires_attribute(name: &str, value: &str) -> Self {
        Self {
            constraint_type: "memberOf".to_string(),
            expression: format!("attribute:{} == {}", name, value),
        }
    }

    pub fn is_attribute_constraint(&self) -> bool {
        self.constraint_type == "memberOf" && self.expression.starts_with("attribute:")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub cluster: String,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub image: ImageRef,
    pub container_port: u16,
    pub desired_count: u32,
    pub gpu_count: u32,
    pub memory_mib: u32,
    pub environment: BTreeMap<String, String>,
    pub health_check: HealthCheckSpec,
    pub placement_constraints: Vec<PlacementConstraint>,
}

/// Desired (or observed) attributes of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ResourceSpec {
    Vpc(VpcSpec),
    Subnet(SubnetSpec),
    SecurityGroup(SecurityGroupSpec),
    Repository(RepositorySpec),
    Cluster(ClusterSpec),
    Service(ServiceSpec),
}

/// Handle on a resource that exists remotely.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteResource {
    /// Provider id (VPC id, group id, repository URI, ARN).
    pub id: String,
    pub logical_name: String,
    pub spec: ResourceSpec,
}

impl RemoteResource {
    pub fn kind(&self) -> ResourceKind {
        self.spec.kind()
    }
}

/// One differing attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub field: &'static str,
    pub observed: String,
    pub desired: String,
    /// Whether the provider can change this field in place.
    pub mutable: bool,
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: '{}' -> '{}'", self.field, self.observed, self.desired)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpecDiff {
    pub changes: Vec<FieldChange>,
}

impl SpecDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Differences in fields that cannot be changed without replacing the resource.
    pub fn conflicts(&self) -> Vec<FieldChange> {
        self.changes.iter().filter(|c| !c.mutable).cloned().collect()
    }

    pub fn has_conflicts(&self) -> bool {
        self.changes.iter().any(|c| !c.mutable)
    }

    pub fn touches(&self, field: &str) -> bool {
        self.changes.iter().any(|c| c.field == field)
    }

    fn compare<T: PartialEq + fmt::Debug>(&mut self, field: &'static str, observed: &T, desired: &T, mutable: bool) {
        if observed != desired {
            self.changes.push(FieldChange {
                field,
                observed: format!("{:?}", observed),
                desired: format!("{:?}", desired),
                mutable,
            });
        }
    }
}

fn sorted<T: Ord + Clone>(items: &[T]) -> Vec<T> {
    let mut v = items.to_vec();
    v.sort();
    v.dedup();
    v
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::Vpc(_) => ResourceKind::Vpc,
            ResourceSpec::Subnet(_) => ResourceKind::Subnet,
            ResourceSpec::SecurityGroup(_) => ResourceKind::SecurityGroup,
            ResourceSpec::Repository(_) => ResourceKind::Repository,
            ResourceSpec::Cluster(_) => ResourceKind::Cluster,
            ResourceSpec::Service(_) => ResourceKind::Service,
        }
    }

    /// Logical names (or, once resolved, ids) of resources this one points at.
    pub fn references(&self) -> Vec<&str> {
        match self {
            ResourceSpec::Vpc(_) | ResourceSpec::Repository(_) | ResourceSpec::Cluster(_) => vec![],
            ResourceSpec::Subnet(s) => vec![s.vpc.as_str()],
            ResourceSpec::SecurityGroup(s) => vec![s.vpc.as_str()],
            ResourceSpec::Service(s) => {
                let mut refs = vec![s.cluster.as_str()];
                refs.extend(s.subnets.iter().map(String::as_str));
                refs.extend(s.security_groups.iter().map(String::as_str));
                if let ImageRef::Repository { ref repository, .. } = s.image {
                    refs.push(repository.as_str());
                }
                refs
            }
        }
    }

    /// Replace logical-name references with the ids of already-provisioned resources.
    /// Returns the first reference `lookup` cannot answer.
    pub fn resolve<'a, F>(&self, lookup: F) -> Result<ResourceSpec, String>
    where
        F: Fn(&str) -> Option<&'a RemoteResource>,
    {
        let id_of = |name: &str| lookup(name).map(|r| r.id.clone()).ok_or_else(|| name.to_string());
        Ok(match self {
            ResourceSpec::Vpc(_) | ResourceSpec::Repository(_) | ResourceSpec::Cluster(_) => self.clone(),
            ResourceSpec::Subnet(s) => ResourceSpec::Subnet(SubnetSpec {
                vpc: id_of(&s.vpc)?,
                ..s.clone()
            }),
            ResourceSpec::SecurityGroup(s) => ResourceSpec::SecurityGroup(SecurityGroupSpec {
                vpc: id_of(&s.vpc)?,
                ..s.clone()
            }),
            ResourceSpec::Service(s) => {
                let image = match s.image {
                    ImageRef::Repository { ref repository, ref tag } => {
                        ImageRef::Uri(format!("{}:{}", id_of(repository)?, tag))
                    }
                    ImageRef::Uri(_) => s.image.clone(),
                };
                ResourceSpec::Service(ServiceSpec {
                    cluster: id_of(&s.cluster)?,
                    subnets: s.subnets.iter().map(|n| id_of(n)).collect::<Result<_, _>>()?,
                    security_groups: s
                        .security_groups
                        .iter()
                        .map(|n| id_of(n))
                        .collect::<Result<_, _>>()?,
                    image,
                    ..s.clone()
                })
            }
        })
    }

    /// Compare a desired spec (`self`) with what the provider reports.
    ///
    /// Rules observed remotely but not desired are tolerated: ingress rules are only
    /// ever added, and an unset availability zone matches any zone.
    pub fn diff(&self, observed: &ResourceSpec) -> SpecDiff {
        let mut d = SpecDiff::default();
        match (self, observed) {
            (ResourceSpec::Vpc(want), ResourceSpec::Vpc(have)) => {
                d.compare("cidr_block", &have.cidr_block, &want.cidr_block, false);
            }
            (ResourceSpec::Subnet(want), ResourceSpec::Subnet(have)) => {
                d.compare("vpc", &have.vpc, &want.vpc, false);
                d.compare("cidr_block", &have.cidr_block, &want.cidr_block, false);
                if want.availability_zone.is_some() {
                    d.compare("availability_zone", &have.availability_zone, &want.availability_zone, false);
                }
            }
            (ResourceSpec::SecurityGroup(want), ResourceSpec::SecurityGroup(have)) => {
                d.compare("vpc", &have.vpc, &want.vpc, false);
                d.compare("description", &have.description, &want.description, false);
                let present: BTreeSet<&IngressRule> = have.ingress.iter().collect();
                let missing: Vec<&IngressRule> = want.ingress.iter().filter(|r| !present.contains(r)).collect();
                if !missing.is_empty() {
                    d.changes.push(FieldChange {
                        field: "ingress",
                        observed: have.ingress.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
                        desired: want.ingress.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
                        mutable: true,
                    });
                }
            }
            (ResourceSpec::Repository(want), ResourceSpec::Repository(have)) => {
                d.compare("scan_on_push", &have.scan_on_push, &want.scan_on_push, true);
            }
            (ResourceSpec::Cluster(want), ResourceSpec::Cluster(have)) => {
                d.compare("instance_type", &have.instance_type, &want.instance_type, true);
                d.compare(
                    "instance_attributes",
                    &have.instance_attributes,
                    &want.instance_attributes,
                    false,
                );
            }
            (ResourceSpec::Service(want), ResourceSpec::Service(have)) => {
                d.compare("cluster", &have.cluster, &want.cluster, false);
                d.compare("subnets", &sorted(&have.subnets), &sorted(&want.subnets), false);
                d.compare(
                    "security_groups",
                    &sorted(&have.security_groups),
                    &sorted(&want.security_groups),
                    false,
                );
                d.compare("container_port", &have.container_port, &want.container_port, false);
                d.compare("gpu_count", &have.gpu_count, &want.gpu_count, false);
                d.compare(
                    "placement_constraints",
                    &sorted(&have.placement_constraints),
                    &sorted(&want.placement_constraints),
                    false,
                );
                d.compare("image", &have.image, &want.image, true);
                d.compare("desired_count", &have.desired_count, &want.desired_count, true);
                d.compare("memory_mib", &have.memory_mib, &want.memory_mib, true);
                d.compare("environment", &have.environment, &want.environment, true);
                d.compare("health_check", &have.health_check, &want.health_check, true);
            }
            (want, have) => d.changes.push(FieldChange {
                field: "kind",
                observed: have.kind().to_string(),
                desired: want.kind().to_string(),
                mutable: false,
            }),
        }
        d
    }

    /// Stable short digest of the spec, usable as an idempotency token.
    pub fn fingerprint(&self) -> String {
        // Debug output is deterministic: every map in a spec is a BTreeMap.
        let digest = Sha256::digest(format!("{:?}", self).as_bytes());
        format!("{:x}", digest).chars().take(32).collect()
    }
}

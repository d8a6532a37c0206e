//! Deployment manifest: the JSON document describing the cloud resources for one
//! deployment, and its translation into a typed resource graph.

use crate::config::{ConfigurationProfile, EnvSettings};
use crate::platform::{Accelerator, HostInfo, Platform};
use crate::provision::{
    ClusterSpec, HealthCheckSpec, ImageRef, IngressRule, PlacementConstraint, RepositorySpec,
    ResourceDescriptor, ResourceSpec, SecurityGroupSpec, ServiceSpec, SubnetSpec, VpcSpec,
};
use crate::utils::slugify;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

/// Container instance attribute that marks GPU-bearing instances.
pub const ACCELERATOR_ATTRIBUTE: &str = "accelerator";

/// Errors loading or validating a manifest.
/// 1. Io - manifest file could not be read
/// 2. Parse - not valid manifest JSON
/// 3. Invalid - a field has an unusable value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ManifestError {
    Io { path: String, message: String },
    Parse(String),
    Invalid { field: String, reason: String },
}

impl ManifestError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ManifestError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestError::Io { path, message } => write!(f, "cannot read manifest {}: {}", path, message),
            ManifestError::Parse(msg) => write!(f, "malformed manifest: {}", msg),
            ManifestError::Invalid { field, reason } => write!(f, "invalid manifest field '{}': {}", field, reason),
        }
    }
}

impl std::error::Error for ManifestError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubnetManifest {
    pub cidr: String,
    pub availability_zone: Option<String>,
}

impl Default for SubnetManifest {
    fn default() -> Self {
        Self {
            cidr: "10.0.1.0/24".to_string(),
            availability_zone: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkManifest {
    pub vpc_cidr: String,
    pub subnets: Vec<SubnetManifest>,
    pub ingress_ports: Vec<u16>,
    pub ingress_cidr: String,
    pub security_group_description: String,
}

impl Default for NetworkManifest {
    fn default() -> Self {
        Self {
            vpc_cidr: "10.0.0.0/16".to_string(),
            subnets: vec![SubnetManifest::default()],
            ingress_ports: vec![8000],
            ingress_cidr: "0.0.0.0/0".to_string(),
            security_group_description: "vLLM inference service".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryManifest {
    /// Repository name; the deployment name when unset.
    pub repository: Option<String>,
    pub scan_on_push: bool,
}

impl Default for RegistryManifest {
    fn default() -> Self {
        Self {
            repository: None,
            scan_on_push: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterManifest {
    pub name: Option<String>,
    pub instance_type: String,
    /// Value of the `accelerator` attribute GPU instances register with.
    pub accelerator_attribute: String,
}

impl Default for ClusterManifest {
    fn default() -> Self {
        Self {
            name: None,
            instance_type: "g4dn.xlarge".to_string(),
            accelerator_attribute: "nvidia-gpu".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckManifest {
    /// Shell command run inside the container; defaults to curling `/health`.
    pub command: Option<String>,
    pub interval_secs: u32,
    pub timeout_secs: u32,
    pub retries: u32,
    pub start_period_secs: u32,
}

impl Default for HealthCheckManifest {
    fn default() -> Self {
        Self {
            command: None,
            interval_secs: 30,
            timeout_secs: 10,
            retries: 3,
            start_period_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceManifest {
    pub name: Option<String>,
    /// Full image URI. When unset the image is `<repository uri>:<image_tag>`.
    pub image: Option<String>,
    pub image_tag: String,
    pub container_port: u16,
    pub desired_count: u32,
    pub gpu_count: u32,
    pub memory_mib: u32,
    pub health_check: HealthCheckManifest,
}

impl Default for ServiceManifest {
    fn default() -> Self {
        Self {
            name: None,
            image: None,
            image_tag: "latest".to_string(),
            container_port: 8000,
            desired_count: 1,
            gpu_count: 1,
            memory_mib: 14336,
            health_check: HealthCheckManifest::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentManifest {
    pub name: String,
    pub network: NetworkManifest,
    pub registry: RegistryManifest,
    pub cluster: ClusterManifest,
    pub service: ServiceManifest,
}

impl Default for DeploymentManifest {
    fn default() -> Self {
        Self {
            name: "vllm-poc".to_string(),
            network: NetworkManifest::default(),
            registry: RegistryManifest::default(),
            cluster: ClusterManifest::default(),
            service: ServiceManifest::default(),
        }
    }
}

type Cidr = (u32, u8);

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn parse_cidr(field: &str, s: &str) -> Result<Cidr, ManifestError> {
    let bad = |reason: &str| ManifestError::invalid(field, format!("'{}' {}", s, reason));
    let (addr, prefix) = s.split_once('/').ok_or_else(|| bad("is not in a.b.c.d/n form"))?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| bad("has an invalid IPv4 address"))?;
    let prefix: u8 = prefix
        .parse()
        .ok()
        .filter(|p| *p <= 32)
        .ok_or_else(|| bad("has an invalid prefix length"))?;
    let bits = u32::from(addr);
    if bits & !mask(prefix) != 0 {
        return Err(bad("has host bits set"));
    }
    Ok((bits, prefix))
}

fn cidr_contains(outer: Cidr, inner: Cidr) -> bool {
    inner.1 >= outer.1 && inner.0 & mask(outer.1) == outer.0
}

fn check_range(field: &str, value: u32, min: u32, max: u32) -> Result<(), ManifestError> {
    if value < min || value > max {
        return Err(ManifestError::invalid(
            field,
            format!("{} is outside {}..={}", value, min, max),
        ));
    }
    Ok(())
}

impl DeploymentManifest {
    /// Read, parse and validate a manifest file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ManifestError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ManifestError> {
        let manifest: Self = serde_json::from_str(text).map_err(|e| ManifestError::Parse(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if slugify(&self.name).is_empty() {
            return Err(ManifestError::invalid("name", "must contain at least one letter or digit"));
        }

        let vpc = parse_cidr("network.vpc_cidr", &self.network.vpc_cidr)?;
        if !(16..=28).contains(&vpc.1) {
            return Err(ManifestError::invalid("network.vpc_cidr", "prefix length must be between /16 and /28"));
        }
        if self.network.subnets.is_empty() {
            return Err(ManifestError::invalid("network.subnets", "at least one subnet is required"));
        }
        let mut seen = BTreeSet::new();
        for (i, subnet) in self.network.subnets.iter().enumerate() {
            let field = format!("network.subnets[{}].cidr", i);
            let cidr = parse_cidr(&field, &subnet.cidr)?;
            if !cidr_contains(vpc, cidr) {
                return Err(ManifestError::invalid(
                    field,
                    format!("{} is not inside {}", subnet.cidr, self.network.vpc_cidr),
                ));
            }
            if !seen.insert(cidr) {
                return Err(ManifestError::invalid(field, format!("{} is listed twice", subnet.cidr)));
            }
        }
        parse_cidr("network.ingress_cidr", &self.network.ingress_cidr)?;
        if self.network.ingress_ports.contains(&0) {
            return Err(ManifestError::invalid("network.ingress_ports", "port 0 is not allowed"));
        }
        if self.network.security_group_description.trim().is_empty() {
            return Err(ManifestError::invalid("network.security_group_description", "must not be empty"));
        }

        if self.cluster.instance_type.trim().is_empty() {
            return Err(ManifestError::invalid("cluster.instance_type", "must not be empty"));
        }
        let service = &self.service;
        if service.container_port == 0 {
            return Err(ManifestError::invalid("service.container_port", "port 0 is not allowed"));
        }
        if service.gpu_count > 0 && self.cluster.accelerator_attribute.trim().is_empty() {
            return Err(ManifestError::invalid(
                "cluster.accelerator_attribute",
                "required when the service requests GPUs",
            ));
        }
        if service.memory_mib == 0 {
            return Err(ManifestError::invalid("service.memory_mib", "must be positive"));
        }
        if service.image.is_none() && service.image_tag.trim().is_empty() {
            return Err(ManifestError::invalid("service.image_tag", "must not be empty"));
        }

        // ECS container health check limits.
        let hc = &service.health_check;
        check_range("service.health_check.interval_secs", hc.interval_secs, 5, 300)?;
        check_range("service.health_check.timeout_secs", hc.timeout_secs, 2, 60)?;
        check_range("service.health_check.retries", hc.retries, 1, 10)?;
        check_range("service.health_check.start_period_secs", hc.start_period_secs, 0, 300)?;
        Ok(())
    }

    fn slug(&self) -> String {
        slugify(&self.name)
    }

    pub fn vpc_name(&self) -> String {
        format!("{}-vpc", self.slug())
    }

    pub fn subnet_name(&self, index: usize) -> String {
        format!("{}-subnet-{}", self.slug(), index + 1)
    }

    pub fn security_group_name(&self) -> String {
        format!("{}-sg", self.slug())
    }

    pub fn repository_name(&self) -> String {
        self.registry.repository.clone().unwrap_or_else(|| self.slug())
    }

    pub fn cluster_name(&self) -> String {
        self.cluster.name.clone().unwrap_or_else(|| format!("{}-cluster", self.slug()))
    }

    pub fn service_name(&self) -> String {
        self.service.name.clone().unwrap_or_else(|| format!("{}-service", self.slug()))
    }

    /// Profile of the container the service runs: a Linux host with as many CUDA devices
    /// as the service requests. Only values set explicitly in `env` carry over, so the
    /// operator's own machine never leaks into the service definition.
    pub fn target_profile(&self, env: &EnvSettings) -> ConfigurationProfile {
        let gpu = self.service.gpu_count > 0;
        ConfigurationProfile::resolve(
            HostInfo {
                platform: Platform::Linux,
                arch: "x86_64".to_string(),
                apple_silicon: false,
                accelerator: if gpu { Accelerator::CudaGpu } else { Accelerator::None },
                gpu_devices: self.service.gpu_count,
                warnings: vec![],
            },
            env.clone(),
        )
    }

    /// Environment for the engine container, from the target profile and the service port.
    pub fn container_environment(&self, profile: &ConfigurationProfile) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("MODEL_NAME".to_string(), profile.model_name.clone());
        env.insert("HOST".to_string(), "0.0.0.0".to_string());
        env.insert("PORT".to_string(), self.service.container_port.to_string());
        env.insert("MAX_MODEL_LEN".to_string(), profile.max_sequence_length.to_string());
        env.insert(
            "GPU_MEMORY_UTILIZATION".to_string(),
            profile.gpu_memory_utilization.to_string(),
        );
        env.insert(
            "TENSOR_PARALLEL_SIZE".to_string(),
            profile.tensor_parallel_size.to_string(),
        );
        env.insert("TRUST_REMOTE_CODE".to_string(), profile.trust_remote_code.to_string());
        env.insert("ENFORCE_EAGER".to_string(), profile.enforce_eager.to_string());
        env.insert(
            "DISABLE_CUSTOM_ALL_REDUCE".to_string(),
            profile.disable_custom_all_reduce.to_string(),
        );
        env
    }

    fn health_check(&self) -> HealthCheckSpec {
        let hc = &self.service.health_check;
        let command = hc.command.clone().unwrap_or_else(|| {
            format!("curl -f http://localhost:{}/health || exit 1", self.service.container_port)
        });
        HealthCheckSpec {
            command: vec!["CMD-SHELL".to_string(), command],
            interval_secs: hc.interval_secs,
            timeout_secs: hc.timeout_secs,
            retries: hc.retries,
            start_period_secs: hc.start_period_secs,
        }
    }

    /// Resource graph for this manifest: network, registry, cluster, service.
    /// `env` holds the operator's explicit engine settings.
    pub fn resource_graph(&self, env: &EnvSettings) -> Vec<ResourceDescriptor> {
        let profile = self.target_profile(env);
        let vpc = self.vpc_name();
        let sg = self.security_group_name();
        let repository = self.repository_name();
        let cluster = self.cluster_name();
        let gpu = self.service.gpu_count > 0;

        let mut graph = vec![ResourceDescriptor::new(
            vpc.clone(),
            ResourceSpec::Vpc(VpcSpec {
                cidr_block: self.network.vpc_cidr.clone(),
            }),
        )];

        let subnets: Vec<String> = (0..self.network.subnets.len()).map(|i| self.subnet_name(i)).collect();
        for (name, subnet) in subnets.iter().zip(&self.network.subnets) {
            graph.push(ResourceDescriptor::new(
                name.clone(),
                ResourceSpec::Subnet(SubnetSpec {
                    vpc: vpc.clone(),
                    cidr_block: subnet.cidr.clone(),
                    availability_zone: subnet.availability_zone.clone(),
                }),
            ));
        }

        graph.push(ResourceDescriptor::new(
            sg.clone(),
            ResourceSpec::SecurityGroup(SecurityGroupSpec {
                vpc: vpc.clone(),
                description: self.network.security_group_description.clone(),
                ingress: self
                    .network
                    .ingress_ports
                    .iter()
                    .map(|p| IngressRule::tcp(*p, self.network.ingress_cidr.clone()))
                    .collect(),
            }),
        ));

        graph.push(ResourceDescriptor::new(
            repository.clone(),
            ResourceSpec::Repository(RepositorySpec {
                scan_on_push: self.registry.scan_on_push,
            }),
        ));

        let mut instance_attributes = BTreeMap::new();
        if gpu {
            instance_attributes.insert(
                ACCELERATOR_ATTRIBUTE.to_string(),
                self.cluster.accelerator_attribute.clone(),
            );
        }
        graph.push(ResourceDescriptor::new(
            cluster.clone(),
            ResourceSpec::Cluster(ClusterSpec {
                instance_type: self.cluster.instance_type.clone(),
                instance_attributes,
            }),
        ));

        let image = match self.service.image {
            Some(ref uri) => ImageRef::Uri(uri.clone()),
            None => ImageRef::Repository {
                repository,
                tag: self.service.image_tag.clone(),
            },
        };
        let placement_constraints = if gpu {
            vec![PlacementConstraint::requires_attribute(
                ACCELERATOR_ATTRIBUTE,
                &self.cluster.accelerator_attribute,
            )]
        } else {
            vec![]
        };
        graph.push(ResourceDescriptor::new(
            self.service_name(),
            ResourceSpec::Service(ServiceSpec {
                cluster,
                subnets,
                security_groups: vec![sg],
                image,
                container_port: self.service.container_port,
                desired_count: self.service.desired_count,
                gpu_count: self.service.gpu_count,
                memory_mib: self.service.memory_mib,
                environment: self.container_environment(&profile),
                health_check: self.health_check(),
                placement_constraints,
            }),
        ));
        graph
    }
}

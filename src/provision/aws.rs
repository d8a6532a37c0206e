//! [CloudProvider] backed by the `aws` command line tool.
//!
//! Every call is a separate `aws ... --output json` process; arguments are passed as
//! argv (never through a shell) and structured values are rendered with `serde_json`.

use super::resource::{
    ClusterSpec, HealthCheckSpec, ImageRef, IngressRule, PlacementConstraint, RemoteResource,
    RepositorySpec, ResourceSpec, SecurityGroupSpec, ServiceSpec, SubnetSpec, VpcSpec,
};
use super::{CloudProvider, ProviderError, SpecDiff};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::process::Stdio;

/// Tag marking resources this tool manages.
pub const MANAGED_BY_TAG: &str = "vllm-deployer:managed-by";
const INSTANCE_TYPE_TAG: &str = "vllm-deployer:instance-type";
const ATTRIBUTE_TAG_PREFIX: &str = "vllm-deployer:attribute:";

/// Runs one AWS CLI invocation and returns its parsed JSON output.
#[allow(async_fn_in_trait)]
pub trait AwsCli {
    async fn run(&self, args: Vec<String>) -> Result<Value, ProviderError>;
}

/// [AwsCli] that spawns the real binary.
#[derive(Debug, Clone)]
pub struct ProcessAwsCli {
    binary: String,
    region: Option<String>,
    profile: Option<String>,
}

impl Default for ProcessAwsCli {
    fn default() -> Self {
        Self {
            binary: "aws".to_string(),
            region: None,
            profile: None,
        }
    }
}

impl ProcessAwsCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            ..Self::default()
        }
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    pub fn with_profile(mut self, profile: Option<String>) -> Self {
        self.profile = profile;
        self
    }
}

impl AwsCli for ProcessAwsCli {
    async fn run(&self, args: Vec<String>) -> Result<Value, ProviderError> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(&args).args(["--output", "json"]);
        if let Some(ref region) = self.region {
            cmd.args(["--region", region.as_str()]);
        }
        if let Some(ref profile) = self.profile {
            cmd.args(["--profile", profile.as_str()]);
        }
        // A timed-out call drops this future; the child must not outlive it.
        cmd.kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        log::debug!("Running {} {}", self.binary, args.join(" "));
        let output = cmd.output().await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ProviderError::CliUnavailable(format!("'{}' not found on PATH", self.binary))
            }
            _ => ProviderError::CliUnavailable(format!("failed to start '{}': {}", self.binary, e)),
        })?;

        if !output.status.success() {
            return Err(classify_cli_error(&String::from_utf8_lossy(&output.stderr)));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&stdout)
            .map_err(|e| ProviderError::UnknownError(format!("unparseable CLI output: {}", e)))
    }
}

/// Map AWS CLI stderr to a [ProviderError].
pub fn classify_cli_error(stderr: &str) -> ProviderError {
    let msg = stderr.trim().to_string();
    let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

    if has(&["Throttling", "RequestLimitExceeded", "TooManyRequests", "Rate exceeded"]) {
        ProviderError::RateLimited(msg)
    } else if has(&[
        "Unable to locate credentials",
        "ExpiredToken",
        "InvalidClientTokenId",
        "UnrecognizedClientException",
        "AccessDenied",
        "UnauthorizedOperation",
        "AuthFailure",
    ]) {
        ProviderError::AuthFailed(msg)
    } else if has(&[
        "Could not connect to the endpoint URL",
        "Connect timeout on endpoint URL",
        "Connection was closed",
        "EndpointConnectionError",
    ]) {
        ProviderError::Unreachable(msg)
    } else if has(&["Read timeout", "timed out"]) {
        ProviderError::Timeout(msg)
    } else if has(&["InternalError", "InternalFailure", "ServiceUnavailable", "ServerException"]) {
        ProviderError::InternalError(msg)
    } else if has(&[
        "InvalidParameter",
        "ValidationError",
        "ValidationException",
        "ClientException",
        "MissingParameter",
        "InvalidRequest",
        "usage:",
    ]) {
        ProviderError::BadRequest(msg)
    } else {
        ProviderError::UnknownError(msg)
    }
}

fn unexpected(what: &str) -> ProviderError {
    ProviderError::UnknownError(format!("unexpected CLI response: missing {}", what))
}

fn str_at<'a>(v: &'a Value, pointer: &str) -> Result<&'a str, ProviderError> {
    v.pointer(pointer).and_then(Value::as_str).ok_or_else(|| unexpected(pointer))
}

fn u64_at(v: &Value, pointer: &str) -> Result<u64, ProviderError> {
    v.pointer(pointer).and_then(Value::as_u64).ok_or_else(|| unexpected(pointer))
}

fn u32_or_zero(v: &Value, pointer: &str) -> u32 {
    v.pointer(pointer)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}

fn array_at<'a>(v: &'a Value, pointer: &str) -> &'a [Value] {
    v.pointer(pointer)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn strings_at(v: &Value, pointer: &str) -> Vec<String> {
    array_at(v, pointer)
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
}

/// At most one match; more means the logical name no longer identifies a resource.
fn at_most_one<'a>(matches: Vec<&'a Value>, what: &str, name: &str) -> Result<Option<&'a Value>, ProviderError> {
    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.into_iter().next()),
        n => Err(ProviderError::Ambiguous(format!("{} {}s are named '{}'", n, what, name))),
    }
}

fn name_filter(name: &str) -> Value {
    json!({ "Name": "tag:Name", "Values": [name] })
}

fn ec2_tag_specification(resource_type: &str, name: &str) -> String {
    json!([{
        "ResourceType": resource_type,
        "Tags": [
            { "Key": "Name", "Value": name },
            { "Key": MANAGED_BY_TAG, "Value": "vllm-deployer" }
        ]
    }])
    .to_string()
}

fn ip_permissions<'a>(rules: impl IntoIterator<Item = &'a IngressRule>) -> String {
    let perms: Vec<Value> = rules
        .into_iter()
        .map(|r| {
            json!({
                "IpProtocol": r.protocol,
                "FromPort": r.port,
                "ToPort": r.port,
                "IpRanges": [{ "CidrIp": r.cidr }]
            })
        })
        .collect();
    Value::Array(perms).to_string()
}

fn parse_ingress(group: &Value) -> Vec<IngressRule> {
    let mut rules = BTreeSet::new();
    for perm in array_at(group, "/IpPermissions") {
        let (Some(protocol), Some(port)) = (
            perm.get("IpProtocol").and_then(Value::as_str),
            perm.get("FromPort").and_then(Value::as_u64),
        ) else {
            continue;
        };
        let Ok(port) = u16::try_from(port) else {
            continue;
        };
        for range in array_at(perm, "/IpRanges") {
            if let Some(cidr) = range.get("CidrIp").and_then(Value::as_str) {
                rules.insert(IngressRule {
                    protocol: protocol.to_string(),
                    port,
                    cidr: cidr.to_string(),
                });
            }
        }
    }
    rules.into_iter().collect()
}

fn vpc_from(name: &str, vpc: &Value) -> Result<RemoteResource, ProviderError> {
    Ok(RemoteResource {
        id: str_at(vpc, "/VpcId")?.to_string(),
        logical_name: name.to_string(),
        spec: ResourceSpec::Vpc(VpcSpec {
            cidr_block: str_at(vpc, "/CidrBlock")?.to_string(),
        }),
    })
}

fn subnet_from(name: &str, subnet: &Value) -> Result<RemoteResource, ProviderError> {
    Ok(RemoteResource {
        id: str_at(subnet, "/SubnetId")?.to_string(),
        logical_name: name.to_string(),
        spec: ResourceSpec::Subnet(SubnetSpec {
            vpc: str_at(subnet, "/VpcId")?.to_string(),
            cidr_block: str_at(subnet, "/CidrBlock")?.to_string(),
            availability_zone: subnet
                .get("AvailabilityZone")
                .and_then(Value::as_str)
                .map(str::to_string),
        }),
    })
}

fn security_group_from(name: &str, group: &Value) -> Result<RemoteResource, ProviderError> {
    Ok(RemoteResource {
        id: str_at(group, "/GroupId")?.to_string(),
        logical_name: name.to_string(),
        spec: ResourceSpec::SecurityGroup(SecurityGroupSpec {
            vpc: str_at(group, "/VpcId")?.to_string(),
            description: str_at(group, "/Description")?.to_string(),
            ingress: parse_ingress(group),
        }),
    })
}

fn repository_from(name: &str, repo: &Value) -> Result<RemoteResource, ProviderError> {
    Ok(RemoteResource {
        id: str_at(repo, "/repositoryUri")?.to_string(),
        logical_name: name.to_string(),
        spec: ResourceSpec::Repository(RepositorySpec {
            scan_on_push: repo
                .pointer("/imageScanningConfiguration/scanOnPush")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
    })
}

fn cluster_tags(name: &str, spec: &ClusterSpec) -> String {
    let mut tags = vec![
        json!({ "key": "Name", "value": name }),
        json!({ "key": MANAGED_BY_TAG, "value": "vllm-deployer" }),
        json!({ "key": INSTANCE_TYPE_TAG, "value": spec.instance_type }),
    ];
    for (k, v) in &spec.instance_attributes {
        tags.push(json!({ "key": format!("{}{}", ATTRIBUTE_TAG_PREFIX, k), "value": v }));
    }
    Value::Array(tags).to_string()
}

fn parse_cluster(cluster: &Value) -> ClusterSpec {
    let mut spec = ClusterSpec {
        instance_type: String::new(),
        instance_attributes: BTreeMap::new(),
    };
    for tag in array_at(cluster, "/tags") {
        let (Some(key), Some(value)) = (
            tag.get("key").and_then(Value::as_str),
            tag.get("value").and_then(Value::as_str),
        ) else {
            continue;
        };
        if key == INSTANCE_TYPE_TAG {
            spec.instance_type = value.to_string();
        } else if let Some(attr) = key.strip_prefix(ATTRIBUTE_TAG_PREFIX) {
            spec.instance_attributes.insert(attr.to_string(), value.to_string());
        }
    }
    spec
}

/// `register-task-definition` input for a service: one essential container on awsvpc.
fn task_definition_input(family: &str, spec: &ServiceSpec) -> String {
    let environment: Vec<Value> = spec
        .environment
        .iter()
        .map(|(k, v)| json!({ "name": k, "value": v }))
        .collect();
    let mut container = json!({
        "name": family,
        "image": spec.image.to_string(),
        "essential": true,
        "memory": spec.memory_mib,
        "portMappings": [{ "containerPort": spec.container_port, "protocol": "tcp" }],
        "environment": environment,
        "healthCheck": {
            "command": spec.health_check.command,
            "interval": spec.health_check.interval_secs,
            "timeout": spec.health_check.timeout_secs,
            "retries": spec.health_check.retries,
            "startPeriod": spec.health_check.start_period_secs
        }
    });
    if spec.gpu_count > 0 {
        container["resourceRequirements"] = json!([{ "type": "GPU", "value": spec.gpu_count.to_string() }]);
    }
    json!({
        "family": family,
        "networkMode": "awsvpc",
        "requiresCompatibilities": ["EC2"],
        "containerDefinitions": [container]
    })
    .to_string()
}

fn parse_service(service: &Value, task: &Value) -> Result<ServiceSpec, ProviderError> {
    let container = task
        .pointer("/containerDefinitions/0")
        .ok_or_else(|| unexpected("/containerDefinitions/0"))?;

    let environment = array_at(container, "/environment")
        .iter()
        .filter_map(|e| {
            Some((
                e.get("name")?.as_str()?.to_string(),
                e.get("value")?.as_str()?.to_string(),
            ))
        })
        .collect();
    let gpu_count = array_at(container, "/resourceRequirements")
        .iter()
        .find(|r| r.get("type").and_then(Value::as_str) == Some("GPU"))
        .and_then(|r| r.get("value").and_then(Value::as_str))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let placement_constraints = array_at(service, "/placementConstraints")
        .iter()
        .filter_map(|c| {
            Some(PlacementConstraint {
                constraint_type: c.get("type")?.as_str()?.to_string(),
                expression: c.get("expression")?.as_str()?.to_string(),
            })
        })
        .collect();
    let container_port = u64_at(container, "/portMappings/0/containerPort")?;

    Ok(ServiceSpec {
        cluster: str_at(service, "/clusterArn")?.to_string(),
        subnets: strings_at(service, "/networkConfiguration/awsvpcConfiguration/subnets"),
        security_groups: strings_at(service, "/networkConfiguration/awsvpcConfiguration/securityGroups"),
        image: ImageRef::Uri(str_at(container, "/image")?.to_string()),
        container_port: u16::try_from(container_port).map_err(|_| unexpected("valid containerPort"))?,
        desired_count: u32_or_zero(service, "/desiredCount"),
        gpu_count,
        memory_mib: u32_or_zero(container, "/memory"),
        environment,
        health_check: HealthCheckSpec {
            command: strings_at(container, "/healthCheck/command"),
            interval_secs: u32_or_zero(container, "/healthCheck/interval"),
            timeout_secs: u32_or_zero(container, "/healthCheck/timeout"),
            retries: u32_or_zero(container, "/healthCheck/retries"),
            start_period_secs: u32_or_zero(container, "/healthCheck/startPeriod"),
        },
        placement_constraints,
    })
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Provider that reconciles EC2, ECR and ECS resources through an [AwsCli].
pub struct AwsCliProvider<C> {
    cli: C,
}

impl<C: AwsCli> AwsCliProvider<C> {
    pub fn new(cli: C) -> Self {
        Self { cli }
    }

    pub fn cli(&self) -> &C {
        &self.cli
    }

    async fn query_vpc(&self, name: &str) -> Result<Option<RemoteResource>, ProviderError> {
        let filters = json!([name_filter(name)]).to_string();
        let out = self.cli.run(args(["ec2", "describe-vpcs", "--filters", &filters])).await?;
        let found: Vec<&Value> = array_at(&out, "/Vpcs").iter().collect();
        at_most_one(found, "VPC", name)?
            .map(|vpc| vpc_from(name, vpc))
            .transpose()
    }

    async fn create_vpc(&self, name: &str, spec: &VpcSpec) -> Result<RemoteResource, ProviderError> {
        let tags = ec2_tag_specification("vpc", name);
        let out = self
            .cli
            .run(args(["ec2", "create-vpc", "--cidr-block", &spec.cidr_block, "--tag-specifications", &tags]))
            .await?;
        Ok(RemoteResource {
            id: str_at(&out, "/Vpc/VpcId")?.to_string(),
            logical_name: name.to_string(),
            spec: ResourceSpec::Vpc(spec.clone()),
        })
    }

    async fn query_subnet(&self, name: &str, spec: &SubnetSpec) -> Result<Option<RemoteResource>, ProviderError> {
        let filters = json!([name_filter(name), { "Name": "vpc-id", "Values": [spec.vpc] }]).to_string();
        let out = self.cli.run(args(["ec2", "describe-subnets", "--filters", &filters])).await?;
        let found: Vec<&Value> = array_at(&out, "/Subnets").iter().collect();
        at_most_one(found, "subnet", name)?
            .map(|s| subnet_from(name, s))
            .transpose()
    }

    async fn create_subnet(&self, name: &str, spec: &SubnetSpec) -> Result<RemoteResource, ProviderError> {
        let tags = ec2_tag_specification("subnet", name);
        let mut argv = args([
            "ec2",
            "create-subnet",
            "--vpc-id",
            &spec.vpc,
            "--cidr-block",
            &spec.cidr_block,
            "--tag-specifications",
            &tags,
        ]);
        if let Some(ref zone) = spec.availability_zone {
            argv.extend(args(["--availability-zone", zone]));
        }
        let out = self.cli.run(argv).await?;
        let subnet = out.get("Subnet").ok_or_else(|| unexpected("/Subnet"))?;
        subnet_from(name, subnet)
    }

    async fn query_security_group(
        &self,
        name: &str,
        spec: &SecurityGroupSpec,
    ) -> Result<Option<RemoteResource>, ProviderError> {
        let filters = json!([
            { "Name": "group-name", "Values": [name] },
            { "Name": "vpc-id", "Values": [spec.vpc] }
        ])
        .to_string();
        let out = self
            .cli
            .run(args(["ec2", "describe-security-groups", "--filters", &filters]))
            .await?;
        let found: Vec<&Value> = array_at(&out, "/SecurityGroups").iter().collect();
        at_most_one(found, "security group", name)?
            .map(|group| security_group_from(name, group))
            .transpose()
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[&IngressRule]) -> Result<(), ProviderError> {
        if rules.is_empty() {
            return Ok(());
        }
        let perms = ip_permissions(rules.iter().copied());
        self.cli
            .run(args([
                "ec2",
                "authorize-security-group-ingress",
                "--group-id",
                group_id,
                "--ip-permissions",
                &perms,
            ]))
            .await?;
        Ok(())
    }

    async fn create_security_group(
        &self,
        name: &str,
        spec: &SecurityGroupSpec,
    ) -> Result<RemoteResource, ProviderError> {
        let tags = ec2_tag_specification("security-group", name);
        let out = self
            .cli
            .run(args([
                "ec2",
                "create-security-group",
                "--group-name",
                name,
                "--description",
                &spec.description,
                "--vpc-id",
                &spec.vpc,
                "--tag-specifications",
                &tags,
            ]))
            .await?;
        let group_id = str_at(&out, "/GroupId")?.to_string();
        if let Err(e) = self
            .authorize_ingress(&group_id, &spec.ingress.iter().collect::<Vec<_>>())
            .await
        {
            // The group stays behind without its rules; the next attempt finds it
            // and reports the step as updated, not created.
            log::warn!(
                "Security group {} was created as {} but adding its ingress rules failed: {}",
                name,
                group_id,
                e
            );
            return Err(e);
        }
        Ok(RemoteResource {
            id: group_id,
            logical_name: name.to_string(),
            spec: ResourceSpec::SecurityGroup(spec.clone()),
        })
    }

    async fn query_repository(&self, name: &str) -> Result<Option<RemoteResource>, ProviderError> {
        let out = match self
            .cli
            .run(args(["ecr", "describe-repositories", "--repository-names", name]))
            .await
        {
            Ok(out) => out,
            Err(e) if e.message().contains("RepositoryNotFoundException") => return Ok(None),
            Err(e) => return Err(e),
        };
        let found: Vec<&Value> = array_at(&out, "/repositories").iter().collect();
        at_most_one(found, "repository", name)?
            .map(|repo| repository_from(name, repo))
            .transpose()
    }

    async fn create_repository(&self, name: &str, spec: &RepositorySpec) -> Result<RemoteResource, ProviderError> {
        let scanning = json!({ "scanOnPush": spec.scan_on_push }).to_string();
        let tags = json!([{ "Key": MANAGED_BY_TAG, "Value": "vllm-deployer" }]).to_string();
        let out = self
            .cli
            .run(args([
                "ecr",
                "create-repository",
                "--repository-name",
                name,
                "--image-scanning-configuration",
                &scanning,
                "--tags",
                &tags,
            ]))
            .await?;
        Ok(RemoteResource {
            id: str_at(&out, "/repository/repositoryUri")?.to_string(),
            logical_name: name.to_string(),
            spec: ResourceSpec::Repository(spec.clone()),
        })
    }

    async fn query_cluster(&self, name: &str) -> Result<Option<RemoteResource>, ProviderError> {
        let out = self
            .cli
            .run(args(["ecs", "describe-clusters", "--clusters", name, "--include", "TAGS"]))
            .await?;
        // Deleted clusters linger as INACTIVE and can be recreated under the same name.
        let active: Vec<&Value> = array_at(&out, "/clusters")
            .iter()
            .filter(|c| c.get("status").and_then(Value::as_str) == Some("ACTIVE"))
            .collect();
        at_most_one(active, "cluster", name)?
            .map(|cluster| {
                str_at(cluster, "/clusterArn").map(|arn| RemoteResource {
                    id: arn.to_string(),
                    logical_name: name.to_string(),
                    spec: ResourceSpec::Cluster(parse_cluster(cluster)),
                })
            })
            .transpose()
    }

    async fn create_cluster(&self, name: &str, spec: &ClusterSpec) -> Result<RemoteResource, ProviderError> {
        let tags = cluster_tags(name, spec);
        let out = self
            .cli
            .run(args(["ecs", "create-cluster", "--cluster-name", name, "--tags", &tags]))
            .await?;
        log::info!(
            "Cluster '{}' expects container instances of type {} registering ECS_INSTANCE_ATTRIBUTES={}",
            name,
            spec.instance_type,
            spec.agent_instance_attributes()
        );
        Ok(RemoteResource {
            id: str_at(&out, "/cluster/clusterArn")?.to_string(),
            logical_name: name.to_string(),
            spec: ResourceSpec::Cluster(spec.clone()),
        })
    }

    async fn query_service(&self, name: &str, spec: &ServiceSpec) -> Result<Option<RemoteResource>, ProviderError> {
        let out = self
            .cli
            .run(args(["ecs", "describe-services", "--cluster", &spec.cluster, "--services", name]))
            .await?;
        let active: Vec<&Value> = array_at(&out, "/services")
            .iter()
            .filter(|s| s.get("status").and_then(Value::as_str) == Some("ACTIVE"))
            .collect();
        let Some(service) = at_most_one(active, "service", name)? else {
            return Ok(None);
        };
        let task_arn = str_at(service, "/taskDefinition")?;
        let task = self
            .cli
            .run(args(["ecs", "describe-task-definition", "--task-definition", task_arn]))
            .await?;
        let task = task.get("taskDefinition").ok_or_else(|| unexpected("/taskDefinition"))?;
        Ok(Some(RemoteResource {
            id: str_at(service, "/serviceArn")?.to_string(),
            logical_name: name.to_string(),
            spec: ResourceSpec::Service(parse_service(service, task)?),
        }))
    }

    async fn register_task_definition(&self, name: &str, spec: &ServiceSpec) -> Result<String, ProviderError> {
        let input = task_definition_input(name, spec);
        let out = self
            .cli
            .run(args(["ecs", "register-task-definition", "--cli-input-json", &input]))
            .await?;
        Ok(str_at(&out, "/taskDefinition/taskDefinitionArn")?.to_string())
    }

    async fn create_service(&self, name: &str, desired: &ResourceSpec, spec: &ServiceSpec) -> Result<RemoteResource, ProviderError> {
        let task_arn = self.register_task_definition(name, spec).await?;
        let network = json!({
            "awsvpcConfiguration": {
                "subnets": spec.subnets,
                "securityGroups": spec.security_groups
            }
        })
        .to_string();
        let placement = serde_json::to_string(&spec.placement_constraints)
            .map_err(|e| ProviderError::BadRequest(e.to_string()))?;
        let tags = json!([{ "key": MANAGED_BY_TAG, "value": "vllm-deployer" }]).to_string();
        let desired_count = spec.desired_count.to_string();
        // Same spec, same token: ECS treats a replayed create as the original request.
        let token = desired.fingerprint();
        let out = self
            .cli
            .run(args([
                "ecs",
                "create-service",
                "--cluster",
                &spec.cluster,
                "--service-name",
                name,
                "--task-definition",
                &task_arn,
                "--desired-count",
                &desired_count,
                "--launch-type",
                "EC2",
                "--placement-constraints",
                &placement,
                "--network-configuration",
                &network,
                "--client-token",
                &token,
                "--tags",
                &tags,
            ]))
            .await?;
        Ok(RemoteResource {
            id: str_at(&out, "/service/serviceArn")?.to_string(),
            logical_name: name.to_string(),
            spec: desired.clone(),
        })
    }

    async fn update_service(
        &self,
        current: &RemoteResource,
        spec: &ServiceSpec,
        diff: &SpecDiff,
    ) -> Result<RemoteResource, ProviderError> {
        let name = current.logical_name.as_str();
        let desired_count = spec.desired_count.to_string();
        let mut argv = args([
            "ecs",
            "update-service",
            "--cluster",
            &spec.cluster,
            "--service",
            name,
            "--desired-count",
            &desired_count,
        ]);
        let needs_revision = ["image", "memory_mib", "environment", "health_check"]
            .iter()
            .any(|f| diff.touches(f));
        if needs_revision {
            let task_arn = self.register_task_definition(name, spec).await?;
            argv.extend(args(["--task-definition", &task_arn]));
        }
        self.cli.run(argv).await?;
        Ok(RemoteResource {
            spec: ResourceSpec::Service(spec.clone()),
            ..current.clone()
        })
    }
}

impl<C: AwsCli> CloudProvider for AwsCliProvider<C> {
    fn name(&self) -> &str {
        "aws-cli"
    }

    async fn query(&self, logical_name: &str, desired: &ResourceSpec) -> Result<Option<RemoteResource>, ProviderError> {
        match desired {
            ResourceSpec::Vpc(_) => self.query_vpc(logical_name).await,
            ResourceSpec::Subnet(s) => self.query_subnet(logical_name, s).await,
            ResourceSpec::SecurityGroup(s) => self.query_security_group(logical_name, s).await,
            ResourceSpec::Repository(_) => self.query_repository(logical_name).await,
            ResourceSpec::Cluster(_) => self.query_cluster(logical_name).await,
            ResourceSpec::Service(s) => self.query_service(logical_name, s).await,
        }
    }

    async fn create(&self, logical_name: &str, desired: &ResourceSpec) -> Result<RemoteResource, ProviderError> {
        match desired {
            ResourceSpec::Vpc(s) => self.create_vpc(logical_name, s).await,
            ResourceSpec::Subnet(s) => self.create_subnet(logical_name, s).await,
            ResourceSpec::SecurityGroup(s) => self.create_security_group(logical_name, s).await,
            ResourceSpec::Repository(s) => self.create_repository(logical_name, s).await,
            ResourceSpec::Cluster(s) => self.create_cluster(logical_name, s).await,
            ResourceSpec::Service(s) => self.create_service(logical_name, desired, s).await,
        }
    }

    async fn update(
        &self,
        current: &RemoteResource,
        desired: &ResourceSpec,
        diff: &SpecDiff,
    ) -> Result<RemoteResource, ProviderError> {
        let name = current.logical_name.as_str();
        match (desired, &current.spec) {
            (ResourceSpec::SecurityGroup(want), ResourceSpec::SecurityGroup(have)) => {
                let present: BTreeSet<&IngressRule> = have.ingress.iter().collect();
                let missing: Vec<&IngressRule> = want.ingress.iter().filter(|r| !present.contains(r)).collect();
                self.authorize_ingress(&current.id, &missing).await?;
                let merged: BTreeSet<IngressRule> = have.ingress.iter().chain(want.ingress.iter()).cloned().collect();
                Ok(RemoteResource {
                    spec: ResourceSpec::SecurityGroup(SecurityGroupSpec {
                        ingress: merged.into_iter().collect(),
                        ..have.clone()
                    }),
                    ..current.clone()
                })
            }
            (ResourceSpec::Repository(want), _) => {
                let scanning = json!({ "scanOnPush": want.scan_on_push }).to_string();
                self.cli
                    .run(args([
                        "ecr",
                        "put-image-scanning-configuration",
                        "--repository-name",
                        name,
                        "--image-scanning-configuration",
                        &scanning,
                    ]))
                    .await?;
                Ok(RemoteResource {
                    spec: desired.clone(),
                    ..current.clone()
                })
            }
            (ResourceSpec::Cluster(want), _) => {
                let tags = cluster_tags(name, want);
                self.cli
                    .run(args(["ecs", "tag-resource", "--resource-arn", &current.id, "--tags", &tags]))
                    .await?;
                Ok(RemoteResource {
                    spec: desired.clone(),
                    ..current.clone()
                })
            }
            (ResourceSpec::Service(want), _) => self.update_service(current, want, diff).await,
            _ => Err(ProviderError::BadRequest(format!(
                "{} '{}' has no fields that can be updated in place",
                desired.kind(),
                name
            ))),
        }
    }
}

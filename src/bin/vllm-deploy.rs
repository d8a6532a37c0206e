//! `vllm-deploy`: detect the host, plan or apply the cloud resources for a vLLM
//! deployment, and wait for it to become healthy.
//!
//! Exit codes: 0 success; 1 failed step, conflict or unhealthy; 2 bad configuration
//! or manifest.

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use vllm_deployer::health::{HealthGate, HealthOutcome, HttpProbe};
use vllm_deployer::platform::{detect_host, SystemProbe};
use vllm_deployer::provision::aws::{AwsCliProvider, ProcessAwsCli};
use vllm_deployer::provision::memory::InMemoryProvider;
use vllm_deployer::provision::{
    CloudProvider, DeploymentSession, Orchestrator, OrchestratorOptions, PlanError, PlannedAction,
    PlannedStep, StepOutcome,
};
use vllm_deployer::{
    ConfigError, ConfigurationProfile, DeploymentManifest, EngineParameters, EnvSettings, ManifestError,
    ResourceDescriptor,
};

const EXIT_FAILED: i32 = 1;
const EXIT_BAD_INPUT: i32 = 2;

/// Provision and check vLLM inference deployments.
#[derive(Parser, Debug)]
#[command(name = "vllm-deploy")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the detected platform, configuration profile and engine command line
    Detect {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Show what `deploy` would change, without changing anything
    Plan(ProvisionArgs),
    /// Create or update the cloud resources, then optionally wait for health
    Deploy(DeployArgs),
    /// Poll a liveness endpoint until it reports healthy
    Wait(WaitArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ProviderKind {
    /// AWS through the `aws` CLI
    Aws,
    /// In-process rehearsal; nothing leaves this machine
    Memory,
}

#[derive(Args, Debug)]
struct ProvisionArgs {
    /// Deployment manifest (JSON); built-in defaults when omitted
    #[arg(long, short)]
    manifest: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ProviderKind::Aws)]
    provider: ProviderKind,

    /// AWS region passed to the CLI
    #[arg(long)]
    region: Option<String>,

    /// AWS named profile passed to the CLI
    #[arg(long)]
    aws_profile: Option<String>,

    /// Attempts per step for transient provider errors
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    /// Upper bound on each provider call, in seconds
    #[arg(long, default_value_t = 60)]
    call_timeout_secs: u64,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct GateArgs {
    /// Maximum number of health checks
    #[arg(long, default_value_t = 30)]
    attempts: u32,

    /// Seconds between health checks
    #[arg(long, default_value_t = 10)]
    interval_secs: u64,

    /// Give up after this many seconds overall
    #[arg(long)]
    deadline_secs: Option<u64>,
}

impl GateArgs {
    fn gate(&self) -> HealthGate {
        let gate = HealthGate::new(self.attempts, Duration::from_secs(self.interval_secs));
        match self.deadline_secs {
            Some(secs) => gate.with_deadline(Duration::from_secs(secs)),
            None => gate,
        }
    }
}

#[derive(Args, Debug)]
struct DeployArgs {
    #[command(flatten)]
    provision: ProvisionArgs,

    /// Liveness endpoint to poll after provisioning succeeds
    #[arg(long)]
    health_url: Option<String>,

    #[command(flatten)]
    gate: GateArgs,
}

#[derive(Args, Debug)]
struct WaitArgs {
    /// Liveness endpoint
    #[arg(long, default_value = "http://localhost:8000/health")]
    url: String,

    #[command(flatten)]
    gate: GateArgs,
}

#[tokio::main]
async fn main() {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(e: &anyhow::Error) -> i32 {
    if e.downcast_ref::<ConfigError>().is_some()
        || e.downcast_ref::<ManifestError>().is_some()
        || e.downcast_ref::<PlanError>().is_some()
    {
        EXIT_BAD_INPUT
    } else {
        EXIT_FAILED
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Detect { json } => detect(json).await,
        Commands::Plan(args) => {
            let graph = build_graph(&args)?;
            let steps = match args.provider {
                ProviderKind::Aws => orchestrator(aws_provider(&args), &args).plan(graph).await?,
                ProviderKind::Memory => orchestrator(InMemoryProvider::new(), &args).plan(graph).await?,
            };
            report_plan(&steps, args.json)
        }
        Commands::Deploy(args) => {
            let graph = build_graph(&args.provision)?;
            let session = match args.provision.provider {
                ProviderKind::Aws => {
                    orchestrator(aws_provider(&args.provision), &args.provision)
                        .ensure(graph)
                        .await?
                }
                ProviderKind::Memory => {
                    orchestrator(InMemoryProvider::new(), &args.provision)
                        .ensure(graph)
                        .await?
                }
            };
            report_session(&session, args.provision.json)?;
            if !session.is_success() {
                return Ok(EXIT_FAILED);
            }
            match args.health_url {
                Some(ref url) => wait(url, &args.gate).await,
                None => Ok(0),
            }
        }
        Commands::Wait(args) => wait(&args.url, &args.gate).await,
    }
}

async fn detect(json: bool) -> anyhow::Result<i32> {
    let host = detect_host(&SystemProbe::default()).await;
    let env = EnvSettings::from_env()?;
    let profile = ConfigurationProfile::resolve(host.clone(), env);
    let engine = EngineParameters::from_profile(&profile);
    let settings = host.settings();
    let recommendations = profile.recommendations();

    if json {
        let out = serde_json::json!({
            "profile": profile,
            "platform_settings": settings,
            "installation_command": host.installation_command(),
            "engine_command": engine.command_line(),
            "engine_env": engine.env,
            "recommendations": recommendations,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(0);
    }

    println!("Platform:        {} ({})", settings.name, host.arch);
    println!("Accelerator:     {} ({})", profile.accelerator, profile.gpu_info());
    if profile.gpu_devices > 0 {
        println!("GPU devices:     {}", profile.gpu_devices);
    }
    println!("Model:           {}", profile.model_name);
    println!("Max model len:   {}", profile.max_sequence_length);
    println!("Base image:      {}", settings.docker_base_image);
    println!("Requirements:    {}", settings.requirements_file);
    for step in &settings.additional_setup {
        println!("Setup:           {}", step);
    }
    println!("Engine command:  {}", engine.command_line().join(" "));
    println!("Install:\n{}", host.installation_command());
    for w in &profile.warnings {
        println!("Warning:         {}", w);
    }
    if !recommendations.is_empty() {
        println!("Recommendations:");
        for r in &recommendations {
            println!("  - {}", r);
        }
    }
    Ok(0)
}

fn build_graph(args: &ProvisionArgs) -> anyhow::Result<Vec<ResourceDescriptor>> {
    let manifest = match args.manifest {
        Some(ref path) => DeploymentManifest::load(path)
            .with_context(|| format!("loading manifest {}", path.display()))?,
        None => {
            let m = DeploymentManifest::default();
            m.validate()?;
            m
        }
    };
    let env = EnvSettings::from_env()?;
    manifest.target_profile(&env).log_summary();
    Ok(manifest.resource_graph(&env))
}

fn aws_provider(args: &ProvisionArgs) -> AwsCliProvider<ProcessAwsCli> {
    AwsCliProvider::new(
        ProcessAwsCli::default()
            .with_region(args.region.clone())
            .with_profile(args.aws_profile.clone()),
    )
}

fn orchestrator<P: CloudProvider>(provider: P, args: &ProvisionArgs) -> Orchestrator<P> {
    Orchestrator::with_options(
        provider,
        OrchestratorOptions {
            max_attempts: args.max_attempts,
            call_timeout: Duration::from_secs(args.call_timeout_secs),
            ..OrchestratorOptions::default()
        },
    )
}

/// Plans with conflicts or unknown state cannot be applied as-is.
fn report_plan(steps: &[PlannedStep], json: bool) -> anyhow::Result<i32> {
    if json {
        println!("{}", serde_json::to_string_pretty(steps)?);
    } else {
        for step in steps {
            let (action, detail) = match step.action {
                PlannedAction::Create => ("create", String::new()),
                PlannedAction::NoChange => ("no-change", String::new()),
                PlannedAction::Update { ref changes } => (
                    "update",
                    changes.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "),
                ),
                PlannedAction::Conflict { ref changes } => (
                    "CONFLICT",
                    changes.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "),
                ),
                PlannedAction::Unknown { ref error } => ("unknown", error.to_string()),
                PlannedAction::Blocked { ref on } => ("blocked", format!("waiting on '{}'", on)),
            };
            let shown = if detail.is_empty() {
                step.remote_id.clone().unwrap_or_default()
            } else {
                detail
            };
            println!("{:<10} {:<15} {:<28} {}", action, step.kind, step.logical_name, shown);
        }
    }
    let blocked = steps.iter().any(|s| {
        matches!(
            s.action,
            PlannedAction::Conflict { .. } | PlannedAction::Unknown { .. } | PlannedAction::Blocked { .. }
        )
    });
    Ok(if blocked { EXIT_FAILED } else { 0 })
}

fn report_session(session: &DeploymentSession, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(session)?);
        return Ok(());
    }
    for step in &session.steps {
        let detail = match step.outcome {
            StepOutcome::Failed { ref failure } => failure.to_string(),
            _ => step.remote_id.clone().unwrap_or_default(),
        };
        println!(
            "{:<16} {:<15} {:<28} {}",
            step.outcome.as_str(),
            step.kind,
            step.logical_name,
            detail
        );
    }
    println!("{}", session.summary());
    Ok(())
}

async fn wait(url: &str, gate: &GateArgs) -> anyhow::Result<i32> {
    let probe = HttpProbe::new(url).context("building health probe")?;
    match gate.gate().wait(&probe).await {
        HealthOutcome::Healthy { attempts, .. } => {
            println!("{} is healthy after {} attempt(s)", url, attempts);
            Ok(0)
        }
        HealthOutcome::Exhausted {
            attempts,
            deadline_exceeded,
            recent_failures,
        } => {
            println!(
                "{} did not become healthy after {} attempt(s){}",
                url,
                attempts,
                if deadline_exceeded { ", deadline exceeded" } else { "" }
            );
            for reason in recent_failures {
                println!("  {}", reason);
            }
            Ok(EXIT_FAILED)
        }
    }
}

pub mod config;
pub mod health;
pub mod launcher;
pub mod manifest;
pub mod platform;
pub mod provision;
pub mod server;
pub mod utils;

// Re-export commonly used types for convenience
pub use config::{ConfigError, ConfigurationProfile, EnvSettings};
pub use health::{wait_until_healthy, HealthGate, HealthOutcome, HttpProbe, LivenessProbe, ProbeFailure};
pub use launcher::{EngineParameters, VllmParametersBuilder};
pub use manifest::{DeploymentManifest, ManifestError};
pub use platform::{detect_host, Accelerator, HostInfo, HostProbe, Platform, SystemProbe};
pub use provision::{
    CloudProvider, DeploymentSession, Orchestrator, OrchestratorOptions, PlanError, ProviderError,
    ResourceDescriptor, StepOutcome,
};
pub use server::{AppState, EngineClient};

//! Environment settings and the immutable configuration profile.

use crate::platform::{detect_host, Accelerator, HostInfo, HostProbe, Platform, SystemProbe};
use crate::utils::normalize_endpoint_url;
use serde::Serialize;
use std::fmt;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_MAX_MODEL_LEN: u32 = 2048;
pub const DEFAULT_GPU_MEMORY_UTILIZATION: f64 = 0.9;

/// Malformed configuration. Always names the offending variable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ConfigError {
    Malformed {
        variable: &'static str,
        value: String,
        expected: &'static str,
    },
    OutOfRange {
        variable: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl ConfigError {
    pub fn variable(&self) -> &'static str {
        match self {
            ConfigError::Malformed { variable, .. } | ConfigError::OutOfRange { variable, .. } => variable,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Malformed { variable, value, expected } => {
                write!(f, "{} is malformed: got '{}', expected {}", variable, value, expected)
            }
            ConfigError::OutOfRange { variable, value, expected } => {
                write!(f, "{} is out of range: got '{}', expected {}", variable, value, expected)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Values read from the environment, before platform policy is applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvSettings {
    /// `MODEL_NAME`; `None` means "use the platform default".
    pub model_name: Option<String>,
    pub host: String,
    pub port: u16,
    pub max_model_len: u32,
    pub gpu_memory_utilization: f64,
    pub tensor_parallel_size: u32,
    pub trust_remote_code: bool,
    pub enforce_eager: bool,
    pub disable_custom_all_reduce: bool,
    pub cuda_visible_devices: Option<String>,
    /// `ENGINE_URL`: where the inference engine listens. Unset means demo mode.
    pub engine_url: Option<String>,
}

impl Default for EnvSettings {
    fn default() -> Self {
        Self {
            model_name: None,
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_model_len: DEFAULT_MAX_MODEL_LEN,
            gpu_memory_utilization: DEFAULT_GPU_MEMORY_UTILIZATION,
            tensor_parallel_size: 1,
            trust_remote_code: true,
            enforce_eager: false,
            disable_custom_all_reduce: false,
            cuda_visible_devices: None,
            engine_url: None,
        }
    }
}

impl EnvSettings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let port = match get("PORT") {
            Some(v) => parse_port("PORT", &v)?,
            None => defaults.port,
        };
        let max_model_len = match get("MAX_MODEL_LEN") {
            Some(v) => parse_positive("MAX_MODEL_LEN", &v)?,
            None => defaults.max_model_len,
        };
        let gpu_memory_utilization = match get("GPU_MEMORY_UTILIZATION") {
            Some(v) => parse_fraction("GPU_MEMORY_UTILIZATION", &v)?,
            None => defaults.gpu_memory_utilization,
        };
        let tensor_parallel_size = match get("TENSOR_PARALLEL_SIZE") {
            Some(v) => parse_positive("TENSOR_PARALLEL_SIZE", &v)?,
            None => defaults.tensor_parallel_size,
        };
        let trust_remote_code = match get("TRUST_REMOTE_CODE") {
            Some(v) => parse_bool("TRUST_REMOTE_CODE", &v)?,
            None => defaults.trust_remote_code,
        };
        let enforce_eager = match get("ENFORCE_EAGER") {
            Some(v) => parse_bool("ENFORCE_EAGER", &v)?,
            None => defaults.enforce_eager,
        };
        let disable_custom_all_reduce = match get("DISABLE_CUSTOM_ALL_REDUCE") {
            Some(v) => parse_bool("DISABLE_CUSTOM_ALL_REDUCE", &v)?,
            None => defaults.disable_custom_all_reduce,
        };

        Ok(Self {
            model_name: get("MODEL_NAME"),
            host: get("HOST").unwrap_or(defaults.host),
            port,
            max_model_len,
            gpu_memory_utilization,
            tensor_parallel_size,
            trust_remote_code,
            enforce_eager,
            disable_custom_all_reduce,
            cuda_visible_devices: get("CUDA_VISIBLE_DEVICES"),
            engine_url: get("ENGINE_URL").map(|u| normalize_endpoint_url(&u)),
        })
    }
}

fn parse_port(variable: &'static str, value: &str) -> Result<u16, ConfigError> {
    let port: u16 = value.parse().map_err(|_| ConfigError::Malformed {
        variable,
        value: value.to_string(),
        expected: "a TCP port number",
    })?;
    if port == 0 {
        return Err(ConfigError::OutOfRange {
            variable,
            value: value.to_string(),
            expected: "a port between 1 and 65535",
        });
    }
    Ok(port)
}

fn parse_positive(variable: &'static str, value: &str) -> Result<u32, ConfigError> {
    let n: u32 = value.parse().map_err(|_| ConfigError::Malformed {
        variable,
        value: value.to_string(),
        expected: "a positive integer",
    })?;
    if n == 0 {
        return Err(ConfigError::OutOfRange {
            variable,
            value: value.to_string(),
            expected: "a positive integer",
        });
    }
    Ok(n)
}

fn parse_fraction(variable: &'static str, value: &str) -> Result<f64, ConfigError> {
    let f: f64 = value.parse().map_err(|_| ConfigError::Malformed {
        variable,
        value: value.to_string(),
        expected: "a number between 0 and 1",
    })?;
    if !f.is_finite() || !(0.0..=1.0).contains(&f) {
        return Err(ConfigError::OutOfRange {
            variable,
            value: value.to_string(),
            expected: "a number between 0 and 1",
        });
    }
    Ok(f)
}

fn parse_bool(variable: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::Malformed {
            variable,
            value: value.to_string(),
            expected: "true or false",
        }),
    }
}

/// Default model for a host: larger on CUDA, smaller on CPU, smallest on macOS.
pub fn default_model(platform: Platform, accelerator: Accelerator) -> &'static str {
    match (platform, accelerator) {
        (Platform::MacOs, _) => "distilgpt2",
        (_, Accelerator::CudaGpu) => "microsoft/DialoGPT-medium",
        _ => "microsoft/DialoGPT-small",
    }
}

/// Everything the launcher, HTTP wrapper and manifests need to know about this host.
/// Built once at startup and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigurationProfile {
    pub platform: Platform,
    pub accelerator: Accelerator,
    pub apple_silicon: bool,
    pub gpu_devices: u32,
    pub model_name: String,
    pub max_sequence_length: u32,
    pub gpu_memory_utilization: f64,
    pub host: String,
    pub port: u16,
    pub tensor_parallel_size: u32,
    pub trust_remote_code: bool,
    pub enforce_eager: bool,
    pub disable_custom_all_reduce: bool,
    pub cuda_visible_devices: Option<String>,
    pub engine_url: Option<String>,
    pub warnings: Vec<String>,
}

impl ConfigurationProfile {
    /// Detect the running host and read the process environment.
    ///
    /// Hardware probing never fails; only malformed environment values return an error.
    pub async fn detect() -> Result<Self, ConfigError> {
        Self::detect_with(&SystemProbe::default(), |key| std::env::var(key).ok()).await
    }

    /// Same as [ConfigurationProfile::detect] with an explicit probe and environment.
    pub async fn detect_with<P, F>(probe: &P, lookup: F) -> Result<Self, ConfigError>
    where
        P: HostProbe,
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvSettings::from_lookup(lookup)?;
        Ok(Self::resolve(detect_host(probe).await, env))
    }

    pub fn resolve(host: HostInfo, env: EnvSettings) -> Self {
        let model_name = env
            .model_name
            .unwrap_or_else(|| default_model(host.platform, host.accelerator).to_string());
        Self {
            platform: host.platform,
            accelerator: host.accelerator,
            apple_silicon: host.apple_silicon,
            gpu_devices: host.gpu_devices,
            model_name,
            max_sequence_length: env.max_model_len,
            gpu_memory_utilization: env.gpu_memory_utilization,
            host: env.host,
            port: env.port,
            tensor_parallel_size: env.tensor_parallel_size,
            trust_remote_code: env.trust_remote_code,
            enforce_eager: env.enforce_eager,
            disable_custom_all_reduce: env.disable_custom_all_reduce,
            cuda_visible_devices: env.cuda_visible_devices,
            engine_url: env.engine_url,
            warnings: host.warnings,
        }
    }

    /// Short accelerator description reported by `/health`.
    pub fn gpu_info(&self) -> &'static str {
        match self.accelerator {
            Accelerator::CudaGpu => "CUDA enabled",
            Accelerator::Metal => "MPS (Apple Silicon) enabled",
            Accelerator::None => "CPU only",
        }
    }

    /// Setup hints for this host, empty when nothing needs attention.
    pub fn recommendations(&self) -> Vec<String> {
        let mut out = Vec::new();
        match (self.platform, self.accelerator) {
            (Platform::MacOs, _) => out.push(
                "vLLM has no Metal backend; the engine runs on CPU, so keep models small".to_string(),
            ),
            (_, Accelerator::None) if !self.warnings.is_empty() => out.push(
                "GPU query failed; check the NVIDIA driver and nvidia-smi to enable CUDA".to_string(),
            ),
            (_, Accelerator::None) => {
                out.push("No CUDA GPU detected; inference runs on CPU and will be slow".to_string())
            }
            _ => {}
        }
        if self.accelerator == Accelerator::CudaGpu {
            if self.tensor_parallel_size > self.gpu_devices {
                out.push(format!(
                    "TENSOR_PARALLEL_SIZE={} exceeds the {} detected GPU(s)",
                    self.tensor_parallel_size, self.gpu_devices
                ));
            } else if self.gpu_devices > 1 && self.tensor_parallel_size == 1 {
                out.push(format!(
                    "{} GPUs detected; set TENSOR_PARALLEL_SIZE={} to use all of them",
                    self.gpu_devices, self.gpu_devices
                ));
            }
        }
        if self.engine_url.is_none() {
            out.push("ENGINE_URL is unset; the HTTP wrapper will serve demo responses".to_string());
        }
        out
    }

    /// Log the profile at info level, warnings at warn level.
    pub fn log_summary(&self) {
        log::info!(
            "Platform: {} ({}), accelerator: {}, model: {}",
            self.platform,
            if self.apple_silicon { "apple silicon" } else { "generic" },
            self.accelerator,
            self.model_name
        );
        log::info!(
            "max_model_len={} gpu_memory_utilization={} tensor_parallel_size={}",
            self.max_sequence_length,
            self.gpu_memory_utilization,
            self.tensor_parallel_size
        );
        for w in &self.warnings {
            log::warn!("{}", w);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::tests::FakeHost;
    use crate::platform::GpuProbe;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    fn gpu_host() -> FakeHost {
        FakeHost {
            os: "linux",
            arch: "x86_64",
            cuda: GpuProbe::Detected { devices: 1 },
        }
    }

    #[test]
    fn test_defaults() {
        let settings = EnvSettings::from_lookup(env(&[])).unwrap();
        assert_eq!(settings, EnvSettings::default());
        assert_eq!(settings.port, 8000);
        assert_eq!(settings.max_model_len, 2048);
    }

    #[test]
    fn test_overrides() {
        let settings = EnvSettings::from_lookup(env(&[
            ("MODEL_NAME", "example/model"),
            ("PORT", "9000"),
            ("MAX_MODEL_LEN", "4096"),
            ("GPU_MEMORY_UTILIZATION", "0.75"),
            ("CUDA_VISIBLE_DEVICES", "0,1"),
            ("TRUST_REMOTE_CODE", "false"),
            ("ENGINE_URL", "localhost:8001/"),
        ]))
        .unwrap();
        assert_eq!(settings.model_name.as_deref(), Some("example/model"));
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.max_model_len, 4096);
        assert_eq!(settings.gpu_memory_utilization, 0.75);
        assert_eq!(settings.cuda_visible_devices.as_deref(), Some("0,1"));
        assert!(!settings.trust_remote_code);
        assert_eq!(settings.engine_url.as_deref(), Some("http://localhost:8001"));
    }

    #[test]
    fn test_malformed_numbers_fail_fast() {
        let err = EnvSettings::from_lookup(env(&[("MAX_MODEL_LEN", "lots")])).unwrap_err();
        assert_eq!(err.variable(), "MAX_MODEL_LEN");
        assert!(matches!(err, ConfigError::Malformed { .. }));

        let err = EnvSettings::from_lookup(env(&[("MAX_MODEL_LEN", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { .. }));

        let err = EnvSettings::from_lookup(env(&[("GPU_MEMORY_UTILIZATION", "1.5")])).unwrap_err();
        assert_eq!(err.variable(), "GPU_MEMORY_UTILIZATION");
        assert!(format!("{}", err).contains("between 0 and 1"));

        let err = EnvSettings::from_lookup(env(&[("GPU_MEMORY_UTILIZATION", "NaN")])).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { .. }));

        let err = EnvSettings::from_lookup(env(&[("PORT", "80000")])).unwrap_err();
        assert_eq!(err.variable(), "PORT");

        let err = EnvSettings::from_lookup(env(&[("ENFORCE_EAGER", "maybe")])).unwrap_err();
        assert_eq!(err.variable(), "ENFORCE_EAGER");
    }

    #[test]
    fn test_empty_values_are_unset() {
        let settings = EnvSettings::from_lookup(env(&[("PORT", "  "), ("MODEL_NAME", "")])).unwrap();
        assert_eq!(settings.port, 8000);
        assert!(settings.model_name.is_none());
    }

    #[tokio::test]
    async fn test_default_model_policy() {
        let cuda = ConfigurationProfile::detect_with(&gpu_host(), env(&[])).await.unwrap();
        assert_eq!(cuda.model_name, "microsoft/DialoGPT-medium");

        let cpu = ConfigurationProfile::detect_with(
            &FakeHost { os: "linux", arch: "x86_64", cuda: GpuProbe::NotInstalled },
            env(&[]),
        )
        .await
        .unwrap();
        assert_eq!(cpu.model_name, "microsoft/DialoGPT-small");
        assert_eq!(cpu.gpu_info(), "CPU only");

        let mac = ConfigurationProfile::detect_with(
            &FakeHost { os: "macos", arch: "aarch64", cuda: GpuProbe::NotInstalled },
            env(&[]),
        )
        .await
        .unwrap();
        assert_eq!(mac.model_name, "distilgpt2");
        assert_eq!(mac.accelerator, Accelerator::Metal);
    }

    #[tokio::test]
    async fn test_profile_is_deterministic() {
        let vars = [("MODEL_NAME", "example/model"), ("MAX_MODEL_LEN", "2048")];
        let a = ConfigurationProfile::detect_with(&gpu_host(), env(&vars)).await.unwrap();
        let b = ConfigurationProfile::detect_with(&gpu_host(), env(&vars)).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_probe_failure_is_not_fatal() {
        let profile = ConfigurationProfile::detect_with(
            &FakeHost {
                os: "linux",
                arch: "x86_64",
                cuda: GpuProbe::Failed("timeout".to_string()),
            },
            env(&[]),
        )
        .await
        .unwrap();
        assert_eq!(profile.accelerator, Accelerator::None);
        assert_eq!(profile.warnings.len(), 1);
    }

    #[test]
    fn test_recommendations() {
        let host = |accelerator: Accelerator, gpu_devices: u32| HostInfo {
            platform: Platform::Linux,
            arch: "x86_64".to_string(),
            apple_silicon: false,
            accelerator,
            gpu_devices,
            warnings: vec![],
        };

        let cpu = ConfigurationProfile::resolve(host(Accelerator::None, 0), EnvSettings::default());
        let hints = cpu.recommendations();
        assert!(hints.iter().any(|h| h.contains("No CUDA GPU")));
        assert!(hints.iter().any(|h| h.contains("ENGINE_URL")));

        let multi = ConfigurationProfile::resolve(host(Accelerator::CudaGpu, 4), EnvSettings::default());
        assert!(multi
            .recommendations()
            .iter()
            .any(|h| h.contains("TENSOR_PARALLEL_SIZE=4")));

        let ready = ConfigurationProfile::resolve(
            host(Accelerator::CudaGpu, 1),
            EnvSettings {
                engine_url: Some("http://localhost:8001".to_string()),
                ..EnvSettings::default()
            },
        );
        assert!(ready.recommendations().is_empty());
    }
}

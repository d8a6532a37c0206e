//! Host platform and accelerator detection.
//!
//! Everything the detector knows about the host comes through [HostProbe], so the
//! policy in [detect_host] can be exercised against a fake host in tests.

use serde::Serialize;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;

/// Operating system family the engine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    MacOs,
    Linux,
    Windows,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::MacOs => "macos",
            Platform::Linux => "linux",
            Platform::Windows => "windows",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute device the engine is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Accelerator {
    None,
    CudaGpu,
    Metal,
}

impl Accelerator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Accelerator::None => "none",
            Accelerator::CudaGpu => "cuda-gpu",
            Accelerator::Metal => "metal",
        }
    }
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of asking the host for CUDA devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuProbe {
    /// The driver answered and listed this many devices (may be zero).
    Detected { devices: u32 },
    /// No driver tooling installed: a normal CPU-only host.
    NotInstalled,
    /// The driver tooling exists but the query itself failed.
    Failed(String),
}

/// Source of host facts.
#[allow(async_fn_in_trait)]
pub trait HostProbe {
    /// Operating system name as reported by `std::env::consts::OS`.
    fn os(&self) -> String;
    /// CPU architecture as reported by `std::env::consts::ARCH`.
    fn arch(&self) -> String;
    async fn probe_cuda(&self) -> GpuProbe;
}

/// Probe backed by the running process: compile-time OS/arch constants and `nvidia-smi`.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    pub nvidia_smi: String,
    pub timeout: Duration,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self {
            nvidia_smi: "nvidia-smi".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl HostProbe for SystemProbe {
    fn os(&self) -> String {
        std::env::consts::OS.to_string()
    }

    fn arch(&self) -> String {
        std::env::consts::ARCH.to_string()
    }

    async fn probe_cuda(&self) -> GpuProbe {
        let mut cmd = tokio::process::Command::new(&self.nvidia_smi);
        cmd.args(["--query-gpu=name", "--format=csv,noheader"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => return GpuProbe::NotInstalled,
            Ok(Err(e)) => return GpuProbe::Failed(format!("failed to run {}: {}", self.nvidia_smi, e)),
            Err(_) => {
                return GpuProbe::Failed(format!(
                    "{} did not answer within {:?}",
                    self.nvidia_smi, self.timeout
                ))
            }
        };

        if !output.status.success() {
            return GpuProbe::Failed(format!(
                "{} exited with {}: {}",
                self.nvidia_smi,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        parse_device_list(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Count devices in `nvidia-smi --query-gpu=name --format=csv,noheader` output.
pub fn parse_device_list(stdout: &str) -> GpuProbe {
    let devices = stdout.lines().filter(|l| !l.trim().is_empty()).count() as u32;
    GpuProbe::Detected { devices }
}

/// Facts about the host after applying the accelerator policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostInfo {
    pub platform: Platform,
    pub arch: String,
    pub apple_silicon: bool,
    pub accelerator: Accelerator,
    pub gpu_devices: u32,
    /// Degradations hit while probing (never fatal).
    pub warnings: Vec<String>,
}

/// Static per-platform settings used by setup output and container builds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformSettings {
    pub name: &'static str,
    pub docker_base_image: &'static str,
    pub requirements_file: &'static str,
    pub additional_setup: Vec<&'static str>,
}

impl HostInfo {
    pub fn settings(&self) -> PlatformSettings {
        match (self.platform, self.apple_silicon) {
            (Platform::MacOs, true) => PlatformSettings {
                name: "macOS Apple Silicon",
                docker_base_image: "python:3.11-slim",
                requirements_file: "requirements-macos.txt",
                additional_setup: vec![
                    "brew install cmake",
                    "export MACOSX_DEPLOYMENT_TARGET=11.0",
                    "pip install torch torchvision torchaudio",
                ],
            },
            (Platform::MacOs, false) => PlatformSettings {
                name: "macOS Intel",
                docker_base_image: "python:3.11-slim",
                requirements_file: "requirements-macos.txt",
                additional_setup: vec!["brew install cmake", "pip install torch torchvision torchaudio"],
            },
            (Platform::Linux, _) => PlatformSettings {
                name: "Linux",
                docker_base_image: "nvidia/cuda:12.1-devel-ubuntu22.04",
                requirements_file: "requirements.txt",
                additional_setup: vec![],
            },
            (Platform::Windows, _) => PlatformSettings {
                name: "Windows",
                docker_base_image: "mcr.microsoft.com/windows/servercore:ltsc2022",
                requirements_file: "requirements-windows.txt",
                additional_setup: vec![
                    "Install Visual Studio Build Tools",
                    "Install CUDA Toolkit if GPU acceleration needed",
                ],
            },
        }
    }

    /// Shell snippet that installs the engine for this host.
    pub fn installation_command(&self) -> &'static str {
        match (self.platform, self.accelerator) {
            (Platform::MacOs, _) => {
                "pip install --upgrade pip\n\
                 pip install torch torchvision torchaudio\n\
                 pip install vllm --no-build-isolation"
            }
            (_, Accelerator::CudaGpu) => {
                "pip install --upgrade pip\n\
                 pip install torch torchvision torchaudio --index-url https://download.pytorch.org/whl/cu121\n\
                 pip install vllm"
            }
            _ => {
                "pip install --upgrade pip\n\
                 pip install torch torchvision torchaudio --index-url https://download.pytorch.org/whl/cpu\n\
                 pip install vllm"
            }
        }
    }
}

/// Apply the accelerator policy to whatever `probe` reports.
///
/// Never fails: an unknown OS is treated as Linux and a failed GPU query degrades to
/// [Accelerator::None], both with a warning recorded on the result.
pub async fn detect_host<P: HostProbe>(probe: &P) -> HostInfo {
    let mut warnings = Vec::new();
    let os = probe.os();
    let arch = probe.arch();

    let platform = match os.as_str() {
        "macos" => Platform::MacOs,
        "linux" => Platform::Linux,
        "windows" => Platform::Windows,
        other => {
            let msg = format!("unrecognised operating system '{}', using Linux settings", other);
            log::warn!("{}", msg);
            warnings.push(msg);
            Platform::Linux
        }
    };
    let apple_silicon = platform == Platform::MacOs && (arch == "aarch64" || arch.starts_with("arm"));

    let (accelerator, gpu_devices) = match platform {
        // CUDA is never available on macOS; no point asking.
        Platform::MacOs if apple_silicon => (Accelerator::Metal, 0),
        Platform::MacOs => (Accelerator::None, 0),
        Platform::Linux | Platform::Windows => match probe.probe_cuda().await {
            GpuProbe::Detected { devices } if devices > 0 => (Accelerator::CudaGpu, devices),
            GpuProbe::Detected { .. } | GpuProbe::NotInstalled => (Accelerator::None, 0),
            GpuProbe::Failed(reason) => {
                let msg = format!("GPU probe failed, falling back to CPU: {}", reason);
                log::warn!("{}", msg);
                warnings.push(msg);
                (Accelerator::None, 0)
            }
        },
    };

    HostInfo {
        platform,
        arch,
        apple_silicon,
        accelerator,
        gpu_devices,
        warnings,
    }
}

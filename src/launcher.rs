use crate::config::ConfigurationProfile;
use crate::platform::{Accelerator, Platform};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Module that serves vLLM's OpenAI-compatible API.
pub const VLLM_ENTRYPOINT: &str = "vllm.entrypoints.openai.api_server";

/// Engine launch parameters: command prefix, flags and environment.
/// Params are kept sorted so the rendered command line is stable across runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineParameters {
    pub command: Vec<String>,
    pub params: BTreeMap<String, Value>,
    pub env: BTreeMap<String, String>,
}

impl EngineParameters {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            params: BTreeMap::new(),
            env: BTreeMap::new(),
        }
    }

    /// Engine parameters for `profile`.
    ///
    /// CUDA hosts get memory utilization and `dtype=auto`; CPU and Metal hosts run
    /// eager without custom all-reduce, and macOS additionally caps concurrent sequences.
    pub fn from_profile(profile: &ConfigurationProfile) -> Self {
        let mut builder = VllmParametersBuilder::new(vec![
            "python".to_string(),
            "-m".to_string(),
            VLLM_ENTRYPOINT.to_string(),
        ])
        .model(&profile.model_name)
        .host(&profile.host)
        .port(profile.port)
        .tensor_parallel_size(profile.tensor_parallel_size)
        .max_model_len(profile.max_sequence_length)
        .trust_remote_code(profile.trust_remote_code);

        if profile.accelerator == Accelerator::CudaGpu {
            builder = builder
                .gpu_memory_utilization(profile.gpu_memory_utilization)
                .dtype("auto")
                .enforce_eager(profile.enforce_eager)
                .disable_custom_all_reduce(profile.disable_custom_all_reduce);
        } else {
            builder = builder.enforce_eager(true).disable_custom_all_reduce(true);
        }

        if profile.platform == Platform::MacOs {
            builder = builder.device("cpu").max_num_seqs(16);
        }

        if let Some(ref devices) = profile.cuda_visible_devices {
            builder = builder.insert_env_var("CUDA_VISIBLE_DEVICES", devices.clone());
        }
        builder.build()
    }

    pub fn insert_param(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn insert_env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Convert params to CLI args (e.g. `--host 0.0.0.0 --port 8000`).
    /// Underscores in keys become dashes. Bool true => `--key`, bool false => omitted.
    pub fn to_cli_args(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (key, value) in &self.params {
            let flag = format!("--{}", key.replace('_', "-"));
            match value {
                Value::Bool(true) => out.push(flag),
                Value::Bool(false) | Value::Null => {}
                Value::String(s) => {
                    out.push(flag);
                    out.push(s.clone());
                }
                v => {
                    out.push(flag);
                    out.push(v.to_string());
                }
            }
        }
        out
    }

    /// Full argv: command prefix followed by the rendered flags.
    pub fn command_line(&self) -> Vec<String> {
        self.command
            .iter()
            .cloned()
            .chain(self.to_cli_args())
            .collect()
    }
}

/// Builder for vLLM engine parameters
pub struct VllmParametersBuilder {
    params: EngineParameters,
}

impl VllmParametersBuilder {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            params: EngineParameters::new(command),
        }
    }

    pub fn model(mut self, model: &str) -> Self {
        self.params.insert_param("model", model);
        self
    }

    pub fn host(mut self, host: &str) -> Self {
        self.params.insert_param("host", host);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.params.insert_param("port", port);
        self
    }

    pub fn tensor_parallel_size(mut self, size: u32) -> Self {
        self.params.insert_param("tensor_parallel_size", size);
        self
    }

    pub fn max_model_len(mut self, len: u32) -> Self {
        self.params.insert_param("max_model_len", len);
        self
    }

    pub fn gpu_memory_utilization(mut self, util: f64) -> Self {
        self.params.insert_param("gpu_memory_utilization", util);
        self
    }

    pub fn dtype(mut self, dtype: &str) -> Self {
        self.params.insert_param("dtype", dtype);
        self
    }

    pub fn device(mut self, device: &str) -> Self {
        self.params.insert_param("device", device);
        self
    }

    pub fn trust_remote_code(mut self, trust: bool) -> Self {
        self.params.insert_param("trust_remote_code", trust);
        self
    }

    pub fn enforce_eager(mut self, enforce: bool) -> Self {
        self.params.insert_param("enforce_eager", enforce);
        self
    }

    pub fn disable_custom_all_reduce(mut self, disable: bool) -> Self {
        self.params.insert_param("disable_custom_all_reduce", disable);
        self
    }

    pub fn max_num_seqs(mut self, n: u32) -> Self {
        self.params.insert_param("max_num_seqs", n);
        self
    }

    pub fn insert_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert_env(key, value);
        self
    }

    pub fn build(self) -> EngineParameters {
        self.params
    }
}

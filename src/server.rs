//! HTTP wrapper in front of the inference engine.
//!
//! Routes: `GET /health`, `GET /models`, `POST /v1/chat/completions`. With an engine
//! URL configured, chat requests are forwarded to the engine's OpenAI-compatible API;
//! without one the server answers in demo mode.

use crate::config::ConfigurationProfile;
use crate::utils::{join_url, normalize_endpoint_url};
use actix_web::{error, http::header, web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const DEMO_RESPONSE: &str = "Demo response: This is a mock response since vLLM is not available.";
/// Fixed creation timestamp reported by `/models`.
pub const MODEL_CREATED: u64 = 1677610602;
pub const MODEL_OWNER: &str = "vllm-poc";

const ENGINE_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const ENGINE_GENERATE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
}

impl ChatRequest {
    pub fn max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(512)
    }

    pub fn temperature(&self) -> f64 {
        self.temperature.unwrap_or(0.7)
    }

    pub fn top_p(&self) -> f64 {
        self.top_p.unwrap_or(0.9)
    }

    /// Flatten the conversation into a plain prompt ending with `Assistant:`.
    /// Messages with other roles (e.g. `system`) are skipped.
    pub fn prompt(&self) -> String {
        let mut prompt = String::new();
        for m in &self.messages {
            match m.role.as_str() {
                "user" => prompt.push_str(&format!("User: {}\n", m.content)),
                "assistant" => prompt.push_str(&format!("Assistant: {}\n", m.content)),
                _ => {}
            }
        }
        prompt.push_str("Assistant:");
        prompt
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    /// Whitespace word counts, used when the engine does not report usage.
    pub fn from_text(prompt: &str, completion: &str) -> Self {
        let prompt_tokens = prompt.split_whitespace().count();
        let completion_tokens = completion.split_whitespace().count();
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub choices: Vec<Value>,
    pub usage: Usage,
}

/// Errors talking to the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EngineError {
    Unreachable(String),
    Timeout(String),
    Status { code: u16, body: String },
    Decode(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Unreachable(msg) => write!(f, "engine unreachable: {}", msg),
            EngineError::Timeout(msg) => write!(f, "engine timeout: {}", msg),
            EngineError::Status { code, body } => write!(f, "engine returned HTTP {}: {}", code, body),
            EngineError::Decode(msg) => write!(f, "cannot decode engine response: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

fn map_send_error(e: reqwest_middleware::Error) -> EngineError {
    match e {
        reqwest_middleware::Error::Reqwest(e) if e.is_timeout() => EngineError::Timeout(e.to_string()),
        reqwest_middleware::Error::Reqwest(e) => EngineError::Unreachable(e.to_string()),
        reqwest_middleware::Error::Middleware(e) => EngineError::Unreachable(e.to_string()),
    }
}

/// Client for the engine's OpenAI-compatible HTTP API.
pub struct EngineClient {
    base_url: String,
    client: reqwest_middleware::ClientWithMiddleware,
}

impl EngineClient {
    pub fn new(base_url: &str) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| EngineError::Unreachable(e.to_string()))?;
        Ok(Self {
            base_url: normalize_endpoint_url(base_url),
            client: reqwest_middleware::ClientBuilder::new(client).build(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<(), EngineError> {
        let resp = self
            .client
            .get(join_url(&self.base_url, "/health"))
            .timeout(ENGINE_HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(map_send_error)?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(EngineError::Status {
                code: resp.status().as_u16(),
                body: String::new(),
            })
        }
    }

    pub async fn chat(&self, model: &str, request: &ChatRequest) -> Result<Value, EngineError> {
        let body = json!({
            "model": model,
            "messages": request.messages,
            "max_tokens": request.max_tokens(),
            "temperature": request.temperature(),
            "top_p": request.top_p(),
        });
        let resp = self
            .client
            .post(join_url(&self.base_url, "/v1/chat/completions"))
            .header(header::CONTENT_TYPE.as_str(), "application/json")
            .body(body.to_string())
            .timeout(ENGINE_GENERATE_TIMEOUT)
            .send()
            .await
            .map_err(map_send_error)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Status {
                code: status.as_u16(),
                body,
            });
        }
        resp.json::<Value>().await.map_err(|e| EngineError::Decode(e.to_string()))
    }
}

/// Shared state of the HTTP wrapper.
pub struct AppState {
    pub profile: ConfigurationProfile,
    engine: Option<EngineClient>,
    requests: AtomicU64,
}

impl AppState {
    /// State for `profile`; an engine client is created when the profile names an engine URL.
    pub fn new(profile: ConfigurationProfile) -> Result<Self, EngineError> {
        let engine = match profile.engine_url {
            Some(ref url) => Some(EngineClient::new(url)?),
            None => None,
        };
        Ok(Self {
            profile,
            engine,
            requests: AtomicU64::new(0),
        })
    }

    pub fn demo_mode(&self) -> bool {
        self.engine.is_none()
    }

    fn next_request_id(&self) -> String {
        format!("chat-{}", self.requests.fetch_add(1, Ordering::Relaxed))
    }
}

async fn health(state: web::Data<AppState>) -> HttpResponse {
    let status = match state.engine {
        Some(ref engine) => match engine.health().await {
            Ok(()) => "healthy",
            Err(e) => {
                log::warn!("Engine at {} is not ready: {}", engine.base_url(), e);
                return HttpResponse::ServiceUnavailable().json(json!({ "detail": "Model not loaded" }));
            }
        },
        None => "demo_mode",
    };
    HttpResponse::Ok().json(json!({
        "status": status,
        "model": state.profile.model_name,
        "gpu_memory_used": state.profile.gpu_info(),
    }))
}

async fn list_models(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "object": "list",
        "data": [{
            "id": state.profile.model_name,
            "object": "model",
            "created": MODEL_CREATED,
            "owned_by": MODEL_OWNER,
        }]
    }))
}

async fn chat_completions(state: web::Data<AppState>, body: web::Json<ChatRequest>) -> HttpResponse {
    let request = body.into_inner();
    match state.engine {
        Some(ref engine) => match engine.chat(&state.profile.model_name, &request).await {
            Ok(value) => HttpResponse::Ok().json(value),
            Err(e) => {
                log::error!("Generation failed: {}", e);
                HttpResponse::InternalServerError().json(json!({ "detail": format!("Generation failed: {}", e) }))
            }
        },
        None => {
            let prompt = request.prompt();
            let response = ChatResponse {
                id: state.next_request_id(),
                choices: vec![json!({
                    "index": 0,
                    "message": { "role": "assistant", "content": DEMO_RESPONSE },
                    "finish_reason": "stop"
                })],
                usage: Usage::from_text(&prompt, DEMO_RESPONSE),
            };
            HttpResponse::Ok().json(response)
        }
    }
}

fn json_error_handler(err: error::JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let detail = err.to_string();
    error::InternalError::from_response(err, HttpResponse::UnprocessableEntity().json(json!({ "detail": detail })))
        .into()
}

/// Register the wrapper's routes. `AppState` must be added as app data; CORS is
/// applied by wrapping the app in `actix_cors::Cors::permissive()`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error_handler))
        .route("/health", web::get().to(health))
        .route("/models", web::get().to(list_models))
        .route("/v1/chat/completions", web::post().to(chat_completions));
}

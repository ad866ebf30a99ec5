//! services/model.rs
//! Language-model backend seam. One request in, one generated text out.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::ModelConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model API key missing; set {0}")]
    MissingApiKey(String),
    #[error("model backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model backend unreachable: {0}")]
    Transport(String),
    #[error("model response could not be decoded: {0}")]
    Decode(String),
    #[error("model returned no text")]
    EmptyResponse,
}

pub trait ModelBackend {
    fn complete(&self, request: &ModelRequest) -> Result<String, ModelError>;
}

impl<T: ModelBackend + ?Sized> ModelBackend for &T {
    fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
        (**self).complete(request)
    }
}

impl<T: ModelBackend + ?Sized> ModelBackend for Box<T> {
    fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
        (**self).complete(request)
    }
}

/// OpenAI-compatible chat completions over HTTP. No timeouts: the operator
/// waits for slow generations. A missing API key only surfaces when a request
/// is made, so the rest of the pipeline runs without one.
pub struct OpenAiBackend {
    agent: ureq::Agent,
    endpoint: String,
    api_key: Option<String>,
    api_key_env: String,
}

impl OpenAiBackend {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().build(),
            endpoint: endpoint.into(),
            api_key: Some(api_key.into()),
            api_key_env: String::new(),
        }
    }

    pub fn from_config(cfg: &ModelConfig) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().build(),
            endpoint: cfg.endpoint.clone(),
            api_key: cfg.api_key(),
            api_key_env: cfg.api_key_env.clone(),
        }
    }

    pub fn has_key(&self) -> bool {
        self.api_key.is_some()
    }
}

impl ModelBackend for OpenAiBackend {
    fn complete(&self, request: &ModelRequest) -> Result<String, ModelError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ModelError::MissingApiKey(self.api_key_env.clone()))?;
        let response = self
            .agent
            .post(&self.endpoint)
            .set("Content-Type", "application/json")
            .set("Authorization", &format!("Bearer {key}"))
            .set("Accept", "application/json")
            .send_json(request)
            .map_err(from_ureq)?;
        let body: Value = response
            .into_json()
            .map_err(|e| ModelError::Decode(e.to_string()))?;
        extract_text(&body)
    }
}

fn from_ureq(err: ureq::Error) -> ModelError {
    match err {
        ureq::Error::Status(status, resp) => {
            let body = resp.into_string().unwrap_or_default();
            ModelError::Status {
                status,
                body: body.chars().take(300).collect(),
            }
        }
        ureq::Error::Transport(t) => ModelError::Transport(t.to_string()),
    }
}

/// `choices[0].message.content`, trimmed.
pub fn extract_text(body: &Value) -> Result<String, ModelError> {
    let text = body
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| ModelError::Decode("missing choices[0].message.content".into()))?
        .trim();
    if text.is_empty() {
        return Err(ModelError::EmptyResponse);
    }
    Ok(text.to_string())
}

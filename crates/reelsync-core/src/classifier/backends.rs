//! HTTP semantic classifier backends and the startup factory.

use super::semantic::{build_prompt, parse_response, SemanticClassifier, SemanticResponse};
use crate::config::{ClassifierBackend, ClassifierConfig, ClassifierSettings};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

fn build_client(settings: &ClassifierSettings) -> Result<Client> {
    Client::builder()
        .timeout(settings.timeout())
        .user_agent(concat!("reelsync/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| SyncError::Network {
            message: format!("Failed to create HTTP client: {}", e),
        })
}

fn endpoint_url(base: &str, path: &str) -> Result<Url> {
    let mut base = Url::parse(base).map_err(|e| SyncError::Config {
        message: format!("Invalid classifier endpoint '{}': {}", base, e),
    })?;
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path).map_err(|e| SyncError::Config {
        message: format!("Invalid classifier endpoint path '{}': {}", path, e),
    })
}

fn api_key_from_env(var: &str) -> Result<String> {
    std::env::var(var).map_err(|_| SyncError::Config {
        message: format!("Environment variable {} is not set", var),
    })
}

/// The configured endpoint, unless it is still the Ollama default.
fn endpoint_or<'a>(settings: &'a ClassifierSettings, default: &'a str) -> &'a str {
    if settings.endpoint == ClassifierConfig::OLLAMA_DEFAULT_ENDPOINT {
        default
    } else {
        settings.endpoint.as_str()
    }
}

async fn post_json(client: &Client, url: &Url, api_key: Option<&str>, body: &Value) -> Result<Value> {
    let mut request = client.post(url.clone()).json(body);
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }
    send_json(request, url).await
}

async fn send_json(request: RequestBuilder, url: &Url) -> Result<Value> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(SyncError::Network {
            message: format!("{} returned {}: {}", url, status, text),
        });
    }
    Ok(response.json().await?)
}

/// Ollama `/api/generate` backend.
pub struct OllamaClassifier {
    client: Client,
    url: Url,
    model: String,
}

impl OllamaClassifier {
    pub fn new(settings: &ClassifierSettings) -> Result<Self> {
        Ok(Self {
            client: build_client(settings)?,
            url: endpoint_url(&settings.endpoint, "api/generate")?,
            model: settings.model.clone(),
        })
    }

    fn request_body(&self, filename: &str) -> Value {
        json!({
            "model": self.model,
            "prompt": build_prompt(filename),
            "stream": false,
            "format": "json",
            "options": {
                "temperature": 0.0,
                "num_predict": ClassifierConfig::MAX_RESPONSE_TOKENS,
            },
        })
    }
}

/// Pull the generated text out of an Ollama reply.
fn ollama_text(reply: &Value) -> Result<&str> {
    reply
        .get("response")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| SyncError::Classification {
            message: "Ollama reply has no response text".to_string(),
        })
}

#[async_trait]
impl SemanticClassifier for OllamaClassifier {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn classify(&self, filename: &str) -> Result<SemanticResponse> {
        let reply = post_json(&self.client, &self.url, None, &self.request_body(filename)).await?;
        let text = ollama_text(&reply)?;
        debug!("ollama reply for {}: {}", filename, text);
        parse_response(text)
    }
}

/// OpenAI-compatible `/v1/chat/completions` backend.
pub struct OpenAiClassifier {
    client: Client,
    url: Url,
    model: String,
    api_key: Option<String>,
}

impl OpenAiClassifier {
    pub fn new(settings: &ClassifierSettings) -> Result<Self> {
        let api_key = settings
            .api_key_env
            .as_deref()
            .map(api_key_from_env)
            .transpose()?;

        Ok(Self {
            client: build_client(settings)?,
            url: endpoint_url(
                endpoint_or(settings, ClassifierConfig::OPENAI_DEFAULT_ENDPOINT),
                "v1/chat/completions",
            )?,
            model: settings.model.clone(),
            api_key,
        })
    }

    fn request_body(&self, filename: &str) -> Value {
        json!({
            "model": self.model,
            "temperature": 0.0,
            "max_tokens": ClassifierConfig::MAX_RESPONSE_TOKENS,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": super::semantic::PARSE_PROMPT },
                { "role": "user", "content": format!("Filename: {}", filename) },
            ],
        })
    }
}

fn openai_text(reply: &Value) -> Result<&str> {
    reply
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Classification {
            message: "chat completion has no message content".to_string(),
        })
}

#[async_trait]
impl SemanticClassifier for OpenAiClassifier {
    fn name(&self) -> &str {
        "openai"
    }

    fn concurrency_safe(&self) -> bool {
        true
    }

    async fn classify(&self, filename: &str) -> Result<SemanticResponse> {
        let reply = post_json(
            &self.client,
            &self.url,
            self.api_key.as_deref(),
            &self.request_body(filename),
        )
        .await?;
        parse_response(openai_text(&reply)?)
    }
}

/// Anthropic `/v1/messages` backend.
pub struct AnthropicClassifier {
    client: Client,
    url: Url,
    model: String,
    api_key: String,
}

impl AnthropicClassifier {
    /// Reads the key from `api_key_env`, or `ANTHROPIC_API_KEY` when unset.
    pub fn new(settings: &ClassifierSettings) -> Result<Self> {
        let var = settings
            .api_key_env
            .as_deref()
            .unwrap_or(ClassifierConfig::ANTHROPIC_DEFAULT_KEY_ENV);
        Self::with_api_key(settings, api_key_from_env(var)?)
    }

    pub fn with_api_key(settings: &ClassifierSettings, api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: build_client(settings)?,
            url: endpoint_url(
                endpoint_or(settings, ClassifierConfig::ANTHROPIC_DEFAULT_ENDPOINT),
                "v1/messages",
            )?,
            model: settings.model.clone(),
            api_key: api_key.into(),
        })
    }

    fn request_body(&self, filename: &str) -> Value {
        json!({
            "model": self.model,
            "max_tokens": ClassifierConfig::MAX_RESPONSE_TOKENS,
            "temperature": 0.0,
            "system": super::semantic::PARSE_PROMPT,
            "messages": [
                { "role": "user", "content": format!("Filename: {}", filename) },
            ],
        })
    }
}

/// First text block of a Messages API reply.
fn anthropic_text(reply: &Value) -> Result<&str> {
    reply
        .get("content")
        .and_then(Value::as_array)
        .and_then(|blocks| {
            blocks
                .iter()
                .find(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        })
        .and_then(|block| block.get("text"))
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Classification {
            message: "message reply has no text block".to_string(),
        })
}

#[async_trait]
impl SemanticClassifier for AnthropicClassifier {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn concurrency_safe(&self) -> bool {
        true
    }

    async fn classify(&self, filename: &str) -> Result<SemanticResponse> {
        let request = self
            .client
            .post(self.url.clone())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ClassifierConfig::ANTHROPIC_API_VERSION)
            .json(&self.request_body(filename));
        let reply = send_json(request, &self.url).await?;
        parse_response(anthropic_text(&reply)?)
    }
}

/// Build the configured backend, or `None` when the classifier is disabled.
pub fn create_semantic_classifier(
    settings: &ClassifierSettings,
) -> Result<Option<Arc<dyn SemanticClassifier>>> {
    if !settings.enabled {
        return Ok(None);
    }

    let backend: Arc<dyn SemanticClassifier> = match settings.backend {
        ClassifierBackend::Ollama => Arc::new(OllamaClassifier::new(settings)?),
        ClassifierBackend::OpenAi => Arc::new(OpenAiClassifier::new(settings)?),
        ClassifierBackend::Anthropic => Arc::new(AnthropicClassifier::new(settings)?),
    };
    info!(
        "Semantic classifier enabled: {} (model {})",
        backend.name(),
        settings.model
    );
    Ok(Some(backend))
}

//! Local inference servers — Ollama and vLLM.
//!
//! These adapters do not trust static model claims: the dispatcher asks
//! [`Provider::loaded_models`] which models the server has right now. An
//! Ollama instance can additionally act as the catch-all backend, accepting
//! any model name the catalog does not assign elsewhere.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::Instrument;

use super::hosted::{classify_status, http_client};
use super::registry::ProviderRegistry;
use super::{inline_file, preview, CallContext, Provider, ProviderVariant};
use crate::error::ProviderError;

/// Generation timeout for local servers (large local models are slow).
pub const LOCAL_SERVER_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Timeout for the live model listing.
const LIST_TIMEOUT: Duration = Duration::from_secs(3);

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_VLLM_URL: &str = "http://localhost:8000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalServerKind {
    /// Ollama native API (`/api/tags`, `/api/generate`)
    Ollama,
    /// vLLM OpenAI-compatible server (`/v1/models`, `/v1/chat/completions`)
    Vllm,
}

impl LocalServerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::Vllm => "vllm",
        }
    }
}

/// Adapter for an inference server running on this machine.
pub struct LocalServerProvider {
    kind: LocalServerKind,
    base_url: String,
    catch_all: bool,
    timeout: Duration,
    client: reqwest::Client,
    list_client: reqwest::Client,
    registry: Arc<ProviderRegistry>,
    verbose: AtomicBool,
}

impl LocalServerProvider {
    pub fn new(kind: LocalServerKind, base_url: &str, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            kind,
            base_url: normalize_base_url(kind, base_url),
            catch_all: false,
            timeout: LOCAL_SERVER_TIMEOUT,
            client: http_client(LOCAL_SERVER_TIMEOUT),
            list_client: http_client(LIST_TIMEOUT),
            registry,
            verbose: AtomicBool::new(false),
        }
    }

    pub fn ollama(registry: Arc<ProviderRegistry>) -> Self {
        Self::new(LocalServerKind::Ollama, DEFAULT_OLLAMA_URL, registry)
    }

    pub fn vllm(registry: Arc<ProviderRegistry>) -> Self {
        Self::new(LocalServerKind::Vllm, DEFAULT_VLLM_URL, registry)
    }

    /// Mark this server as the last-resort backend for unknown model names.
    pub fn as_catch_all(mut self) -> Self {
        self.catch_all = true;
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = normalize_base_url(self.kind, base_url);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.client = http_client(timeout);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn unreachable(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout {
                provider: self.kind.as_str().to_string(),
                after: self.timeout,
            }
        } else {
            ProviderError::terminal(
                self.kind.as_str(),
                format!("could not reach {} at {}: {}", self.kind.as_str(), self.base_url, e),
            )
        }
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .list_client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_status(self.kind.as_str(), status.as_u16(), None, &text));
        }
        serde_json::from_str(&text).map_err(|e| {
            ProviderError::terminal(self.kind.as_str(), format!("bad model listing: {}", e))
        })
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.unreachable(e))?;
        if !status.is_success() {
            return Err(classify_status(self.kind.as_str(), status.as_u16(), None, &text));
        }
        serde_json::from_str(&text).map_err(|e| {
            ProviderError::terminal(self.kind.as_str(), format!("failed to parse response JSON: {}", e))
        })
    }

    async fn generate(&self, model: &str, prompt: &str) -> Result<String, ProviderError> {
        match self.kind {
            LocalServerKind::Ollama => {
                let body = serde_json::json!({
                    "model": model,
                    "prompt": prompt,
                    "stream": false,
                });
                let json = self.post_json("/api/generate", &body).await?;
                json.get("response")
                    .and_then(|r| r.as_str())
                    .map(|s| s.to_string())
                    .ok_or_else(|| ProviderError::terminal("ollama", "response field missing"))
            }
            LocalServerKind::Vllm => {
                let body = serde_json::json!({
                    "model": model,
                    "messages": [ { "role": "user", "content": prompt } ],
                });
                let json = self.post_json("/v1/chat/completions", &body).await?;
                json.get("choices")
                    .and_then(|c| c.as_array())
                    .and_then(|arr| arr.first())
                    .and_then(|choice| choice.get("message"))
                    .and_then(|msg| msg.get("content"))
                    .and_then(|c| c.as_str())
                    .map(|s| s.to_string())
                    .ok_or_else(|| ProviderError::terminal("vllm", "response contained no choices"))
            }
        }
    }
}

/// vLLM endpoints are often given with their `/v1` suffix; the adapter adds it per request.
fn normalize_base_url(kind: LocalServerKind, url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    match kind {
        LocalServerKind::Vllm => url.strip_suffix("/v1").unwrap_or(url).to_string(),
        LocalServerKind::Ollama => url.to_string(),
    }
}

/// Model names from an Ollama `/api/tags` or OpenAI `/v1/models` listing.
///
/// Ollama reports `name:tag`; a `:latest` tag is also exposed without it.
pub fn parse_model_listing(kind: LocalServerKind, json: &serde_json::Value) -> Vec<String> {
    let (array_key, name_key) = match kind {
        LocalServerKind::Ollama => ("models", "name"),
        LocalServerKind::Vllm => ("data", "id"),
    };
    let mut names = Vec::new();
    for entry in json
        .get(array_key)
        .and_then(|m| m.as_array())
        .into_iter()
        .flatten()
    {
        if let Some(name) = entry.get(name_key).and_then(|n| n.as_str()) {
            names.push(name.to_string());
            if let Some(base) = name.strip_suffix(":latest") {
                names.push(base.to_string());
            }
        }
    }
    names
}

#[async_trait]
impl Provider for LocalServerProvider {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    fn variant(&self) -> ProviderVariant {
        ProviderVariant::LocalServer
    }

    /// A catch-all claims every name the catalog leaves unassigned; a plain
    /// local server makes no static claims at all.
    fn supports_model(&self, model: &str) -> bool {
        self.catch_all && self.registry.family_for(model).is_none()
    }

    fn configure(&mut self, credential: &str) -> Result<(), ProviderError> {
        let url = credential.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ProviderError::terminal(
                self.kind.as_str(),
                format!("expected an http(s) base URL, got '{}'", url),
            ));
        }
        self.base_url = normalize_base_url(self.kind, url);
        Ok(())
    }

    async fn send_prompt(
        &self,
        ctx: &CallContext,
        model: &str,
        prompt: &str,
    ) -> Result<String, ProviderError> {
        let span = tracing::info_span!("provider_call", provider = self.kind.as_str(), model, step = %ctx.step);
        async {
            if self.verbose.load(Ordering::Relaxed) {
                tracing::debug!("[LocalServer] Prompt ({} chars): {}", prompt.len(), preview(prompt, 200));
            }
            tracing::info!("[LocalServer] Generating with {} at {}", model, self.base_url);
            self.generate(model, prompt).await
        }
        .instrument(span)
        .await
    }

    async fn send_prompt_with_file(
        &self,
        ctx: &CallContext,
        model: &str,
        prompt: &str,
        file: &Path,
    ) -> Result<String, ProviderError> {
        let full_prompt = inline_file(self.kind.as_str(), prompt, file).await?;
        self.send_prompt(ctx, model, &full_prompt).await
    }

    fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    async fn loaded_models(&self) -> Result<Vec<String>, ProviderError> {
        let path = match self.kind {
            LocalServerKind::Ollama => "/api/tags",
            LocalServerKind::Vllm => "/v1/models",
        };
        let json = self.get_json(path).await?;
        Ok(parse_model_listing(self.kind, &json))
    }

    fn accepts_any_model(&self) -> bool {
        self.catch_all
    }
}

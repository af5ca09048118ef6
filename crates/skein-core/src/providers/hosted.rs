//! Hosted API adapters — OpenAI-compatible, Anthropic Messages and Gemini.
//!
//! One adapter type covers every hosted family; the wire format differs per
//! [`ApiFlavor`]. OpenAI, xAI, DeepSeek, Moonshot and OpenRouter all speak
//! the OpenAI chat-completions dialect and only differ in base URL.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::Instrument;

use super::registry::ProviderRegistry;
use super::{inline_file, preview, CallContext, Provider, ProviderVariant};
use crate::error::ProviderError;

/// Default request timeout for hosted APIs.
pub const HOSTED_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Request/response dialect of a hosted API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    /// POST {base}/chat/completions, Bearer auth
    OpenAiCompatible,
    /// POST {base}/v1/messages, x-api-key auth
    Anthropic,
    /// POST {base}/v1beta/models/{model}:generateContent, key query param
    Gemini,
}

/// Static description of a built-in hosted provider.
struct HostedDefaults {
    name: &'static str,
    flavor: ApiFlavor,
    base_url: &'static str,
    /// Environment variables holding the API key, in priority order
    key_env: &'static [&'static str],
    /// Prefix stripped from the model name before sending
    strip_prefix: Option<&'static str>,
}

const HOSTED_PROVIDERS: &[HostedDefaults] = &[
    HostedDefaults {
        name: "openai",
        flavor: ApiFlavor::OpenAiCompatible,
        base_url: "https://api.openai.com/v1",
        key_env: &["OPENAI_API_KEY"],
        strip_prefix: None,
    },
    HostedDefaults {
        name: "anthropic",
        flavor: ApiFlavor::Anthropic,
        base_url: "https://api.anthropic.com",
        key_env: &["ANTHROPIC_API_KEY", "ANTHROPIC_AUTH_TOKEN"],
        strip_prefix: None,
    },
    HostedDefaults {
        name: "google",
        flavor: ApiFlavor::Gemini,
        base_url: "https://generativelanguage.googleapis.com",
        key_env: &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
        strip_prefix: None,
    },
    HostedDefaults {
        name: "xai",
        flavor: ApiFlavor::OpenAiCompatible,
        base_url: "https://api.x.ai/v1",
        key_env: &["XAI_API_KEY"],
        strip_prefix: None,
    },
    HostedDefaults {
        name: "deepseek",
        flavor: ApiFlavor::OpenAiCompatible,
        base_url: "https://api.deepseek.com/v1",
        key_env: &["DEEPSEEK_API_KEY"],
        strip_prefix: None,
    },
    HostedDefaults {
        name: "moonshot",
        flavor: ApiFlavor::OpenAiCompatible,
        base_url: "https://api.moonshot.ai/v1",
        key_env: &["MOONSHOT_API_KEY"],
        strip_prefix: None,
    },
    HostedDefaults {
        name: "openrouter",
        flavor: ApiFlavor::OpenAiCompatible,
        base_url: "https://openrouter.ai/api/v1",
        key_env: &["OPENROUTER_API_KEY"],
        strip_prefix: Some("openrouter/"),
    },
];

/// Names of every built-in hosted provider.
pub fn builtin_hosted_names() -> Vec<&'static str> {
    HOSTED_PROVIDERS.iter().map(|d| d.name).collect()
}

/// Environment variables consulted for a hosted provider's key.
pub fn key_env_vars(name: &str) -> &'static [&'static str] {
    HOSTED_PROVIDERS
        .iter()
        .find(|d| d.name == name)
        .map(|d| d.key_env)
        .unwrap_or(&[])
}

/// Adapter for a hosted LLM API.
pub struct HostedApiProvider {
    name: String,
    flavor: ApiFlavor,
    base_url: String,
    api_key: Option<String>,
    strip_prefix: Option<String>,
    max_tokens: u32,
    timeout: Duration,
    client: reqwest::Client,
    registry: Arc<ProviderRegistry>,
    verbose: AtomicBool,
}

impl HostedApiProvider {
    pub fn new(
        name: &str,
        flavor: ApiFlavor,
        base_url: &str,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            name: name.to_string(),
            flavor,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
            strip_prefix: None,
            max_tokens: 8192,
            timeout: HOSTED_TIMEOUT,
            client: http_client(HOSTED_TIMEOUT),
            registry,
            verbose: AtomicBool::new(false),
        }
    }

    /// Build one of the built-in hosted providers by name.
    pub fn builtin(name: &str, registry: Arc<ProviderRegistry>) -> Option<Self> {
        let defaults = HOSTED_PROVIDERS.iter().find(|d| d.name == name)?;
        let mut provider = Self::new(defaults.name, defaults.flavor, defaults.base_url, registry);
        provider.strip_prefix = defaults.strip_prefix.map(|s| s.to_string());
        Some(provider)
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.client = http_client(timeout);
        self
    }

    pub fn flavor(&self) -> ApiFlavor {
        self.flavor
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        match self.api_key.as_deref() {
            Some(key) if !key.is_empty() => Ok(key),
            _ => {
                let vars = key_env_vars(&self.name);
                let hint = if vars.is_empty() {
                    "an api_key in the provider config".to_string()
                } else {
                    vars.join(" or ")
                };
                Err(ProviderError::terminal(
                    &self.name,
                    format!("no API key configured; set {}", hint),
                ))
            }
        }
    }

    fn wire_model<'a>(&self, model: &'a str) -> &'a str {
        match &self.strip_prefix {
            Some(prefix) => model.strip_prefix(prefix.as_str()).unwrap_or(model),
            None => model,
        }
    }

    /// POST a JSON body and return the parsed response, mapping HTTP failures.
    async fn post_json(
        &self,
        request: reqwest::RequestBuilder,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, ProviderError> {
        let response = request
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::terminal(&self.name, format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(classify_status(&self.name, status.as_u16(), retry_after.as_deref(), &text));
        }

        serde_json::from_str(&text)
            .map_err(|e| ProviderError::terminal(&self.name, format!("failed to parse response JSON: {}", e)))
    }

    fn map_transport_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout {
                provider: self.name.clone(),
                after: self.timeout,
            }
        } else {
            ProviderError::terminal(&self.name, format!("HTTP request failed: {}", e))
        }
    }

    async fn call_openai_compatible(&self, model: &str, prompt: &str) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.wire_model(model),
            "messages": [
                { "role": "user", "content": prompt }
            ]
        });

        let request = self.client.post(&url).bearer_auth(self.api_key()?);
        let json = self.post_json(request, &body).await?;

        json.get("choices")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| ProviderError::terminal(&self.name, "response contained no choices"))
    }

    async fn call_anthropic(&self, model: &str, prompt: &str) -> Result<String, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = serde_json::json!({
            "model": self.wire_model(model),
            "max_tokens": self.max_tokens,
            "messages": [
                { "role": "user", "content": prompt }
            ]
        });

        let request = self
            .client
            .post(&url)
            .header("x-api-key", self.api_key()?)
            .header("anthropic-version", "2023-06-01");
        let json = self.post_json(request, &body).await?;

        json.get("content")
            .and_then(|c| c.as_array())
            .and_then(|arr| {
                arr.iter()
                    .filter(|block| block.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
                    .map(|s| s.to_string())
                    .reduce(|a, b| format!("{}\n{}", a, b))
            })
            .ok_or_else(|| ProviderError::terminal(&self.name, "response contained no text blocks"))
    }

    async fn call_gemini(&self, model: &str, prompt: &str) -> Result<String, ProviderError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url,
            self.wire_model(model)
        );
        let body = serde_json::json!({
            "contents": [
                { "role": "user", "parts": [ { "text": prompt } ] }
            ]
        });

        let request = self.client.post(&url).query(&[("key", self.api_key()?)]);
        let json = self.post_json(request, &body).await?;

        json.get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .and_then(|cand| cand.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(|parts| parts.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .ok_or_else(|| ProviderError::terminal(&self.name, "response contained no candidates"))
    }
}

#[async_trait]
impl Provider for HostedApiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn variant(&self) -> ProviderVariant {
        ProviderVariant::HostedApi
    }

    fn supports_model(&self, model: &str) -> bool {
        self.registry.is_owned_by(model, &self.name)
    }

    fn configure(&mut self, credential: &str) -> Result<(), ProviderError> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(ProviderError::terminal(&self.name, "empty API key"));
        }
        self.api_key = Some(credential.to_string());
        Ok(())
    }

    async fn send_prompt(
        &self,
        ctx: &CallContext,
        model: &str,
        prompt: &str,
    ) -> Result<String, ProviderError> {
        let span = tracing::info_span!("provider_call", provider = %self.name, model, step = %ctx.step);
        async {
            if self.verbose.load(Ordering::Relaxed) {
                tracing::debug!("[Hosted] Prompt ({} chars): {}", prompt.len(), preview(prompt, 200));
            }
            tracing::info!("[Hosted] Calling {} at {}", self.name, self.base_url);

            let output = match self.flavor {
                ApiFlavor::OpenAiCompatible => self.call_openai_compatible(model, prompt).await,
                ApiFlavor::Anthropic => self.call_anthropic(model, prompt).await,
                ApiFlavor::Gemini => self.call_gemini(model, prompt).await,
            }?;

            if self.verbose.load(Ordering::Relaxed) {
                tracing::debug!("[Hosted] Response: {}", preview(&output, 200));
            }
            Ok::<_, ProviderError>(output)
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
        let full_prompt = inline_file(&self.name, prompt, file).await?;
        self.send_prompt(ctx, model, &full_prompt).await
    }

    fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }
}

pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Map a non-success HTTP status to a provider error.
///
/// 429 and overload statuses are transient; a `Retry-After` header is folded
/// into the message so the retry executor can honour it.
pub fn classify_status(provider: &str, status: u16, retry_after: Option<&str>, body: &str) -> ProviderError {
    let mut message = format!("API returned {}: {}", status, preview(body.trim(), 500));
    match status {
        429 | 503 | 529 => {
            if let Some(secs) = retry_after.and_then(|v| v.trim().parse::<u64>().ok()) {
                message.push_str(&format!(" (retry after {} seconds)", secs));
            }
            ProviderError::transient(provider, message)
        }
        _ => ProviderError::terminal(provider, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::retry::{is_transient, retry_hint};

    fn registry() -> Arc<ProviderRegistry> {
        Arc::new(ProviderRegistry::builtin())
    }

    #[test]
    fn test_builtin_supports_models() {
        let openai = HostedApiProvider::builtin("openai", registry()).unwrap();
        assert!(openai.supports_model("gpt-4o"));
        assert!(openai.supports_model("o4-mini"));
        assert!(!openai.supports_model("claude-sonnet-4"));

        let anthropic = HostedApiProvider::builtin("anthropic", registry()).unwrap();
        assert!(anthropic.supports_model("claude-sonnet-4"));
        assert!(!anthropic.supports_model("claude-code"));
        assert_eq!(anthropic.flavor(), ApiFlavor::Anthropic);
    }

    #[test]
    fn test_openrouter_strips_prefix() {
        let provider = HostedApiProvider::builtin("openrouter", registry()).unwrap();
        assert_eq!(provider.wire_model("openrouter/meta-llama/llama-3-70b"), "meta-llama/llama-3-70b");
    }

    #[test]
    fn test_configure_rejects_empty_key() {
        let mut provider = HostedApiProvider::builtin("xai", registry()).unwrap();
        assert!(provider.configure("  ").is_err());
        assert!(provider.configure("xai-123").is_ok());
        assert_eq!(provider.api_key().unwrap(), "xai-123");
    }

    #[test]
    fn test_missing_key_names_env_var() {
        let provider = HostedApiProvider::builtin("deepseek", registry()).unwrap();
        let err = provider.api_key().unwrap_err();
        assert!(err.to_string().contains("DEEPSEEK_API_KEY"));
        assert!(!is_transient(&err));
    }

    #[test]
    fn test_classify_status() {
        let err = classify_status("openai", 429, Some("7"), "Too Many Requests");
        assert!(is_transient(&err));
        assert_eq!(retry_hint(&err.message()), Some(Duration::from_secs(7)));

        let err = classify_status("openai", 401, None, "invalid API key");
        assert!(!is_transient(&err));
    }
}

//! Provider dispatcher — turns a model name into a concrete adapter.
//!
//! Resolution order is fixed:
//!
//! 1. local inference servers that have the model loaded right now,
//! 2. CLI agent families (exact name or prefix); a missing executable is a
//!    hard error, never a reason to look further,
//! 3. hosted API families, most specific catalog entry first,
//! 4. the catch-all local server, for names no catalog family claims.
//!
//! Anything else is a configuration error and is not retried.

use std::path::Path;
use std::sync::Arc;

use super::cli_agent::{CliAgentProvider, CliTool};
use super::hosted::{builtin_hosted_names, HostedApiProvider};
use super::local_server::{LocalServerKind, LocalServerProvider, DEFAULT_OLLAMA_URL, DEFAULT_VLLM_URL};
use super::registry::ProviderRegistry;
use super::retry::{is_transient, with_retry, RetryPolicy};
use super::{CallContext, Provider, ProviderVariant};
use crate::config::EnvConfig;
use crate::error::EngineError;

pub struct ProviderDispatcher {
    registry: Arc<ProviderRegistry>,
    providers: Vec<Arc<dyn Provider>>,
    retry: RetryPolicy,
}

impl ProviderDispatcher {
    pub fn new(registry: Arc<ProviderRegistry>, providers: Vec<Arc<dyn Provider>>) -> Self {
        Self {
            registry,
            providers,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Build the full set of built-in adapters from `env`.
    pub fn from_env(env: &EnvConfig, registry: Arc<ProviderRegistry>) -> Self {
        let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

        // ─── Local servers ──────────────────────────────────────────────
        let ollama_url = env
            .provider("ollama")
            .and_then(|s| s.base_url.as_deref())
            .unwrap_or(DEFAULT_OLLAMA_URL);
        let mut ollama = LocalServerProvider::new(LocalServerKind::Ollama, ollama_url, registry.clone())
            .with_timeout(env.timeouts.local_server());
        if env.catch_all == "ollama" {
            ollama = ollama.as_catch_all();
        }
        providers.push(Arc::new(ollama));

        let vllm_url = env.provider("vllm").and_then(|s| s.base_url.as_deref());
        if vllm_url.is_some() || env.catch_all == "vllm" {
            let mut vllm = LocalServerProvider::new(
                LocalServerKind::Vllm,
                vllm_url.unwrap_or(DEFAULT_VLLM_URL),
                registry.clone(),
            )
            .with_timeout(env.timeouts.local_server());
            if env.catch_all == "vllm" {
                vllm = vllm.as_catch_all();
            }
            providers.push(Arc::new(vllm));
        }

        // ─── CLI agents ─────────────────────────────────────────────────
        for tool in CliTool::all() {
            let mut agent = CliAgentProvider::new(tool, registry.clone())
                .with_timeout(env.timeouts.cli_agent());
            if let Some(binary) = env.provider(tool.provider_name()).and_then(|s| s.binary.as_deref()) {
                agent = agent.with_binary(binary);
            }
            providers.push(Arc::new(agent));
        }

        // ─── Hosted APIs ────────────────────────────────────────────────
        for name in builtin_hosted_names() {
            let Some(mut hosted) = HostedApiProvider::builtin(name, registry.clone()) else {
                continue;
            };
            hosted = hosted.with_timeout(env.timeouts.hosted_api());
            if let Some(settings) = env.provider(name) {
                if let Some(url) = settings.base_url.as_deref() {
                    hosted = hosted.with_base_url(url);
                }
                if let Some(key) = settings.api_key.as_deref() {
                    if let Err(e) = hosted.configure(key) {
                        tracing::warn!("[Dispatcher] Ignoring credential for {}: {}", name, e);
                    }
                }
            }
            providers.push(Arc::new(hosted));
        }

        Self::new(registry, providers).with_retry_policy(env.retry.clone())
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn providers(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn set_verbose(&self, verbose: bool) {
        for provider in &self.providers {
            provider.set_verbose(verbose);
        }
    }

    fn of_variant(&self, variant: ProviderVariant) -> impl Iterator<Item = &Arc<dyn Provider>> {
        self.providers.iter().filter(move |p| p.variant() == variant)
    }

    /// Pick the adapter that serves `model`.
    pub async fn detect(&self, model: &str) -> Result<Arc<dyn Provider>, EngineError> {
        for stage in [
            ProviderVariant::LocalServer,
            ProviderVariant::CliAgent,
            ProviderVariant::HostedApi,
        ] {
            let found = match stage {
                ProviderVariant::LocalServer => self.detect_loaded(model).await,
                ProviderVariant::CliAgent => self.detect_cli_agent(model)?,
                ProviderVariant::HostedApi => self.detect_hosted(model),
            };
            if let Some(provider) = found {
                tracing::debug!(
                    "[Dispatcher] {} -> {} ({})",
                    model,
                    provider.name(),
                    provider.variant().as_str()
                );
                return Ok(provider);
            }
        }

        if self.registry.family_for(model).is_none() {
            if let Some(catch_all) = self.providers.iter().find(|p| p.accepts_any_model()) {
                tracing::debug!("[Dispatcher] {} -> {} (catch-all)", model, catch_all.name());
                return Ok(catch_all.clone());
            }
        }

        Err(EngineError::Config(format!(
            "No provider available for model '{}'",
            model
        )))
    }

    async fn detect_loaded(&self, model: &str) -> Option<Arc<dyn Provider>> {
        for provider in self.of_variant(ProviderVariant::LocalServer) {
            match provider.loaded_models().await {
                Ok(models) if models.iter().any(|m| m == model) => return Some(provider.clone()),
                Ok(_) => {}
                Err(e) => tracing::debug!("[Dispatcher] {} model list unavailable: {}", provider.name(), e),
            }
        }
        None
    }

    fn detect_cli_agent(&self, model: &str) -> Result<Option<Arc<dyn Provider>>, EngineError> {
        let Some(family) = self
            .registry
            .family_for(model)
            .filter(|f| f.variant == ProviderVariant::CliAgent)
        else {
            return Ok(None);
        };

        let agent = self
            .of_variant(ProviderVariant::CliAgent)
            .find(|p| p.name() == family.provider)
            .ok_or_else(|| {
                EngineError::Config(format!(
                    "Model '{}' belongs to {}, but no adapter for it is configured",
                    model, family.provider
                ))
            })?;

        if !agent.is_available() {
            return Err(EngineError::Config(format!(
                "Model '{}' requires the {} CLI ('{}'), which was not found in PATH",
                model,
                family.provider,
                family.binary.as_deref().unwrap_or(family.provider.as_str())
            )));
        }
        Ok(Some(agent.clone()))
    }

    fn detect_hosted(&self, model: &str) -> Option<Arc<dyn Provider>> {
        let mut hosted = self.of_variant(ProviderVariant::HostedApi);
        match self.registry.family_for(model) {
            Some(family) if family.variant == ProviderVariant::HostedApi => hosted
                .find(|p| p.name() == family.provider)
                .cloned(),
            _ => hosted.find(|p| p.supports_model(model)).cloned(),
        }
    }

    /// Resolve `model` and send the prompt, retrying transient failures.
    pub async fn call(
        &self,
        ctx: &CallContext,
        model: &str,
        prompt: &str,
        file: Option<&Path>,
    ) -> Result<String, EngineError> {
        let provider = self.detect(model).await?;
        let provider = &provider;
        let output = with_retry(
            |attempt| async move {
                if attempt > 1 {
                    tracing::info!("[Dispatcher] {} attempt {} on {}", ctx.step, attempt, provider.name());
                }
                match file {
                    Some(path) => provider.send_prompt_with_file(ctx, model, prompt, path).await,
                    None => provider.send_prompt(ctx, model, prompt).await,
                }
            },
            is_transient,
            &self.retry,
        )
        .await?;
        Ok(output)
    }
}

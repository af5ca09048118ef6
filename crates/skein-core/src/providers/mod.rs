//! LLM provider adapters and the dispatch layer in front of them.
//!
//! ```text
//! Step ──► ProviderDispatcher::detect(model) ──► Arc<dyn Provider>
//!                │                                   │
//!          ProviderRegistry                  with_retry(send_prompt)
//!                                                    │
//!                     ┌──────────────┬───────────────┴─────────┐
//!                HostedApi       LocalServer               CliAgent
//!          (OpenAI, Anthropic,  (Ollama, vLLM)     (claude, gemini, codex)
//!           Gemini, xAI, ...)
//! ```
//!
//! Every adapter implements the same capability trait; the dispatcher picks
//! one by matching on its [`ProviderVariant`] rather than its concrete type.

pub mod cli_agent;
pub mod dispatcher;
pub mod hosted;
pub mod local_server;
pub mod registry;
pub mod retry;

pub use cli_agent::{CliAgentProvider, CliTool};
pub use dispatcher::ProviderDispatcher;
pub use hosted::{ApiFlavor, HostedApiProvider};
pub use local_server::{LocalServerKind, LocalServerProvider};
pub use registry::{ModelFamily, ProviderRegistry};
pub use retry::{is_transient, with_retry, RetryPolicy};

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// The three shapes of backend an adapter can be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderVariant {
    /// Remote API reached over HTTPS with a credential
    HostedApi,
    /// Inference server on this machine whose loaded models can be listed
    LocalServer,
    /// Agentic CLI tool spawned as a subprocess
    CliAgent,
}

impl ProviderVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HostedApi => "hosted_api",
            Self::LocalServer => "local_server",
            Self::CliAgent => "cli_agent",
        }
    }
}

/// Per-call context handed to adapters.
///
/// Carries what the adapter needs to label its logs and, for CLI agents,
/// which extra directories the tool may touch.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Name of the step making the call
    pub step: String,
    /// Directories a CLI agent may access besides its working directory
    pub allowed_paths: Vec<PathBuf>,
    /// Working directory for subprocess-based adapters
    pub cwd: Option<PathBuf>,
}

impl CallContext {
    pub fn for_step(step: &str) -> Self {
        Self {
            step: step.to_string(),
            ..Self::default()
        }
    }
}

/// Uniform capability contract implemented by every backend adapter.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn variant(&self) -> ProviderVariant;

    /// Static claim: does this adapter serve `model` according to the catalog.
    fn supports_model(&self, model: &str) -> bool;

    /// Install the credential, base URL, or binary path for this adapter.
    fn configure(&mut self, credential: &str) -> Result<(), ProviderError>;

    async fn send_prompt(
        &self,
        ctx: &CallContext,
        model: &str,
        prompt: &str,
    ) -> Result<String, ProviderError>;

    async fn send_prompt_with_file(
        &self,
        ctx: &CallContext,
        model: &str,
        prompt: &str,
        file: &Path,
    ) -> Result<String, ProviderError>;

    fn set_verbose(&self, verbose: bool);

    /// Models currently loaded (local servers only; queried live).
    async fn loaded_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(Vec::new())
    }

    /// Whether the adapter can run at all (CLI agents: binary found).
    fn is_available(&self) -> bool {
        true
    }

    /// Whether this adapter is the last-resort catch-all.
    fn accepts_any_model(&self) -> bool {
        false
    }
}

/// Read a text attachment and fold it into the prompt.
///
/// Adapters whose wire format has no file part use this to inline the file.
pub(crate) async fn inline_file(
    provider: &str,
    prompt: &str,
    file: &Path,
) -> Result<String, ProviderError> {
    let bytes = tokio::fs::read(file).await.map_err(|e| {
        ProviderError::terminal(provider, format!("failed to read '{}': {}", file.display(), e))
    })?;
    let content = String::from_utf8(bytes).map_err(|_| {
        ProviderError::terminal(
            provider,
            format!("'{}' is not a UTF-8 text file", file.display()),
        )
    })?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| file.display().to_string());
    Ok(format!("File: {}\n```\n{}\n```\n\n{}", name, content, prompt))
}

/// Shorten a string for log previews.
pub(crate) fn preview(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

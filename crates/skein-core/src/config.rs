//! Runtime configuration for the engine.
//!
//! `EnvConfig` starts from environment variables and is optionally overlaid
//! by a YAML file (`~/.skein/config.yaml` by default):
//!
//! ```yaml
//! providers:
//!   openai:
//!     api_key: ${OPENAI_API_KEY}
//!   ollama:
//!     base_url: ${OLLAMA_HOST:-http://localhost:11434}
//!   claude-code:
//!     binary: /opt/tools/claude
//! catch_all: ollama
//! memory_file: ./memory.md
//! allowed_tools: [git, ls, cat]
//! retry:
//!   max_retries: 5
//!   initial_wait: 2000
//! timeouts:
//!   hosted_api: 600
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::providers::hosted::{builtin_hosted_names, key_env_vars};
use crate::providers::RetryPolicy;

/// Per-provider settings. Which fields matter depends on the variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// API key for hosted providers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Endpoint override (hosted or local servers)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Executable path for CLI agents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
}

/// Per-variant call timeouts, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub hosted_api: u64,
    pub local_server: u64,
    pub cli_agent: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            hosted_api: 10 * 60,
            local_server: 30 * 60,
            cli_agent: 30 * 60,
        }
    }
}

impl Timeouts {
    pub fn hosted_api(&self) -> Duration {
        Duration::from_secs(self.hosted_api)
    }

    pub fn local_server(&self) -> Duration {
        Duration::from_secs(self.local_server)
    }

    pub fn cli_agent(&self) -> Duration {
        Duration::from_secs(self.cli_agent)
    }
}

/// Provider credentials, endpoints and engine-wide knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub providers: BTreeMap<String, ProviderSettings>,
    /// Local server used for model names no catalog family claims
    /// (`ollama`, `vllm`, or `none`).
    pub catch_all: String,
    pub memory_file: Option<PathBuf>,
    /// Commands `tool:` inputs may run (matched on the first word)
    pub allowed_tools: Vec<String>,
    pub retry: RetryPolicy,
    pub timeouts: Timeouts,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            providers: BTreeMap::new(),
            catch_all: "ollama".to_string(),
            memory_file: None,
            allowed_tools: Vec::new(),
            retry: RetryPolicy::default(),
            timeouts: Timeouts::default(),
        }
    }
}

impl EnvConfig {
    /// Build from process environment variables only.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        for name in builtin_hosted_names() {
            if let Some(key) = key_env_vars(name).iter().find_map(|var| get(var)) {
                config.settings_mut(name).api_key = Some(key);
            }
        }

        if let Some(host) = get("OLLAMA_HOST") {
            config.settings_mut("ollama").base_url = Some(normalize_host(&host));
        }
        if let Some(endpoint) = get("VLLM_ENDPOINT") {
            config.settings_mut("vllm").base_url = Some(endpoint);
        }
        if let Some(path) = get("SKEIN_MEMORY_FILE") {
            config.memory_file = Some(PathBuf::from(path));
        }
        if let Some(tools) = get("SKEIN_ALLOWED_TOOLS") {
            config.allowed_tools = tools
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
        }
        config
    }

    /// Environment, overlaid by `path` (or the default file when it exists).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::from_env();
        let file = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path().filter(|p| p.exists()),
        };
        if let Some(file) = file {
            let content = std::fs::read_to_string(&file).map_err(|e| {
                EngineError::Config(format!("cannot read config '{}': {}", file.display(), e))
            })?;
            config.overlay_yaml(&content)?;
            tracing::info!("[Config] Loaded {}", file.display());
        }
        Ok(config)
    }

    /// Merge a YAML document over this config. `${VAR}` references are expanded.
    pub fn overlay_yaml(&mut self, content: &str) -> Result<()> {
        let expanded = resolve_env_vars(content);
        let file: ConfigFile = serde_yaml::from_str(&expanded)?;

        for (name, settings) in file.providers {
            let target = self.settings_mut(&name);
            if settings.api_key.is_some() {
                target.api_key = settings.api_key;
            }
            if settings.base_url.is_some() {
                target.base_url = settings.base_url;
            }
            if settings.binary.is_some() {
                target.binary = settings.binary;
            }
        }
        if let Some(catch_all) = file.catch_all {
            self.catch_all = catch_all;
        }
        if file.memory_file.is_some() {
            self.memory_file = file.memory_file;
        }
        if let Some(tools) = file.allowed_tools {
            self.allowed_tools = tools;
        }
        if let Some(retry) = file.retry {
            self.retry = retry;
        }
        if let Some(timeouts) = file.timeouts {
            self.timeouts = timeouts;
        }
        Ok(())
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderSettings> {
        self.providers.get(name)
    }

    pub fn settings_mut(&mut self, name: &str) -> &mut ProviderSettings {
        self.providers.entry(name.to_string()).or_default()
    }

    pub fn api_key(&self, name: &str) -> Option<&str> {
        self.provider(name).and_then(|s| s.api_key.as_deref())
    }

    /// Whether `command` (a `tool:` input) is allowed to run.
    pub fn is_tool_allowed(&self, command: &str) -> bool {
        let program = command.split_whitespace().next().unwrap_or("");
        !program.is_empty() && self.allowed_tools.iter().any(|t| t == program)
    }
}

/// On-disk shape of the config file; every field optional.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    providers: BTreeMap<String, ProviderSettings>,
    catch_all: Option<String>,
    memory_file: Option<PathBuf>,
    allowed_tools: Option<Vec<String>>,
    retry: Option<RetryPolicy>,
    timeouts: Option<Timeouts>,
}

/// Settings for callers embedding the engine in a server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base directory for relative file refs when no runtime dir is given
    pub data_dir: Option<PathBuf>,
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".skein").join("config.yaml"))
}

/// `OLLAMA_HOST` may be a bare `host:port`.
fn normalize_host(host: &str) -> String {
    let host = host.trim();
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    }
}

/// Resolve `${VAR}` and `${VAR:-default}` references.
/// Unset variables without a default are left as written.
pub fn resolve_env_vars(input: &str) -> String {
    static VAR_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(re) = VAR_RE
        .get_or_init(|| Regex::new(r"\$\{([^}]+)\}").ok())
        .as_ref()
    else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let expr = &caps[1];
        match expr.split_once(":-") {
            Some((name, default)) => std::env::var(name).unwrap_or_else(|_| default.to_string()),
            None => std::env::var(expr).unwrap_or_else(|_| format!("${{{}}}", expr)),
        }
    })
    .to_string()
}

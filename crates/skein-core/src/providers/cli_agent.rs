//! Local agentic CLI tools driven as one-shot subprocesses.
//!
//! Each call spawns the tool in non-interactive mode (`claude -p`,
//! `gemini -p`, `codex exec`), waits for it to exit and returns its stdout.
//! A ticker task logs elapsed time while the agent works; the child is
//! killed if the call times out.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::Instrument;

use super::registry::ProviderRegistry;
use super::retry::has_transient_signature;
use super::{preview, CallContext, Provider, ProviderVariant};
use crate::error::ProviderError;
use crate::shell_env;

/// Default wall-clock limit for one agent run.
pub const CLI_AGENT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const TICK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliTool {
    ClaudeCode,
    GeminiCli,
    Codex,
}

impl CliTool {
    pub fn all() -> [CliTool; 3] {
        [CliTool::ClaudeCode, CliTool::GeminiCli, CliTool::Codex]
    }

    /// Provider name, as used in the registry.
    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude-code",
            Self::GeminiCli => "gemini-cli",
            Self::Codex => "openai-codex",
        }
    }

    pub fn default_binary(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude",
            Self::GeminiCli => "gemini",
            Self::Codex => "codex",
        }
    }

    /// Command-line arguments for one non-interactive run.
    pub fn build_args(
        &self,
        model: Option<&str>,
        prompt: &str,
        allowed_paths: &[PathBuf],
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        match self {
            Self::ClaudeCode => {
                args.push("-p".into());
                args.push(prompt.into());
                args.push("--output-format".into());
                args.push("text".into());
                if let Some(m) = model {
                    args.push("--model".into());
                    args.push(m.into());
                }
                for path in allowed_paths {
                    args.push("--add-dir".into());
                    args.push(path.into());
                }
            }
            Self::GeminiCli => {
                if let Some(m) = model {
                    args.push("-m".into());
                    args.push(m.into());
                }
                if !allowed_paths.is_empty() {
                    let joined = allowed_paths
                        .iter()
                        .map(|p| p.to_string_lossy().to_string())
                        .collect::<Vec<_>>()
                        .join(",");
                    args.push("--include-directories".into());
                    args.push(joined.into());
                }
                args.push("-p".into());
                args.push(prompt.into());
            }
            Self::Codex => {
                args.push("exec".into());
                if let Some(m) = model {
                    args.push("-m".into());
                    args.push(m.into());
                }
                for path in allowed_paths {
                    args.push("--add-dir".into());
                    args.push(path.into());
                }
                args.push(prompt.into());
            }
        }
        args
    }
}

/// Adapter for an agentic CLI tool installed on this machine.
pub struct CliAgentProvider {
    tool: CliTool,
    binary_override: Option<PathBuf>,
    timeout: Duration,
    registry: Arc<ProviderRegistry>,
    verbose: AtomicBool,
}

impl CliAgentProvider {
    pub fn new(tool: CliTool, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            tool,
            binary_override: None,
            timeout: CLI_AGENT_TIMEOUT,
            registry,
            verbose: AtomicBool::new(false),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary_override = Some(binary.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn tool(&self) -> CliTool {
        self.tool
    }

    /// Executable name the catalog expects for this tool.
    pub fn binary_name(&self) -> String {
        self.registry
            .family_by_provider(self.tool.provider_name())
            .and_then(|f| f.binary.clone())
            .unwrap_or_else(|| self.tool.default_binary().to_string())
    }

    pub fn resolve_binary(&self) -> Option<PathBuf> {
        match &self.binary_override {
            Some(path) => shell_env::which(&path.to_string_lossy()),
            None => shell_env::which(&self.binary_name()),
        }
    }

    /// Model flag for `model`: the part after the family prefix, if any.
    ///
    /// `claude-code` runs the tool's default model; `claude-code-opus` passes
    /// `--model opus`.
    pub fn model_flag(&self, model: &str) -> Option<String> {
        let family = self.registry.family_by_provider(self.tool.provider_name())?;
        if family.exact.iter().any(|e| e == model) {
            return None;
        }
        family
            .prefixes
            .iter()
            .filter_map(|p| model.strip_prefix(p.as_str()))
            .filter(|rest| !rest.is_empty())
            .min_by_key(|rest| rest.len())
            .map(|s| s.to_string())
    }

    async fn run(&self, ctx: &CallContext, model: &str, prompt: &str) -> Result<String, ProviderError> {
        let name = self.tool.provider_name();
        let binary = self.resolve_binary().ok_or_else(|| ProviderError::ToolNotFound {
            provider: name.to_string(),
            binary: self.binary_name(),
        })?;

        let args = self
            .tool
            .build_args(self.model_flag(model).as_deref(), prompt, &ctx.allowed_paths);

        let mut cmd = Command::new(&binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &ctx.cwd {
            cmd.current_dir(cwd);
        }

        tracing::info!(
            "[CliAgent] Spawning {} ({} args, {} allowed paths)",
            binary.display(),
            args.len(),
            ctx.allowed_paths.len()
        );
        if self.verbose.load(Ordering::Relaxed) {
            tracing::debug!("[CliAgent] Prompt ({} chars): {}", prompt.len(), preview(prompt, 200));
        }

        let child = cmd.spawn().map_err(|e| {
            ProviderError::terminal(
                name,
                format!("failed to spawn '{}': {}", binary.display(), e),
            )
        })?;

        let started = Instant::now();
        let step = ctx.step.clone();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                tracing::info!(
                    "[CliAgent] {} still working on '{}' ({}s elapsed)",
                    name,
                    step,
                    started.elapsed().as_secs()
                );
            }
        });

        let waited = tokio::time::timeout(self.timeout, child.wait_with_output()).await;
        ticker.abort();

        let output = match waited {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ProviderError::terminal(name, format!("failed to wait for agent: {}", e)))
            }
            Err(_) => {
                tracing::warn!("[CliAgent] {} timed out after {:?}; process killed", name, self.timeout);
                return Err(ProviderError::Timeout {
                    provider: name.to_string(),
                    after: self.timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let detail = if stderr.is_empty() { &stdout } else { &stderr };
            let message = format!("exited with {}: {}", output.status, preview(detail, 500));
            return Err(if has_transient_signature(detail) {
                ProviderError::transient(name, message)
            } else {
                ProviderError::terminal(name, message)
            });
        }

        tracing::info!(
            "[CliAgent] {} finished in {}s ({} chars)",
            name,
            started.elapsed().as_secs(),
            stdout.len()
        );
        Ok(stdout)
    }
}

#[async_trait]
impl Provider for CliAgentProvider {
    fn name(&self) -> &str {
        self.tool.provider_name()
    }

    fn variant(&self) -> ProviderVariant {
        ProviderVariant::CliAgent
    }

    fn supports_model(&self, model: &str) -> bool {
        self.registry.is_owned_by(model, self.tool.provider_name())
    }

    /// The credential of a CLI agent is the path to its executable.
    fn configure(&mut self, credential: &str) -> Result<(), ProviderError> {
        let path = credential.trim();
        if path.is_empty() {
            return Err(ProviderError::terminal(self.tool.provider_name(), "empty binary path"));
        }
        self.binary_override = Some(PathBuf::from(path));
        Ok(())
    }

    async fn send_prompt(
        &self,
        ctx: &CallContext,
        model: &str,
        prompt: &str,
    ) -> Result<String, ProviderError> {
        let span = tracing::info_span!("provider_call", provider = self.tool.provider_name(), model, step = %ctx.step);
        self.run(ctx, model, prompt).instrument(span).await
    }

    /// Agents read files themselves: the file's directory is added to the
    /// accessible paths and the prompt names the file.
    async fn send_prompt_with_file(
        &self,
        ctx: &CallContext,
        model: &str,
        prompt: &str,
        file: &Path,
    ) -> Result<String, ProviderError> {
        let absolute = if file.is_absolute() {
            file.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(file))
                .unwrap_or_else(|_| file.to_path_buf())
        };
        let mut ctx = ctx.clone();
        if let Some(parent) = absolute.parent() {
            if !ctx.allowed_paths.iter().any(|p| p == parent) {
                ctx.allowed_paths.push(parent.to_path_buf());
            }
        }
        let full_prompt = format!("File: {}\n\n{}", absolute.display(), prompt);
        self.send_prompt(&ctx, model, &full_prompt).await
    }

    fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    fn is_available(&self) -> bool {
        self.resolve_binary().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<ProviderRegistry> {
        Arc::new(ProviderRegistry::builtin())
    }

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().to_string()).collect()
    }

    #[test]
    fn test_claude_args() {
        let args = CliTool::ClaudeCode.build_args(
            Some("opus"),
            "hello",
            &[PathBuf::from("/data")],
        );
        assert_eq!(
            strings(&args),
            vec!["-p", "hello", "--output-format", "text", "--model", "opus", "--add-dir", "/data"]
        );
    }

    #[test]
    fn test_gemini_and_codex_args() {
        let gemini = CliTool::GeminiCli.build_args(None, "hi", &[PathBuf::from("/a"), PathBuf::from("/b")]);
        assert_eq!(strings(&gemini), vec!["--include-directories", "/a,/b", "-p", "hi"]);

        let codex = CliTool::Codex.build_args(Some("o3"), "hi", &[]);
        assert_eq!(strings(&codex), vec!["exec", "-m", "o3", "hi"]);
    }

    #[test]
    fn test_model_flag() {
        let claude = CliAgentProvider::new(CliTool::ClaudeCode, registry());
        assert_eq!(claude.model_flag("claude-code"), None);
        assert_eq!(claude.model_flag("claude-code-opus").as_deref(), Some("opus"));

        let codex = CliAgentProvider::new(CliTool::Codex, registry());
        assert_eq!(codex.model_flag("codex"), None);
        assert_eq!(codex.model_flag("codex-cli-o3").as_deref(), Some("o3"));
    }

    #[test]
    fn test_supports_only_own_family() {
        let gemini = CliAgentProvider::new(CliTool::GeminiCli, registry());
        assert!(gemini.supports_model("gemini-cli"));
        assert!(!gemini.supports_model("gemini-2.5-pro"));
    }

    #[test]
    fn test_missing_binary_unavailable() {
        let claude = CliAgentProvider::new(CliTool::ClaudeCode, registry())
            .with_binary("/nonexistent/skein-test/claude");
        assert!(!claude.is_available());
    }

    #[tokio::test]
    async fn test_missing_binary_errors() {
        let claude = CliAgentProvider::new(CliTool::ClaudeCode, registry())
            .with_binary("/nonexistent/skein-test/claude");
        let err = claude
            .send_prompt(&CallContext::for_step("s"), "claude-code", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::ToolNotFound { .. }));
    }

    #[cfg(unix)]
    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_agent_and_returns_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "claude", "echo \"agent saw: $2\"");
        let claude = CliAgentProvider::new(CliTool::ClaudeCode, registry()).with_binary(&bin);

        let out = claude
            .send_prompt(&CallContext::for_step("s"), "claude-code", "ping")
            .await
            .unwrap();
        assert_eq!(out, "agent saw: ping");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rate_limited_exit_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "gemini", "echo 'Rate limit exceeded' >&2; exit 1");
        let gemini = CliAgentProvider::new(CliTool::GeminiCli, registry()).with_binary(&bin);

        let err = gemini
            .send_prompt(&CallContext::for_step("s"), "gemini-cli", "ping")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Transient { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_agent() {
        let dir = tempfile::tempdir().unwrap();
        let bin = script(dir.path(), "codex", "sleep 5");
        let codex = CliAgentProvider::new(CliTool::Codex, registry())
            .with_binary(&bin)
            .with_timeout(Duration::from_millis(100));

        let err = codex
            .send_prompt(&CallContext::for_step("s"), "codex", "ping")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout { .. }));
    }
}

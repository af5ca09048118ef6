//! Provider registry — the static catalog of model families.
//!
//! The registry maps model names to the backend family that serves them,
//! either by exact name or by prefix. It is built once at startup and shared
//! by reference with the dispatcher and the adapters; nothing mutates it after
//! construction, so tests can hand in a substitute catalog.

use serde::Serialize;

use super::ProviderVariant;

/// One backend family in the catalog.
#[derive(Debug, Clone, Serialize)]
pub struct ModelFamily {
    /// Provider name (matches `Provider::name()` of the adapter serving it)
    pub provider: String,
    pub variant: ProviderVariant,
    /// Model names matched exactly
    pub exact: Vec<String>,
    /// Prefixes matched against the start of the model name
    pub prefixes: Vec<String>,
    /// Executable required for CLI agent families
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    /// Whether the family accepts an attached file alongside the prompt
    pub supports_files: bool,
}

impl ModelFamily {
    pub fn new(provider: &str, variant: ProviderVariant) -> Self {
        Self {
            provider: provider.to_string(),
            variant,
            exact: Vec::new(),
            prefixes: Vec::new(),
            binary: None,
            supports_files: true,
        }
    }

    pub fn exact(mut self, names: &[&str]) -> Self {
        self.exact.extend(names.iter().map(|s| s.to_string()));
        self
    }

    pub fn prefixes(mut self, prefixes: &[&str]) -> Self {
        self.prefixes.extend(prefixes.iter().map(|s| s.to_string()));
        self
    }

    pub fn binary(mut self, binary: &str) -> Self {
        self.binary = Some(binary.to_string());
        self
    }

    pub fn supports_files(mut self, supports: bool) -> Self {
        self.supports_files = supports;
        self
    }

    /// Length of the most specific match, or `None`.
    ///
    /// Exact matches rank above every prefix match.
    fn match_rank(&self, model: &str) -> Option<usize> {
        if self.exact.iter().any(|e| e == model) {
            return Some(usize::MAX);
        }
        self.prefixes
            .iter()
            .filter(|p| model.starts_with(p.as_str()))
            .map(|p| p.len())
            .max()
    }
}

/// Immutable catalog of model families.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    families: Vec<ModelFamily>,
}

impl ProviderRegistry {
    pub fn new(families: Vec<ModelFamily>) -> Self {
        Self { families }
    }

    /// The built-in catalog covering every adapter shipped with the crate.
    pub fn builtin() -> Self {
        use ProviderVariant::*;

        Self::new(vec![
            // ── Local CLI agents ─────────────────────────────────────────
            ModelFamily::new("claude-code", CliAgent)
                .exact(&["claude-code"])
                .prefixes(&["claude-code-"])
                .binary("claude"),
            ModelFamily::new("gemini-cli", CliAgent)
                .exact(&["gemini-cli"])
                .prefixes(&["gemini-cli-"])
                .binary("gemini"),
            ModelFamily::new("openai-codex", CliAgent)
                .exact(&["openai-codex", "codex"])
                .prefixes(&["openai-codex-", "codex-cli-"])
                .binary("codex"),
            // ── Hosted APIs ──────────────────────────────────────────────
            ModelFamily::new("openai", HostedApi)
                .exact(&["o1", "o3", "o3-mini", "o4-mini", "chatgpt-4o-latest"])
                .prefixes(&["gpt-", "o1-", "o3-", "o4-", "text-embedding-"]),
            ModelFamily::new("anthropic", HostedApi).prefixes(&["claude-"]),
            ModelFamily::new("google", HostedApi).prefixes(&["gemini-", "gemma-"]),
            ModelFamily::new("xai", HostedApi).prefixes(&["grok-"]),
            ModelFamily::new("deepseek", HostedApi)
                .prefixes(&["deepseek-"])
                .supports_files(false),
            ModelFamily::new("moonshot", HostedApi)
                .prefixes(&["moonshot-", "kimi-"])
                .supports_files(false),
            ModelFamily::new("openrouter", HostedApi).prefixes(&["openrouter/"]),
        ])
    }

    /// Most specific family for `model`: exact name first, then longest prefix.
    pub fn family_for(&self, model: &str) -> Option<&ModelFamily> {
        self.families
            .iter()
            .filter_map(|f| f.match_rank(model).map(|rank| (rank, f)))
            .max_by_key(|(rank, _)| *rank)
            .map(|(_, f)| f)
    }

    /// Whether `provider` is the most specific owner of `model`.
    pub fn is_owned_by(&self, model: &str, provider: &str) -> bool {
        self.family_for(model)
            .map(|f| f.provider == provider)
            .unwrap_or(false)
    }

    /// Whether `model` is claimed by any family of the given variant.
    pub fn claimed_by_variant(&self, model: &str, variant: ProviderVariant) -> bool {
        self.family_for(model)
            .map(|f| f.variant == variant)
            .unwrap_or(false)
    }

    pub fn families(&self) -> &[ModelFamily] {
        &self.families
    }

    pub fn family_by_provider(&self, provider: &str) -> Option<&ModelFamily> {
        self.families.iter().find(|f| f.provider == provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_beats_prefix() {
        let registry = ProviderRegistry::builtin();
        let family = registry.family_for("gemini-cli").unwrap();
        assert_eq!(family.provider, "gemini-cli");
        assert_eq!(family.variant, ProviderVariant::CliAgent);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let registry = ProviderRegistry::builtin();
        assert_eq!(registry.family_for("claude-code-opus").unwrap().provider, "claude-code");
        assert_eq!(
            registry.family_for("claude-sonnet-4-20250514").unwrap().provider,
            "anthropic"
        );
        assert_eq!(registry.family_for("gemini-2.5-pro").unwrap().provider, "google");
    }

    #[test]
    fn test_unknown_model() {
        let registry = ProviderRegistry::builtin();
        assert!(registry.family_for("llama3.2").is_none());
        assert!(!registry.is_owned_by("llama3.2", "openai"));
    }

    #[test]
    fn test_substitute_catalog() {
        let registry = ProviderRegistry::new(vec![ModelFamily::new(
            "fake",
            ProviderVariant::HostedApi,
        )
        .exact(&["fake-1"])]);
        assert!(registry.is_owned_by("fake-1", "fake"));
        assert!(registry.family_for("gpt-4o").is_none());
    }
}

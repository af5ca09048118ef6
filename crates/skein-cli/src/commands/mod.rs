//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command.

pub mod models;
pub mod run;
pub mod validate;

use std::path::Path;

use skein_core::EnvConfig;

/// Provider settings from the environment, overlaid by the config file.
pub fn load_env_config(config: Option<&str>) -> Result<EnvConfig, String> {
    EnvConfig::load(config.map(Path::new)).map_err(|e| e.to_string())
}

/// Load .env and .env.local files for environment variables.
pub fn load_dotenv() {
    // .env.local wins over .env; variables already set win over both
    for filename in &[".env.local", ".env"] {
        let path = Path::new(filename);
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        for (key, value) in parse_dotenv(&content) {
            if std::env::var(&key).is_err() {
                std::env::set_var(&key, &value);
            }
        }
        tracing::info!("[Config] Loaded environment from '{}'", filename);
    }
}

/// `KEY=VALUE` pairs of a dotenv file; comments, blanks and `export` skipped.
pub fn parse_dotenv(content: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }
        pairs.push((key.to_string(), value.to_string()));
    }
    pairs
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dotenv() {
        let pairs = parse_dotenv(
            "# keys\nOPENAI_API_KEY=sk-1\nexport ANTHROPIC_API_KEY = \"sk-ant\"\n\nBROKEN\nEMPTY=\nQUOTED='a b'\n",
        );
        assert_eq!(
            pairs,
            vec![
                ("OPENAI_API_KEY".to_string(), "sk-1".to_string()),
                ("ANTHROPIC_API_KEY".to_string(), "sk-ant".to_string()),
                ("EMPTY".to_string(), String::new()),
                ("QUOTED".to_string(), "a b".to_string()),
            ]
        );
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("gemini-cli", 16), "gemini-cli");
        assert_eq!(truncate("openai-codex-mini-long", 8), "openai-…");
    }
}

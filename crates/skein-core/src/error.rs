//! Core error types for the Skein engine.
//!
//! `EngineError` is what a workflow run reports to its caller. Provider
//! adapters return `ProviderError`, which the retry executor may reclassify
//! and the step executor wraps into `EngineError::StepFailed`.

use std::time::Duration;

/// Errors surfaced by workflow planning and execution.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Fatal configuration problem (unresolvable model, missing field, ...).
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dependency cycle detected between: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Failed to parse workflow YAML: {0}")]
    Yaml(String),

    #[error("IO error: {0}")]
    Io(String),

    /// A step failed; `attempts` is set when a retry budget was exhausted.
    #[error("Step '{step}' failed{}: {source}", attempts_suffix(.attempts))]
    StepFailed {
        step: String,
        attempts: Option<u32>,
        #[source]
        source: Box<EngineError>,
    },

    /// A parallel task panicked or was cancelled.
    #[error("Parallel task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

fn attempts_suffix(attempts: &Option<u32>) -> String {
    match attempts {
        Some(n) => format!(" after {} attempts", n),
        None => String::new(),
    }
}

impl EngineError {
    /// Wrap an error raised while executing `step`.
    pub fn step(step: &str, source: EngineError) -> Self {
        let attempts = match &source {
            EngineError::Provider(ProviderError::RetriesExhausted { attempts, .. }) => {
                Some(*attempts)
            }
            _ => None,
        };
        EngineError::StepFailed {
            step: step.to_string(),
            attempts,
            source: Box::new(source),
        }
    }

    /// Name of the failing step, if this error came from one.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            EngineError::StepFailed { step, .. } => Some(step),
            _ => None,
        }
    }

    pub fn is_config(&self) -> bool {
        match self {
            EngineError::Config(_) | EngineError::Cycle(_) | EngineError::Yaml(_) => true,
            EngineError::StepFailed { source, .. } => source.is_config(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(e: serde_yaml::Error) -> Self {
        EngineError::Yaml(e.to_string())
    }
}

/// Errors returned by provider adapters.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Rate limit, quota or overload; eligible for retry.
    #[error("{provider}: {message}")]
    Transient { provider: String, message: String },

    /// Auth failure, malformed request or bad response; never retried.
    #[error("{provider}: {message}")]
    Terminal { provider: String, message: String },

    #[error("{provider} does not support model '{model}'")]
    UnsupportedModel { provider: String, model: String },

    #[error("'{binary}' was not found in PATH (required by {provider})")]
    ToolNotFound { provider: String, binary: String },

    #[error("{provider}: call timed out after {}s", .after.as_secs())]
    Timeout { provider: String, after: Duration },

    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<ProviderError>,
    },
}

impl ProviderError {
    pub fn transient(provider: &str, message: impl Into<String>) -> Self {
        ProviderError::Transient {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn terminal(provider: &str, message: impl Into<String>) -> Self {
        ProviderError::Terminal {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    /// Raw message text, without the provider prefix.
    pub fn message(&self) -> String {
        match self {
            ProviderError::Transient { message, .. } | ProviderError::Terminal { message, .. } => {
                message.clone()
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_failure_reports_attempts() {
        let err = EngineError::step(
            "summarize",
            EngineError::Provider(ProviderError::RetriesExhausted {
                attempts: 4,
                last: Box::new(ProviderError::transient("openai", "429 Too Many Requests")),
            }),
        );
        let text = err.to_string();
        assert!(text.contains("Step 'summarize' failed after 4 attempts"));
        assert!(text.contains("429 Too Many Requests"));
        assert_eq!(err.failed_step(), Some("summarize"));
    }

    #[test]
    fn test_cycle_is_config_error() {
        let err = EngineError::Cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert!(err.is_config());
        assert_eq!(err.to_string(), "Dependency cycle detected between: a -> b -> a");
    }
}

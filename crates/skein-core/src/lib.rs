//! Skein Core — YAML-defined LLM workflows over many model backends.
//!
//! A workflow is a list of steps, each sending a prompt to a named model.
//! This crate parses workflow documents, orders steps by their data
//! dependencies, runs parallel groups and agentic loops, and routes every
//! call to a hosted API, a local inference server, or an agentic CLI tool.
//!
//! It has no CLI or HTTP dependency, so it can back:
//!
//! - the `skein` command line tool
//! - an embedding service streaming [`workflow::ProgressUpdate`]s

pub mod config;
pub mod error;
pub mod providers;
pub mod shell_env;
pub mod workflow;

// Convenience re-exports
pub use config::EnvConfig;
pub use error::{EngineError, ProviderError, Result};
pub use providers::{Provider, ProviderDispatcher, ProviderRegistry, ProviderVariant};
pub use workflow::{Processor, RunSummary, WorkflowConfig};

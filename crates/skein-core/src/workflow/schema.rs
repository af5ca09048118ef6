//! YAML schema types for workflow documents.
//!
//! ```yaml
//! name: "Release notes"
//!
//! steps:
//!   - name: collect
//!     input: tool:git log --oneline -20
//!     action: Group these commits by area
//!     model: gpt-4o-mini
//!     output: $changes
//!
//!   - name: draft_notes
//!     input: $changes
//!     model: claude-sonnet-4-20250514
//!     action: Write user-facing release notes
//!     parallel_group: drafts
//!     output: notes.md
//!
//!   - name: draft_tweet
//!     input: $changes
//!     model: gemini-2.5-flash
//!     action: Write a one-line announcement
//!     parallel_group: drafts
//!     output: STDOUT
//!     next_action: archive
//!
//! deferred:
//!   - name: archive
//!     model: NA
//!     output: MEMORY
//!
//! loops:
//!   - name: polish
//!     input_state: notes.md
//!     output_state: notes.final.md
//!     max_iterations: 4
//!     exit_condition: llm_decides
//!     quality_gates:
//!       - name: not_empty
//!         min_length: 200
//!     steps:
//!       - name: review
//!         model: claude-code
//!         action: Tighten the release notes. Reply DONE when nothing is left to fix.
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{EngineError, Result};

/// Top-level workflow document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub name: String,

    /// Steps in declaration order (sequential or parallel-grouped)
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Steps that only run when triggered by `next_action` or `run_deferred`
    #[serde(default)]
    pub deferred: Vec<Step>,

    #[serde(default)]
    pub loops: Vec<AgenticLoopConfig>,

    /// Explicit loop order; when absent loops are ordered by their dependencies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_loops: Option<Vec<String>>,
}

/// One step of a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Step {
    pub name: String,

    /// Input refs; no declared input means `STDIN`
    #[serde(default, deserialize_with = "one_or_many")]
    pub input: Vec<String>,

    #[serde(default, alias = "instructions")]
    pub action: String,

    #[serde(default)]
    pub model: Option<String>,

    /// Output refs; no declared output means `STDOUT`
    #[serde(default, deserialize_with = "one_or_many")]
    pub output: Vec<String>,

    #[serde(default, alias = "memory")]
    pub memory_enabled: bool,

    /// Deferred step to run right after this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<String>,

    /// `deferred` moves the step out of the default order
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
}

impl Step {
    pub fn inputs(&self) -> Vec<DataRef> {
        if self.input.is_empty() {
            return vec![DataRef::Stdin];
        }
        self.input.iter().map(|s| DataRef::parse(s)).collect()
    }

    pub fn outputs(&self) -> Vec<DataRef> {
        if self.output.is_empty() {
            return vec![DataRef::Stdout];
        }
        self.output.iter().map(|s| DataRef::parse(s)).collect()
    }

    pub fn model_name(&self) -> Result<&str> {
        self.model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| EngineError::Config(format!("Step '{}' has no model", self.name)))
    }

    /// `model: NA` steps pass their input through without a provider call.
    pub fn is_passthrough(&self) -> bool {
        self.model.as_deref().map(str::trim) == Some("NA")
    }

    pub fn is_deferred(&self) -> bool {
        self.step_type.as_deref() == Some("deferred")
    }
}

/// A data reference in a step's `input` or `output` list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataRef {
    Stdin,
    Stdout,
    Memory,
    /// `NA`: no input
    Na,
    /// `tool:<command>`: stdout of an allow-listed command
    Tool(String),
    /// `$name`: an in-run variable
    Var(String),
    /// A file path or glob pattern
    Path(String),
}

impl DataRef {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw {
            "STDIN" => DataRef::Stdin,
            "STDOUT" => DataRef::Stdout,
            "MEMORY" => DataRef::Memory,
            "NA" => DataRef::Na,
            _ => {
                if let Some(cmd) = raw.strip_prefix("tool:") {
                    DataRef::Tool(cmd.trim().to_string())
                } else if let Some(var) = raw.strip_prefix('$') {
                    DataRef::Var(var.to_string())
                } else {
                    DataRef::Path(raw.to_string())
                }
            }
        }
    }

    /// Key under which a produced value is registered (variables and files).
    pub fn key(&self) -> Option<String> {
        match self {
            DataRef::Var(name) => Some(format!("${}", name)),
            DataRef::Path(path) => Some(path.clone()),
            _ => None,
        }
    }

    pub fn is_glob(&self) -> bool {
        matches!(self, DataRef::Path(p) if p.contains(['*', '?', '[']))
    }
}

impl std::fmt::Display for DataRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataRef::Stdin => write!(f, "STDIN"),
            DataRef::Stdout => write!(f, "STDOUT"),
            DataRef::Memory => write!(f, "MEMORY"),
            DataRef::Na => write!(f, "NA"),
            DataRef::Tool(cmd) => write!(f, "tool:{}", cmd),
            DataRef::Var(name) => write!(f, "${}", name),
            DataRef::Path(path) => write!(f, "{}", path),
        }
    }
}

/// How an agentic loop decides it is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCondition {
    /// The model ends its reply with a line reading `DONE`
    #[default]
    LlmDecides,
    /// The output matches `exit_pattern`
    PatternMatch,
}

/// A bounded, iterative block of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgenticLoopConfig {
    pub name: String,

    #[serde(default)]
    pub steps: Vec<Step>,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default)]
    pub exit_condition: ExitCondition,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_pattern: Option<String>,

    /// Wall-clock limit for the whole loop; 0 means unlimited
    #[serde(default)]
    pub timeout_seconds: u64,

    /// Feed each iteration's output into the next
    #[serde(default)]
    pub stateful: bool,

    #[serde(default)]
    pub quality_gates: Vec<QualityGateConfig>,

    /// Number of past iterations kept in the prompt context
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    /// Extra directories CLI agents may access during the loop
    #[serde(default)]
    pub allowed_paths: Vec<String>,

    /// Ref seeding the first iteration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_state: Option<String>,

    /// Ref receiving the final output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_state: Option<String>,

    #[serde(default, deserialize_with = "one_or_many")]
    pub depends_on: Vec<String>,
}

fn default_max_iterations() -> u32 {
    10
}

fn default_context_window() -> usize {
    5
}

/// What a failing gate does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateFailAction {
    /// End the loop as `GateFailed` (default)
    #[default]
    Abort,
    /// Re-run the same iteration
    Retry,
    /// Ignore the failure
    Skip,
}

/// A check applied to each iteration's output. Every declared check must pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityGateConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_contains: Option<String>,

    /// Regex the output must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matches: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,

    /// Shell command receiving the output on stdin; passes on exit status 0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default)]
    pub on_fail: GateFailAction,

    /// Re-runs allowed when `on_fail: retry`
    #[serde(default = "default_gate_retries")]
    pub max_retries: u32,
}

fn default_gate_retries() -> u32 {
    1
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Null(()),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
        OneOrMany::Null(()) => Vec::new(),
    })
}

impl WorkflowConfig {
    /// Parse and validate a workflow document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: WorkflowConfig = serde_yaml::from_str(yaml)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Io(format!("Failed to read workflow file '{}': {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Move `type: deferred` steps into the deferred list.
    fn normalize(&mut self) {
        let (deferred, steps): (Vec<Step>, Vec<Step>) =
            std::mem::take(&mut self.steps).into_iter().partition(Step::is_deferred);
        self.steps = steps;
        self.deferred.extend(deferred);
    }

    /// Structural checks that do not need the dependency graph.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let all_steps = self
            .steps
            .iter()
            .chain(&self.deferred)
            .chain(self.loops.iter().flat_map(|l| &l.steps));
        for step in all_steps {
            if step.name.trim().is_empty() {
                return Err(EngineError::Config("Every step needs a name".to_string()));
            }
            if !names.insert(step.name.as_str()) {
                return Err(EngineError::Config(format!("Duplicate step name '{}'", step.name)));
            }
            step.model_name()?;
            if let Some(next) = &step.next_action {
                if !self.deferred.iter().any(|d| &d.name == next) {
                    return Err(EngineError::Config(format!(
                        "Step '{}' names next_action '{}', which is not a deferred step",
                        step.name, next
                    )));
                }
            }
        }

        let mut loop_names = HashSet::new();
        for lp in &self.loops {
            if !loop_names.insert(lp.name.as_str()) {
                return Err(EngineError::Config(format!("Duplicate loop name '{}'", lp.name)));
            }
            if lp.steps.is_empty() {
                return Err(EngineError::Config(format!("Loop '{}' has no steps", lp.name)));
            }
            if lp.max_iterations == 0 {
                return Err(EngineError::Config(format!(
                    "Loop '{}' needs max_iterations of at least 1",
                    lp.name
                )));
            }
            if lp.exit_condition == ExitCondition::PatternMatch {
                let pattern = lp.exit_pattern.as_deref().ok_or_else(|| {
                    EngineError::Config(format!("Loop '{}' uses pattern_match without exit_pattern", lp.name))
                })?;
                compile_regex(pattern, &lp.name)?;
            }
            for gate in &lp.quality_gates {
                if let Some(pattern) = &gate.matches {
                    compile_regex(pattern, &gate.name)?;
                }
            }
        }
        for lp in &self.loops {
            for dep in &lp.depends_on {
                if !loop_names.contains(dep.as_str()) {
                    return Err(EngineError::Config(format!(
                        "Loop '{}' depends on unknown loop '{}'",
                        lp.name, dep
                    )));
                }
            }
        }
        if let Some(order) = &self.execute_loops {
            for name in order {
                if !loop_names.contains(name.as_str()) {
                    return Err(EngineError::Config(format!(
                        "execute_loops names unknown loop '{}'",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn deferred_step(&self, name: &str) -> Option<&Step> {
        self.deferred.iter().find(|s| s.name == name)
    }
}

pub(crate) fn compile_regex(pattern: &str, owner: &str) -> Result<regex::Regex> {
    regex::Regex::new(pattern)
        .map_err(|e| EngineError::Config(format!("Invalid pattern in '{}': {}", owner, e)))
}

//! Workflow processor — runs a workflow document end to end.
//!
//! The processor:
//! 1. Builds the dependency graph and execution order
//! 2. Runs each scheduling unit: one step, or a parallel group as tokio tasks
//! 3. Resolves step inputs (STDIN, variables, files, globs, tools, memory)
//! 4. Calls the model through the provider dispatcher (with retry)
//! 5. Commits outputs (STDOUT, MEMORY, variables, files)
//! 6. Runs deferred steps named by `next_action`
//! 7. Runs agentic loops after the top-level steps

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::Instrument;

use super::agentic_loop::{IterationRunner, LoopController, LoopReport};
use super::graph::{ExecutionPlan, ScheduleUnit};
use super::memory::MemoryStore;
use super::progress::{ProgressKind, ProgressUpdate, SharedProgressWriter};
use super::schema::{AgenticLoopConfig, DataRef, Step, WorkflowConfig};
use crate::config::{EnvConfig, ServerConfig};
use crate::error::{EngineError, Result};
use crate::providers::{CallContext, ProviderDispatcher, ProviderRegistry};

/// Outcome of one executed step.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: String,
    pub model: String,
    pub output_chars: usize,
    pub elapsed_ms: u64,
}

/// Text a step sent to `STDOUT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StdoutRecord {
    pub step: String,
    pub text: String,
}

/// Result of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub workflow: String,
    pub started_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
    pub loops: Vec<LoopReport>,
    /// Every `STDOUT` output, in commit order
    pub stdout: Vec<StdoutRecord>,
    /// Last output of the run
    pub output: String,
    pub elapsed_ms: u64,
}

type Values = HashMap<String, String>;
type StdoutLog = Arc<std::sync::Mutex<Vec<StdoutRecord>>>;

/// Everything a step needs while running, cheap to clone into a task.
#[derive(Clone)]
struct StepEnv {
    dispatcher: Arc<ProviderDispatcher>,
    env: Arc<EnvConfig>,
    memory: Arc<MemoryStore>,
    base_dir: PathBuf,
    progress: Option<SharedProgressWriter>,
    stdout: StdoutLog,
    verbose: bool,
    allowed_paths: Vec<PathBuf>,
}

impl StepEnv {
    fn emit(&self, update: ProgressUpdate) {
        if let Some(writer) = &self.progress {
            writer.send(update);
        }
    }

    fn write_stdout(&self, step: &str, text: &str) {
        if let Ok(mut log) = self.stdout.lock() {
            log.push(StdoutRecord {
                step: step.to_string(),
                text: text.to_string(),
            });
        }
        self.emit(ProgressUpdate::output(step, text));
    }
}

pub struct Processor {
    config: WorkflowConfig,
    env: Arc<EnvConfig>,
    server: Option<ServerConfig>,
    verbose: bool,
    runtime_dir: Option<PathBuf>,
    dispatcher: Arc<ProviderDispatcher>,
    memory: Arc<MemoryStore>,
    memory_context: Option<String>,
    progress: Option<SharedProgressWriter>,
    stdout: StdoutLog,
    values: Values,
    last_output: String,
    records: Vec<StepRecord>,
}

impl Processor {
    pub fn new(
        config: WorkflowConfig,
        env: EnvConfig,
        server: Option<ServerConfig>,
        verbose: bool,
        runtime_dir: Option<PathBuf>,
    ) -> Self {
        let registry = Arc::new(ProviderRegistry::builtin());
        let dispatcher = Arc::new(ProviderDispatcher::from_env(&env, registry));
        dispatcher.set_verbose(verbose);
        Self {
            config,
            env: Arc::new(env),
            server,
            verbose,
            runtime_dir,
            dispatcher,
            memory: Arc::new(MemoryStore::new()),
            memory_context: None,
            progress: None,
            stdout: StdoutLog::default(),
            values: Values::new(),
            last_output: String::new(),
            records: Vec::new(),
        }
    }

    /// Replace the dispatcher (tests, embedders with their own adapters).
    pub fn with_dispatcher(mut self, dispatcher: Arc<ProviderDispatcher>) -> Self {
        dispatcher.set_verbose(self.verbose);
        self.dispatcher = dispatcher;
        self
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Seed the `STDIN` of the first step.
    pub fn set_last_output(&mut self, output: impl Into<String>) {
        self.last_output = output.into();
    }

    pub fn last_output(&self) -> &str {
        &self.last_output
    }

    /// Context prepended to memory for this run (not persisted).
    pub fn set_memory_context(&mut self, context: impl Into<String>) {
        self.memory_context = Some(context.into());
    }

    pub fn set_progress_writer(&mut self, writer: SharedProgressWriter) {
        self.progress = Some(writer);
    }

    /// Value a step produced under `key` (`$name` or a file path).
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Directory relative refs are resolved against.
    pub fn base_dir(&self) -> PathBuf {
        self.runtime_dir
            .clone()
            .or_else(|| self.server.as_ref().and_then(|s| s.data_dir.clone()))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn step_env(&self) -> StepEnv {
        StepEnv {
            dispatcher: self.dispatcher.clone(),
            env: self.env.clone(),
            memory: self.memory.clone(),
            base_dir: self.base_dir(),
            progress: self.progress.clone(),
            stdout: self.stdout.clone(),
            verbose: self.verbose,
            allowed_paths: Vec::new(),
        }
    }

    async fn prepare_memory(&mut self) -> Result<()> {
        if let Some(path) = &self.env.memory_file {
            let path = resolve_path(&self.base_dir(), &path.to_string_lossy());
            self.memory = Arc::new(MemoryStore::open(&path).await?);
        }
        if let Some(context) = self.memory_context.take() {
            self.memory.seed(&context).await;
        }
        Ok(())
    }

    /// Run every step, then every loop.
    pub async fn process(&mut self) -> Result<RunSummary> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("workflow_run", run_id = %run_id, workflow = %self.config.name);
        let started_at = Utc::now();
        let started = Instant::now();

        let loops = async {
            let plan = ExecutionPlan::build(&self.config)?;
            self.prepare_memory().await?;
            self.records.clear();
            if let Ok(mut log) = self.stdout.lock() {
                log.clear();
            }

            tracing::info!(
                "[Workflow] Starting '{}': {} unit(s), {} loop(s)",
                self.config.name,
                plan.order.len(),
                plan.loop_order.len()
            );

            // Output of each unit that has run, read by STDIN-chain edges.
            let seed = self.last_output.clone();
            let mut unit_outputs: Vec<Option<String>> = vec![None; plan.graph.units.len()];

            for (position, &u) in plan.order.iter().enumerate() {
                let unit = &plan.graph.units[u];
                tracing::info!(
                    "[Workflow] Unit {}/{}: {}{}",
                    position + 1,
                    plan.order.len(),
                    unit.name,
                    if unit.parallel { " (parallel)" } else { "" }
                );
                let stdin = match plan.graph.stdin_source(u) {
                    Some(from) => unit_outputs[from].clone().unwrap_or_default(),
                    None => seed.clone(),
                };
                if unit.parallel {
                    self.run_group(unit, stdin).await?;
                } else {
                    let step = self.config.steps[unit.steps[0]].clone();
                    self.run_sequential(&step, stdin).await?;
                }
                unit_outputs[u] = Some(self.last_output.clone());
            }

            let mut reports = Vec::new();
            for &l in &plan.loop_order {
                let lp = self.config.loops[l].clone();
                reports.push(self.run_loop(&lp).await?);
            }
            Ok::<_, EngineError>(reports)
        }
        .instrument(span)
        .await?;

        tracing::info!(
            "[Workflow] '{}' finished in {}ms",
            self.config.name,
            started.elapsed().as_millis()
        );
        Ok(RunSummary {
            run_id,
            workflow: self.config.name.clone(),
            started_at,
            steps: self.records.clone(),
            loops,
            stdout: self.stdout.lock().map(|log| log.clone()).unwrap_or_default(),
            output: self.last_output.clone(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Run a deferred step now, as if it were the next sequential step.
    pub async fn run_deferred(&mut self, name: &str) -> Result<String> {
        let step = self.deferred(name)?;
        tracing::info!("[Workflow] Running deferred step '{}'", name);
        let stdin = self.last_output.clone();
        self.run_sequential(&step, stdin).await?;
        Ok(self.last_output.clone())
    }

    fn deferred(&self, name: &str) -> Result<Step> {
        self.config
            .deferred_step(name)
            .cloned()
            .ok_or_else(|| EngineError::Config(format!("Unknown deferred step '{}'", name)))
    }

    /// Run `step` on `stdin`, then the chain of deferred steps its
    /// `next_action` names, each reading the output before it.
    async fn run_sequential(&mut self, step: &Step, stdin: String) -> Result<()> {
        let mut current = step.clone();
        let mut visited = vec![current.name.clone()];
        let mut stdin = stdin;
        loop {
            self.run_single(&current, stdin).await?;
            stdin = self.last_output.clone();
            let Some(next) = current.next_action.clone() else {
                return Ok(());
            };
            if visited.contains(&next) {
                return Err(EngineError::Config(format!(
                    "next_action chain loops back to '{}'",
                    next
                )));
            }
            tracing::info!("[Workflow] '{}' triggers deferred step '{}'", current.name, next);
            current = self.deferred(&next)?;
            visited.push(next);
        }
    }

    async fn run_single(&mut self, step: &Step, stdin: String) -> Result<()> {
        let env = self.step_env();
        let started = Instant::now();
        let output = execute_step(env.clone(), step.clone(), Arc::new(self.values.clone()), stdin).await?;

        commit_outputs(&env, step, &output, &mut self.values).await?;
        self.record(step, &output, started);
        self.last_output = output;
        Ok(())
    }

    /// Launch every member at once; fail fast and commit nothing on error.
    async fn run_group(&mut self, unit: &ScheduleUnit, stdin: String) -> Result<()> {
        let env = self.step_env();
        let values = Arc::new(self.values.clone());
        let started = Instant::now();
        let mut tasks = JoinSet::new();

        for (slot, &idx) in unit.steps.iter().enumerate() {
            let step = self.config.steps[idx].clone();
            let env = env.clone();
            let values = values.clone();
            let input = stdin.clone();
            tasks.spawn(async move { (slot, execute_step(env, step, values, input).await) });
        }

        let mut outputs: Vec<Option<String>> = vec![None; unit.steps.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, Ok(output))) => outputs[slot] = Some(output),
                Ok((_, Err(e))) => {
                    tasks.abort_all();
                    tracing::warn!("[Workflow] Group '{}' failed: {}", unit.name, e);
                    return Err(e);
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(EngineError::Task(format!("group '{}': {}", unit.name, e)));
                }
            }
        }

        let mut committed = Vec::with_capacity(outputs.len());
        for (slot, output) in outputs.into_iter().enumerate() {
            let step = self.config.steps[unit.steps[slot]].clone();
            let output = output.unwrap_or_default();
            commit_outputs(&env, &step, &output, &mut self.values).await?;
            self.record(&step, &output, started);
            committed.push((step, output));
        }

        self.last_output = committed
            .iter()
            .map(|(_, output)| output.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        for (step, _) in &committed {
            if let Some(next) = &step.next_action {
                tracing::info!("[Workflow] '{}' triggers deferred step '{}'", step.name, next);
                self.run_deferred(next).await?;
            }
        }
        Ok(())
    }

    async fn run_loop(&mut self, lp: &AgenticLoopConfig) -> Result<LoopReport> {
        let base_dir = self.base_dir();
        let mut env = self.step_env();
        env.allowed_paths = lp
            .allowed_paths
            .iter()
            .map(|p| resolve_path(&base_dir, p))
            .collect();

        let initial = match &lp.input_state {
            Some(raw) => {
                resolve_ref(&env, &DataRef::parse(raw), &self.values, &self.last_output, None).await?
            }
            None => self.last_output.clone(),
        };

        let runner = LoopRunner {
            env: env.clone(),
            steps: lp.steps.clone(),
            values: tokio::sync::Mutex::new(self.values.clone()),
            records: std::sync::Mutex::new(Vec::new()),
        };
        let report = LoopController::new(lp)?.run(&runner, &initial).await?;

        self.values = runner.values.into_inner();
        if let Ok(records) = runner.records.into_inner() {
            self.records.extend(records);
        }

        tracing::info!(
            "[Workflow] Loop '{}' ended after {} iteration(s): {:?}",
            lp.name,
            report.iterations,
            report.outcome
        );
        env.emit(ProgressUpdate::new(
            ProgressKind::LoopFinished,
            &lp.name,
            format!("{:?} after {} iteration(s)", report.outcome, report.iterations),
        ));

        if let Some(target) = &lp.output_state {
            let sink = Step {
                name: lp.name.clone(),
                output: vec![target.clone()],
                ..Step::default()
            };
            commit_outputs(&env, &sink, &report.output, &mut self.values).await?;
        }
        self.last_output = report.output.clone();
        Ok(report)
    }

    fn record(&mut self, step: &Step, output: &str, started: Instant) {
        self.records.push(StepRecord {
            step: step.name.clone(),
            model: step.model.clone().unwrap_or_default(),
            output_chars: output.chars().count(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
    }
}

/// Runs a loop's steps in sequence, once per iteration.
struct LoopRunner {
    env: StepEnv,
    steps: Vec<Step>,
    values: tokio::sync::Mutex<Values>,
    records: std::sync::Mutex<Vec<StepRecord>>,
}

#[async_trait]
impl IterationRunner for LoopRunner {
    async fn run_iteration(&self, iteration: u32, input: &str) -> Result<String> {
        let mut last = input.to_string();
        for step in &self.steps {
            self.env.emit(ProgressUpdate::new(
                ProgressKind::LoopIteration,
                &step.name,
                format!("iteration {}", iteration),
            ));
            let started = Instant::now();
            let snapshot = Arc::new(self.values.lock().await.clone());
            let output = execute_step(self.env.clone(), step.clone(), snapshot, last).await?;
            commit_outputs(&self.env, step, &output, &mut *self.values.lock().await).await?;
            if let Ok(mut records) = self.records.lock() {
                records.push(StepRecord {
                    step: step.name.clone(),
                    model: step.model.clone().unwrap_or_default(),
                    output_chars: output.chars().count(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            last = output;
        }
        Ok(last)
    }
}

// ─── Step execution ─────────────────────────────────────────────────────

/// Input resolved for one step.
#[derive(Debug, Default)]
struct ResolvedInput {
    text: String,
    /// Single on-disk file sent as an attachment
    file: Option<PathBuf>,
}

async fn execute_step(env: StepEnv, step: Step, values: Arc<Values>, stdin: String) -> Result<String> {
    env.emit(ProgressUpdate::new(
        ProgressKind::StepStarted,
        &step.name,
        step.model.clone().unwrap_or_default(),
    ));
    match run_step(&env, &step, &values, &stdin).await {
        Ok(output) => {
            env.emit(ProgressUpdate::new(
                ProgressKind::StepCompleted,
                &step.name,
                format!("{} chars", output.chars().count()),
            ));
            Ok(output)
        }
        Err(e) => {
            env.emit(ProgressUpdate::new(ProgressKind::StepFailed, &step.name, e.to_string()));
            Err(EngineError::step(&step.name, e))
        }
    }
}

async fn run_step(env: &StepEnv, step: &Step, values: &Values, stdin: &str) -> Result<String> {
    let inputs = step.inputs();
    let outputs = step.outputs();
    let touches_memory = step.memory_enabled
        || inputs.contains(&DataRef::Memory)
        || outputs.contains(&DataRef::Memory);

    // Held from the memory read until the memory write.
    let mut memory = if touches_memory {
        Some(env.memory.lock().await)
    } else {
        None
    };

    let passthrough = step.is_passthrough();
    let memory_text = memory.as_ref().map(|g| g.content().to_string());
    let input = resolve_inputs(env, &inputs, values, stdin, memory_text.as_deref(), !passthrough).await?;

    let output = if passthrough {
        tracing::info!("[Workflow] Step '{}' passes its input through", step.name);
        input.text
    } else {
        let model = step.model_name()?;
        let memory_context = memory_text.as_deref().filter(|_| step.memory_enabled);
        let prompt = compose_prompt(memory_context, &input.text, &step.action);
        let ctx = CallContext {
            step: step.name.clone(),
            allowed_paths: env.allowed_paths.clone(),
            cwd: Some(env.base_dir.clone()),
        };

        tracing::info!("[Workflow] Step '{}' -> {} ({} chars)", step.name, model, prompt.len());
        if env.verbose {
            tracing::debug!("[Workflow] Prompt for '{}': {}", step.name, truncate(&prompt, 300));
        }
        env.dispatcher
            .call(&ctx, model, &prompt, input.file.as_deref())
            .await?
    };

    if outputs.contains(&DataRef::Memory) {
        if let Some(guard) = memory.as_mut() {
            guard.append(&output).await?;
        }
    }
    Ok(output)
}

/// Resolve every input ref into prompt text, or a single attachment.
async fn resolve_inputs(
    env: &StepEnv,
    inputs: &[DataRef],
    values: &Values,
    stdin: &str,
    memory: Option<&str>,
    allow_attachment: bool,
) -> Result<ResolvedInput> {
    if allow_attachment {
        if let [DataRef::Path(raw)] = inputs {
            let path = resolve_path(&env.base_dir, raw);
            if !values.contains_key(raw) && !inputs[0].is_glob() && path.is_file() {
                return Ok(ResolvedInput {
                    text: String::new(),
                    file: Some(path),
                });
            }
        }
    }

    let headed = inputs.len() > 1;
    let mut parts = Vec::new();
    for input in inputs {
        let text = resolve_ref(env, input, values, stdin, memory).await?;
        if text.is_empty() {
            continue;
        }
        match input {
            DataRef::Path(raw) if headed && !input.is_glob() && !values.contains_key(raw) => {
                parts.push(format!("File: {}\n{}", raw, text))
            }
            _ => parts.push(text),
        }
    }
    Ok(ResolvedInput {
        text: parts.join("\n\n"),
        file: None,
    })
}

/// Text behind one input ref.
async fn resolve_ref(
    env: &StepEnv,
    input: &DataRef,
    values: &Values,
    stdin: &str,
    memory: Option<&str>,
) -> Result<String> {
    match input {
        DataRef::Stdin => Ok(stdin.to_string()),
        DataRef::Na => Ok(String::new()),
        DataRef::Memory => Ok(match memory {
            Some(text) => text.to_string(),
            None => env.memory.snapshot().await,
        }),
        DataRef::Stdout => Err(EngineError::Config("STDOUT cannot be used as an input".to_string())),
        DataRef::Tool(command) => run_tool(env, command).await,
        DataRef::Var(name) => values.get(&format!("${}", name)).cloned().ok_or_else(|| {
            EngineError::Config(format!("Variable '${}' has not been produced yet", name))
        }),
        DataRef::Path(raw) => {
            if let Some(value) = values.get(raw) {
                return Ok(value.clone());
            }
            if input.is_glob() {
                return read_glob(&env.base_dir, raw).await;
            }
            let path = resolve_path(&env.base_dir, raw);
            tokio::fs::read_to_string(&path).await.map_err(|e| {
                EngineError::Io(format!("Failed to read input '{}': {}", path.display(), e))
            })
        }
    }
}

async fn read_glob(base_dir: &Path, pattern: &str) -> Result<String> {
    let full = resolve_path(base_dir, pattern);
    let full = full.to_string_lossy();
    let paths = glob::glob(&full)
        .map_err(|e| EngineError::Config(format!("Invalid glob '{}': {}", pattern, e)))?;

    let mut files: Vec<PathBuf> = paths.filter_map(|p| p.ok()).filter(|p| p.is_file()).collect();
    files.sort();
    if files.is_empty() {
        return Err(EngineError::Io(format!("No files match '{}'", pattern)));
    }

    let mut parts = Vec::with_capacity(files.len());
    for path in files {
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            EngineError::Io(format!("Failed to read input '{}': {}", path.display(), e))
        })?;
        let shown = path.strip_prefix(base_dir).unwrap_or(&path);
        parts.push(format!("File: {}\n{}", shown.display(), content));
    }
    Ok(parts.join("\n\n"))
}

/// Run an allow-listed `tool:` command and return its stdout.
async fn run_tool(env: &StepEnv, command: &str) -> Result<String> {
    if !env.env.is_tool_allowed(command) {
        return Err(EngineError::Config(format!(
            "Tool command '{}' is not in allowed_tools",
            command
        )));
    }
    tracing::info!("[Workflow] Running tool: {}", command);
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(&env.base_dir)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| EngineError::Io(format!("Failed to run tool '{}': {}", command, e)))?;
    if !output.status.success() {
        return Err(EngineError::Io(format!(
            "Tool '{}' exited with {}: {}",
            command,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
}

/// Deliver a step's output to every declared destination except MEMORY,
/// which the step itself writes while holding the memory lock.
async fn commit_outputs(env: &StepEnv, step: &Step, output: &str, values: &mut Values) -> Result<()> {
    for target in step.outputs() {
        match &target {
            DataRef::Stdout => env.write_stdout(&step.name, output),
            DataRef::Memory => {}
            DataRef::Var(_) => {
                if let Some(key) = target.key() {
                    values.insert(key, output.to_string());
                }
            }
            DataRef::Path(raw) => {
                let path = resolve_path(&env.base_dir, raw);
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, output).await.map_err(|e| {
                    EngineError::Io(format!("Failed to write '{}': {}", path.display(), e))
                })?;
                tracing::info!("[Workflow] Step '{}' wrote {}", step.name, path.display());
                values.insert(raw.clone(), output.to_string());
            }
            DataRef::Stdin | DataRef::Na | DataRef::Tool(_) => {
                return Err(EngineError::step(
                    &step.name,
                    EngineError::Config(format!("'{}' cannot be used as an output", target)),
                ));
            }
        }
    }
    Ok(())
}

/// `Memory context` / `Input` / `Action` blocks, empty ones left out.
pub fn compose_prompt(memory: Option<&str>, input: &str, action: &str) -> String {
    let mut prompt = String::new();
    if let Some(memory) = memory.map(str::trim).filter(|m| !m.is_empty()) {
        prompt.push_str(&format!("Memory context:\n{}\n\n", memory));
    }
    if !input.trim().is_empty() {
        prompt.push_str(&format!("Input:\n{}\n\n", input));
    }
    if !action.trim().is_empty() {
        prompt.push_str(&format!("Action: {}", action.trim()));
    }
    prompt.trim_end().to_string()
}

fn resolve_path(base_dir: &Path, raw: &str) -> PathBuf {
    let expanded = match raw.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().map(|home| home.join(rest)),
        None => None,
    };
    let path = expanded.unwrap_or_else(|| PathBuf::from(raw));
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

fn truncate(s: &str, max: usize) -> String {
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
    fn test_compose_prompt() {
        assert_eq!(
            compose_prompt(None, "hello", "Translate"),
            "Input:\nhello\n\nAction: Translate"
        );
        assert_eq!(
            compose_prompt(Some("user prefers French"), "hello", "Translate"),
            "Memory context:\nuser prefers French\n\nInput:\nhello\n\nAction: Translate"
        );
        assert_eq!(compose_prompt(Some("  "), "", "Summarize"), "Action: Summarize");
    }

    #[test]
    fn test_resolve_path() {
        let base = Path::new("/work");
        assert_eq!(resolve_path(base, "out/a.md"), PathBuf::from("/work/out/a.md"));
        assert_eq!(resolve_path(base, "/tmp/a.md"), PathBuf::from("/tmp/a.md"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 5), "abcd…");
    }
}

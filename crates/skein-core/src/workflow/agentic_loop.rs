//! Agentic loop controller.
//!
//! Runs a block of steps repeatedly until it converges. After each iteration
//! the controller checks, in order:
//!
//! 1. the exit condition (`DONE` from the model, or `exit_pattern`),
//! 2. the quality gates, in declared order,
//! 3. the loop timeout,
//! 4. the iteration cap.
//!
//! The first check that fires decides the [`LoopOutcome`]. A gate failure is
//! an outcome, not an error; an iteration whose steps fail is an error.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use super::schema::{compile_regex, AgenticLoopConfig, ExitCondition, GateFailAction, QualityGateConfig};
use crate::error::{EngineError, Result};

/// Line the model emits to end an `llm_decides` loop.
pub const DONE_MARKER: &str = "DONE";

/// Upper bound for one gate command, with or without a loop timeout.
pub const GATE_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoopOutcome {
    Converged,
    GateFailed { gate: String, iteration: u32 },
    TimedOut,
    MaxIterationsReached,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoopReport {
    pub name: String,
    pub outcome: LoopOutcome,
    /// Iterations completed
    pub iterations: u32,
    /// Output of the last completed iteration
    pub output: String,
    pub elapsed_ms: u64,
}

/// Executes one pass over a loop's steps.
#[async_trait]
pub trait IterationRunner: Send + Sync {
    async fn run_iteration(&self, iteration: u32, input: &str) -> Result<String>;
}

/// Mutable state carried between iterations.
#[derive(Debug, Default)]
struct LoopState {
    last_output: Option<String>,
    /// (iteration, output), oldest first, at most `context_window` long
    history: VecDeque<(u32, String)>,
}

impl LoopState {
    fn record(&mut self, iteration: u32, output: &str, window: usize) {
        self.last_output = Some(output.to_string());
        if window == 0 {
            return;
        }
        self.history.push_back((iteration, output.to_string()));
        while self.history.len() > window {
            self.history.pop_front();
        }
    }
}

pub struct LoopController<'a> {
    config: &'a AgenticLoopConfig,
    exit_re: Option<Regex>,
    gate_res: Vec<Option<Regex>>,
}

enum GateVerdict {
    Pass,
    Fail { index: usize, reason: String },
}

impl<'a> LoopController<'a> {
    pub fn new(config: &'a AgenticLoopConfig) -> Result<Self> {
        let exit_re = match config.exit_condition {
            ExitCondition::PatternMatch => {
                let pattern = config.exit_pattern.as_deref().ok_or_else(|| {
                    EngineError::Config(format!(
                        "Loop '{}' uses pattern_match without exit_pattern",
                        config.name
                    ))
                })?;
                Some(compile_regex(pattern, &config.name)?)
            }
            ExitCondition::LlmDecides => None,
        };
        let gate_res = config
            .quality_gates
            .iter()
            .map(|g| g.matches.as_deref().map(|p| compile_regex(p, &g.name)).transpose())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            exit_re,
            gate_res,
        })
    }

    fn deadline(&self, started: Instant) -> Option<Instant> {
        (self.config.timeout_seconds > 0)
            .then(|| started + Duration::from_secs(self.config.timeout_seconds))
    }

    /// Input for the next iteration.
    fn compose_input(&self, initial: &str, state: &LoopState) -> String {
        if !self.config.stateful {
            return initial.to_string();
        }
        let current = state.last_output.as_deref().unwrap_or(initial);
        if state.history.is_empty() {
            return current.to_string();
        }
        let mut input = current.to_string();
        input.push_str("\n\nPrevious iterations:");
        for (iteration, output) in &state.history {
            input.push_str(&format!("\n--- Iteration {} ---\n{}", iteration, output));
        }
        input
    }

    /// Whether `output` ends the loop, and the output with any marker removed.
    fn check_exit(&self, output: &str) -> (bool, String) {
        match self.config.exit_condition {
            ExitCondition::LlmDecides => match strip_done_marker(output) {
                Some(stripped) => (true, stripped),
                None => (false, output.to_string()),
            },
            ExitCondition::PatternMatch => {
                let hit = self.exit_re.as_ref().map(|re| re.is_match(output)).unwrap_or(false);
                (hit, output.to_string())
            }
        }
    }

    async fn evaluate_gates(&self, output: &str, iteration: u32) -> Result<GateVerdict> {
        for (index, gate) in self.config.quality_gates.iter().enumerate() {
            let Some(reason) = check_gate(gate, self.gate_res[index].as_ref(), output).await? else {
                continue;
            };
            if gate.on_fail == GateFailAction::Skip {
                tracing::warn!(
                    "[Loop] '{}' iteration {}: gate '{}' failed ({}), skipping",
                    self.config.name,
                    iteration,
                    gate.name,
                    reason
                );
                continue;
            }
            return Ok(GateVerdict::Fail { index, reason });
        }
        Ok(GateVerdict::Pass)
    }

    pub async fn run(&self, runner: &dyn IterationRunner, initial_input: &str) -> Result<LoopReport> {
        let name = &self.config.name;
        let started = Instant::now();
        let deadline = self.deadline(started);
        let mut state = LoopState::default();
        let mut iteration: u32 = 1;

        tracing::info!(
            "[Loop] Starting '{}' (max {} iterations, timeout {}s)",
            name,
            self.config.max_iterations,
            self.config.timeout_seconds
        );

        let report = |state: &LoopState, outcome: LoopOutcome, iterations: u32| LoopReport {
            name: name.clone(),
            outcome,
            iterations,
            output: state.last_output.clone().unwrap_or_default(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        loop {
            let mut gate_retries = vec![0u32; self.config.quality_gates.len()];

            let (converged, output) = loop {
                let input = self.compose_input(initial_input, &state);
                let pass = runner.run_iteration(iteration, &input);
                let raw = match deadline {
                    Some(deadline) => match tokio::time::timeout_at(deadline, pass).await {
                        Ok(result) => result?,
                        Err(_) => {
                            tracing::warn!("[Loop] '{}' timed out during iteration {}", name, iteration);
                            return Ok(report(&state, LoopOutcome::TimedOut, iteration - 1));
                        }
                    },
                    None => pass.await?,
                };

                let (converged, output) = self.check_exit(&raw);
                if converged {
                    break (true, output);
                }

                let gates = self.evaluate_gates(&output, iteration);
                let verdict = match deadline {
                    Some(deadline) => match tokio::time::timeout_at(deadline, gates).await {
                        Ok(result) => result?,
                        Err(_) => {
                            tracing::warn!(
                                "[Loop] '{}' timed out during quality gates of iteration {}",
                                name,
                                iteration
                            );
                            state.record(iteration, &output, self.config.context_window);
                            return Ok(report(&state, LoopOutcome::TimedOut, iteration));
                        }
                    },
                    None => gates.await?,
                };

                match verdict {
                    GateVerdict::Pass => break (false, output),
                    GateVerdict::Fail { index, reason } => {
                        let gate = &self.config.quality_gates[index];
                        if gate.on_fail == GateFailAction::Retry && gate_retries[index] < gate.max_retries {
                            gate_retries[index] += 1;
                            tracing::warn!(
                                "[Loop] '{}' iteration {}: gate '{}' failed ({}), retry {}/{}",
                                name,
                                iteration,
                                gate.name,
                                reason,
                                gate_retries[index],
                                gate.max_retries
                            );
                            continue;
                        }
                        tracing::warn!(
                            "[Loop] '{}' iteration {}: gate '{}' failed: {}",
                            name,
                            iteration,
                            gate.name,
                            reason
                        );
                        state.record(iteration, &output, self.config.context_window);
                        return Ok(report(
                            &state,
                            LoopOutcome::GateFailed {
                                gate: gate.name.clone(),
                                iteration,
                            },
                            iteration,
                        ));
                    }
                }
            };

            state.record(iteration, &output, self.config.context_window);
            tracing::info!("[Loop] '{}' iteration {} complete ({} chars)", name, iteration, output.len());

            if converged {
                return Ok(report(&state, LoopOutcome::Converged, iteration));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(report(&state, LoopOutcome::TimedOut, iteration));
            }
            if iteration >= self.config.max_iterations {
                return Ok(report(&state, LoopOutcome::MaxIterationsReached, iteration));
            }
            iteration += 1;
        }
    }
}

/// Remove a trailing `DONE` line; `None` when the output has none.
pub fn strip_done_marker(output: &str) -> Option<String> {
    let trimmed = output.trim_end();
    let (rest, last) = match trimmed.rfind('\n') {
        Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
        None => ("", trimmed),
    };
    (last.trim() == DONE_MARKER).then(|| rest.trim_end().to_string())
}

/// `None` when every check on `gate` passes, otherwise the first failure.
pub async fn check_gate(
    gate: &QualityGateConfig,
    matches: Option<&Regex>,
    output: &str,
) -> Result<Option<String>> {
    if let Some(needle) = &gate.contains {
        if !output.contains(needle.as_str()) {
            return Ok(Some(format!("output does not contain '{}'", needle)));
        }
    }
    if let Some(needle) = &gate.not_contains {
        if output.contains(needle.as_str()) {
            return Ok(Some(format!("output contains '{}'", needle)));
        }
    }
    if let Some(re) = matches {
        if !re.is_match(output) {
            return Ok(Some(format!("output does not match /{}/", re.as_str())));
        }
    }
    if let Some(min) = gate.min_length {
        let len = output.chars().count();
        if len < min {
            return Ok(Some(format!("output is {} chars, minimum is {}", len, min)));
        }
    }
    if let Some(command) = &gate.command {
        if let Some(reason) = run_gate_command(command, output, GATE_COMMAND_TIMEOUT).await? {
            return Ok(Some(reason));
        }
    }
    Ok(None)
}

/// Run `command` with `output` on its stdin; `Some(reason)` when it fails.
///
/// A command still running after `limit` is killed and counts as a failure.
async fn run_gate_command(command: &str, output: &str, limit: Duration) -> Result<Option<String>> {
    let mut child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| EngineError::Io(format!("Failed to run gate command '{}': {}", command, e)))?;

    let interaction = async {
        if let Some(mut stdin) = child.stdin.take() {
            // a command that exits without reading stdin is not an error
            let _ = stdin.write_all(output.as_bytes()).await;
        }
        child.wait().await
    };
    match tokio::time::timeout(limit, interaction).await {
        Ok(status) => Ok((!status?.success()).then(|| format!("command '{}' failed", command))),
        Err(_) => {
            tracing::warn!("[Loop] Gate command '{}' killed after {}s", command, limit.as_secs());
            Ok(Some(format!("command '{}' timed out after {}s", command, limit.as_secs())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays canned outputs and records the inputs it was given.
    struct ScriptedRunner {
        outputs: Vec<String>,
        inputs: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl ScriptedRunner {
        fn new(outputs: &[&str]) -> Self {
            Self {
                outputs: outputs.iter().map(|s| s.to_string()).collect(),
                inputs: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.inputs.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl IterationRunner for ScriptedRunner {
        async fn run_iteration(&self, _iteration: u32, input: &str) -> Result<String> {
            let n = {
                let mut inputs = self.inputs.lock().unwrap();
                inputs.push(input.to_string());
                inputs.len()
            };
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let idx = (n - 1).min(self.outputs.len() - 1);
            Ok(self.outputs[idx].clone())
        }
    }

    fn loop_config(yaml: &str) -> AgenticLoopConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn test_runs_to_iteration_cap() {
        let config = loop_config("name: l\nmax_iterations: 3\n");
        let runner = ScriptedRunner::new(&["not yet"]);
        let report = LoopController::new(&config).unwrap().run(&runner, "go").await.unwrap();

        assert_eq!(report.outcome, LoopOutcome::MaxIterationsReached);
        assert_eq!(report.iterations, 3);
        assert_eq!(runner.calls(), 3);
    }

    #[tokio::test]
    async fn test_gate_failure_on_second_iteration() {
        let config = loop_config(
            r#"
name: l
max_iterations: 5
quality_gates:
  - name: mentions_tests
    contains: tests
"#,
        );
        let runner = ScriptedRunner::new(&["added tests", "removed everything"]);
        let report = LoopController::new(&config).unwrap().run(&runner, "go").await.unwrap();

        assert_eq!(
            report.outcome,
            LoopOutcome::GateFailed {
                gate: "mentions_tests".into(),
                iteration: 2
            }
        );
        assert_eq!(report.iterations, 2);
        assert_eq!(runner.calls(), 2);
    }

    #[tokio::test]
    async fn test_llm_decides_done() {
        let config = loop_config("name: l\nmax_iterations: 5\n");
        let runner = ScriptedRunner::new(&["draft", "final answer\n\nDONE\n"]);
        let report = LoopController::new(&config).unwrap().run(&runner, "go").await.unwrap();

        assert_eq!(report.outcome, LoopOutcome::Converged);
        assert_eq!(report.iterations, 2);
        assert_eq!(report.output, "final answer");
    }

    #[tokio::test]
    async fn test_pattern_match_exit() {
        let config = loop_config(
            "name: l\nexit_condition: pattern_match\nexit_pattern: 'score: (9|10)/10'\n",
        );
        let runner = ScriptedRunner::new(&["score: 6/10", "score: 9/10"]);
        let report = LoopController::new(&config).unwrap().run(&runner, "go").await.unwrap();
        assert_eq!(report.outcome, LoopOutcome::Converged);
        assert_eq!(report.output, "score: 9/10");
    }

    #[tokio::test]
    async fn test_timeout_during_iteration() {
        let config = loop_config("name: l\ntimeout_seconds: 1\n");
        let mut runner = ScriptedRunner::new(&["slow"]);
        runner.delay = Duration::from_millis(1500);
        let report = LoopController::new(&config).unwrap().run(&runner, "go").await.unwrap();

        assert_eq!(report.outcome, LoopOutcome::TimedOut);
        assert_eq!(report.iterations, 0);
    }

    #[tokio::test]
    async fn test_stateful_context_window() {
        let config = loop_config("name: l\nmax_iterations: 4\nstateful: true\ncontext_window: 2\n");
        let runner = ScriptedRunner {
            outputs: vec!["out-1".into(), "out-2".into(), "out-3".into(), "out-4".into()],
            inputs: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        };
        LoopController::new(&config).unwrap().run(&runner, "seed").await.unwrap();

        let inputs = runner.inputs.lock().unwrap();
        assert_eq!(inputs[0], "seed");
        assert!(inputs[1].starts_with("out-1"));
        let last = &inputs[3];
        assert!(last.starts_with("out-3"));
        assert!(last.contains("--- Iteration 2 ---\nout-2"));
        assert!(last.contains("--- Iteration 3 ---\nout-3"));
        assert!(!last.contains("out-1"));
    }

    #[tokio::test]
    async fn test_stateless_reuses_initial_input() {
        let config = loop_config("name: l\nmax_iterations: 2\n");
        let runner = ScriptedRunner::new(&["a", "b"]);
        LoopController::new(&config).unwrap().run(&runner, "seed").await.unwrap();
        assert_eq!(*runner.inputs.lock().unwrap(), vec!["seed", "seed"]);
    }

    #[tokio::test]
    async fn test_gate_retry_and_skip() {
        let retry = loop_config(
            r#"
name: l
max_iterations: 1
quality_gates:
  - name: long_enough
    min_length: 5
    on_fail: retry
"#,
        );
        let runner = ScriptedRunner::new(&["no", "long answer"]);
        let report = LoopController::new(&retry).unwrap().run(&runner, "go").await.unwrap();
        assert_eq!(report.outcome, LoopOutcome::MaxIterationsReached);
        assert_eq!(report.iterations, 1);
        assert_eq!(runner.calls(), 2);

        let skip = loop_config(
            r#"
name: l
max_iterations: 2
quality_gates:
  - name: strict
    not_contains: TODO
    on_fail: skip
"#,
        );
        let runner = ScriptedRunner::new(&["TODO: everything"]);
        let report = LoopController::new(&skip).unwrap().run(&runner, "go").await.unwrap();
        assert_eq!(report.outcome, LoopOutcome::MaxIterationsReached);
    }

    #[test]
    fn test_strip_done_marker() {
        assert_eq!(strip_done_marker("answer\nDONE").as_deref(), Some("answer"));
        assert_eq!(strip_done_marker("DONE\n\n").as_deref(), Some(""));
        assert_eq!(strip_done_marker("not DONE yet"), None);
        assert_eq!(strip_done_marker("DONE\nmore work"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_gate() {
        let gate = QualityGateConfig {
            name: "grep".into(),
            command: Some("grep -q ready".into()),
            ..QualityGateConfig::default()
        };
        assert_eq!(check_gate(&gate, None, "all ready").await.unwrap(), None);
        assert!(check_gate(&gate, None, "not yet").await.unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hung_gate_command_is_killed() {
        let started = Instant::now();
        let reason = run_gate_command("sleep 5", "output", Duration::from_millis(200))
            .await
            .unwrap();

        assert!(reason.unwrap().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_during_gate_command() {
        let config = loop_config(
            r#"
name: l
max_iterations: 3
timeout_seconds: 1
quality_gates:
  - name: slow_check
    command: sleep 4
"#,
        );
        let runner = ScriptedRunner::new(&["draft"]);
        let started = Instant::now();
        let report = LoopController::new(&config).unwrap().run(&runner, "go").await.unwrap();

        assert_eq!(report.outcome, LoopOutcome::TimedOut);
        assert_eq!(report.iterations, 1);
        assert_eq!(report.output, "draft");
        assert_eq!(runner.calls(), 1);
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}

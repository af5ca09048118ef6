//! Integration tests for the workflow processor.
//!
//! These tests run whole workflow documents through `Processor` with a mock
//! provider injected into the dispatcher, so no network or CLI tool is needed.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use skein_core::providers::{CallContext, Provider, ProviderDispatcher, ProviderRegistry, ProviderVariant, RetryPolicy};
use skein_core::workflow::{ExecutionPlan, LoopOutcome, ProgressKind, ProgressUpdate, StdoutRecord};
use skein_core::{EnvConfig, ProviderError, Processor, WorkflowConfig};

/// Answers `out:<step>` and records every prompt it receives.
///
/// Model names steer the behavior: `mock-fail` fails terminally, `mock-slow`
/// sleeps first, `mock-done` ends an `llm_decides` loop.
#[derive(Default)]
struct MockProvider {
    calls: Mutex<Vec<(String, String)>>,
    files: Mutex<Vec<String>>,
}

impl MockProvider {
    fn prompt_for(&self, step: &str) -> Option<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|(s, _)| s == step)
            .map(|(_, p)| p.clone())
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn variant(&self) -> ProviderVariant {
        ProviderVariant::HostedApi
    }

    fn supports_model(&self, _model: &str) -> bool {
        true
    }

    fn configure(&mut self, _credential: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn send_prompt(&self, ctx: &CallContext, model: &str, prompt: &str) -> Result<String, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push((ctx.step.clone(), prompt.to_string()));
        match model {
            "mock-fail" => Err(ProviderError::terminal("mock", "model refused")),
            "mock-slow" => {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok(format!("out:{}", ctx.step))
            }
            "mock-done" => Ok("polished\nDONE".to_string()),
            _ => Ok(format!("out:{}", ctx.step)),
        }
    }

    async fn send_prompt_with_file(
        &self,
        ctx: &CallContext,
        model: &str,
        prompt: &str,
        file: &Path,
    ) -> Result<String, ProviderError> {
        self.files.lock().unwrap().push(file.display().to_string());
        self.send_prompt(ctx, model, prompt).await
    }

    fn set_verbose(&self, _verbose: bool) {}
}

struct Harness {
    processor: Processor,
    mock: Arc<MockProvider>,
    updates: mpsc::UnboundedReceiver<ProgressUpdate>,
}

/// Processor wired to a fresh mock provider, with no progress writer.
fn mock_processor(yaml: &str, env: EnvConfig, runtime_dir: Option<&Path>) -> (Processor, Arc<MockProvider>) {
    let config = WorkflowConfig::from_yaml(yaml).expect("workflow should parse");
    let mock = Arc::new(MockProvider::default());
    let dispatcher = ProviderDispatcher::new(
        Arc::new(ProviderRegistry::new(Vec::new())),
        vec![mock.clone() as Arc<dyn Provider>],
    )
    .with_retry_policy(RetryPolicy::none());

    let processor = Processor::new(config, env, None, false, runtime_dir.map(Path::to_path_buf))
        .with_dispatcher(Arc::new(dispatcher));
    (processor, mock)
}

impl Harness {
    fn new(yaml: &str, env: EnvConfig, runtime_dir: Option<&Path>) -> Self {
        let (mut processor, mock) = mock_processor(yaml, env, runtime_dir);
        let (tx, updates) = mpsc::unbounded_channel();
        processor.set_progress_writer(Arc::new(tx));
        Self {
            processor,
            mock,
            updates,
        }
    }

    /// `STDOUT` texts delivered so far, in order.
    fn stdout(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(update) = self.updates.try_recv() {
            if update.kind == ProgressKind::Output {
                out.extend(update.stdout);
            }
        }
        out
    }
}

#[tokio::test]
async fn test_variable_feeds_next_step() {
    let mut h = Harness::new(
        r#"
name: chain
steps:
  - name: summarize
    action: Summarize the text
    model: mock
    output: $summary
  - name: translate
    input: $summary
    action: Translate to French
    model: mock
"#,
        EnvConfig::default(),
        None,
    );
    h.processor.set_last_output("the quick brown fox");

    let summary = h.processor.process().await.unwrap();

    let first = h.mock.prompt_for("summarize").unwrap();
    assert_eq!(first, "Input:\nthe quick brown fox\n\nAction: Summarize the text");
    let second = h.mock.prompt_for("translate").unwrap();
    assert!(second.contains("out:summarize"));
    assert!(second.ends_with("Action: Translate to French"));

    assert_eq!(h.processor.value("$summary"), Some("out:summarize"));
    assert_eq!(h.stdout(), vec!["out:translate"]);
    assert_eq!(summary.output, "out:translate");
    assert_eq!(summary.steps.len(), 2);
}

#[tokio::test]
async fn test_parallel_group_failure_commits_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(
        r#"
name: fan-out
steps:
  - name: brief
    model: mock
    parallel_group: drafts
  - name: broken
    model: mock-fail
    parallel_group: drafts
    output: $broken
  - name: long
    model: mock-slow
    parallel_group: drafts
    output: long.md
  - name: after
    model: mock
"#,
        EnvConfig::default(),
        Some(dir.path()),
    );

    let err = h.processor.process().await.unwrap_err();

    assert_eq!(err.failed_step(), Some("broken"));
    assert!(h.stdout().is_empty());
    assert!(!dir.path().join("long.md").exists());
    assert!(h.mock.prompt_for("after").is_none());
}

#[tokio::test]
async fn test_parallel_group_commits_in_declaration_order() {
    let mut h = Harness::new(
        r#"
name: fan-out
steps:
  - name: slow
    model: mock-slow
    parallel_group: g
  - name: fast
    model: mock
    parallel_group: g
  - name: merge
    model: mock
"#,
        EnvConfig::default(),
        None,
    );
    h.processor.set_last_output("topic");

    h.processor.process().await.unwrap();

    assert_eq!(h.stdout(), vec!["out:slow", "out:fast", "out:merge"]);
    let merge = h.mock.prompt_for("merge").unwrap();
    assert!(merge.contains("out:slow\n\nout:fast"));
}

#[tokio::test]
async fn test_memory_file_is_shared_and_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let env = EnvConfig {
        memory_file: Some(dir.path().join("memory.md")),
        ..EnvConfig::default()
    };
    let mut h = Harness::new(
        r#"
name: remember
steps:
  - name: learn
    model: mock
    output: MEMORY
  - name: recall
    model: mock
    memory: true
    output: [MEMORY, STDOUT]
"#,
        env,
        None,
    );
    h.processor.set_last_output("user likes tea");
    h.processor.set_memory_context("session 42");

    h.processor.process().await.unwrap();

    let recall = h.mock.prompt_for("recall").unwrap();
    assert!(recall.starts_with("Memory context:\nsession 42\nout:learn"));
    let persisted = std::fs::read_to_string(dir.path().join("memory.md")).unwrap();
    assert_eq!(persisted, "out:learn\nout:recall\n");
}

#[tokio::test]
async fn test_next_action_runs_deferred_step() {
    let mut h = Harness::new(
        r#"
name: notify
steps:
  - name: draft
    model: mock
    output: $draft
    next_action: announce
  - name: announce
    type: deferred
    model: mock
"#,
        EnvConfig::default(),
        None,
    );
    h.processor.set_last_output("release 1.2");

    let summary = h.processor.process().await.unwrap();

    assert!(h.mock.prompt_for("announce").unwrap().contains("out:draft"));
    assert_eq!(h.stdout(), vec!["out:announce"]);
    assert_eq!(summary.output, "out:announce");

    let again = h.processor.run_deferred("announce").await.unwrap();
    assert_eq!(again, "out:announce");
    assert!(h.processor.run_deferred("missing").await.unwrap_err().is_config());
}

#[tokio::test]
async fn test_file_input_is_attached_and_output_written() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "meeting notes").unwrap();
    let mut h = Harness::new(
        r#"
name: files
steps:
  - name: read
    input: notes.txt
    model: mock
    output: out/summary.md
  - name: copy
    input: out/summary.md
    model: NA
    output: copy.md
"#,
        EnvConfig::default(),
        Some(dir.path()),
    );

    h.processor.process().await.unwrap();

    let files = h.mock.files.lock().unwrap().clone();
    assert_eq!(files, vec![dir.path().join("notes.txt").display().to_string()]);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("out/summary.md")).unwrap(),
        "out:read"
    );
    // the NA step made no provider call
    assert_eq!(h.mock.call_count(), 1);
    assert_eq!(std::fs::read_to_string(dir.path().join("copy.md")).unwrap(), "out:read");
}

#[tokio::test]
async fn test_loops_run_after_steps_in_dependency_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(
        r#"
name: refine
steps:
  - name: draft
    model: mock
    output: $draft
loops:
  - name: polish
    depends_on: review
    input_state: $reviewed
    output_state: final.md
    max_iterations: 3
    steps:
      - name: polish_step
        model: mock-done
  - name: review
    input_state: $draft
    output_state: $reviewed
    max_iterations: 2
    steps:
      - name: review_step
        model: mock
"#,
        EnvConfig::default(),
        Some(dir.path()),
    );
    h.processor.set_last_output("first idea");

    let summary = h.processor.process().await.unwrap();

    let names: Vec<&str> = summary.loops.iter().map(|l| l.name.as_str()).collect();
    assert_eq!(names, vec!["review", "polish"]);

    assert_eq!(summary.loops[0].outcome, LoopOutcome::MaxIterationsReached);
    assert_eq!(summary.loops[0].iterations, 2);
    assert!(h.mock.prompt_for("review_step").unwrap().contains("out:draft"));

    assert_eq!(summary.loops[1].outcome, LoopOutcome::Converged);
    assert_eq!(summary.loops[1].iterations, 1);
    assert_eq!(std::fs::read_to_string(dir.path().join("final.md")).unwrap(), "polished");
    assert_eq!(summary.output, "polished");
}

#[tokio::test]
async fn test_unknown_input_variable_is_reported() {
    let mut h = Harness::new(
        r#"
name: broken
steps:
  - name: only
    input: $never_set
    model: mock
"#,
        EnvConfig::default(),
        None,
    );

    let err = h.processor.process().await.unwrap_err();
    assert!(err.is_config());
    assert_eq!(h.mock.call_count(), 0);
}

#[tokio::test]
async fn test_stdin_reads_declared_predecessor_after_reorder() {
    let yaml = r#"
name: reorder
steps:
  - name: report
    input: $facts
    model: mock
    output: STDOUT
  - name: gather
    input: NA
    model: NA
    output: $facts
  - name: third
    action: Conclude
    model: mock
"#;
    let config = WorkflowConfig::from_yaml(yaml).unwrap();
    let plan = ExecutionPlan::build(&config).unwrap();
    let order: Vec<&str> = plan.order.iter().map(|&u| plan.graph.units[u].name.as_str()).collect();
    assert_eq!(order, vec!["gather", "report", "third"]);
    assert_eq!(plan.graph.stdin_source(2), Some(1));

    let mut h = Harness::new(yaml, EnvConfig::default(), None);
    h.processor.set_last_output("seed text");
    h.processor.process().await.unwrap();

    // gather passes its empty input through, so third gets no Input block
    assert_eq!(h.mock.prompt_for("third").unwrap(), "Action: Conclude");
    assert_eq!(h.stdout(), vec!["out:report", "out:third"]);
}

#[tokio::test]
async fn test_stdin_chain_follows_declared_unit_with_content() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("facts.txt"), "water boils at 100C").unwrap();
    let mut h = Harness::new(
        r#"
name: reorder
steps:
  - name: report
    input: $facts
    model: mock
    output: STDOUT
  - name: gather
    input: facts.txt
    model: NA
    output: $facts
  - name: third
    input: STDIN
    model: mock
"#,
        EnvConfig::default(),
        Some(dir.path()),
    );

    h.processor.process().await.unwrap();

    let report = h.mock.prompt_for("report").unwrap();
    assert!(report.contains("water boils at 100C"));
    let third = h.mock.prompt_for("third").unwrap();
    assert!(third.contains("water boils at 100C"));
    assert!(!third.contains("out:report"));
}

#[tokio::test]
async fn test_stdout_returned_without_progress_writer() {
    let (mut processor, _mock) = mock_processor(
        r#"
name: quiet
steps:
  - name: first
    model: mock
    output: [$first, STDOUT]
  - name: second
    input: $first
    model: mock
    output: STDOUT
"#,
        EnvConfig::default(),
        None,
    );
    processor.set_last_output("topic");

    let summary = processor.process().await.unwrap();

    assert_eq!(
        summary.stdout,
        vec![
            StdoutRecord { step: "first".into(), text: "out:first".into() },
            StdoutRecord { step: "second".into(), text: "out:second".into() },
        ]
    );

    // a second run starts from an empty log
    let again = processor.process().await.unwrap();
    assert_eq!(again.stdout.len(), 2);
}

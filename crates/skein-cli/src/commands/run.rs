//! `skein run` — Run a workflow end to end.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use console::style;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use skein_core::workflow::{LoopOutcome, ProgressUpdate, RunSummary};
use skein_core::{Processor, WorkflowConfig};

pub struct RunOptions<'a> {
    pub file: &'a str,
    pub input: Option<&'a str>,
    pub verbose: bool,
    pub runtime_dir: Option<&'a str>,
    pub config: Option<&'a str>,
    pub memory_file: Option<&'a str>,
    pub memory_context: Option<&'a str>,
    pub json: bool,
}

pub async fn run(opts: RunOptions<'_>) -> Result<(), String> {
    // Load .env / .env.local if present (for API keys, etc.)
    super::load_dotenv();

    let mut env = super::load_env_config(opts.config)?;
    if let Some(path) = opts.memory_file {
        env.memory_file = Some(PathBuf::from(path));
    }

    let workflow = WorkflowConfig::from_file(opts.file).map_err(|e| e.to_string())?;
    eprintln!(
        "📄 Loaded workflow: {} ({})",
        style(&workflow.name).bold(),
        opts.file
    );
    eprintln!(
        "   {} step(s), {} deferred, {} loop(s)",
        workflow.steps.len(),
        workflow.deferred.len(),
        workflow.loops.len()
    );
    eprintln!();

    let input = match opts.input {
        Some(text) => text.to_string(),
        None => read_piped_stdin().await?,
    };

    let mut processor = Processor::new(
        workflow,
        env,
        None,
        opts.verbose,
        opts.runtime_dir.map(PathBuf::from),
    );
    processor.set_last_output(input);
    if let Some(context) = opts.memory_context {
        processor.set_memory_context(context);
    }

    // STDOUT outputs are printed as each step commits them.
    let (tx, mut updates) = mpsc::unbounded_channel::<ProgressUpdate>();
    processor.set_progress_writer(Arc::new(tx));
    let printer = tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            if let Some(text) = update.stdout {
                println!("{}", text);
            }
        }
    });

    let result = processor.process().await;
    // closes the channel so the printer drains and exits
    drop(processor);
    let _ = printer.await;
    let summary = result.map_err(|e| format!("Workflow failed: {}", e))?;

    print_summary(&summary);
    if opts.json {
        let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
        eprintln!("{}", json);
    }
    Ok(())
}

/// Whole of stdin when it is piped; empty when it is a terminal.
async fn read_piped_stdin() -> Result<String, String> {
    if std::io::stdin().is_terminal() {
        return Ok(String::new());
    }
    let mut buf = String::new();
    tokio::io::stdin()
        .read_to_string(&mut buf)
        .await
        .map_err(|e| format!("Failed to read stdin: {}", e))?;
    Ok(buf)
}

fn print_summary(summary: &RunSummary) {
    eprintln!();
    for report in &summary.loops {
        let outcome = match &report.outcome {
            LoopOutcome::Converged => style("converged".to_string()).green(),
            LoopOutcome::GateFailed { gate, iteration } => {
                style(format!("gate '{}' failed on iteration {}", gate, iteration)).yellow()
            }
            LoopOutcome::TimedOut => style("timed out".to_string()).yellow(),
            LoopOutcome::MaxIterationsReached => style("hit max iterations".to_string()).yellow(),
        };
        eprintln!(
            "🔁 Loop {}: {} after {} iteration(s)",
            report.name, outcome, report.iterations
        );
    }
    eprintln!(
        "🎉 Workflow '{}' completed: {} step(s) in {:.1}s",
        summary.workflow,
        summary.steps.len(),
        summary.elapsed_ms as f64 / 1000.0
    );
}

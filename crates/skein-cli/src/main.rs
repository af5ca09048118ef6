//! Skein CLI — run and validate YAML-defined LLM workflows.
//!
//! Thin shell over `skein-core`: argument parsing, `.env` loading, logging
//! setup and human-readable banners. All execution lives in the core crate.

mod commands;

use clap::{Parser, Subcommand};

/// Skein — YAML-defined LLM workflows across hosted, local and CLI models
#[derive(Parser)]
#[command(name = "skein", version, about = "Skein — YAML-defined LLM workflows")]
pub struct Cli {
    /// Provider config file (defaults to ~/.skein/config.yaml when present)
    #[arg(long, global = true, env = "SKEIN_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow
    Run {
        /// Path to the workflow YAML file
        file: String,
        /// Text fed to the first step (read from piped stdin when omitted)
        #[arg(long)]
        input: Option<String>,
        /// Verbose output (prompt previews, provider debug logs)
        #[arg(long, short)]
        verbose: bool,
        /// Directory relative file refs are resolved against
        #[arg(long)]
        runtime_dir: Option<String>,
        /// Persistent memory file shared across runs
        #[arg(long, env = "SKEIN_MEMORY_FILE")]
        memory_file: Option<String>,
        /// Extra context prepended to memory for this run only
        #[arg(long)]
        memory_context: Option<String>,
        /// Print the run summary as JSON on stderr when done
        #[arg(long)]
        json: bool,
    },

    /// Validate a workflow and print its execution plan without running it
    Validate {
        /// Path to the workflow YAML file
        file: String,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the model catalog and which providers are usable here
    Models {
        /// Print the catalog as JSON
        #[arg(long)]
        json: bool,
    },
}

fn verbose_requested(cli: &Cli) -> bool {
    matches!(cli.command, Some(Commands::Run { verbose: true, .. }))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if verbose_requested(&cli) {
        "skein_core=debug,skein_cli=debug"
    } else {
        "skein_core=warn,skein_cli=info"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let result = match cli.command {
        Some(Commands::Run {
            file,
            input,
            verbose,
            runtime_dir,
            memory_file,
            memory_context,
            json,
        }) => {
            commands::run::run(commands::run::RunOptions {
                file: &file,
                input: input.as_deref(),
                verbose,
                runtime_dir: runtime_dir.as_deref(),
                config: cli.config.as_deref(),
                memory_file: memory_file.as_deref(),
                memory_context: memory_context.as_deref(),
                json,
            })
            .await
        }
        Some(Commands::Validate { file, json }) => commands::validate::validate(&file, json),
        Some(Commands::Models { json }) => commands::models::list(cli.config.as_deref(), json),
        None => {
            use clap::CommandFactory;
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("{} {}", console::style("Error:").red().bold(), e);
        std::process::exit(1);
    }
}

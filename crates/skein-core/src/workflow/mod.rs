//! Workflow engine — YAML-defined multi-step LLM workflows.
//!
//! # Architecture
//!
//! ```text
//! workflow.yaml ──► WorkflowConfig ──► ExecutionPlan (graph + topo order)
//!                                            │
//!                                        Processor ──► ProviderDispatcher
//!                                       │        │
//!                              MemoryStore   LoopController (agentic loops)
//! ```

pub mod agentic_loop;
pub mod executor;
pub mod graph;
pub mod memory;
pub mod progress;
pub mod schema;

pub use agentic_loop::{IterationRunner, LoopController, LoopOutcome, LoopReport};
pub use executor::{compose_prompt, Processor, RunSummary, StdoutRecord, StepRecord};
pub use graph::{loop_order, topological_sort, DependencyGraph, ExecutionPlan, ScheduleUnit};
pub use memory::MemoryStore;
pub use progress::{ProgressKind, ProgressUpdate, ProgressWriter, SharedProgressWriter};
pub use schema::{
    AgenticLoopConfig, DataRef, ExitCondition, GateFailAction, QualityGateConfig, Step, WorkflowConfig,
};

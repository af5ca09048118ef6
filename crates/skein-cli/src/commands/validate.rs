//! `skein validate` — Check a workflow and print its execution plan.

use console::style;
use serde::Serialize;

use skein_core::workflow::ExecutionPlan;
use skein_core::WorkflowConfig;

#[derive(Serialize)]
struct PlanReport<'a> {
    name: &'a str,
    entry_inputs: Vec<&'a str>,
    terminal_outputs: Vec<&'a str>,
    order: Vec<Unit<'a>>,
    deferred: Vec<&'a str>,
    loop_order: Vec<&'a str>,
}

#[derive(Serialize)]
struct Unit<'a> {
    name: &'a str,
    parallel: bool,
    steps: Vec<&'a str>,
}

/// Validate a workflow YAML file without executing it.
pub fn validate(file: &str, json: bool) -> Result<(), String> {
    let workflow = WorkflowConfig::from_file(file).map_err(|e| e.to_string())?;
    let plan = ExecutionPlan::build(&workflow).map_err(|e| e.to_string())?;

    let report = PlanReport {
        name: &workflow.name,
        entry_inputs: plan.graph.entry_inputs.iter().map(String::as_str).collect(),
        terminal_outputs: plan.graph.terminal_outputs.iter().map(String::as_str).collect(),
        order: plan
            .order
            .iter()
            .map(|&u| {
                let unit = &plan.graph.units[u];
                Unit {
                    name: &unit.name,
                    parallel: unit.parallel,
                    steps: unit.steps.iter().map(|&s| workflow.steps[s].name.as_str()).collect(),
                }
            })
            .collect(),
        deferred: workflow.deferred.iter().map(|s| s.name.as_str()).collect(),
        loop_order: plan.loop_names(&workflow),
    };

    if json {
        let out = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
        println!("{}", out);
        return Ok(());
    }

    println!("✅ Workflow '{}' is valid", style(report.name).bold());
    println!("   Entry inputs: {}", list_or_none(&report.entry_inputs));
    println!("   Terminal outputs: {}", list_or_none(&report.terminal_outputs));
    println!("   Execution order:");
    for (i, unit) in report.order.iter().enumerate() {
        if unit.parallel {
            println!("   {}. [{}] {}", i + 1, unit.name, unit.steps.join(" | "));
        } else {
            println!("   {}. {}", i + 1, unit.name);
        }
    }
    if !report.deferred.is_empty() {
        println!("   Deferred: {}", report.deferred.join(", "));
    }
    if !report.loop_order.is_empty() {
        println!("   Loop order: {}", report.loop_order.join(" -> "));
    }
    Ok(())
}

fn list_or_none(items: &[&str]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

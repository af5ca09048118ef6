//! Dependency graph and execution ordering.
//!
//! Steps are grouped into scheduling units: a sequential step is a unit of
//! its own, and all members of a parallel group form one unit sitting at the
//! slot of the group's first declared member. Edges are inferred from
//! input/output refs; `STDIN` on any unit but the first is an edge from the
//! unit declared right before it, and that unit's output is what it reads.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;

use super::schema::{DataRef, Step, WorkflowConfig};
use crate::error::{EngineError, Result};

/// A sequential step or a whole parallel group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleUnit {
    /// Step name, or group name for parallel groups
    pub name: String,
    /// Indices into the workflow's `steps`, in declaration order
    pub steps: Vec<usize>,
    pub parallel: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EdgeKind {
    /// The consumer reads a ref the producer writes
    Named(String),
    /// The consumer reads `STDIN`, i.e. the previous unit's output
    StdinChain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    /// Producing unit
    pub from: usize,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DependencyGraph {
    pub units: Vec<ScheduleUnit>,
    /// Refs read but not produced inside the workflow
    pub entry_inputs: BTreeSet<String>,
    /// Refs written but not read inside the workflow
    pub terminal_outputs: BTreeSet<String>,
    pub producer_of: BTreeMap<String, usize>,
    /// Incoming edges per unit
    pub depends_on: Vec<Vec<Edge>>,
}

/// Group `steps` into scheduling units.
pub fn schedule_units(steps: &[Step]) -> Vec<ScheduleUnit> {
    let mut units: Vec<ScheduleUnit> = Vec::new();
    let mut group_slot: BTreeMap<&str, usize> = BTreeMap::new();

    for (idx, step) in steps.iter().enumerate() {
        match step.parallel_group.as_deref() {
            Some(group) => match group_slot.get(group) {
                Some(&slot) => units[slot].steps.push(idx),
                None => {
                    group_slot.insert(group, units.len());
                    units.push(ScheduleUnit {
                        name: group.to_string(),
                        steps: vec![idx],
                        parallel: true,
                    });
                }
            },
            None => units.push(ScheduleUnit {
                name: step.name.clone(),
                steps: vec![idx],
                parallel: false,
            }),
        }
    }
    units
}

impl DependencyGraph {
    pub fn build(steps: &[Step]) -> Result<Self> {
        let units = schedule_units(steps);

        // ─── Producers ──────────────────────────────────────────────────
        let mut producer_of: BTreeMap<String, usize> = BTreeMap::new();
        for (u, unit) in units.iter().enumerate() {
            for &s in &unit.steps {
                for out in steps[s].outputs() {
                    let Some(key) = out.key() else { continue };
                    if let Some(&other) = producer_of.get(&key) {
                        if other != u || unit.parallel {
                            return Err(EngineError::Config(format!(
                                "Output '{}' is produced by both '{}' and '{}'",
                                key,
                                units[other].name,
                                steps[s].name
                            )));
                        }
                    }
                    producer_of.insert(key, u);
                }
            }
        }

        // ─── Consumers ──────────────────────────────────────────────────
        let mut entry_inputs = BTreeSet::new();
        let mut consumed: HashSet<String> = HashSet::new();
        let mut depends_on: Vec<Vec<Edge>> = vec![Vec::new(); units.len()];

        for (u, unit) in units.iter().enumerate() {
            for &s in &unit.steps {
                let step = &steps[s];
                for input in step.inputs() {
                    match &input {
                        DataRef::Stdin if u == 0 => {
                            entry_inputs.insert(input.to_string());
                        }
                        DataRef::Stdin => {
                            let edge = Edge { from: u - 1, kind: EdgeKind::StdinChain };
                            if !depends_on[u].contains(&edge) {
                                depends_on[u].push(edge);
                            }
                        }
                        DataRef::Tool(_) | DataRef::Na | DataRef::Memory | DataRef::Stdout => {}
                        DataRef::Var(_) | DataRef::Path(_) => {
                            let Some(key) = input.key() else { continue };
                            consumed.insert(key.clone());
                            match producer_of.get(&key) {
                                Some(&p) if p == u && unit.parallel => {
                                    return Err(EngineError::Config(format!(
                                        "Step '{}' reads '{}', which a sibling in parallel group '{}' produces",
                                        step.name, key, unit.name
                                    )));
                                }
                                Some(&p) if p == u => {}
                                Some(&p) => {
                                    let edge = Edge { from: p, kind: EdgeKind::Named(key) };
                                    if !depends_on[u].contains(&edge) {
                                        depends_on[u].push(edge);
                                    }
                                }
                                None => {
                                    entry_inputs.insert(key);
                                }
                            }
                        }
                    }
                }
            }
        }

        // ─── Terminal outputs ───────────────────────────────────────────
        let mut terminal_outputs = BTreeSet::new();
        for unit in &units {
            for &s in &unit.steps {
                for out in steps[s].outputs() {
                    match &out {
                        DataRef::Stdout => {
                            terminal_outputs.insert(out.to_string());
                        }
                        DataRef::Memory => {}
                        _ => {
                            if let Some(key) = out.key() {
                                if !consumed.contains(&key) {
                                    terminal_outputs.insert(key);
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(Self {
            units,
            entry_inputs,
            terminal_outputs,
            producer_of,
            depends_on,
        })
    }

    /// Unit whose output feeds `unit`'s `STDIN`, if it reads one.
    pub fn stdin_source(&self, unit: usize) -> Option<usize> {
        self.depends_on
            .get(unit)?
            .iter()
            .find(|e| e.kind == EdgeKind::StdinChain)
            .map(|e| e.from)
    }

    /// Units in execution order; declaration order breaks ties.
    pub fn execution_order(&self) -> Result<Vec<usize>> {
        let deps: Vec<Vec<usize>> = self
            .depends_on
            .iter()
            .map(|edges| edges.iter().map(|e| e.from).collect())
            .collect();
        topological_sort(&deps, |i| i, |i| self.units[i].name.clone())
    }
}

/// Kahn's algorithm over `deps` (node -> nodes it depends on).
///
/// Among ready nodes the one with the smallest `key` goes first. A cycle is
/// reported with the nodes on it, labelled by `label`.
pub fn topological_sort<K, F, L>(deps: &[Vec<usize>], key: F, label: L) -> Result<Vec<usize>>
where
    K: Ord,
    F: Fn(usize) -> K,
    L: Fn(usize) -> String,
{
    let n = deps.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (node, node_deps) in deps.iter().enumerate() {
        let unique: BTreeSet<usize> = node_deps.iter().copied().filter(|&d| d != node).collect();
        in_degree[node] = unique.len();
        for d in unique {
            dependents[d].push(node);
        }
    }

    let mut ready: BTreeSet<(K, usize)> = (0..n)
        .filter(|&i| in_degree[i] == 0)
        .map(|i| (key(i), i))
        .collect();
    let mut order = Vec::with_capacity(n);

    while let Some((_, node)) = ready.pop_first() {
        order.push(node);
        for &next in &dependents[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert((key(next), next));
            }
        }
    }

    if order.len() < n {
        let cycle = find_cycle(deps, &in_degree);
        return Err(EngineError::Cycle(cycle.into_iter().map(label).collect()));
    }
    Ok(order)
}

/// Walk unresolved dependencies from any stuck node until one repeats.
fn find_cycle(deps: &[Vec<usize>], in_degree: &[usize]) -> Vec<usize> {
    let stuck = |i: usize| in_degree[i] > 0;
    let Some(start) = (0..deps.len()).find(|&i| stuck(i)) else {
        return Vec::new();
    };

    let mut path: Vec<usize> = Vec::new();
    let mut node = start;
    loop {
        if let Some(pos) = path.iter().position(|&p| p == node) {
            // path runs consumer -> producer; report producer -> consumer
            let mut cycle: Vec<usize> = path[pos..].iter().rev().copied().collect();
            cycle.push(cycle[0]);
            return cycle;
        }
        path.push(node);
        match deps[node].iter().copied().find(|&d| d != node && stuck(d)) {
            Some(next) => node = next,
            None => return path,
        }
    }
}

/// Order in which agentic loops run.
///
/// `execute_loops` wins when present; otherwise loops are sorted by
/// `depends_on` and by `input_state` reading another loop's `output_state`,
/// ties broken by name.
pub fn loop_order(config: &WorkflowConfig) -> Result<Vec<usize>> {
    let loops = &config.loops;
    if let Some(explicit) = &config.execute_loops {
        return explicit
            .iter()
            .map(|name| {
                loops.iter().position(|l| &l.name == name).ok_or_else(|| {
                    EngineError::Config(format!("execute_loops names unknown loop '{}'", name))
                })
            })
            .collect();
    }

    let deps: Vec<Vec<usize>> = loops
        .iter()
        .map(|lp| {
            let mut d: Vec<usize> = lp
                .depends_on
                .iter()
                .filter_map(|name| loops.iter().position(|l| &l.name == name))
                .collect();
            if let Some(input) = &lp.input_state {
                d.extend(
                    loops
                        .iter()
                        .enumerate()
                        .filter(|(_, other)| other.output_state.as_ref() == Some(input))
                        .map(|(i, _)| i),
                );
            }
            d
        })
        .collect();

    topological_sort(&deps, |i| loops[i].name.clone(), |i| loops[i].name.clone())
}

/// Everything `validate` reports and `process` follows.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    pub graph: DependencyGraph,
    /// Unit indices in execution order
    pub order: Vec<usize>,
    /// Loop indices in execution order
    pub loop_order: Vec<usize>,
}

impl ExecutionPlan {
    pub fn build(config: &WorkflowConfig) -> Result<Self> {
        let graph = DependencyGraph::build(&config.steps)?;
        let order = graph.execution_order()?;
        let loop_order = loop_order(config)?;
        Ok(Self {
            graph,
            order,
            loop_order,
        })
    }

    pub fn unit_names(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|&u| self.graph.units[u].name.as_str())
            .collect()
    }

    pub fn loop_names<'a>(&self, config: &'a WorkflowConfig) -> Vec<&'a str> {
        self.loop_order
            .iter()
            .map(|&l| config.loops[l].name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, input: &[&str], output: &[&str]) -> Step {
        Step {
            name: name.to_string(),
            input: input.iter().map(|s| s.to_string()).collect(),
            output: output.iter().map(|s| s.to_string()).collect(),
            model: Some("m".to_string()),
            ..Step::default()
        }
    }

    fn grouped(mut s: Step, group: &str) -> Step {
        s.parallel_group = Some(group.to_string());
        s
    }

    #[test]
    fn test_stdin_to_stdout_chain() {
        let steps = vec![step("A", &["STDIN"], &["X"]), step("B", &["X"], &["STDOUT"])];
        let graph = DependencyGraph::build(&steps).unwrap();

        assert_eq!(graph.entry_inputs, BTreeSet::from(["STDIN".to_string()]));
        assert_eq!(graph.terminal_outputs, BTreeSet::from(["STDOUT".to_string()]));
        assert_eq!(graph.execution_order().unwrap(), vec![0, 1]);
        assert_eq!(
            graph.depends_on[1],
            vec![Edge { from: 0, kind: EdgeKind::Named("X".into()) }]
        );
    }

    #[test]
    fn test_duplicate_producer_rejected() {
        let steps = vec![step("A", &[], &["$x"]), step("B", &[], &["$x"])];
        let err = DependencyGraph::build(&steps).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("'$x'"));
    }

    #[test]
    fn test_stdout_and_memory_may_repeat() {
        let steps = vec![
            step("A", &[], &["STDOUT", "MEMORY"]),
            step("B", &["MEMORY"], &["STDOUT", "MEMORY"]),
        ];
        let graph = DependencyGraph::build(&steps).unwrap();
        assert!(!graph.entry_inputs.contains("MEMORY"));
        assert!(!graph.terminal_outputs.contains("MEMORY"));
    }

    #[test]
    fn test_forward_reference_reorders() {
        let steps = vec![
            step("report", &["$facts"], &["STDOUT"]),
            step("gather", &["NA"], &["$facts"]),
        ];
        let graph = DependencyGraph::build(&steps).unwrap();
        assert_eq!(graph.execution_order().unwrap(), vec![1, 0]);
        assert!(graph.entry_inputs.is_empty());
    }

    #[test]
    fn test_three_node_cycle() {
        let steps = vec![
            step("a", &["$c"], &["$a"]),
            step("b", &["$a"], &["$b"]),
            step("c", &["$b"], &["$c"]),
        ];
        let graph = DependencyGraph::build(&steps).unwrap();
        match graph.execution_order() {
            Err(EngineError::Cycle(nodes)) => {
                assert_eq!(nodes.len(), 4);
                assert_eq!(nodes.first(), nodes.last());
                for name in ["a", "b", "c"] {
                    assert!(nodes.contains(&name.to_string()));
                }
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_stdin_chain_edges() {
        let steps = vec![
            step("first", &[], &["$one"]),
            step("second", &["STDIN"], &["STDOUT"]),
            step("third", &[], &["STDOUT"]),
        ];
        let graph = DependencyGraph::build(&steps).unwrap();
        assert_eq!(graph.depends_on[1], vec![Edge { from: 0, kind: EdgeKind::StdinChain }]);
        assert_eq!(graph.depends_on[2], vec![Edge { from: 1, kind: EdgeKind::StdinChain }]);
        assert_eq!(graph.stdin_source(0), None);
        assert_eq!(graph.stdin_source(2), Some(1));
        assert_eq!(graph.entry_inputs, BTreeSet::from(["STDIN".to_string()]));
        assert!(graph.terminal_outputs.contains("$one"));
    }

    #[test]
    fn test_tool_and_na_not_entry_inputs() {
        let steps = vec![step("a", &["tool:git status", "NA"], &["STDOUT"])];
        let graph = DependencyGraph::build(&steps).unwrap();
        assert!(graph.entry_inputs.is_empty());
    }

    #[test]
    fn test_parallel_group_is_one_unit() {
        let steps = vec![
            step("prep", &[], &["$doc"]),
            grouped(step("x", &["$doc"], &["$x"]), "fan"),
            step("solo", &["STDIN"], &["STDOUT"]),
            grouped(step("y", &["$doc"], &["$y"]), "fan"),
            step("merge", &["$x", "$y"], &["STDOUT"]),
        ];
        let graph = DependencyGraph::build(&steps).unwrap();
        assert_eq!(graph.units.len(), 4);
        assert_eq!(graph.units[1].steps, vec![1, 3]);
        assert!(graph.units[1].parallel);
        assert_eq!(graph.producer_of["$y"], 1);
        assert_eq!(graph.execution_order().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_sibling_dependency_rejected() {
        let steps = vec![
            grouped(step("x", &[], &["$x"]), "fan"),
            grouped(step("y", &["$x"], &["$y"]), "fan"),
        ];
        let err = DependencyGraph::build(&steps).unwrap_err();
        assert!(err.to_string().contains("sibling"));
    }

    #[test]
    fn test_topological_sort_ties_by_key() {
        let deps = vec![vec![], vec![], vec![0, 1]];
        let names = ["zeta", "alpha", "omega"];
        let order = topological_sort(&deps, |i| names[i], |i| names[i].to_string()).unwrap();
        assert_eq!(order, vec![1, 0, 2]);
    }

    #[test]
    fn test_loop_order() {
        let yaml = r#"
loops:
  - name: polish
    input_state: draft.md
    steps: [{ name: p, model: m }]
  - name: write
    output_state: draft.md
    steps: [{ name: w, model: m }]
  - name: audit
    depends_on: polish
    steps: [{ name: a, model: m }]
  - name: lint
    steps: [{ name: l, model: m }]
"#;
        let config = WorkflowConfig::from_yaml(yaml).unwrap();
        let plan = ExecutionPlan::build(&config).unwrap();
        assert_eq!(plan.loop_names(&config), vec!["lint", "write", "polish", "audit"]);

        let mut explicit = config.clone();
        explicit.execute_loops = Some(vec!["audit".into(), "lint".into()]);
        let plan = ExecutionPlan::build(&explicit).unwrap();
        assert_eq!(plan.loop_names(&explicit), vec!["audit", "lint"]);
    }
}

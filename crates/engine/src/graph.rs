//! Step dependency graph and level computation.
//!
//! Steps are grouped into levels: every dependency of a step sits in a strictly earlier level,
//! and steps sharing a level have no dependency relation, so they may run concurrently. Levels
//! are minimal; each step lands in the first level whose predecessors are already placed.
//!
//! All iteration follows insertion order so levels and cycle reports are deterministic.

use std::collections::HashSet;

use indexmap::{IndexMap, IndexSet};
use regflow_types::WorkflowDefinition;

use crate::error::{ConfigurationError, CycleError};

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// step -> steps that must wait for it
    dependents: IndexMap<String, IndexSet<String>>,
    /// step -> steps it waits for
    dependencies: IndexMap<String, IndexSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the graph of a workflow definition.
    ///
    /// Returns an error for duplicate step identifiers or dependencies on undeclared steps.
    /// Cycles are reported later by [`DependencyGraph::compute_levels`].
    pub fn from_workflow(definition: &WorkflowDefinition) -> Result<Self, ConfigurationError> {
        let mut graph = Self::new();
        for step in &definition.steps {
            if graph.contains(&step.id) {
                return Err(ConfigurationError::DuplicateStep { step_id: step.id.clone() });
            }
            graph.add_step(step.id.clone());
        }

        for step in &definition.steps {
            for dependency in &step.depends_on {
                if !graph.contains(dependency) {
                    return Err(ConfigurationError::UnknownDependency {
                        step_id: step.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
                graph.add_dependency(dependency.clone(), step.id.clone());
            }
        }

        Ok(graph)
    }

    pub fn add_step(&mut self, step_id: impl Into<String>) {
        let step_id = step_id.into();
        self.dependents.entry(step_id.clone()).or_default();
        self.dependencies.entry(step_id).or_default();
    }

    /// Declares that `from` must finish before `to` starts. Unknown steps are added.
    pub fn add_dependency(&mut self, from: impl Into<String>, to: impl Into<String>) {
        let from = from.into();
        let to = to.into();
        self.add_step(from.clone());
        self.add_step(to.clone());
        self.dependents.entry(from.clone()).or_default().insert(to.clone());
        self.dependencies.entry(to).or_default().insert(from);
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.dependencies.contains_key(step_id)
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Depth-first search with an explicit recursion stack.
    ///
    /// Roots and edges are visited in insertion order, so the same graph always reports the same
    /// cycle.
    pub fn detect_cycle(&self) -> Result<(), CycleError> {
        let mut visited: HashSet<&str> = HashSet::new();

        for root in self.dependents.keys() {
            let root = root.as_str();
            if !visited.insert(root) {
                continue;
            }

            let mut path: Vec<&str> = vec![root];
            let mut on_path: HashSet<&str> = HashSet::from([root]);
            let mut frames: Vec<(&str, usize)> = vec![(root, 0)];

            while let Some(frame) = frames.last_mut() {
                let node = frame.0;
                let next = self.dependents.get(node).and_then(|children| children.get_index(frame.1));

                let Some(child) = next else {
                    frames.pop();
                    if let Some(finished) = path.pop() {
                        on_path.remove(finished);
                    }
                    continue;
                };
                frame.1 += 1;
                let child = child.as_str();

                if on_path.contains(child) {
                    let start = path.iter().position(|step| *step == child).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].iter().map(|step| step.to_string()).collect();
                    cycle.push(child.to_string());
                    return Err(CycleError { path: cycle });
                }

                if visited.insert(child) {
                    path.push(child);
                    on_path.insert(child);
                    frames.push((child, 0));
                }
            }
        }

        Ok(())
    }

    /// Groups steps into concurrency-safe levels by iterative layering.
    pub fn compute_levels(&self) -> Result<Vec<Vec<String>>, CycleError> {
        self.detect_cycle()?;

        let mut placed: HashSet<&str> = HashSet::with_capacity(self.len());
        let mut levels = Vec::new();

        while placed.len() < self.len() {
            let level: Vec<&str> = self
                .dependencies
                .iter()
                .filter(|(step_id, _)| !placed.contains(step_id.as_str()))
                .filter(|(_, dependencies)| dependencies.iter().all(|dependency| placed.contains(dependency.as_str())))
                .map(|(step_id, _)| step_id.as_str())
                .collect();

            if level.is_empty() {
                let remaining = self
                    .dependencies
                    .keys()
                    .filter(|step_id| !placed.contains(step_id.as_str()))
                    .cloned()
                    .collect();
                return Err(CycleError { path: remaining });
            }

            placed.extend(level.iter().copied());
            levels.push(level.into_iter().map(str::to_string).collect());
        }

        Ok(levels)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use regflow_types::{StepKind, WorkflowDefinition, WorkflowStep};

    use super::DependencyGraph;
    use crate::error::ConfigurationError;

    fn workflow(steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        WorkflowDefinition {
            workflow_id: "demo".into(),
            report_id: "report".into(),
            description: None,
            steps,
        }
    }

    fn level_index(levels: &[Vec<String>]) -> HashMap<&str, usize> {
        levels
            .iter()
            .enumerate()
            .flat_map(|(index, level)| level.iter().map(move |step_id| (step_id.as_str(), index)))
            .collect()
    }

    #[test]
    fn levels_respect_dependencies_even_when_declared_out_of_order() {
        let definition = workflow(vec![
            WorkflowStep::new("render", StepKind::Rendering).depends_on(["aggregate"]),
            WorkflowStep::new("aggregate", StepKind::Aggregation).depends_on(["validate"]),
            WorkflowStep::new("validate", StepKind::Validation).depends_on(["extract"]),
            WorkflowStep::new("extract", StepKind::Extraction),
        ]);

        let levels = DependencyGraph::from_workflow(&definition).expect("graph").compute_levels().expect("levels");
        assert_eq!(
            levels,
            vec![vec!["extract"], vec!["validate"], vec!["aggregate"], vec!["render"]]
        );
    }

    #[test]
    fn independent_steps_share_a_level() {
        let mut graph = DependencyGraph::new();
        graph.add_step("trades");
        graph.add_step("positions");
        graph.add_dependency("trades", "merge");
        graph.add_dependency("positions", "merge");
        graph.add_step("audit");

        let levels = graph.compute_levels().expect("levels");
        assert_eq!(levels, vec![vec!["trades", "positions", "audit"], vec!["merge"]]);
    }

    #[test]
    fn every_step_lands_in_exactly_one_level_after_its_dependencies() {
        let mut graph = DependencyGraph::new();
        let edges = [("a", "c"), ("b", "c"), ("c", "e"), ("d", "e"), ("a", "e"), ("e", "f"), ("b", "f")];
        for step_id in ["a", "b", "c", "d", "e", "f", "g"] {
            graph.add_step(step_id);
        }
        for (from, to) in edges {
            graph.add_dependency(from, to);
        }

        let levels = graph.compute_levels().expect("levels");
        let index = level_index(&levels);
        let total: usize = levels.iter().map(Vec::len).sum();
        assert_eq!(total, 7);
        assert_eq!(index.len(), 7);
        for (from, to) in edges {
            assert!(index[from] < index[to], "{from} should precede {to}: {levels:?}");
        }
        // Minimality: f only needs e (level 2), so it sits in level 3.
        assert_eq!(index["f"], 3);
        assert_eq!(index["g"], 0);
    }

    #[test]
    fn cycle_is_reported_with_its_path() {
        let mut graph = DependencyGraph::new();
        graph.add_step("start");
        graph.add_dependency("start", "first");
        graph.add_dependency("first", "second");
        graph.add_dependency("second", "third");
        graph.add_dependency("third", "first");

        let error = graph.compute_levels().expect_err("should detect cycle");
        assert_eq!(error.path, vec!["first", "second", "third", "first"]);
        assert_eq!(error.to_string(), "cycle detected in workflow steps: first -> second -> third -> first");
    }

    #[test]
    fn cycle_message_is_stable_across_calls() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("x", "y");
        graph.add_dependency("y", "x");
        let first = graph.compute_levels().expect_err("cycle").to_string();
        let second = graph.compute_levels().expect_err("cycle").to_string();
        assert_eq!(first, second);
        assert_eq!(first, "cycle detected in workflow steps: x -> y -> x");
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let definition = workflow(vec![WorkflowStep::new("only", StepKind::Extraction).depends_on(["only"])]);
        let error = DependencyGraph::from_workflow(&definition)
            .expect("graph")
            .compute_levels()
            .expect_err("self cycle");
        assert_eq!(error.path, vec!["only", "only"]);
    }

    #[test]
    fn unknown_dependency_is_a_configuration_error() {
        let definition = workflow(vec![WorkflowStep::new("only", StepKind::Validation).depends_on(["missing"])]);
        let error = DependencyGraph::from_workflow(&definition).expect_err("should fail");
        assert!(matches!(error, ConfigurationError::UnknownDependency { .. }));
        assert!(error.to_string().contains("depends on unknown step"), "unexpected error: {error}");
    }

    #[test]
    fn duplicate_step_is_a_configuration_error() {
        let definition = workflow(vec![
            WorkflowStep::new("dup", StepKind::Extraction),
            WorkflowStep::new("dup", StepKind::Validation),
        ]);
        let error = DependencyGraph::from_workflow(&definition).expect_err("should fail");
        assert!(matches!(error, ConfigurationError::DuplicateStep { ref step_id } if step_id == "dup"));
    }
}

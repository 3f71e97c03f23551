// Execution Graph (DAG) Builder
// Unifies stage barriers and `needs` into one job graph for execution ordering

use crate::parser::models::{JobSpec, PipelineDefinition, When};
use crate::rules::{RuleDecision, RuleEvaluation};

use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;

/// Error type for graph operations
#[derive(Debug, Clone)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
    /// Jobs involved (the cycle path for cyclic dependencies)
    pub jobs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// Circular dependency detected
    CyclicDependency,
    /// Reference to a job that is unknown or excluded by rules
    UnknownDependency,
    /// Job names a stage that is not declared
    UnknownStage,
    /// Reference points to a later stage
    StageOrder,
    /// Invalid pipeline structure
    InvalidStructure,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph error: {}", self.message)
    }
}

impl std::error::Error for GraphError {}

impl GraphError {
    pub fn cyclic(cycle: Vec<String>) -> Self {
        Self {
            message: format!("circular dependency detected: {}", cycle.join(" -> ")),
            kind: GraphErrorKind::CyclicDependency,
            jobs: cycle,
        }
    }

    pub fn unknown_dependency(job: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::UnknownDependency,
            jobs: vec![job.to_string()],
        }
    }

    pub fn unknown_stage(job: &str, stage: &str) -> Self {
        Self {
            message: format!("job '{}' uses undeclared stage '{}'", job, stage),
            kind: GraphErrorKind::UnknownStage,
            jobs: vec![job.to_string()],
        }
    }

    pub fn stage_order(job: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::StageOrder,
            jobs: vec![job.to_string()],
        }
    }

    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::InvalidStructure,
            jobs: Vec::new(),
        }
    }
}

/// Why one job waits for another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Implicit edge to every job of the nearest earlier non-empty stage
    Barrier,
    /// Explicit `needs:` edge
    Needs,
}

/// Edge to an upstream job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub upstream: usize,
    pub kind: EdgeKind,
}

/// A job that survived rule evaluation, with its effective `when`
#[derive(Debug, Clone)]
pub struct PlannedJob {
    pub spec: JobSpec,
    pub when: When,
    pub allow_failure: bool,
    /// Variables contributed by the matching rule
    pub variables: HashMap<String, String>,
}

impl PlannedJob {
    /// Plan a job with no rules applied
    pub fn from_spec(spec: JobSpec) -> Self {
        let when = spec.when;
        let allow_failure = spec.allow_failure.unwrap_or(when == When::Manual);
        Self {
            spec,
            when,
            allow_failure,
            variables: HashMap::new(),
        }
    }
}

/// A node representing a job in the execution graph
#[derive(Debug, Clone)]
pub struct JobNode {
    pub index: usize,
    pub name: String,
    pub stage: String,
    /// Position of the stage in the pipeline's stage order
    pub stage_index: usize,
    pub spec: JobSpec,
    pub when: When,
    pub allow_failure: bool,
    pub rule_variables: HashMap<String, String>,
    /// Upstream edges this job waits for
    pub dependencies: Vec<Edge>,
    /// Jobs whose artifacts are restored before this job runs
    pub artifact_sources: Vec<usize>,
    /// Sources named explicitly in `dependencies:`
    pub explicit_artifacts: bool,
}

impl JobNode {
    /// Whether a failure of this job fails its stage and the pipeline
    pub fn is_required(&self) -> bool {
        !self.allow_failure
    }
}

/// Validated job DAG
#[derive(Debug, Clone)]
pub struct JobGraph {
    /// Pipeline stage order (including `.pre` and `.post`)
    pub stages: Vec<String>,
    nodes: Vec<JobNode>,
    indices: HashMap<String, usize>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl JobGraph {
    /// Build the graph for the jobs a rule evaluation included
    pub fn from_pipeline(
        pipeline: &PipelineDefinition,
        evaluation: &RuleEvaluation,
    ) -> Result<Self, GraphError> {
        let mut planned = Vec::new();
        let mut excluded = HashSet::new();

        for job in &pipeline.jobs {
            match evaluation.decision(&job.name) {
                Some(RuleDecision::Include {
                    when,
                    allow_failure,
                    variables,
                }) => planned.push(PlannedJob {
                    spec: job.clone(),
                    when: *when,
                    allow_failure: *allow_failure,
                    variables: variables.clone(),
                }),
                Some(RuleDecision::Exclude { .. }) | None => {
                    excluded.insert(job.name.clone());
                }
            }
        }

        Self::build(&pipeline.effective_stages(), planned, &excluded)
    }

    /// Build the graph from planned jobs.
    ///
    /// `excluded` holds jobs that exist in the definition but were pruned by
    /// rules; `needs` on them is dropped when optional and an error otherwise.
    pub fn build(
        stages: &[String],
        jobs: Vec<PlannedJob>,
        excluded: &HashSet<String>,
    ) -> Result<Self, GraphError> {
        let stage_positions: HashMap<&str, usize> = stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i))
            .collect();

        let mut nodes = Vec::with_capacity(jobs.len());
        let mut indices = HashMap::new();

        for (index, job) in jobs.into_iter().enumerate() {
            let name = job.spec.name.clone();
            let Some(&stage_index) = stage_positions.get(job.spec.stage.as_str()) else {
                return Err(GraphError::unknown_stage(&name, &job.spec.stage));
            };
            if indices.insert(name.clone(), index).is_some() {
                return Err(GraphError::invalid_structure(format!(
                    "job '{}' is defined twice",
                    name
                )));
            }

            nodes.push(JobNode {
                index,
                name,
                stage: job.spec.stage.clone(),
                stage_index,
                spec: job.spec,
                when: job.when,
                allow_failure: job.allow_failure,
                rule_variables: job.variables,
                dependencies: Vec::new(),
                artifact_sources: Vec::new(),
                explicit_artifacts: false,
            });
        }

        for index in 0..nodes.len() {
            let (dependencies, artifact_sources, explicit) =
                Self::resolve_edges(&nodes, &indices, excluded, index)?;
            let node = &mut nodes[index];
            node.dependencies = dependencies;
            node.artifact_sources = artifact_sources;
            node.explicit_artifacts = explicit;
        }

        let mut dependents = vec![Vec::new(); nodes.len()];
        for node in &nodes {
            for edge in &node.dependencies {
                dependents[edge.upstream].push(node.index);
            }
        }

        let mut graph = Self {
            stages: stages.to_vec(),
            nodes,
            indices,
            dependents,
            order: Vec::new(),
        };
        graph.order = graph.kahn_order()?;

        Ok(graph)
    }

    /// Edges and artifact sources of one job
    fn resolve_edges(
        nodes: &[JobNode],
        indices: &HashMap<String, usize>,
        excluded: &HashSet<String>,
        index: usize,
    ) -> Result<(Vec<Edge>, Vec<usize>, bool), GraphError> {
        let node = &nodes[index];
        let mut edges = Vec::new();
        let mut needs_artifacts = Vec::new();

        if let Some(needs) = &node.spec.needs {
            for need in needs {
                let target = match indices.get(need.job()) {
                    Some(&target) => target,
                    None if excluded.contains(need.job()) && need.optional() => continue,
                    None if excluded.contains(need.job()) => {
                        return Err(GraphError::unknown_dependency(
                            &node.name,
                            format!(
                                "job '{}' needs '{}', which is not in this pipeline",
                                node.name,
                                need.job()
                            ),
                        ))
                    }
                    None => {
                        return Err(GraphError::unknown_dependency(
                            &node.name,
                            format!("job '{}' needs unknown job '{}'", node.name, need.job()),
                        ))
                    }
                };

                if nodes[target].stage_index > node.stage_index {
                    return Err(GraphError::stage_order(
                        &node.name,
                        format!(
                            "job '{}' needs '{}' from later stage '{}'",
                            node.name, nodes[target].name, nodes[target].stage
                        ),
                    ));
                }

                edges.push(Edge {
                    upstream: target,
                    kind: EdgeKind::Needs,
                });
                if need.artifacts() {
                    needs_artifacts.push(target);
                }
            }
        } else if let Some(barrier_stage) = nodes
            .iter()
            .map(|n| n.stage_index)
            .filter(|&s| s < node.stage_index)
            .max()
        {
            edges.extend(
                nodes
                    .iter()
                    .filter(|n| n.stage_index == barrier_stage)
                    .map(|n| Edge {
                        upstream: n.index,
                        kind: EdgeKind::Barrier,
                    }),
            );
        }

        if let Some(dependencies) = &node.spec.dependencies {
            let mut sources = Vec::new();
            for dep in dependencies {
                let Some(&target) = indices.get(dep) else {
                    return Err(GraphError::unknown_dependency(
                        &node.name,
                        format!(
                            "job '{}' takes artifacts from '{}', which is not in this pipeline",
                            node.name, dep
                        ),
                    ));
                };
                if nodes[target].stage_index >= node.stage_index {
                    return Err(GraphError::stage_order(
                        &node.name,
                        format!(
                            "job '{}' takes artifacts from '{}', which is not in an earlier stage",
                            node.name, dep
                        ),
                    ));
                }
                sources.push(target);
            }
            return Ok((edges, sources, true));
        }

        let sources = if node.spec.needs.is_some() {
            needs_artifacts
        } else {
            nodes
                .iter()
                .filter(|n| n.stage_index < node.stage_index)
                .map(|n| n.index)
                .collect()
        };

        Ok((edges, sources, false))
    }

    /// Kahn's algorithm; ties broken by (stage position, declaration order)
    fn kahn_order(&self) -> Result<Vec<usize>, GraphError> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.dependencies.len()).collect();
        let mut ready: BinaryHeap<Reverse<(usize, usize)>> = self
            .nodes
            .iter()
            .filter(|n| n.dependencies.is_empty())
            .map(|n| Reverse((n.stage_index, n.index)))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse((_, index))) = ready.pop() {
            order.push(index);
            for &dependent in &self.dependents[index] {
                let degree = &mut in_degree[dependent];
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse((self.nodes[dependent].stage_index, dependent)));
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(GraphError::cyclic(self.find_cycle()));
        }

        Ok(order)
    }

    /// Find one dependency cycle (as a name path) using DFS
    fn find_cycle(&self) -> Vec<String> {
        #[derive(Clone, Copy, PartialEq)]
        enum NodeState {
            Unvisited,
            Visiting,
            Visited,
        }

        fn visit(
            graph: &JobGraph,
            index: usize,
            states: &mut [NodeState],
            path: &mut Vec<usize>,
        ) -> Option<Vec<usize>> {
            match states[index] {
                NodeState::Visiting => {
                    let start = path.iter().position(|&i| i == index).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(index);
                    return Some(cycle);
                }
                NodeState::Visited => return None,
                NodeState::Unvisited => {}
            }

            states[index] = NodeState::Visiting;
            path.push(index);
            for edge in &graph.nodes[index].dependencies {
                if let Some(cycle) = visit(graph, edge.upstream, states, path) {
                    return Some(cycle);
                }
            }
            path.pop();
            states[index] = NodeState::Visited;
            None
        }

        let mut states = vec![NodeState::Unvisited; self.nodes.len()];
        for index in 0..self.nodes.len() {
            let mut path = Vec::new();
            if let Some(mut cycle) = visit(self, index, &mut states, &mut path) {
                // Path follows dependency edges; report it in execution direction
                cycle.reverse();
                return cycle
                    .into_iter()
                    .map(|i| self.nodes[i].name.clone())
                    .collect();
            }
        }
        Vec::new()
    }

    /// Jobs in an order consistent with every edge
    pub fn topological_order(&self) -> Vec<&JobNode> {
        self.order.iter().map(|&i| &self.nodes[i]).collect()
    }

    /// Group jobs into waves that could run in parallel
    pub fn levels(&self) -> Vec<Vec<&JobNode>> {
        let mut level = vec![0usize; self.nodes.len()];
        for &index in &self.order {
            level[index] = self.nodes[index]
                .dependencies
                .iter()
                .map(|e| level[e.upstream] + 1)
                .max()
                .unwrap_or(0);
        }

        let depth = level.iter().copied().max().map(|m| m + 1).unwrap_or(0);
        let mut levels: Vec<Vec<&JobNode>> = vec![Vec::new(); depth];
        for &index in &self.order {
            levels[level[index]].push(&self.nodes[index]);
        }
        levels
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[JobNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &JobNode {
        &self.nodes[index]
    }

    pub fn get(&self, name: &str) -> Option<&JobNode> {
        self.index_of(name).map(|i| &self.nodes[i])
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.indices.get(name).copied()
    }

    /// Jobs that wait for the given job
    pub fn dependents(&self, index: usize) -> &[usize] {
        &self.dependents[index]
    }

    /// Jobs of a stage in declaration order
    pub fn jobs_in_stage<'a>(&'a self, stage: &'a str) -> impl Iterator<Item = &'a JobNode> + 'a {
        self.nodes.iter().filter(move |n| n.stage == stage)
    }

    /// Stages that still hold at least one job, in pipeline order
    pub fn active_stages(&self) -> Vec<&str> {
        self.stages
            .iter()
            .enumerate()
            .filter(|(i, _)| self.nodes.iter().any(|n| n.stage_index == *i))
            .map(|(_, s)| s.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::models::Need;
    use crate::parser::PipelineParser;
    use crate::rules::{RuleContext, RuleEvaluator};

    use proptest::prelude::*;

    fn graph_for(yaml: &str) -> Result<JobGraph, GraphError> {
        let pipeline = PipelineParser::parse(yaml).unwrap();
        let ctx = RuleContext::for_branch("main");
        let evaluation = RuleEvaluator::new(&ctx, &pipeline.variables).evaluate_pipeline(&pipeline);
        JobGraph::from_pipeline(&pipeline, &evaluation)
    }

    fn upstream_names(graph: &JobGraph, job: &str) -> Vec<String> {
        let mut names: Vec<String> = graph
            .get(job)
            .unwrap()
            .dependencies
            .iter()
            .map(|e| graph.node(e.upstream).name.clone())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_barrier_edges_to_previous_stage() {
        let graph = graph_for(
            r#"
stages: [build, test, deploy]
compile:
  stage: build
  script: make
lint:
  stage: test
  script: lint
unit:
  stage: test
  script: test
ship:
  stage: deploy
  script: ship
"#,
        )
        .unwrap();

        assert_eq!(upstream_names(&graph, "compile"), Vec::<String>::new());
        assert_eq!(upstream_names(&graph, "unit"), vec!["compile"]);
        assert_eq!(upstream_names(&graph, "ship"), vec!["lint", "unit"]);
        assert!(graph
            .get("ship")
            .unwrap()
            .dependencies
            .iter()
            .all(|e| e.kind == EdgeKind::Barrier));
    }

    #[test]
    fn test_barrier_skips_empty_stages() {
        let graph = graph_for(
            r#"
stages: [build, test, deploy]
compile:
  stage: build
  script: make
ship:
  stage: deploy
  script: ship
"#,
        )
        .unwrap();
        assert_eq!(upstream_names(&graph, "ship"), vec!["compile"]);
        assert_eq!(graph.active_stages(), vec!["build", "deploy"]);
    }

    #[test]
    fn test_needs_replace_barrier() {
        let graph = graph_for(
            r#"
stages: [build, test, deploy]
compile:
  stage: build
  script: make
docs:
  stage: build
  script: docs
slow_test:
  stage: test
  script: test
ship:
  stage: deploy
  script: ship
  needs: [compile]
early:
  stage: deploy
  script: early
  needs: []
"#,
        )
        .unwrap();

        assert_eq!(upstream_names(&graph, "ship"), vec!["compile"]);
        assert_eq!(graph.get("ship").unwrap().dependencies[0].kind, EdgeKind::Needs);
        assert!(graph.get("early").unwrap().dependencies.is_empty());
        assert!(graph.get("early").unwrap().artifact_sources.is_empty());
    }

    #[test]
    fn test_artifact_sources() {
        let graph = graph_for(
            r#"
stages: [build, test, deploy]
compile:
  stage: build
  script: make
docs:
  stage: build
  script: docs
unit:
  stage: test
  script: test
package:
  stage: deploy
  script: pkg
  dependencies: [compile]
ship:
  stage: deploy
  script: ship
  needs:
    - job: unit
      artifacts: false
    - docs
"#,
        )
        .unwrap();

        let names = |job: &str| -> Vec<String> {
            graph
                .get(job)
                .unwrap()
                .artifact_sources
                .iter()
                .map(|&i| graph.node(i).name.clone())
                .collect()
        };
        assert_eq!(names("unit"), vec!["compile", "docs"]);
        assert_eq!(names("package"), vec!["compile"]);
        assert!(graph.get("package").unwrap().explicit_artifacts);
        assert_eq!(names("ship"), vec!["docs"]);
    }

    #[test]
    fn test_cycle_detected() {
        let err = graph_for(
            r#"
a:
  script: x
  needs: [c]
b:
  script: x
  needs: [a]
c:
  script: x
  needs: [b]
"#,
        )
        .unwrap_err();

        assert_eq!(err.kind, GraphErrorKind::CyclicDependency);
        assert_eq!(err.jobs.len(), 4);
        assert_eq!(err.jobs.first(), err.jobs.last());
    }

    #[test]
    fn test_unknown_and_excluded_needs() {
        let err = graph_for("a:\n  script: x\n  needs: [ghost]\n").unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::UnknownDependency);

        let excluded = r#"
tagged:
  script: x
  rules:
    - if: $CI_COMMIT_TAG
after:
  script: y
  needs: [tagged]
"#;
        let err = graph_for(excluded).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::UnknownDependency);
        assert!(err.message.contains("not in this pipeline"));

        let optional = r#"
tagged:
  script: x
  rules:
    - if: $CI_COMMIT_TAG
after:
  script: y
  needs:
    - job: tagged
      optional: true
"#;
        let graph = graph_for(optional).unwrap();
        assert_eq!(graph.len(), 1);
        assert!(graph.get("after").unwrap().dependencies.is_empty());
    }

    #[test]
    fn test_stage_errors() {
        let err = graph_for("a:\n  stage: nope\n  script: x\n").unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::UnknownStage);

        let err = graph_for(
            r#"
a:
  stage: build
  script: x
  needs: [b]
b:
  stage: deploy
  script: y
"#,
        )
        .unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::StageOrder);
    }

    #[test]
    fn test_pre_and_post_stages() {
        let graph = graph_for(
            r#"
stages: [build]
setup:
  stage: .pre
  script: x
compile:
  stage: build
  script: y
cleanup:
  stage: .post
  script: z
"#,
        )
        .unwrap();

        let order: Vec<&str> = graph
            .topological_order()
            .iter()
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(order, vec!["setup", "compile", "cleanup"]);
    }

    #[test]
    fn test_levels() {
        let graph = graph_for(
            r#"
stages: [build, test]
a:
  stage: build
  script: x
b:
  stage: build
  script: x
c:
  stage: test
  script: x
d:
  stage: test
  script: x
  needs: []
"#,
        )
        .unwrap();

        let levels: Vec<Vec<&str>> = graph
            .levels()
            .iter()
            .map(|l| l.iter().map(|n| n.name.as_str()).collect())
            .collect();
        assert_eq!(levels, vec![vec!["a", "b", "d"], vec!["c"]]);
    }

    fn planned(name: &str, stage: &str, needs: Option<Vec<String>>) -> PlannedJob {
        let mut spec = JobSpec::new(name, stage);
        spec.script = vec!["true".to_string()];
        spec.needs = needs.map(|n| n.into_iter().map(Need::Job).collect());
        PlannedJob::from_spec(spec)
    }

    proptest! {
        #[test]
        fn test_topological_order_respects_edges(
            shape in proptest::collection::vec(
                (0usize..4, proptest::option::of(proptest::collection::vec(any::<prop::sample::Index>(), 0..3))),
                1..16,
            )
        ) {
            let stages: Vec<String> = (0..4).map(|i| format!("s{}", i)).collect();
            let mut stage_of = Vec::new();
            let mut jobs = Vec::new();

            for (i, (stage, needs)) in shape.iter().enumerate() {
                // needs only point at earlier-declared jobs in the same or an earlier stage
                let candidates: Vec<usize> = (0..i).filter(|&j| stage_of[j] <= *stage).collect();
                let needs = needs.as_ref().map(|picks| {
                    let mut names: Vec<String> = picks
                        .iter()
                        .filter(|_| !candidates.is_empty())
                        .map(|p| format!("j{}", candidates[p.index(candidates.len())]))
                        .collect();
                    names.dedup();
                    names
                });
                stage_of.push(*stage);
                jobs.push(planned(&format!("j{}", i), &stages[*stage], needs));
            }

            let graph = JobGraph::build(&stages, jobs, &HashSet::new()).unwrap();
            let order = graph.topological_order();
            prop_assert_eq!(order.len(), graph.len());

            let position: HashMap<usize, usize> =
                order.iter().enumerate().map(|(pos, n)| (n.index, pos)).collect();
            for node in graph.nodes() {
                for edge in &node.dependencies {
                    prop_assert!(position[&edge.upstream] < position[&node.index]);
                }
            }
        }

        #[test]
        fn test_cycles_always_rejected(len in 2usize..8) {
            let stages = vec!["test".to_string()];
            let jobs: Vec<PlannedJob> = (0..len)
                .map(|i| planned(&format!("j{}", i), "test", Some(vec![format!("j{}", (i + 1) % len)])))
                .collect();

            let err = JobGraph::build(&stages, jobs, &HashSet::new()).unwrap_err();
            prop_assert_eq!(err.kind, GraphErrorKind::CyclicDependency);
        }
    }
}

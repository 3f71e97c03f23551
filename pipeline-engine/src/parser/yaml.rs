// Pipeline YAML Parser
// Reads pipeline files into a PipelineDefinition, resolving `extends` and anchors

use crate::parser::error::{ParseError, ParseErrorKind, ParseResult, ValidationError};
use crate::parser::models::*;
use crate::utils::{parse_duration, parse_expiry};

use serde_yaml::{Mapping, Value};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

/// Maximum `extends` nesting depth
const MAX_EXTENDS_DEPTH: usize = 11;

/// Maximum value accepted by `retry`
pub const MAX_RETRY: u32 = 2;

/// Top-level keys that are not jobs
const RESERVED_KEYS: &[&str] = &[
    "stages",
    "default",
    "variables",
    "image",
    "before_script",
    "after_script",
    "cache",
];

/// Top-level keys recognised by other CI systems but not handled here
const UNSUPPORTED_KEYS: &[&str] = &["include", "workflow", "services", "pages"];

/// Pipeline file parser
pub struct PipelineParser;

impl PipelineParser {
    /// Parse pipeline from YAML string
    pub fn parse(content: &str) -> ParseResult<PipelineDefinition> {
        let mut root: Value =
            serde_yaml::from_str(content).map_err(|e| ParseError::from_yaml_error(&e, content))?;
        root.apply_merge()
            .map_err(|e| ParseError::from_yaml_error(&e, content))?;

        let mapping = match root {
            Value::Mapping(mapping) => mapping,
            Value::Null => Mapping::new(),
            _ => {
                return Err(ParseError::new("pipeline file must be a mapping", 1, 1)
                    .with_kind(ParseErrorKind::InvalidSchema))
            }
        };

        let mut definition = PipelineDefinition {
            stages: default_stages(),
            ..Default::default()
        };
        let mut legacy = Mapping::new();
        let mut raw_jobs: Vec<(String, Value)> = Vec::new();
        let mut templates: HashMap<String, Value> = HashMap::new();

        for (key, value) in mapping {
            let Some(key) = key.as_str().map(str::to_string) else {
                return Err(ParseError::new("top-level keys must be strings", 0, 0));
            };

            match key.as_str() {
                "stages" => {
                    definition.stages = serde_yaml::from_value(value).map_err(|e| {
                        ParseError::new(format!("invalid 'stages': {}", e), 0, 0)
                            .with_kind(ParseErrorKind::InvalidValue)
                    })?;
                }
                "default" => {
                    definition.default = serde_yaml::from_value(value)
                        .map_err(|e| ParseError::from_job_error("default", &e))?;
                }
                "variables" => {
                    definition.variables = string_map(value).map_err(|e| {
                        ParseError::new(format!("invalid 'variables': {}", e), 0, 0)
                            .with_kind(ParseErrorKind::InvalidValue)
                    })?;
                }
                k if RESERVED_KEYS.contains(&k) => {
                    legacy.insert(Value::String(key), value);
                }
                k if UNSUPPORTED_KEYS.contains(&k) => {
                    return Err(ParseError::new(format!("'{}' is not supported", k), 0, 0)
                        .with_kind(ParseErrorKind::UnknownField));
                }
                k if k.starts_with('.') => {
                    templates.insert(key, value);
                }
                _ => raw_jobs.push((key, value)),
            }
        }

        if !legacy.is_empty() {
            let legacy: Defaults = serde_yaml::from_value(Value::Mapping(legacy))
                .map_err(|e| ParseError::from_job_error("default", &e))?;
            merge_legacy_defaults(&mut definition.default, legacy);
        }

        let resolver = ExtendsResolver {
            templates: &templates,
            jobs: raw_jobs.iter().cloned().collect(),
        };

        for (name, value) in &raw_jobs {
            let resolved = resolver.resolve(name, value)?;
            let mut job: JobSpec =
                serde_yaml::from_value(resolved).map_err(|e| ParseError::from_job_error(name, &e))?;
            job.name = name.clone();
            definition.jobs.push(job);
        }

        Ok(definition)
    }

    /// Parse pipeline from file
    pub fn parse_file<P: AsRef<Path>>(path: P) -> ParseResult<PipelineDefinition> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ParseError::io_error(format!("failed to read {}: {}", path.display(), e))
        })?;

        Self::parse(&content)
    }
}

/// Top-level `image`/`before_script`/... only fill what `default:` left unset
fn merge_legacy_defaults(defaults: &mut Defaults, legacy: Defaults) {
    if defaults.image.is_none() {
        defaults.image = legacy.image;
    }
    if defaults.before_script.is_none() {
        defaults.before_script = legacy.before_script;
    }
    if defaults.after_script.is_none() {
        defaults.after_script = legacy.after_script;
    }
    if defaults.cache.is_none() {
        defaults.cache = legacy.cache;
    }
}

/// Resolves `extends` chains by deep-merging parent mappings into the child
struct ExtendsResolver<'a> {
    templates: &'a HashMap<String, Value>,
    jobs: HashMap<String, Value>,
}

impl ExtendsResolver<'_> {
    fn resolve(&self, name: &str, value: &Value) -> ParseResult<Value> {
        let mut stack = Vec::new();
        self.resolve_inner(name, value, &mut stack)
    }

    fn resolve_inner(
        &self,
        name: &str,
        value: &Value,
        stack: &mut Vec<String>,
    ) -> ParseResult<Value> {
        let Value::Mapping(mapping) = value else {
            return Err(ParseError::in_job(name, "job definition must be a mapping")
                .with_kind(ParseErrorKind::InvalidSchema));
        };

        if stack.iter().any(|s| s == name) {
            stack.push(name.to_string());
            return Err(ParseError::in_job(
                name,
                format!("circular extends: {}", stack.join(" -> ")),
            )
            .with_kind(ParseErrorKind::ExtendsError));
        }
        if stack.len() >= MAX_EXTENDS_DEPTH {
            return Err(ParseError::in_job(
                name,
                format!("extends nesting deeper than {}", MAX_EXTENDS_DEPTH),
            )
            .with_kind(ParseErrorKind::ExtendsError));
        }

        let mut own = mapping.clone();
        let parents = match own.remove("extends") {
            None => Vec::new(),
            Some(Value::String(parent)) => vec![parent],
            Some(other) => serde_yaml::from_value::<Vec<String>>(other).map_err(|_| {
                ParseError::in_job(name, "'extends' must be a string or a list of strings")
                    .with_kind(ParseErrorKind::InvalidValue)
            })?,
        };

        if parents.is_empty() {
            return Ok(Value::Mapping(own));
        }

        stack.push(name.to_string());
        let mut merged = Value::Mapping(Mapping::new());
        for parent in &parents {
            let parent_value = self
                .templates
                .get(parent)
                .or_else(|| self.jobs.get(parent))
                .ok_or_else(|| {
                    ParseError::in_job(name, format!("extends unknown job '{}'", parent))
                        .with_kind(ParseErrorKind::ExtendsError)
                })?;
            let resolved = self.resolve_inner(parent, parent_value, stack)?;
            deep_merge(&mut merged, resolved);
        }
        stack.pop();

        deep_merge(&mut merged, Value::Mapping(own));
        Ok(merged)
    }
}

/// Merge `overlay` into `base`: mappings merge recursively, everything else
/// (including sequences) is replaced.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Validator for parsed pipelines
pub struct PipelineValidator;

impl PipelineValidator {
    /// Validate a parsed pipeline for semantic correctness
    pub fn validate(pipeline: &PipelineDefinition) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if pipeline.jobs.is_empty() {
            errors.push(
                ValidationError::new("pipeline must define at least one job", "pipeline")
                    .with_suggestion("add a job with a 'script'"),
            );
        }

        Self::validate_stages(&pipeline.stages, &mut errors);

        let stages = pipeline.effective_stages();
        for job in &pipeline.jobs {
            Self::validate_job(pipeline, job, &stages, &mut errors);
        }

        Self::validate_job_references(pipeline, &stages, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_stages(stages: &[String], errors: &mut Vec<ValidationError>) {
        let mut seen = HashSet::new();
        for stage in stages {
            if !seen.insert(stage.as_str()) {
                errors.push(ValidationError::new(
                    format!("stage '{}' is declared twice", stage),
                    "stages",
                ));
            }
        }
    }

    fn validate_job(
        pipeline: &PipelineDefinition,
        job: &JobSpec,
        stages: &[String],
        errors: &mut Vec<ValidationError>,
    ) {
        let path = job.name.clone();

        if job.script.iter().all(|line| line.trim().is_empty()) {
            errors.push(
                ValidationError::new("job must have a non-empty 'script'", &path)
                    .with_suggestion("add 'script:' with the commands to run"),
            );
        }

        if !stages.contains(&job.stage) {
            errors.push(
                ValidationError::new(
                    format!("unknown stage '{}'", job.stage),
                    format!("{}.stage", path),
                )
                .with_suggestion(format!("available stages: {}", stages.join(", "))),
            );
        }

        let retries = pipeline.retries_for(job);
        if retries > MAX_RETRY {
            errors.push(ValidationError::new(
                format!("retry must be between 0 and {}, got {}", MAX_RETRY, retries),
                format!("{}.retry", path),
            ));
        }

        if let Some(timeout) = pipeline.timeout_for(job) {
            if let Err(e) = parse_duration(timeout) {
                errors.push(ValidationError::new(e.to_string(), format!("{}.timeout", path)));
            }
        }

        if let Some(expire_in) = job.artifacts.as_ref().and_then(|a| a.expire_in.as_deref()) {
            if let Err(e) = parse_expiry(expire_in) {
                errors.push(ValidationError::new(
                    e.to_string(),
                    format!("{}.artifacts.expire_in", path),
                ));
            }
        }

        if let Some(rules) = &job.rules {
            for (i, rule) in rules.iter().enumerate() {
                if rule.if_expr.is_none()
                    && rule.changes.is_none()
                    && rule.exists.is_none()
                    && rule.when.is_none()
                {
                    errors.push(ValidationError::new(
                        "rule has no clauses",
                        format!("{}.rules[{}]", path, i),
                    ));
                }
            }
        }
    }

    fn validate_job_references(
        pipeline: &PipelineDefinition,
        stages: &[String],
        errors: &mut Vec<ValidationError>,
    ) {
        let job_names: Vec<&str> = pipeline.jobs.iter().map(|j| j.name.as_str()).collect();
        let stage_index = |job: &JobSpec| stages.iter().position(|s| *s == job.stage);

        for job in &pipeline.jobs {
            let own_stage = stage_index(job);

            for need in job.need_names() {
                let Some(target) = pipeline.job(need) else {
                    errors.push(
                        ValidationError::new(
                            format!("job '{}' needs unknown job '{}'", job.name, need),
                            format!("{}.needs", job.name),
                        )
                        .with_suggestion(format!("available jobs: {}", job_names.join(", "))),
                    );
                    continue;
                };
                if let (Some(own), Some(theirs)) = (own_stage, stage_index(target)) {
                    if theirs > own {
                        errors.push(ValidationError::new(
                            format!(
                                "job '{}' needs '{}' from later stage '{}'",
                                job.name, need, target.stage
                            ),
                            format!("{}.needs", job.name),
                        ));
                    }
                }
            }

            for dep in job.dependencies.iter().flatten() {
                let Some(target) = pipeline.job(dep) else {
                    errors.push(
                        ValidationError::new(
                            format!("job '{}' depends on unknown job '{}'", job.name, dep),
                            format!("{}.dependencies", job.name),
                        )
                        .with_suggestion(format!("available jobs: {}", job_names.join(", "))),
                    );
                    continue;
                };
                if let (Some(own), Some(theirs)) = (own_stage, stage_index(target)) {
                    if theirs >= own {
                        errors.push(ValidationError::new(
                            format!(
                                "job '{}' takes artifacts from '{}' which is not in an earlier stage",
                                job.name, dep
                            ),
                            format!("{}.dependencies", job.name),
                        ));
                    }
                }
            }
        }

        if let Err(cycle) = Self::detect_cycles(&job_names, |name| {
            pipeline
                .job(name)
                .map(|j| j.need_names().into_iter().map(str::to_string).collect())
                .unwrap_or_default()
        }) {
            errors.push(ValidationError::new(
                format!("circular dependency detected: {}", cycle.join(" -> ")),
                "needs",
            ));
        }
    }

    /// Detect cycles in a dependency graph using DFS
    fn detect_cycles<F>(nodes: &[&str], get_deps: F) -> Result<(), Vec<String>>
    where
        F: Fn(&str) -> Vec<String>,
    {
        #[derive(Clone, Copy, PartialEq)]
        enum NodeState {
            Unvisited,
            Visiting,
            Visited,
        }

        let mut states: HashMap<String, NodeState> = nodes
            .iter()
            .map(|n| (n.to_string(), NodeState::Unvisited))
            .collect();
        let mut path: Vec<String> = Vec::new();

        fn visit<F>(
            node: &str,
            states: &mut HashMap<String, NodeState>,
            path: &mut Vec<String>,
            get_deps: &F,
        ) -> Result<(), Vec<String>>
        where
            F: Fn(&str) -> Vec<String>,
        {
            match states.get(node) {
                Some(NodeState::Visiting) => {
                    let start = path.iter().position(|n| n == node).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(node.to_string());
                    return Err(cycle);
                }
                Some(NodeState::Visited) | None => return Ok(()),
                Some(NodeState::Unvisited) => {}
            }

            states.insert(node.to_string(), NodeState::Visiting);
            path.push(node.to_string());

            for dep in get_deps(node) {
                visit(&dep, states, path, get_deps)?;
            }

            path.pop();
            states.insert(node.to_string(), NodeState::Visited);
            Ok(())
        }

        for node in nodes {
            visit(node, &mut states, &mut path, &get_deps)?;
        }

        Ok(())
    }
}

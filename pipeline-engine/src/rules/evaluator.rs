// Rule Evaluator
// Decides per job whether it is part of a pipeline, and with which `when`

use crate::expression::{compile_regex, ExprParser, Evaluator, Expr};
use crate::parser::models::{JobSpec, PipelineDefinition, RefFilterSpec, RuleSpec, When};
use crate::rules::context::{RuleContext, TriggerEvent};
use crate::utils::build_glob_set;

use globset::GlobSet;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use walkdir::WalkDir;

/// Outcome of rule evaluation for one job
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RuleDecision {
    Include {
        when: When,
        allow_failure: bool,
        /// Variables added by the matching rule
        variables: HashMap<String, String>,
    },
    Exclude {
        reason: String,
    },
}

impl RuleDecision {
    pub fn is_included(&self) -> bool {
        matches!(self, RuleDecision::Include { .. })
    }

    fn exclude(reason: impl Into<String>) -> Self {
        RuleDecision::Exclude {
            reason: reason.into(),
        }
    }
}

/// A job's rules could not be evaluated (malformed expression, regex or glob)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleError {
    pub job: String,
    pub message: String,
}

impl RuleError {
    pub fn new(job: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rules of job '{}': {}", self.job, self.message)
    }
}

impl std::error::Error for RuleError {}

/// Decisions for every job of a pipeline, in declaration order
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleEvaluation {
    pub decisions: Vec<(String, RuleDecision)>,
    pub errors: Vec<RuleError>,
}

impl RuleEvaluation {
    pub fn decision(&self, job: &str) -> Option<&RuleDecision> {
        self.decisions
            .iter()
            .find(|(name, _)| name == job)
            .map(|(_, decision)| decision)
    }

    pub fn is_included(&self, job: &str) -> bool {
        self.decision(job).is_some_and(RuleDecision::is_included)
    }

    /// Names of included jobs
    pub fn included(&self) -> impl Iterator<Item = &str> {
        self.decisions
            .iter()
            .filter(|(_, d)| d.is_included())
            .map(|(name, _)| name.as_str())
    }
}

/// One clause of a rule
#[derive(Debug, Clone)]
pub enum RulePredicate {
    /// `if:` condition
    If(Expr),
    /// `changes:` globs, matched against the changed paths
    Changes(GlobSet),
    /// `exists:` globs, matched against files in the checkout
    Exists(GlobSet),
}

/// A compiled `rules:` entry
#[derive(Debug, Clone)]
pub struct Rule {
    pub predicates: Vec<RulePredicate>,
    pub when: Option<When>,
    pub allow_failure: Option<bool>,
    pub variables: HashMap<String, String>,
}

impl Rule {
    pub fn compile(job: &str, spec: &RuleSpec) -> Result<Self, RuleError> {
        let mut predicates = Vec::new();

        if let Some(condition) = &spec.if_expr {
            let expr = ExprParser::parse_str(condition)
                .map_err(|e| RuleError::new(job, format!("invalid if '{}': {}", condition, e)))?;
            predicates.push(RulePredicate::If(expr));
        }
        if let Some(changes) = &spec.changes {
            let set = build_glob_set(&changes.to_vec())
                .map_err(|e| RuleError::new(job, format!("invalid changes pattern: {}", e)))?;
            predicates.push(RulePredicate::Changes(set));
        }
        if let Some(exists) = &spec.exists {
            let set = build_glob_set(&exists.to_vec())
                .map_err(|e| RuleError::new(job, format!("invalid exists pattern: {}", e)))?;
            predicates.push(RulePredicate::Exists(set));
        }

        Ok(Self {
            predicates,
            when: spec.when,
            allow_failure: spec.allow_failure,
            variables: spec.variables.clone(),
        })
    }
}

/// Evaluates `rules:` and `only`/`except` against a RuleContext
pub struct RuleEvaluator<'a> {
    context: &'a RuleContext,
    pipeline_variables: &'a HashMap<String, String>,
}

impl<'a> RuleEvaluator<'a> {
    pub fn new(context: &'a RuleContext, pipeline_variables: &'a HashMap<String, String>) -> Self {
        Self {
            context,
            pipeline_variables,
        }
    }

    /// Evaluate every job of a pipeline. Jobs whose rules fail to evaluate
    /// are excluded and the error is recorded.
    pub fn evaluate_pipeline(&self, pipeline: &PipelineDefinition) -> RuleEvaluation {
        let mut evaluation = RuleEvaluation::default();

        for job in &pipeline.jobs {
            let decision = match self.evaluate(job) {
                Ok(decision) => decision,
                Err(err) => {
                    tracing::warn!(job = %job.name, error = %err.message, "rule evaluation failed");
                    let decision = RuleDecision::exclude(format!("rule error: {}", err.message));
                    evaluation.errors.push(err);
                    decision
                }
            };
            tracing::debug!(job = %job.name, ?decision, "rules evaluated");
            evaluation.decisions.push((job.name.clone(), decision));
        }

        evaluation
    }

    /// Evaluate a single job
    pub fn evaluate(&self, job: &JobSpec) -> Result<RuleDecision, RuleError> {
        let variables = self
            .context
            .variables_for(self.pipeline_variables, &job.variables);

        if let Some(rules) = &job.rules {
            return self.evaluate_rules(job, rules, &variables);
        }

        if let Some(only) = &job.only {
            if !self.matches_filter(job, &only.spec(), &variables)? {
                return Ok(RuleDecision::exclude("only: did not match"));
            }
        }
        if let Some(except) = &job.except {
            if self.matches_filter(job, &except.spec(), &variables)? {
                return Ok(RuleDecision::exclude("except: matched"));
            }
        }

        Ok(Self::decide(job, job.when, None, false, HashMap::new()))
    }

    fn evaluate_rules(
        &self,
        job: &JobSpec,
        rules: &[RuleSpec],
        variables: &HashMap<String, String>,
    ) -> Result<RuleDecision, RuleError> {
        for (index, spec) in rules.iter().enumerate() {
            let rule = Rule::compile(&job.name, spec)?;
            if !self.rule_matches(&job.name, &rule, variables)? {
                continue;
            }

            let when = rule.when.unwrap_or(job.when);
            if when == When::Never {
                return Ok(RuleDecision::exclude(format!(
                    "rules[{}]: when: never",
                    index
                )));
            }
            let manual_from_rule = rule.when == Some(When::Manual);
            return Ok(Self::decide(
                job,
                when,
                rule.allow_failure,
                manual_from_rule,
                rule.variables,
            ));
        }

        Ok(RuleDecision::exclude("no rule matched"))
    }

    fn decide(
        job: &JobSpec,
        when: When,
        rule_allow_failure: Option<bool>,
        manual_from_rule: bool,
        variables: HashMap<String, String>,
    ) -> RuleDecision {
        if when == When::Never {
            return RuleDecision::exclude("when: never");
        }

        let allow_failure = rule_allow_failure
            .or(job.allow_failure)
            .unwrap_or(when == When::Manual && !manual_from_rule);

        RuleDecision::Include {
            when,
            allow_failure,
            variables,
        }
    }

    fn rule_matches(
        &self,
        job: &str,
        rule: &Rule,
        variables: &HashMap<String, String>,
    ) -> Result<bool, RuleError> {
        for predicate in &rule.predicates {
            let matched = match predicate {
                RulePredicate::If(expr) => Evaluator::new(variables)
                    .eval_bool(expr)
                    .map_err(|e| RuleError::new(job, e.message))?,
                RulePredicate::Changes(set) => self.changes_match(set),
                RulePredicate::Exists(set) => self.exists_match(set),
            };
            if !matched {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Unknown diffs count as changed
    fn changes_match(&self, set: &GlobSet) -> bool {
        match &self.context.changed_paths {
            None => true,
            Some(paths) => paths
                .iter()
                .any(|p| set.is_match(p.trim_start_matches("./"))),
        }
    }

    fn exists_match(&self, set: &GlobSet) -> bool {
        let Some(root) = &self.context.project_dir else {
            return false;
        };
        any_file_matches(root, set)
    }

    fn matches_filter(
        &self,
        job: &JobSpec,
        filter: &RefFilterSpec,
        variables: &HashMap<String, String>,
    ) -> Result<bool, RuleError> {
        if !filter.refs.is_empty() {
            let mut matched = false;
            for pattern in &filter.refs {
                if self.ref_matches(&job.name, pattern)? {
                    matched = true;
                    break;
                }
            }
            if !matched {
                return Ok(false);
            }
        }

        if !filter.changes.is_empty() {
            let set = build_glob_set(&filter.changes)
                .map_err(|e| RuleError::new(&job.name, format!("invalid changes pattern: {}", e)))?;
            if !self.changes_match(&set) {
                return Ok(false);
            }
        }

        if !filter.variables.is_empty() {
            let mut matched = false;
            for condition in &filter.variables {
                let expr = ExprParser::parse_str(condition).map_err(|e| {
                    RuleError::new(&job.name, format!("invalid variables '{}': {}", condition, e))
                })?;
                if Evaluator::new(variables)
                    .eval_bool(&expr)
                    .map_err(|e| RuleError::new(&job.name, e.message))?
                {
                    matched = true;
                    break;
                }
            }
            if !matched {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Match one `only`/`except` ref entry: a keyword, `/regex/` or literal ref
    fn ref_matches(&self, job: &str, pattern: &str) -> Result<bool, RuleError> {
        let ctx = self.context;
        let matched = match pattern {
            "branches" => ctx.branch.is_some() && ctx.tag.is_none(),
            "tags" => ctx.tag.is_some(),
            "merge_requests" => ctx.event == TriggerEvent::MergeRequest,
            "schedules" => ctx.is_schedule(),
            "web" => ctx.event == TriggerEvent::Web,
            "api" => ctx.event == TriggerEvent::Api,
            "triggers" => ctx.event == TriggerEvent::Trigger,
            "pushes" => ctx.event == TriggerEvent::Push && !ctx.schedule,
            p if p.len() > 1 && p.starts_with('/') => {
                let end = p.rfind('/').unwrap_or(0);
                if end == 0 {
                    return Err(RuleError::new(job, format!("unterminated ref regex '{}'", p)));
                }
                let regex = compile_regex(&p[1..end], &p[end + 1..])
                    .map_err(|e| RuleError::new(job, e.message))?;
                regex.is_match(ctx.ref_name())
            }
            literal => ctx.ref_name() == literal,
        };
        Ok(matched)
    }
}

fn any_file_matches(root: &Path, set: &GlobSet) -> bool {
    WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .any(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .map(|rel| set.is_match(rel))
                .unwrap_or(false)
        })
}

// Rule Context
// Immutable description of what triggered a pipeline, used by rule evaluation

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// What caused the pipeline to be created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    #[default]
    Push,
    MergeRequest,
    Schedule,
    Web,
    Api,
    Trigger,
}

impl TriggerEvent {
    /// Value exposed as `CI_PIPELINE_SOURCE`
    pub fn pipeline_source(&self) -> &'static str {
        match self {
            TriggerEvent::Push => "push",
            TriggerEvent::MergeRequest => "merge_request_event",
            TriggerEvent::Schedule => "schedule",
            TriggerEvent::Web => "web",
            TriggerEvent::Api => "api",
            TriggerEvent::Trigger => "trigger",
        }
    }
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pipeline_source())
    }
}

impl FromStr for TriggerEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "push" => Ok(TriggerEvent::Push),
            "merge_request" | "merge_request_event" | "mr" => Ok(TriggerEvent::MergeRequest),
            "schedule" => Ok(TriggerEvent::Schedule),
            "web" => Ok(TriggerEvent::Web),
            "api" => Ok(TriggerEvent::Api),
            "trigger" => Ok(TriggerEvent::Trigger),
            other => Err(format!(
                "unknown event '{}' (expected push, merge_request, schedule, web, api or trigger)",
                other
            )),
        }
    }
}

/// Everything rules may look at. Built once per pipeline and never read
/// from the process environment.
#[derive(Debug, Clone, Default)]
pub struct RuleContext {
    /// Branch being built (absent for tag pipelines)
    pub branch: Option<String>,
    /// Tag being built
    pub tag: Option<String>,
    pub commit_sha: Option<String>,
    pub event: TriggerEvent,
    /// Pipeline was started by a schedule
    pub schedule: bool,
    pub default_branch: String,
    /// Paths changed by the triggering commit; `None` when unknown
    pub changed_paths: Option<Vec<String>>,
    /// Checkout used to evaluate `exists:`
    pub project_dir: Option<PathBuf>,
    /// Variables supplied with the trigger (highest precedence)
    pub variables: HashMap<String, String>,
}

impl RuleContext {
    pub fn for_branch(branch: impl Into<String>) -> Self {
        Self {
            branch: Some(branch.into()),
            default_branch: "main".to_string(),
            ..Default::default()
        }
    }

    pub fn for_tag(tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            default_branch: "main".to_string(),
            ..Default::default()
        }
    }

    pub fn with_event(mut self, event: TriggerEvent) -> Self {
        self.event = event;
        self
    }

    pub fn with_schedule(mut self, schedule: bool) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_default_branch(mut self, branch: impl Into<String>) -> Self {
        self.default_branch = branch.into();
        self
    }

    pub fn with_changed_paths(mut self, paths: Vec<String>) -> Self {
        self.changed_paths = Some(paths);
        self
    }

    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = Some(dir.into());
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Ref the pipeline runs for: the tag if any, otherwise the branch
    pub fn ref_name(&self) -> &str {
        self.tag
            .as_deref()
            .or(self.branch.as_deref())
            .unwrap_or_default()
    }

    /// Effective pipeline source; a schedule flag wins over the event
    pub fn pipeline_source(&self) -> &'static str {
        if self.schedule {
            TriggerEvent::Schedule.pipeline_source()
        } else {
            self.event.pipeline_source()
        }
    }

    pub fn is_schedule(&self) -> bool {
        self.schedule || self.event == TriggerEvent::Schedule
    }

    /// The `CI_*` variables derived from the trigger
    pub fn predefined_variables(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        let ref_name = self.ref_name().to_string();

        if let Some(branch) = &self.branch {
            if self.tag.is_none() {
                vars.insert("CI_COMMIT_BRANCH".to_string(), branch.clone());
            }
        }
        if let Some(tag) = &self.tag {
            vars.insert("CI_COMMIT_TAG".to_string(), tag.clone());
        }
        if let Some(sha) = &self.commit_sha {
            vars.insert("CI_COMMIT_SHA".to_string(), sha.clone());
            vars.insert(
                "CI_COMMIT_SHORT_SHA".to_string(),
                sha.chars().take(8).collect(),
            );
        }
        vars.insert(
            "CI_COMMIT_REF_SLUG".to_string(),
            crate::utils::slugify(&ref_name),
        );
        vars.insert("CI_COMMIT_REF_NAME".to_string(), ref_name);
        vars.insert(
            "CI_PIPELINE_SOURCE".to_string(),
            self.pipeline_source().to_string(),
        );
        vars.insert("CI_DEFAULT_BRANCH".to_string(), self.default_branch.clone());
        vars.insert("CI".to_string(), "true".to_string());
        vars
    }

    /// Variables visible to a job: predefined, then pipeline, then job,
    /// then trigger variables (later layers win).
    pub fn variables_for(
        &self,
        pipeline: &HashMap<String, String>,
        job: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let mut vars = self.predefined_variables();
        vars.extend(pipeline.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars.extend(job.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars.extend(self.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }
}

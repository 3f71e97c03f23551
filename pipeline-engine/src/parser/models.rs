// Pipeline Definition Models
// Types for the stage/job pipeline file: jobs, rules, artifacts, caches

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Stage every pipeline implicitly starts with
pub const PRE_STAGE: &str = ".pre";
/// Stage every pipeline implicitly ends with
pub const POST_STAGE: &str = ".post";
/// Stage assigned to jobs that do not declare one
pub const DEFAULT_JOB_STAGE: &str = "test";

/// Stages used when the file has no `stages:` key
pub fn default_stages() -> Vec<String> {
    vec!["build".to_string(), "test".to_string(), "deploy".to_string()]
}

/// A parsed pipeline definition (immutable once built)
#[derive(Debug, Clone, Serialize, Default)]
pub struct PipelineDefinition {
    /// Declared stage order (without the implicit `.pre`/`.post`)
    pub stages: Vec<String>,

    /// Defaults inherited by every job
    pub default: Defaults,

    /// Global variables
    pub variables: HashMap<String, String>,

    /// Visible jobs in declaration order
    pub jobs: Vec<JobSpec>,
}

impl PipelineDefinition {
    /// Full stage order including the implicit `.pre` and `.post` stages
    pub fn effective_stages(&self) -> Vec<String> {
        let mut stages = Vec::with_capacity(self.stages.len() + 2);
        stages.push(PRE_STAGE.to_string());
        stages.extend(
            self.stages
                .iter()
                .filter(|s| s.as_str() != PRE_STAGE && s.as_str() != POST_STAGE)
                .cloned(),
        );
        stages.push(POST_STAGE.to_string());
        stages
    }

    /// Get a job by name
    pub fn job(&self, name: &str) -> Option<&JobSpec> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Image for a job, falling back to the default image
    pub fn image_for(&self, job: &JobSpec) -> Option<String> {
        job.image
            .as_ref()
            .or(self.default.image.as_ref())
            .map(|i| i.name().to_string())
    }

    /// Commands run before `script` (the job's own list replaces the default)
    pub fn before_script_for<'a>(&'a self, job: &'a JobSpec) -> &'a [String] {
        job.before_script
            .as_ref()
            .or(self.default.before_script.as_ref())
            .map(|s| s.as_slice())
            .unwrap_or(&[])
    }

    /// Commands run after `script` regardless of its outcome
    pub fn after_script_for<'a>(&'a self, job: &'a JobSpec) -> &'a [String] {
        job.after_script
            .as_ref()
            .or(self.default.after_script.as_ref())
            .map(|s| s.as_slice())
            .unwrap_or(&[])
    }

    pub fn cache_for<'a>(&'a self, job: &'a JobSpec) -> Option<&'a CacheSpec> {
        job.cache.as_ref().or(self.default.cache.as_ref())
    }

    pub fn timeout_for<'a>(&'a self, job: &'a JobSpec) -> Option<&'a str> {
        job.timeout
            .as_deref()
            .or(self.default.timeout.as_deref())
    }

    pub fn retries_for(&self, job: &JobSpec) -> u32 {
        job.retry
            .as_ref()
            .or(self.default.retry.as_ref())
            .map(RetrySpec::max)
            .unwrap_or(0)
    }
}

/// Keys inherited by all jobs (`default:` or legacy top-level keys)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    pub image: Option<ImageSpec>,

    #[serde(default, deserialize_with = "opt_string_or_list")]
    pub before_script: Option<Vec<String>>,

    #[serde(default, deserialize_with = "opt_string_or_list")]
    pub after_script: Option<Vec<String>>,

    pub cache: Option<CacheSpec>,

    pub timeout: Option<String>,

    pub retry: Option<RetrySpec>,

    #[serde(default)]
    pub tags: Vec<String>,
}

// =============================================================================
// Jobs
// =============================================================================

/// A job definition
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    /// Job name (the mapping key in the file)
    #[serde(skip)]
    pub name: String,

    /// Owning stage
    #[serde(default = "default_job_stage")]
    pub stage: String,

    /// Container image
    pub image: Option<ImageSpec>,

    /// Main commands (opaque to the engine)
    #[serde(default, deserialize_with = "string_or_list")]
    pub script: Vec<String>,

    #[serde(default, deserialize_with = "opt_string_or_list")]
    pub before_script: Option<Vec<String>>,

    #[serde(default, deserialize_with = "opt_string_or_list")]
    pub after_script: Option<Vec<String>>,

    /// Job variables
    #[serde(default, deserialize_with = "string_map")]
    pub variables: HashMap<String, String>,

    /// Jobs whose artifacts are restored before this job runs
    pub dependencies: Option<Vec<String>>,

    /// Fine-grained ordering edges (replace the stage barrier)
    pub needs: Option<Vec<Need>>,

    pub artifacts: Option<ArtifactSpec>,

    pub cache: Option<CacheSpec>,

    /// Structured rules (take precedence over only/except)
    pub rules: Option<Vec<RuleSpec>>,

    /// Legacy inclusion filter
    pub only: Option<RefFilter>,

    /// Legacy exclusion filter
    pub except: Option<RefFilter>,

    pub allow_failure: Option<bool>,

    #[serde(default)]
    pub when: When,

    /// Job timeout ("1h 30m")
    pub timeout: Option<String>,

    pub retry: Option<RetrySpec>,

    pub environment: Option<EnvironmentSpec>,

    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_job_stage() -> String {
    DEFAULT_JOB_STAGE.to_string()
}

impl JobSpec {
    pub fn new(name: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stage: stage.into(),
            ..Default::default()
        }
    }

    /// Whether the job declares structured rules or a legacy filter
    pub fn has_rules(&self) -> bool {
        self.rules.is_some() || self.only.is_some() || self.except.is_some()
    }

    /// Names of jobs referenced by `needs`
    pub fn need_names(&self) -> Vec<&str> {
        self.needs
            .as_ref()
            .map(|n| n.iter().map(Need::job).collect())
            .unwrap_or_default()
    }

    /// Whether the job declares artifact paths or reports
    pub fn produces_artifacts(&self) -> bool {
        self.artifacts
            .as_ref()
            .is_some_and(|a| !a.paths.is_empty() || !a.reports.is_empty())
    }
}

/// When a job runs relative to earlier jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum When {
    /// Run when all dependencies succeeded
    #[default]
    OnSuccess,
    /// Wait for explicit approval
    Manual,
    /// Run whatever happened upstream
    Always,
    /// Never run (only meaningful inside rules)
    Never,
}

impl When {
    pub fn as_str(&self) -> &'static str {
        match self {
            When::OnSuccess => "on_success",
            When::Manual => "manual",
            When::Always => "always",
            When::Never => "never",
        }
    }
}

/// Image reference: `image: alpine` or `image: {name: alpine, entrypoint: [""]}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageSpec {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        entrypoint: Vec<String>,
    },
}

impl ImageSpec {
    pub fn name(&self) -> &str {
        match self {
            ImageSpec::Name(name) => name,
            ImageSpec::Full { name, .. } => name,
        }
    }
}

/// An entry of `needs:`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Need {
    Job(String),
    Spec {
        job: String,
        #[serde(default = "default_true")]
        artifacts: bool,
        #[serde(default)]
        optional: bool,
    },
}

impl Need {
    pub fn job(&self) -> &str {
        match self {
            Need::Job(job) => job,
            Need::Spec { job, .. } => job,
        }
    }

    /// Whether the needed job's artifacts are restored
    pub fn artifacts(&self) -> bool {
        match self {
            Need::Job(_) => true,
            Need::Spec { artifacts, .. } => *artifacts,
        }
    }

    /// Whether a rule-excluded target is silently dropped
    pub fn optional(&self) -> bool {
        match self {
            Need::Job(_) => false,
            Need::Spec { optional, .. } => *optional,
        }
    }
}

fn default_true() -> bool {
    true
}

/// `retry: 2` or `retry: {max: 2}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetrySpec {
    Count(u32),
    Config { max: u32 },
}

impl RetrySpec {
    pub fn max(&self) -> u32 {
        match self {
            RetrySpec::Count(n) => *n,
            RetrySpec::Config { max } => *max,
        }
    }
}

/// `environment: production` or `environment: {name, url}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentSpec {
    Name(String),
    Full { name: String, url: Option<String> },
}

impl EnvironmentSpec {
    pub fn name(&self) -> &str {
        match self {
            EnvironmentSpec::Name(name) => name,
            EnvironmentSpec::Full { name, .. } => name,
        }
    }
}

// =============================================================================
// Artifacts and caches
// =============================================================================

/// Declared job outputs
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ArtifactSpec {
    pub name: Option<String>,

    #[serde(default)]
    pub paths: Vec<String>,

    /// Expiry such as "1 week" or "never"
    pub expire_in: Option<String>,

    /// Report kind (junit, coverage_report, ...) to report paths
    #[serde(default)]
    pub reports: BTreeMap<String, StringList>,

    #[serde(default)]
    pub when: ArtifactWhen,
}

/// When artifacts are uploaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactWhen {
    #[default]
    OnSuccess,
    OnFailure,
    Always,
}

impl ArtifactWhen {
    pub fn applies(&self, succeeded: bool) -> bool {
        match self {
            ArtifactWhen::OnSuccess => succeeded,
            ArtifactWhen::OnFailure => !succeeded,
            ArtifactWhen::Always => true,
        }
    }
}

/// Cache declaration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct CacheSpec {
    /// Stable key (variables are expanded); defaults to "default"
    pub key: Option<String>,

    #[serde(default)]
    pub paths: Vec<String>,

    #[serde(default)]
    pub policy: CachePolicy,

    /// Replace the stored cache instead of layering onto it
    #[serde(default)]
    pub reset: bool,
}

impl CacheSpec {
    pub fn key_or_default(&self) -> &str {
        self.key.as_deref().unwrap_or("default")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CachePolicy {
    Pull,
    Push,
    #[default]
    PullPush,
}

impl CachePolicy {
    pub fn pulls(&self) -> bool {
        matches!(self, CachePolicy::Pull | CachePolicy::PullPush)
    }

    pub fn pushes(&self) -> bool {
        matches!(self, CachePolicy::Push | CachePolicy::PullPush)
    }
}

// =============================================================================
// Rules
// =============================================================================

/// One entry of `rules:`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    #[serde(rename = "if")]
    pub if_expr: Option<String>,

    pub changes: Option<StringList>,

    pub exists: Option<StringList>,

    pub when: Option<When>,

    pub allow_failure: Option<bool>,

    #[serde(default, deserialize_with = "string_map")]
    pub variables: HashMap<String, String>,
}

/// Legacy `only:` / `except:` value
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RefFilter {
    Refs(Vec<String>),
    Full(RefFilterSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RefFilterSpec {
    #[serde(default)]
    pub refs: Vec<String>,
    #[serde(default)]
    pub changes: Vec<String>,
    #[serde(default)]
    pub variables: Vec<String>,
}

impl RefFilter {
    pub fn spec(&self) -> RefFilterSpec {
        match self {
            RefFilter::Refs(refs) => RefFilterSpec {
                refs: refs.clone(),
                ..Default::default()
            },
            RefFilter::Full(spec) => spec.clone(),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// A value written either as a single string or as a list of strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringList {
    One(String),
    Many(Vec<String>),
}

impl StringList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            StringList::One(s) => vec![s.clone()],
            StringList::Many(v) => v.clone(),
        }
    }
}

fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(StringList::deserialize(deserializer)?.to_vec())
}

fn opt_string_or_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<StringList>::deserialize(deserializer)?.map(|s| s.to_vec()))
}

/// Scalar variable values (strings, numbers, booleans) are all kept as strings
#[derive(Deserialize)]
#[serde(untagged)]
enum ScalarValue {
    String(String),
    Bool(bool),
    Int(i64),
    Float(f64),
    Full { value: String },
}

impl ScalarValue {
    fn into_string(self) -> String {
        match self {
            ScalarValue::String(s) => s,
            ScalarValue::Bool(b) => b.to_string(),
            ScalarValue::Int(n) => n.to_string(),
            ScalarValue::Float(n) => n.to_string(),
            ScalarValue::Full { value } => value,
        }
    }
}

pub(crate) fn string_map<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<HashMap<String, ScalarValue>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.into_string()))
        .collect())
}

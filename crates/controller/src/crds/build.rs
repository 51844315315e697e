//! `Build` Custom Resource Definition

use super::validation::{parse_duration, ValidationError};
use k8s_openapi::api::core::v1::{Affinity, Container, ContainerState, EnvVar, Volume};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Timeout applied when a build does not declare one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Longest timeout a build may declare
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Condition type tracking overall build success
pub const CONDITION_SUCCEEDED: &str = "Succeeded";

/// `Build` CRD: an ordered list of steps sharing one workspace
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "build.platform", version = "v1alpha1", kind = "Build")]
#[kube(namespaced)]
#[kube(status = "BuildStatus")]
#[kube(
    printcolumn = r#"{"name":"Succeeded","type":"string","jsonPath":".status.conditions[?(@.type==\"Succeeded\")].status"}"#
)]
#[kube(
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.conditions[?(@.type==\"Succeeded\")].reason"}"#
)]
#[kube(printcolumn = r#"{"name":"StartTime","type":"date","jsonPath":".status.startTime"}"#)]
#[kube(
    printcolumn = r#"{"name":"CompletionTime","type":"date","jsonPath":".status.completionTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    /// Sources fetched into the workspace before any step runs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceSpec>,

    /// Steps executed in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Container>,

    /// Volumes available to steps
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    /// Service account whose secrets are used for credentials (defaults to "default")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Template to instantiate instead of inline steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateInstantiationSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Maximum run time, e.g. "10m" or "1h30m" (default 10m, max 24h)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// A source fetched into the workspace. Exactly one of `git`, `gcs`, `custom` is set.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSourceSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs: Option<GcsSourceSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Container>,

    /// Directory under the workspace the source is fetched into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,

    /// Sub-path of the workspace volume mounted as the steps' workspace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct GitSourceSpec {
    #[serde(default)]
    pub url: String,

    /// Branch, tag, commit or ref to check out
    #[serde(default)]
    pub revision: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct GcsSourceSpec {
    #[serde(rename = "type", default)]
    pub source_type: GcsSourceType,

    /// Object location, e.g. gs://bucket/path/source.zip
    #[serde(default)]
    pub location: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum GcsSourceType {
    #[default]
    Archive,
    Manifest,
}

impl std::fmt::Display for GcsSourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GcsSourceType::Archive => write!(f, "Archive"),
            GcsSourceType::Manifest => write!(f, "Manifest"),
        }
    }
}

/// The single variant a [`SourceSpec`] selects
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SourceKind<'a> {
    Git(&'a GitSourceSpec),
    Gcs(&'a GcsSourceSpec),
    Custom(&'a Container),
}

impl SourceSpec {
    /// Resolve which kind of source this is
    pub fn kind(&self) -> Result<SourceKind<'_>, ValidationError> {
        match (&self.git, &self.gcs, &self.custom) {
            (Some(git), None, None) => Ok(SourceKind::Git(git)),
            (None, Some(gcs), None) => Ok(SourceKind::Gcs(gcs)),
            (None, None, Some(custom)) => Ok(SourceKind::Custom(custom)),
            _ => Err(ValidationError::UnsupportedSource {
                source_name: self.name.clone().unwrap_or_default(),
            }),
        }
    }

    /// Sub-path that differs from the workspace root, if any
    pub fn effective_sub_path(&self) -> Option<&str> {
        self.sub_path
            .as_deref()
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self.kind()? {
            SourceKind::Git(git) => {
                if git.url.trim().is_empty() {
                    return Err(ValidationError::missing("source.git.url"));
                }
                if git.revision.trim().is_empty() {
                    return Err(ValidationError::missing("source.git.revision"));
                }
            }
            SourceKind::Gcs(gcs) => {
                if gcs.location.trim().is_empty() {
                    return Err(ValidationError::missing("source.gcs.location"));
                }
            }
            SourceKind::Custom(custom) => {
                if !custom.name.is_empty() {
                    return Err(ValidationError::CustomSourceNamed {
                        name: custom.name.clone(),
                    });
                }
                if custom.image.as_deref().unwrap_or("").is_empty() {
                    return Err(ValidationError::missing("source.custom.image"));
                }
            }
        }
        Ok(())
    }
}

/// Reference to a template plus the arguments bound to its parameters
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInstantiationSpec {
    pub name: String,

    #[serde(default)]
    pub kind: TemplateKind,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<ArgumentSpec>,

    /// Environment appended to every templated step
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum TemplateKind {
    #[default]
    BuildTemplate,
    ClusterBuildTemplate,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ArgumentSpec {
    pub name: String,
    pub value: String,
}

impl BuildSpec {
    /// Check the structural invariants of a build.
    ///
    /// Templates must be expanded before the build is compiled, but a spec
    /// that still references one is valid here.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match (&self.template, self.steps.is_empty()) {
            (Some(_), false) => return Err(ValidationError::StepsAndTemplate),
            (None, true) => return Err(ValidationError::missing("steps")),
            _ => {}
        }

        let mut step_names = HashSet::new();
        for step in &self.steps {
            if !step.name.is_empty() && !step_names.insert(step.name.as_str()) {
                return Err(ValidationError::DuplicateStepName {
                    name: step.name.clone(),
                });
            }
            if step.image.as_deref().unwrap_or("").is_empty() {
                return Err(ValidationError::missing("step.image"));
            }
        }

        let mut volume_names = HashSet::new();
        for volume in &self.volumes {
            if !volume_names.insert(volume.name.as_str()) {
                return Err(ValidationError::DuplicateVolumeName {
                    name: volume.name.clone(),
                });
            }
        }

        if let Some(template) = &self.template {
            if template.name.trim().is_empty() {
                return Err(ValidationError::missing("template.name"));
            }
            let mut argument_names = HashSet::new();
            for argument in &template.arguments {
                if !argument_names.insert(argument.name.as_str()) {
                    return Err(ValidationError::DuplicateArgumentName {
                        name: argument.name.clone(),
                    });
                }
            }
        }

        let mut sub_paths = 0;
        for source in &self.sources {
            source.validate()?;
            if source.effective_sub_path().is_some() {
                sub_paths += 1;
            }
        }
        if sub_paths > 1 {
            return Err(ValidationError::MultipleSubPaths);
        }

        self.timeout_duration()?;
        Ok(())
    }

    /// Declared timeout, or [`DEFAULT_TIMEOUT`]
    pub fn timeout_duration(&self) -> Result<Duration, ValidationError> {
        let Some(raw) = self.timeout.as_deref() else {
            return Ok(DEFAULT_TIMEOUT);
        };
        let timeout = parse_duration(raw)?;
        if timeout > MAX_TIMEOUT {
            return Err(ValidationError::InvalidTimeout {
                value: raw.to_string(),
                reason: "must not exceed 24h".to_string(),
            });
        }
        Ok(timeout)
    }

    /// Sub-path applied to the steps' workspace mount
    pub fn workspace_sub_path(&self) -> Option<&str> {
        self.sources.iter().find_map(SourceSpec::effective_sub_path)
    }
}

/// Which backend executed a build
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum BuildProvider {
    Cluster,
    Google,
}

impl std::fmt::Display for BuildProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildProvider::Cluster => write!(f, "Cluster"),
            BuildProvider::Google => write!(f, "Google"),
        }
    }
}

/// Locator of a build running as a pod
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    pub namespace: String,
    pub pod_name: String,
}

/// Locator of a build running as a managed remote operation
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct GoogleSpec {
    pub operation: String,
}

/// Status of the `Build`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder: Option<BuildProvider>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google: Option<GoogleSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,

    /// One entry per step container, in declaration order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_states: Vec<ContainerState>,

    /// Names of step containers that reached a terminal state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps_completed: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Condition for the `Build`
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,

    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

impl Condition {
    /// `Succeeded` condition with the given status
    pub fn succeeded(status: ConditionStatus) -> Self {
        Self {
            condition_type: CONDITION_SUCCEEDED.to_string(),
            status,
            reason: None,
            message: None,
            last_transition_time: None,
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl BuildStatus {
    pub fn get_condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Replace the condition of the same type.
    ///
    /// The transition time only moves when the condition's status changes.
    pub fn set_condition(&mut self, mut condition: Condition) {
        let previous = self
            .conditions
            .iter()
            .position(|c| c.condition_type == condition.condition_type)
            .map(|idx| self.conditions.remove(idx));

        condition.last_transition_time = match previous {
            Some(prev) if prev.status == condition.status => prev.last_transition_time,
            _ => Some(Time(chrono::Utc::now())),
        };
        self.conditions.push(condition);
    }

    /// Copy transition times from `previous` for conditions whose status is unchanged
    pub fn inherit_transition_times(&mut self, previous: &BuildStatus) {
        for condition in &mut self.conditions {
            if let Some(prev) = previous.get_condition(&condition.condition_type) {
                if prev.status == condition.status {
                    condition.last_transition_time = prev.last_transition_time.clone();
                }
            }
        }
    }

    /// True once the build has succeeded or failed
    pub fn is_done(&self) -> bool {
        self.get_condition(CONDITION_SUCCEEDED)
            .is_some_and(|c| c.status != ConditionStatus::Unknown)
    }
}

impl Build {
    /// True once the build has succeeded or failed
    pub fn is_done(&self) -> bool {
        self.status.as_ref().is_some_and(BuildStatus::is_done)
    }
}

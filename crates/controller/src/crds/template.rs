//! `BuildTemplate` and `ClusterBuildTemplate` Custom Resource Definitions

use super::validation::ValidationError;
use k8s_openapi::api::core::v1::{Container, Volume};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Namespaced, parameterized list of steps a `Build` can instantiate
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "build.platform", version = "v1alpha1", kind = "BuildTemplate")]
#[kube(namespaced)]
#[serde(rename_all = "camelCase")]
pub struct BuildTemplateSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParameterSpec>,

    /// Steps with `${PARAM}` placeholders
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Container>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

/// Cluster-scoped variant of [`BuildTemplate`]
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "build.platform", version = "v1alpha1", kind = "ClusterBuildTemplate")]
pub struct ClusterBuildTemplateSpec {
    #[serde(flatten)]
    pub template: BuildTemplateSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ParameterSpec {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Value used when the build supplies no argument
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl BuildTemplateSpec {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.steps.is_empty() {
            return Err(ValidationError::missing("template.steps"));
        }

        let mut parameter_names = HashSet::new();
        for parameter in &self.parameters {
            if !parameter_names.insert(parameter.name.as_str()) {
                return Err(ValidationError::DuplicateParameterName {
                    name: parameter.name.clone(),
                });
            }
        }

        let mut step_names = HashSet::new();
        for step in &self.steps {
            if !step.name.is_empty() && !step_names.insert(step.name.as_str()) {
                return Err(ValidationError::DuplicateStepName {
                    name: step.name.clone(),
                });
            }
            for value in step_strings(step) {
                check_placeholders(value)?;
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

        Ok(())
    }
}

/// Every string of a step that may carry placeholders
fn step_strings(step: &Container) -> impl Iterator<Item = &str> {
    std::iter::once(step.name.as_str())
        .chain(step.image.as_deref())
        .chain(step.working_dir.as_deref())
        .chain(step.command.iter().flatten().map(String::as_str))
        .chain(step.args.iter().flatten().map(String::as_str))
        .chain(
            step.env
                .iter()
                .flatten()
                .filter_map(|env| env.value.as_deref()),
        )
}

/// Reject `${A${B}}` and `${A` forms
pub fn check_placeholders(value: &str) -> Result<(), ValidationError> {
    let nested = || ValidationError::NestedPlaceholder {
        value: value.to_string(),
    };

    let mut rest = value;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(nested)?;
        if after[..end].contains("${") {
            return Err(nested());
        }
        rest = &after[end + 1..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::EnvVar;

    fn template_step(args: &[&str]) -> Container {
        Container {
            name: "build".to_string(),
            image: Some("gcr.io/kaniko-project/executor".to_string()),
            args: Some(args.iter().map(ToString::to_string).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn placeholders_must_be_flat_and_closed() {
        assert_eq!(check_placeholders("--destination=${IMAGE}"), Ok(()));
        assert_eq!(check_placeholders("${A}-${B} and ${HOME}"), Ok(()));
        assert!(check_placeholders("${A${B}}").is_err());
        assert!(check_placeholders("--flag=${UNCLOSED").is_err());
    }

    #[test]
    fn template_validation_scans_every_step_string() {
        let mut spec = BuildTemplateSpec {
            parameters: vec![ParameterSpec {
                name: "IMAGE".to_string(),
                ..Default::default()
            }],
            steps: vec![template_step(&["--destination=${IMAGE}"])],
            ..Default::default()
        };
        assert_eq!(spec.validate(), Ok(()));

        spec.steps[0].env = Some(vec![EnvVar {
            name: "TARGET".to_string(),
            value: Some("${OUTER${IMAGE}}".to_string()),
            ..Default::default()
        }]);
        assert!(matches!(
            spec.validate(),
            Err(ValidationError::NestedPlaceholder { .. })
        ));
    }

    #[test]
    fn duplicate_parameters_are_rejected() {
        let parameter = ParameterSpec {
            name: "IMAGE".to_string(),
            ..Default::default()
        };
        let spec = BuildTemplateSpec {
            parameters: vec![parameter.clone(), parameter],
            steps: vec![template_step(&[])],
            ..Default::default()
        };
        assert!(matches!(
            spec.validate(),
            Err(ValidationError::DuplicateParameterName { .. })
        ));
    }
}

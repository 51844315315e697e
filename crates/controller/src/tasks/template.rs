//! Template expansion: instantiate a `BuildTemplate` or `ClusterBuildTemplate`
//! into the steps of a build.
//!
//! `${NAME}` is replaced when `NAME` is a template parameter. Any other
//! `${...}` is left alone so shell variables in step scripts survive.

use crate::crds::{
    Build, BuildSpec, BuildTemplate, BuildTemplateSpec, ClusterBuildTemplate, TemplateKind,
    ValidationError,
};
use crate::tasks::types::{Error, Result};
use k8s_openapi::api::core::v1::Container;
use kube::{Api, Client, ResourceExt};
use regex::{Captures, Regex};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use tracing::{debug, instrument};

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

/// Resolve the template `build` refers to and return the expanded build.
///
/// A build without a template is returned unchanged.
#[instrument(skip(client, build), fields(build = %build.name_any()))]
pub async fn expand_build(client: &Client, build: &Build) -> Result<Build> {
    let Some(instantiation) = &build.spec.template else {
        return Ok(build.clone());
    };
    let namespace = build.namespace().ok_or(Error::MissingObjectKey)?;

    let not_found = || Error::TemplateNotFound {
        kind: format!("{:?}", instantiation.kind),
        name: instantiation.name.clone(),
    };
    let template = match instantiation.kind {
        TemplateKind::BuildTemplate => {
            let templates: Api<BuildTemplate> = Api::namespaced(client.clone(), &namespace);
            templates
                .get_opt(&instantiation.name)
                .await?
                .ok_or_else(not_found)?
                .spec
        }
        TemplateKind::ClusterBuildTemplate => {
            let templates: Api<ClusterBuildTemplate> = Api::all(client.clone());
            templates
                .get_opt(&instantiation.name)
                .await?
                .ok_or_else(not_found)?
                .spec
                .template
        }
    };

    debug!(
        "Expanding {:?} {} into build {}",
        instantiation.kind,
        instantiation.name,
        build.name_any()
    );
    let mut expanded = build.clone();
    expanded.spec = apply_template(&build.spec, &template)?;
    Ok(expanded)
}

/// Bind the build's arguments to `template` and produce a spec with concrete steps
pub fn apply_template(
    spec: &BuildSpec,
    template: &BuildTemplateSpec,
) -> Result<BuildSpec, ValidationError> {
    let Some(instantiation) = &spec.template else {
        return Ok(spec.clone());
    };
    template.validate()?;

    let parameters: HashSet<&str> = template.parameters.iter().map(|p| p.name.as_str()).collect();
    let mut values: HashMap<&str, &str> = HashMap::new();
    for argument in &instantiation.arguments {
        if !parameters.contains(argument.name.as_str()) {
            return Err(ValidationError::UnknownArgument {
                name: argument.name.clone(),
            });
        }
        if values
            .insert(argument.name.as_str(), argument.value.as_str())
            .is_some()
        {
            return Err(ValidationError::DuplicateArgumentName {
                name: argument.name.clone(),
            });
        }
    }
    for parameter in &template.parameters {
        if values.contains_key(parameter.name.as_str()) {
            continue;
        }
        match parameter.default.as_deref() {
            Some(default) => {
                values.insert(parameter.name.as_str(), default);
            }
            None => {
                return Err(ValidationError::missing(format!(
                    "template.arguments[{}]",
                    parameter.name
                )))
            }
        }
    }

    let steps = template
        .steps
        .iter()
        .map(|step| {
            let mut step = substitute_step(step, &values);
            if !instantiation.env.is_empty() {
                step.env
                    .get_or_insert_with(Vec::new)
                    .extend(instantiation.env.iter().cloned());
            }
            step
        })
        .collect();

    let mut volumes = spec.volumes.clone();
    let mut volume_names: HashSet<String> = volumes.iter().map(|v| v.name.clone()).collect();
    for volume in &template.volumes {
        if !volume_names.insert(volume.name.clone()) {
            return Err(ValidationError::DuplicateVolumeName {
                name: volume.name.clone(),
            });
        }
        volumes.push(volume.clone());
    }

    let expanded = BuildSpec {
        steps,
        volumes,
        template: None,
        ..spec.clone()
    };
    expanded.validate()?;
    Ok(expanded)
}

fn substitute_step(step: &Container, values: &HashMap<&str, &str>) -> Container {
    let apply = |value: &str| substitute(value, values);
    let apply_all = |list: &Vec<String>| list.iter().map(|v| apply(v)).collect::<Vec<_>>();

    let mut step = step.clone();
    step.name = apply(&step.name);
    step.image = step.image.as_deref().map(apply);
    step.working_dir = step.working_dir.as_deref().map(apply);
    step.command = step.command.as_ref().map(apply_all);
    step.args = step.args.as_ref().map(apply_all);
    for env in step.env.iter_mut().flatten() {
        env.value = env.value.as_deref().map(apply);
    }
    step
}

/// Replace `${NAME}` for every known `NAME`
fn substitute(value: &str, values: &HashMap<&str, &str>) -> String {
    let pattern = PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.-]*)\}").expect("Invalid regex pattern")
    });
    pattern
        .replace_all(value, |caps: &Captures| match values.get(&caps[1]) {
            Some(replacement) => (*replacement).to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

//! Execution plan compiler: turns a `Build` into the `Pod` that runs it.
//!
//! Init containers, in order: credential initializer, one fetcher per source,
//! then the container placing the step entrypoint into the shared `tools`
//! volume. Every step becomes a regular container rewritten to run under that
//! entrypoint, so the steps execute one after another.

pub mod credentials;
pub mod entrypoint;
pub mod naming;
pub mod remote;
pub mod sources;

pub use credentials::{gather_credentials, CredentialLookup, KubeCredentialLookup};
pub use naming::ResourceNaming;
pub use remote::{EntrypointResolver, ImageEntrypoint, RegistryAuth, RegistryError};

use crate::crds::{Build, BuildSpec, ValidationError};
use crate::tasks::config::ImagesConfig;
use crate::tasks::types::{Error, Result};
use build_entrypoint::{EntrypointOptions, OPTIONS_ENV_VAR};
use credentials::BuildCredentials;
use entrypoint::{tools_mount, ENTRYPOINT_BINARY, TOOLS_MOUNT_PATH, TOOLS_VOLUME_NAME};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, Pod, PodSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::HashSet;
use tracing::{debug, instrument};

/// Label carrying the owning build's name on every build pod
pub const BUILD_NAME_LABEL: &str = "build.platform/buildName";

pub const WORKSPACE_VOLUME_NAME: &str = "workspace";
pub const WORKSPACE_DIR: &str = "/workspace";
pub const HOME_VOLUME_NAME: &str = "home";
pub const HOME_DIR: &str = "/builder/home";
pub const DEFAULT_SERVICE_ACCOUNT: &str = "default";

pub const CREDS_INIT_CONTAINER: &str = "build-step-credential-initializer";
pub const PLACE_TOOLS_CONTAINER: &str = "build-step-place-tools";

/// Where the entrypoint image keeps the synchronizer binary
pub const ENTRYPOINT_IMAGE_BINARY: &str = "/usr/local/bin/build-entrypoint";

/// Compile `build` into its pod. The build's template must already be expanded.
#[instrument(skip_all, fields(build = %build.name_any()))]
pub async fn make_pod(
    build: &Build,
    lookup: &dyn CredentialLookup,
    resolver: &EntrypointResolver,
    images: &ImagesConfig,
) -> Result<Pod> {
    let spec = &build.spec;
    spec.validate()?;
    let name = build.name_any();
    if spec.template.is_some() {
        return Err(Error::ConfigError(format!(
            "build {name} must have its template expanded before it is compiled"
        )));
    }
    let namespace = build.namespace().ok_or(Error::MissingObjectKey)?;
    let owner = build.controller_owner_ref(&()).ok_or(Error::MissingObjectKey)?;

    let service_account = spec
        .service_account_name
        .as_deref()
        .filter(|sa| !sa.is_empty())
        .unwrap_or(DEFAULT_SERVICE_ACCOUNT);
    let credentials = gather_credentials(lookup, &namespace, service_account).await?;

    let mut init_containers = Vec::with_capacity(spec.sources.len() + 2);
    init_containers.push(credential_init_container(&credentials, images));
    for (index, source) in spec.sources.iter().enumerate() {
        init_containers.push(sources::source_container(source, index, images)?);
    }
    init_containers.push(place_tools_container(images));

    let sub_path = spec.workspace_sub_path();
    let mut steps: Vec<Container> = spec
        .steps
        .iter()
        .enumerate()
        .map(|(index, step)| step_container(step, index, sub_path))
        .collect();
    entrypoint::redirect_steps(&mut steps, resolver, &credentials.registry_auth).await?;

    let volumes = pod_volumes(spec, credentials.volumes)?;

    let mut labels = build.labels().clone();
    labels.insert(BUILD_NAME_LABEL.to_string(), name.clone());
    let annotations = build.annotations().clone();

    let pod_name = ResourceNaming::pod_name(build);
    debug!(
        "Compiled pod {} with {} init container(s) and {} step(s)",
        pod_name,
        init_containers.len(),
        steps.len()
    );

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(pod_name),
            namespace: Some(namespace),
            labels: Some(labels),
            annotations: (!annotations.is_empty()).then_some(annotations),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            service_account_name: Some(service_account.to_string()),
            node_selector: spec.node_selector.clone(),
            affinity: spec.affinity.clone(),
            init_containers: Some(init_containers),
            containers: steps,
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Recover the declared steps from a compiled pod.
///
/// Lossy where the compiler filled in defaults: working directories and
/// commands resolved from the image stay as compiled.
pub fn steps_from_pod(pod: &Pod) -> Result<Vec<Container>> {
    let Some(spec) = pod.spec.as_ref() else {
        return Ok(Vec::new());
    };

    let mut steps = Vec::with_capacity(spec.containers.len());
    for container in &spec.containers {
        let Some(name) = ResourceNaming::step_name_from_container(&container.name) else {
            continue;
        };
        let mut step = container.clone();
        step.name = name;

        let mut env = step.env.take().unwrap_or_default();
        if let Some(idx) = env.iter().position(|e| e.name == OPTIONS_ENV_VAR) {
            let raw = env.remove(idx).value.unwrap_or_default();
            let mut command_line = EntrypointOptions::from_json(&raw)?.args.into_iter();
            step.command = command_line.next().map(|command| vec![command]);
            let args: Vec<String> = command_line.collect();
            step.args = (!args.is_empty()).then_some(args);
        }
        if env
            .first()
            .is_some_and(|e| e.name == "HOME" && e.value.as_deref() == Some(HOME_DIR))
        {
            env.remove(0);
        }
        step.env = (!env.is_empty()).then_some(env);

        let mounts: Vec<VolumeMount> = step
            .volume_mounts
            .take()
            .unwrap_or_default()
            .into_iter()
            .filter(|m| !is_implicit_mount(m))
            .collect();
        step.volume_mounts = (!mounts.is_empty()).then_some(mounts);

        steps.push(step);
    }
    Ok(steps)
}

fn is_implicit_mount(mount: &VolumeMount) -> bool {
    matches!(
        (mount.name.as_str(), mount.mount_path.as_str()),
        (WORKSPACE_VOLUME_NAME, WORKSPACE_DIR)
            | (HOME_VOLUME_NAME, HOME_DIR)
            | (TOOLS_VOLUME_NAME, TOOLS_MOUNT_PATH)
    )
}

/// Prepend `HOME=/builder/home` to the container's env
pub(crate) fn with_implicit_env(mut container: Container) -> Container {
    let mut env = vec![EnvVar {
        name: "HOME".to_string(),
        value: Some(HOME_DIR.to_string()),
        ..Default::default()
    }];
    env.extend(container.env.take().unwrap_or_default());
    container.env = Some(env);
    container
}

/// Add the workspace and home mounts unless the container already mounts those paths
pub(crate) fn with_implicit_mounts(mut container: Container, sub_path: Option<&str>) -> Container {
    let mut mounts = container.volume_mounts.take().unwrap_or_default();
    let implicit = [
        VolumeMount {
            name: WORKSPACE_VOLUME_NAME.to_string(),
            mount_path: WORKSPACE_DIR.to_string(),
            sub_path: sub_path.map(ToString::to_string),
            ..Default::default()
        },
        VolumeMount {
            name: HOME_VOLUME_NAME.to_string(),
            mount_path: HOME_DIR.to_string(),
            ..Default::default()
        },
    ];
    for mount in implicit {
        if !mounts.iter().any(|m| m.mount_path == mount.mount_path) {
            mounts.push(mount);
        }
    }
    container.volume_mounts = Some(mounts);
    container
}

fn step_container(step: &Container, index: usize, sub_path: Option<&str>) -> Container {
    let mut container = with_implicit_mounts(with_implicit_env(step.clone()), sub_path);
    container.name = ResourceNaming::step_container_name(&step.name, index);
    if container.working_dir.as_deref().unwrap_or_default().is_empty() {
        container.working_dir = Some(WORKSPACE_DIR.to_string());
    }
    container
}

fn credential_init_container(credentials: &BuildCredentials, images: &ImagesConfig) -> Container {
    let container = Container {
        name: CREDS_INIT_CONTAINER.to_string(),
        image: Some(images.creds_init.reference()),
        args: Some(credentials.flags.clone()),
        ..Default::default()
    };
    let mut container = with_implicit_mounts(with_implicit_env(container), None);
    container
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .extend(credentials.mounts.iter().cloned());
    container
}

fn place_tools_container(images: &ImagesConfig) -> Container {
    Container {
        name: PLACE_TOOLS_CONTAINER.to_string(),
        image: Some(images.entrypoint.reference()),
        command: Some(vec![
            "cp".to_string(),
            ENTRYPOINT_IMAGE_BINARY.to_string(),
            ENTRYPOINT_BINARY.to_string(),
        ]),
        volume_mounts: Some(vec![tools_mount()]),
        ..Default::default()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn pod_volumes(spec: &BuildSpec, secret_volumes: Vec<Volume>) -> Result<Vec<Volume>> {
    let mut volumes = spec.volumes.clone();
    volumes.push(empty_dir(WORKSPACE_VOLUME_NAME));
    volumes.push(empty_dir(HOME_VOLUME_NAME));
    volumes.extend(secret_volumes);
    volumes.push(empty_dir(TOOLS_VOLUME_NAME));

    let mut seen = HashSet::new();
    for volume in &volumes {
        if !seen.insert(volume.name.as_str()) {
            return Err(ValidationError::DuplicateVolumeName {
                name: volume.name.clone(),
            }
            .into());
        }
    }
    Ok(volumes)
}

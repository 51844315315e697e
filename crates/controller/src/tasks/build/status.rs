//! Translation of a build pod's lifecycle into `BuildStatus`.

use crate::crds::{BuildProvider, BuildSpec, BuildStatus, ClusterSpec, Condition, ConditionStatus};
use chrono::Utc;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;

pub const REASON_PENDING: &str = "Pending";
pub const REASON_BUILDING: &str = "Building";
pub const REASON_BUILD_FAILED: &str = "BuildFailed";
pub const REASON_VALIDATION_FAILED: &str = "BuildValidationFailed";
pub const REASON_EXECUTE_FAILED: &str = "BuildExecuteFailed";
pub const REASON_TIMEOUT: &str = "BuildTimeout";

const UNSPECIFIED_FAILURE: &str = "build failed for unspecified reasons.";

/// Compute the status of a build from its pod
pub fn build_status_from_pod(pod: &Pod, spec: &BuildSpec) -> BuildStatus {
    let mut status = BuildStatus {
        builder: Some(BuildProvider::Cluster),
        cluster: Some(ClusterSpec {
            namespace: pod.namespace().unwrap_or_default(),
            pod_name: pod.name_any(),
        }),
        start_time: pod.metadata.creation_timestamp.clone(),
        ..Default::default()
    };

    // Credential initializer, one fetcher per source, then the tools copier
    let skip = spec.sources.len() + 2;
    for container in ordered_statuses(pod).into_iter().skip(skip) {
        let state = container.state.clone().unwrap_or_default();
        if state.terminated.is_some() {
            status.steps_completed.push(container.name.clone());
        }
        status.step_states.push(state);
    }

    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default();
    let condition = match phase {
        "Running" => Condition::succeeded(ConditionStatus::Unknown).with_reason(REASON_BUILDING),
        "Succeeded" => {
            status.completion_time = Some(completion_time(pod));
            Condition::succeeded(ConditionStatus::True)
        }
        "Failed" => {
            status.completion_time = Some(completion_time(pod));
            Condition::succeeded(ConditionStatus::False)
                .with_reason(REASON_BUILD_FAILED)
                .with_message(failure_message(pod))
        }
        _ => Condition::succeeded(ConditionStatus::Unknown)
            .with_reason(REASON_PENDING)
            .with_message(waiting_message(pod)),
    };
    status.set_condition(condition);
    status
}

/// Explain why a pod has not started its steps yet
pub fn waiting_message(pod: &Pod) -> String {
    for container in ordered_statuses(pod) {
        let waiting_message = container
            .state
            .as_ref()
            .and_then(|s| s.waiting.as_ref())
            .and_then(|w| w.message.as_deref())
            .filter(|m| !m.is_empty());
        if let Some(message) = waiting_message {
            return format!(
                "build step \"{}\" is pending with reason \"{}\"",
                container.name, message
            );
        }
    }

    let pod_status = pod.status.as_ref();
    let unready = pod_status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.status != "True"));
    if let Some(condition) = unready {
        return format!(
            "pod status \"{}\":\"{}\"; message: \"{}\"",
            condition.type_,
            condition.status,
            condition.message.as_deref().unwrap_or_default()
        );
    }

    pod_status
        .and_then(|s| s.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| REASON_PENDING.to_string())
}

/// Explain why a pod failed, naming the first step that exited non-zero
pub fn failure_message(pod: &Pod) -> String {
    let namespace = pod.namespace().unwrap_or_default();
    let pod_name = pod.name_any();

    for container in ordered_statuses(pod) {
        let Some(terminated) = container.state.as_ref().and_then(|s| s.terminated.as_ref()) else {
            continue;
        };
        if terminated.exit_code != 0 {
            return format!(
                "build step \"{name}\" exited with code {code} (image: \"{image}\"); \
                 for logs run: kubectl -n {namespace} logs {pod_name} -c {name}",
                name = container.name,
                code = terminated.exit_code,
                image = container.image_id,
            );
        }
    }

    pod.status
        .as_ref()
        .and_then(|s| s.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| UNSPECIFIED_FAILURE.to_string())
}

/// Init container statuses then container statuses, each in pod spec order
fn ordered_statuses(pod: &Pod) -> Vec<&ContainerStatus> {
    let (Some(spec), Some(status)) = (pod.spec.as_ref(), pod.status.as_ref()) else {
        return Vec::new();
    };

    let init_names = spec
        .init_containers
        .iter()
        .flatten()
        .map(|c| c.name.as_str());
    let init = in_spec_order(init_names, status.init_container_statuses.as_deref());
    let steps = in_spec_order(
        spec.containers.iter().map(|c| c.name.as_str()),
        status.container_statuses.as_deref(),
    );
    init.into_iter().chain(steps).collect()
}

fn in_spec_order<'a, 'p>(
    names: impl Iterator<Item = &'a str>,
    statuses: Option<&'p [ContainerStatus]>,
) -> Vec<&'p ContainerStatus> {
    let statuses = statuses.unwrap_or_default();
    names
        .filter_map(|name| statuses.iter().find(|s| s.name == name))
        .collect()
}

/// Latest step finish time, or now when no container reports one
fn completion_time(pod: &Pod) -> Time {
    ordered_statuses(pod)
        .into_iter()
        .filter_map(|s| s.state.as_ref()?.terminated.as_ref()?.finished_at.clone())
        .max_by_key(|t| t.0)
        .unwrap_or_else(|| Time(Utc::now()))
}

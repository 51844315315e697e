use super::status::{
    build_status_from_pod, REASON_BUILDING, REASON_EXECUTE_FAILED, REASON_VALIDATION_FAILED,
};
use super::update_status;
use crate::builder::{Operation, PodKey};
use crate::crds::{Build, BuildStatus, Condition, ConditionStatus};
use crate::tasks::template::expand_build;
use crate::tasks::types::{Context, Error, Result};
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// How often a running build is re-examined without any watch event
const RUNNING_REQUEUE: Duration = Duration::from_secs(60);

#[instrument(skip(build, ctx), fields(build = %build.name_any(), namespace = ?build.namespace()))]
pub async fn reconcile_build(build: Arc<Build>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = build.namespace().ok_or(Error::MissingObjectKey)?;
    let key = format!("{}/{}", namespace, build.name_any());

    let action = reconcile_build_inner(&build, &namespace, &ctx).await?;
    ctx.backoff.reset(&key);
    Ok(action)
}

async fn reconcile_build_inner(build: &Build, namespace: &str, ctx: &Arc<Context>) -> Result<Action> {
    let name = build.name_any();
    if build.is_done() {
        debug!("Build {} already finished, nothing to do", name);
        return Ok(Action::await_change());
    }

    let builds: Api<Build> = Api::namespaced(ctx.client.clone(), namespace);
    let status = build.status.clone().unwrap_or_default();
    match status.cluster.as_ref() {
        Some(cluster) => {
            info!("🔄 Refreshing status of build {} from pod {}", name, cluster.pod_name);
            let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &cluster.namespace);
            let Some(computed) = sync_from_pod(&pods, &builds, build, &cluster.pod_name).await? else {
                info!("Pod {} of build {} not found, skipping", cluster.pod_name, name);
                return Ok(Action::await_change());
            };
            if computed.is_done() {
                return Ok(Action::await_change());
            }

            let key = PodKey::new(&cluster.namespace, &cluster.pod_name);
            if !ctx.registry.is_waiting(&key).await {
                let operation = ctx.builder.operation_from_status(&status)?;
                spawn_wait(ctx.client.clone(), builds, name, operation);
            }
            Ok(Action::requeue(RUNNING_REQUEUE))
        }
        None => start_build(build, builds, ctx).await,
    }
}

/// Expand, validate and execute a build that has not started yet
async fn start_build(build: &Build, builds: Api<Build>, ctx: &Arc<Context>) -> Result<Action> {
    let name = build.name_any();
    info!("🎯 Starting build {}", name);

    let expanded = match expand_build(&ctx.client, build).await {
        Ok(expanded) => expanded,
        Err(e) if e.is_user_error() => {
            return fail_build(&builds, &name, REASON_VALIDATION_FAILED, &e).await;
        }
        Err(e) => return Err(e),
    };

    let handle = match ctx.builder.build_from_spec(&expanded) {
        Ok(handle) => handle,
        Err(e) if e.is_user_error() => {
            return fail_build(&builds, &name, REASON_VALIDATION_FAILED, &e).await;
        }
        Err(e) => return Err(e),
    };

    let operation = match handle.execute().await {
        Ok(operation) => operation,
        Err(e @ Error::ValidationError(_)) => {
            return fail_build(&builds, &name, REASON_VALIDATION_FAILED, &e).await;
        }
        Err(e) if e.is_user_error() => {
            return fail_build(&builds, &name, REASON_EXECUTE_FAILED, &e).await;
        }
        Err(e) => return Err(e),
    };
    info!("🚀 Build {} running as {}", name, operation.name());

    update_status(&builds, &name, |status| {
        if status.is_done() {
            return false;
        }
        operation.checkpoint(build, status);
        status.set_condition(
            Condition::succeeded(ConditionStatus::Unknown).with_reason(REASON_BUILDING),
        );
        true
    })
    .await?;

    spawn_wait(ctx.client.clone(), builds, name, operation);
    Ok(Action::requeue(RUNNING_REQUEUE))
}

/// Mark a build failed for good
async fn fail_build(builds: &Api<Build>, name: &str, reason: &str, err: &Error) -> Result<Action> {
    warn!("❌ Build {} failed ({}): {}", name, reason, err);
    let message = err.to_string();
    update_status(builds, name, |status| {
        if status.is_done() {
            return false;
        }
        status.set_condition(
            Condition::succeeded(ConditionStatus::False)
                .with_reason(reason)
                .with_message(message.clone()),
        );
        status.completion_time = Some(Time(Utc::now()));
        true
    })
    .await?;
    Ok(Action::await_change())
}

/// Fold the current state of pod `pod_name` into the stored status of `build`.
///
/// Returns the status computed from the pod, or `None` when the pod is gone.
async fn sync_from_pod(
    pods: &Api<Pod>,
    builds: &Api<Build>,
    build: &Build,
    pod_name: &str,
) -> Result<Option<BuildStatus>> {
    let Some(pod) = pods.get_opt(pod_name).await? else {
        return Ok(None);
    };
    let name = build.name_any();
    let computed = build_status_from_pod(&pod, &build.spec);
    if update_status(builds, &name, |stored| merge_status(stored, &computed)).await? {
        debug!("Updated status of build {}", name);
    }
    Ok(Some(computed))
}

/// Re-read build `name` and its pod after its waiter failed.
///
/// A pod that already finished is recorded right away; one still running
/// gets a new waiter on the next requeue.
async fn refresh_from_pod(
    client: &Client,
    builds: &Api<Build>,
    name: &str,
) -> Result<Option<BuildStatus>> {
    let build = builds.get(name).await?;
    let Some(cluster) = build.status.as_ref().and_then(|s| s.cluster.clone()) else {
        return Ok(None);
    };
    let pods: Api<Pod> = Api::namespaced(client.clone(), &cluster.namespace);
    sync_from_pod(&pods, builds, &build, &cluster.pod_name).await
}

/// Wait for `operation` in the background and record the final status
fn spawn_wait(client: Client, builds: Api<Build>, name: String, operation: Box<dyn Operation>) {
    tokio::spawn(async move {
        let computed = match operation.wait().await {
            Ok(status) => status,
            Err(Error::AlreadyWaiting(key)) => {
                debug!("Build {} already has a waiter on {}", name, key);
                return;
            }
            Err(e) => {
                warn!("Waiting on build {} failed, refreshing from its pod: {}", name, e);
                match refresh_from_pod(&client, &builds, &name).await {
                    Ok(Some(status)) if status.is_done() => info!("🏁 Build {} finished", name),
                    Ok(_) => debug!("Build {} left for the next requeue", name),
                    Err(e) => error!("Failed to refresh status of build {}: {}", name, e),
                }
                return;
            }
        };

        match update_status(&builds, &name, |stored| merge_status(stored, &computed)).await {
            Ok(true) => info!("🏁 Build {} finished", name),
            Ok(false) => debug!("Build {} status already current", name),
            Err(e) => error!("Failed to record final status of build {}: {}", name, e),
        }
    });
}

/// Fold a status computed from the pod into the stored one.
///
/// Terminal statuses are never overwritten, the stored start and completion
/// times win, and condition transition times are kept when the status did
/// not change. Returns whether `stored` changed.
fn merge_status(stored: &mut BuildStatus, computed: &BuildStatus) -> bool {
    if stored.is_done() {
        return false;
    }

    let mut next = computed.clone();
    if stored.start_time.is_some() {
        next.start_time = stored.start_time.clone();
    }
    if stored.completion_time.is_some() {
        next.completion_time = stored.completion_time.clone();
    }
    next.inherit_transition_times(stored);

    if *stored == next {
        return false;
    }
    *stored = next;
    true
}

/// Requeue failed reconciliations with a linear backoff per build
pub fn error_policy(build: Arc<Build>, err: &Error, ctx: Arc<Context>) -> Action {
    let key = format!(
        "{}/{}",
        build.namespace().unwrap_or_default(),
        build.name_any()
    );
    if err.is_not_found() {
        debug!("Build {} is gone, dropping its backoff", key);
        ctx.backoff.reset(&key);
        return Action::await_change();
    }
    let delay = ctx.backoff.next_delay(&key);
    error!(
        error = ?err,
        build = %key,
        "Build reconciliation failed, retrying in {}s",
        delay.as_secs()
    );
    Action::requeue(delay)
}

//! `Build` reconciliation.

pub mod controller;
pub mod status;

pub use controller::{error_policy, reconcile_build};

use crate::crds::{Build, BuildStatus};
use crate::tasks::types::Result;
use kube::api::PostParams;
use kube::Api;
use tracing::debug;

/// Attempts made when the status write races another writer
const STATUS_WRITE_ATTEMPTS: usize = 3;

/// Read-modify-write the status of build `name`.
///
/// `mutate` gets the latest stored status and returns whether it changed
/// anything; nothing is written otherwise. The write carries the read
/// `resourceVersion`, and a conflict re-reads the build and applies `mutate`
/// again. Returns whether a write happened.
pub async fn update_status<F>(builds: &Api<Build>, name: &str, mut mutate: F) -> Result<bool>
where
    F: FnMut(&mut BuildStatus) -> bool,
{
    let mut attempt = 1;
    loop {
        let mut build = builds.get_status(name).await?;
        let mut status = build.status.take().unwrap_or_default();
        if !mutate(&mut status) {
            return Ok(false);
        }
        build.status = Some(status);

        let data = serde_json::to_vec(&build)?;
        match builds.replace_status(name, &PostParams::default(), data).await {
            Ok(_) => return Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 && attempt < STATUS_WRITE_ATTEMPTS => {
                debug!(
                    "Status of build {} changed underneath us, retrying (attempt {})",
                    name, attempt
                );
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{Condition, ConditionStatus};
    use crate::testing::{
        api_error, bodies_of, build_object, client_for, one_step_spec, running_status,
        succeeded_condition, BUILD_STATUS_PATH, NAMESPACE,
    };
    use serde_json::Value;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn mark_failed(status: &mut BuildStatus) -> bool {
        status.set_condition(
            Condition::succeeded(ConditionStatus::False)
                .with_reason("BuildTimeout")
                .with_message("too slow"),
        );
        true
    }

    #[tokio::test]
    async fn conflicting_write_reapplies_mutation_to_latest() {
        let server = MockServer::start().await;
        let stale = build_object(one_step_spec(), running_status("hello-pod-abc"));
        let mut latest = stale.clone();
        latest["metadata"]["resourceVersion"] = "42".into();
        latest["status"]["stepsCompleted"] = serde_json::json!(["build-step-compile"]);

        Mock::given(method("GET"))
            .and(path(BUILD_STATUS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(&stale))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(BUILD_STATUS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(&latest))
            .with_priority(5)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(BUILD_STATUS_PATH))
            .respond_with(api_error(409, "Conflict"))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(BUILD_STATUS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(&latest))
            .with_priority(5)
            .mount(&server)
            .await;

        let builds: Api<Build> = Api::namespaced(client_for(&server), NAMESPACE);
        let mut calls = 0;
        let written = update_status(&builds, "hello", |status| {
            calls += 1;
            mark_failed(status)
        })
        .await
        .unwrap();

        assert!(written);
        assert_eq!(calls, 2);
        let writes = bodies_of(&server, "PUT", BUILD_STATUS_PATH).await;
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0]["metadata"]["resourceVersion"], "41");
        assert_eq!(writes[1]["metadata"]["resourceVersion"], "42");
        assert_eq!(writes[1]["status"]["stepsCompleted"][0], "build-step-compile");
        assert_eq!(succeeded_condition(&writes[1])["reason"], "BuildTimeout");
    }

    #[tokio::test]
    async fn persistent_conflict_gives_up() {
        let server = MockServer::start().await;
        let build = build_object(one_step_spec(), running_status("hello-pod-abc"));
        Mock::given(method("GET"))
            .and(path(BUILD_STATUS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(&build))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(BUILD_STATUS_PATH))
            .respond_with(api_error(409, "Conflict"))
            .expect(STATUS_WRITE_ATTEMPTS as u64)
            .mount(&server)
            .await;

        let builds: Api<Build> = Api::namespaced(client_for(&server), NAMESPACE);
        let err = update_status(&builds, "hello", mark_failed).await.unwrap_err();
        assert!(err.to_string().contains("Conflict"), "{err}");
    }

    #[tokio::test]
    async fn unchanged_status_is_not_written() {
        let server = MockServer::start().await;
        let build = build_object(one_step_spec(), Value::Null);
        Mock::given(method("GET"))
            .and(path(BUILD_STATUS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(&build))
            .mount(&server)
            .await;

        let builds: Api<Build> = Api::namespaced(client_for(&server), NAMESPACE);
        assert!(!update_status(&builds, "hello", |_| false).await.unwrap());
        assert!(bodies_of(&server, "PUT", BUILD_STATUS_PATH).await.is_empty());
    }
}

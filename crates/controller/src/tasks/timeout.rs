//! Periodic sweep failing builds that ran past their timeout.

use crate::crds::validation::format_duration;
use crate::crds::{Build, BuildStatus, Condition, ConditionStatus, DEFAULT_TIMEOUT};
use crate::tasks::build::status::REASON_TIMEOUT;
use crate::tasks::build::update_status;
use crate::tasks::types::{Error, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{DeleteParams, ListParams};
use kube::{Api, Client, ResourceExt};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub struct TimeoutHandler {
    client: Client,
    namespace: Option<String>,
    interval: Duration,
}

impl TimeoutHandler {
    pub fn new(client: Client, namespace: Option<String>, interval: Duration) -> Self {
        Self {
            client,
            namespace,
            interval,
        }
    }

    /// Sweep every `interval` until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "⏱️ Timeout handler started, checking every {}s",
            self.interval.as_secs()
        );
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!("Timeout sweep failed: {}", e);
                    }
                }
            }
        }
        info!("Timeout handler stopped");
    }

    #[instrument(skip(self))]
    async fn sweep(&self) -> Result<()> {
        let now = Utc::now();
        for namespace in self.namespaces().await? {
            let builds: Api<Build> = Api::namespaced(self.client.clone(), &namespace);
            for build in builds.list(&ListParams::default()).await?.items {
                if let Err(e) = self.check_build(&builds, &build, now).await {
                    warn!(
                        "Failed to enforce timeout of build {}/{}: {}",
                        namespace,
                        build.name_any(),
                        e
                    );
                }
            }
        }
        Ok(())
    }

    async fn namespaces(&self) -> Result<Vec<String>> {
        if let Some(namespace) = &self.namespace {
            return Ok(vec![namespace.clone()]);
        }
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        Ok(namespaces
            .list(&ListParams::default())
            .await?
            .items
            .iter()
            .map(ResourceExt::name_any)
            .collect())
    }

    async fn check_build(&self, builds: &Api<Build>, build: &Build, now: DateTime<Utc>) -> Result<()> {
        let Some(status) = build.status.as_ref().filter(|s| !s.is_done()) else {
            return Ok(());
        };
        let timeout = build.spec.timeout_duration()?;
        if !is_timeout(status, timeout, now) {
            return Ok(());
        }

        let name = build.name_any();
        let message = format!(
            "Build \"{}\" failed to finish within \"{}\"",
            name,
            format_duration(timeout)
        );
        info!("⌛ {}", message);

        let written = update_status(builds, &name, |status| {
            if status.is_done() {
                return false;
            }
            status.set_condition(
                Condition::succeeded(ConditionStatus::False)
                    .with_reason(REASON_TIMEOUT)
                    .with_message(message.clone()),
            );
            status.completion_time = Some(Time(Utc::now()));
            true
        })
        .await?;
        if !written {
            debug!("Build {} finished before its timeout was recorded", name);
            return Ok(());
        }

        if let Some(cluster) = &status.cluster {
            let pods: Api<Pod> = Api::namespaced(self.client.clone(), &cluster.namespace);
            match pods.delete(&cluster.pod_name, &DeleteParams::default()).await {
                Ok(_) => info!("🗑️ Deleted pod {} of timed out build {}", cluster.pod_name, name),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    debug!("Pod {} of build {} already gone", cluster.pod_name, name);
                }
                Err(e) => return Err(Error::KubeError(e)),
            }
        }
        Ok(())
    }
}

/// True when a build that started at `status.startTime` has outlived `timeout`.
///
/// A zero timeout means the default. Builds that have not started never time out.
pub fn is_timeout(status: &BuildStatus, timeout: Duration, now: DateTime<Utc>) -> bool {
    let Some(start) = &status.start_time else {
        return false;
    };
    let timeout = if timeout.is_zero() { DEFAULT_TIMEOUT } else { timeout };
    let Ok(timeout) = chrono::Duration::from_std(timeout) else {
        return false;
    };
    now.signed_duration_since(start.0) > timeout
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        api_error, bodies_of, build_object, client_for, one_step_spec, running_status,
        succeeded_condition, BUILD_STATUS_PATH, NAMESPACE, PODS_PATH,
    };
    use chrono::TimeZone;
    use serde_json::Value;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const POD_NAME: &str = "hello-pod-abc";

    async fn handler_for(server: &MockServer, stored: &Value) -> (TimeoutHandler, Api<Build>) {
        Mock::given(method("GET"))
            .and(path(BUILD_STATUS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(stored))
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path(BUILD_STATUS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(stored))
            .mount(server)
            .await;

        let client = client_for(server);
        let builds = Api::namespaced(client.clone(), NAMESPACE);
        let handler = TimeoutHandler::new(client, Some(NAMESPACE.to_string()), Duration::from_secs(30));
        (handler, builds)
    }

    /// Twenty minutes after the fixture builds started
    fn twenty_minutes_in() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 10, 20, 0).unwrap()
    }

    #[tokio::test]
    async fn expired_build_is_failed_and_its_pod_deleted() {
        let server = MockServer::start().await;
        let stored = build_object(one_step_spec(), running_status(POD_NAME));
        let (handler, builds) = handler_for(&server, &stored).await;
        Mock::given(method("DELETE"))
            .and(path(format!("{PODS_PATH}/{POD_NAME}")))
            .respond_with(api_error(404, "NotFound"))
            .expect(1)
            .mount(&server)
            .await;

        let build: Build = serde_json::from_value(stored).unwrap();
        handler
            .check_build(&builds, &build, twenty_minutes_in())
            .await
            .unwrap();

        let writes = bodies_of(&server, "PUT", BUILD_STATUS_PATH).await;
        assert_eq!(writes.len(), 1);
        let condition = succeeded_condition(&writes[0]);
        assert_eq!(condition["status"], "False");
        assert_eq!(condition["reason"], REASON_TIMEOUT);
        assert_eq!(
            condition["message"],
            "Build \"hello\" failed to finish within \"10m0s\""
        );
        assert!(writes[0]["status"]["completionTime"].is_string());
    }

    #[tokio::test]
    async fn build_within_its_timeout_is_left_alone() {
        let server = MockServer::start().await;
        let stored = build_object(one_step_spec(), running_status(POD_NAME));
        let (handler, builds) = handler_for(&server, &stored).await;

        let build: Build = serde_json::from_value(stored).unwrap();
        let five_minutes_in = Utc.with_ymd_and_hms(2025, 3, 1, 10, 5, 0).unwrap();
        handler.check_build(&builds, &build, five_minutes_in).await.unwrap();

        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn build_finished_meanwhile_keeps_its_pod() {
        let server = MockServer::start().await;
        let listed = build_object(one_step_spec(), running_status(POD_NAME));
        let mut stored = listed.clone();
        stored["status"]["conditions"][0]["status"] = "True".into();
        stored["status"]["conditions"][0]["reason"] = Value::Null;
        let (handler, builds) = handler_for(&server, &stored).await;

        let build: Build = serde_json::from_value(listed).unwrap();
        handler
            .check_build(&builds, &build, twenty_minutes_in())
            .await
            .unwrap();

        assert!(bodies_of(&server, "PUT", BUILD_STATUS_PATH).await.is_empty());
        assert!(bodies_of(&server, "DELETE", &format!("{PODS_PATH}/{POD_NAME}"))
            .await
            .is_empty());
    }

    fn started_minutes_ago(now: DateTime<Utc>, minutes: i64) -> BuildStatus {
        BuildStatus {
            start_time: Some(Time(now - chrono::Duration::minutes(minutes))),
            ..Default::default()
        }
    }

    #[test]
    fn build_past_its_timeout_times_out() {
        let now = Utc::now();
        let status = started_minutes_ago(now, 11);
        assert!(is_timeout(&status, Duration::from_secs(9 * 60), now));
        assert!(!is_timeout(&status, Duration::from_secs(20 * 60), now));
    }

    #[test]
    fn zero_timeout_uses_default() {
        let now = Utc::now();
        assert!(!is_timeout(&started_minutes_ago(now, 9), Duration::ZERO, now));
        assert!(is_timeout(&started_minutes_ago(now, 11), Duration::ZERO, now));
    }

    #[test]
    fn unstarted_build_never_times_out() {
        assert!(!is_timeout(
            &BuildStatus::default(),
            Duration::from_secs(1),
            Utc::now()
        ));
    }
}

//! On-cluster execution: every build runs as one pod.

pub mod registry;

pub use registry::{Completion, CompletionRegistry, PodKey};

use super::{BuildHandle, Builder, Operation};
use crate::crds::{
    Build, BuildProvider, BuildStatus, ClusterSpec, Condition, ConditionStatus,
};
use crate::resources::{make_pod, EntrypointResolver, KubeCredentialLookup, BUILD_NAME_LABEL};
use crate::tasks::build::status::{build_status_from_pod, failure_message, REASON_BUILD_FAILED};
use crate::tasks::config::ImagesConfig;
use crate::tasks::types::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::PostParams;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub struct ClusterBuilder {
    client: Client,
    images: ImagesConfig,
    resolver: Arc<EntrypointResolver>,
    registry: Arc<CompletionRegistry>,
}

impl ClusterBuilder {
    pub fn new(
        client: Client,
        images: ImagesConfig,
        resolver: Arc<EntrypointResolver>,
        registry: Arc<CompletionRegistry>,
    ) -> Self {
        Self {
            client,
            images,
            resolver,
            registry,
        }
    }

    /// Feed terminal build pods into the completion registry until the watch ends
    #[instrument(skip(self))]
    pub async fn watch_pods(&self, namespace: Option<String>) -> Result<()> {
        let pods: Api<Pod> = match namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let config = watcher::Config::default().labels(BUILD_NAME_LABEL);

        info!("👀 Watching build pods for completion");
        let mut events = watcher(pods, config).default_backoff().boxed();
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => notify_completion(&self.registry, event).await,
                Err(e) => warn!("Build pod watch error: {}", e),
            }
        }

        info!("Build pod watch ended");
        Ok(())
    }
}

/// Complete the waiter of a pod that finished or was deleted while running
async fn notify_completion(registry: &CompletionRegistry, event: watcher::Event<Pod>) {
    match event {
        watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => {
            if let Some(completion) = completion_for(&pod) {
                registry.complete(&pod_key(&pod), completion).await;
            }
        }
        watcher::Event::Delete(pod) => {
            if completion_for(&pod).is_none() {
                let key = pod_key(&pod);
                let message = format!("pod {key} was deleted before it finished");
                registry.complete(&key, Completion::Failed(message)).await;
            }
        }
        watcher::Event::Init | watcher::Event::InitDone => {}
    }
}

impl Builder for ClusterBuilder {
    fn provider(&self) -> BuildProvider {
        BuildProvider::Cluster
    }

    fn build_from_spec(&self, build: &Build) -> Result<Box<dyn BuildHandle>> {
        build.spec.validate()?;
        if build.spec.template.is_some() {
            return Err(Error::ConfigError(format!(
                "build {} must have its template expanded before execution",
                build.name_any()
            )));
        }

        Ok(Box::new(ClusterBuildHandle {
            build: build.clone(),
            client: self.client.clone(),
            images: self.images.clone(),
            resolver: self.resolver.clone(),
            registry: self.registry.clone(),
        }))
    }

    fn operation_from_status(&self, status: &BuildStatus) -> Result<Box<dyn Operation>> {
        if let Some(provider) = status.builder.filter(|p| *p != BuildProvider::Cluster) {
            return Err(Error::UnsupportedBuilder(provider.to_string()));
        }
        let cluster = status.cluster.as_ref().ok_or(Error::MissingObjectKey)?;

        Ok(Box::new(ClusterOperation {
            client: self.client.clone(),
            registry: self.registry.clone(),
            key: PodKey::new(&cluster.namespace, &cluster.pod_name),
            start_time: status.start_time.clone(),
        }))
    }
}

struct ClusterBuildHandle {
    build: Build,
    client: Client,
    images: ImagesConfig,
    resolver: Arc<EntrypointResolver>,
    registry: Arc<CompletionRegistry>,
}

#[async_trait]
impl BuildHandle for ClusterBuildHandle {
    #[instrument(skip(self), fields(build = %self.build.name_any()))]
    async fn execute(&self) -> Result<Box<dyn Operation>> {
        let namespace = self.build.namespace().ok_or(Error::MissingObjectKey)?;
        let lookup = KubeCredentialLookup::new(self.client.clone());
        let pod = make_pod(&self.build, &lookup, &self.resolver, &self.images).await?;
        let pod_name = pod.name_any();

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let pod = match pods.create(&PostParams::default(), &pod).await {
            Ok(created) => {
                info!("🚀 Created build pod {}/{}", namespace, pod_name);
                created
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                info!("Build pod {}/{} already exists, adopting it", namespace, pod_name);
                pods.get(&pod_name).await?
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Box::new(ClusterOperation {
            client: self.client.clone(),
            registry: self.registry.clone(),
            key: PodKey::new(namespace, pod_name),
            start_time: pod.metadata.creation_timestamp.clone(),
        }))
    }
}

/// A build running as a pod
pub struct ClusterOperation {
    client: Client,
    registry: Arc<CompletionRegistry>,
    key: PodKey,
    start_time: Option<Time>,
}

impl ClusterOperation {
    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.key.namespace)
    }

    /// Status computed from the pod, if it has finished
    async fn finished_status(&self) -> Result<Option<BuildStatus>> {
        let Some(pod) = self.pods().get_opt(&self.key.name).await? else {
            return Ok(None);
        };
        if completion_for(&pod).is_none() {
            return Ok(None);
        }
        self.status_from_pod(&pod).await.map(Some)
    }

    async fn status_from_pod(&self, pod: &Pod) -> Result<BuildStatus> {
        let build_name = pod
            .labels()
            .get(BUILD_NAME_LABEL)
            .ok_or(Error::MissingObjectKey)?;
        let builds: Api<Build> = Api::namespaced(self.client.clone(), &self.key.namespace);
        let build = builds.get(build_name).await?;
        Ok(build_status_from_pod(pod, &build.spec))
    }

    fn deleted_status(&self, message: String) -> BuildStatus {
        let mut status = BuildStatus {
            builder: Some(BuildProvider::Cluster),
            cluster: Some(self.locator()),
            start_time: self.start_time.clone(),
            completion_time: Some(Time(chrono::Utc::now())),
            ..Default::default()
        };
        status.set_condition(
            Condition::succeeded(ConditionStatus::False)
                .with_reason(REASON_BUILD_FAILED)
                .with_message(message),
        );
        status
    }

    fn locator(&self) -> ClusterSpec {
        ClusterSpec {
            namespace: self.key.namespace.clone(),
            pod_name: self.key.name.clone(),
        }
    }
}

#[async_trait]
impl Operation for ClusterOperation {
    fn name(&self) -> String {
        self.key.to_string()
    }

    fn checkpoint(&self, build: &Build, status: &mut BuildStatus) {
        status.builder = Some(BuildProvider::Cluster);
        status.cluster = Some(self.locator());
        if status.start_time.is_none() {
            status.start_time = self
                .start_time
                .clone()
                .or_else(|| build.metadata.creation_timestamp.clone());
        }
    }

    #[instrument(skip(self), fields(pod = %self.key))]
    async fn wait(&self) -> Result<BuildStatus> {
        let receiver = self.registry.register(self.key.clone()).await?;

        // The pod may have finished before the waiter was registered
        if let Some(status) = self.finished_status().await? {
            self.registry.unregister(&self.key).await;
            return Ok(status);
        }

        let completion = receiver
            .await
            .map_err(|_| Error::WaiterDropped(self.key.to_string()))?;
        debug!("Build pod {} completed: {:?}", self.key, completion);

        match self.pods().get_opt(&self.key.name).await? {
            Some(pod) => self.status_from_pod(&pod).await,
            None => {
                let message = match completion {
                    Completion::Failed(message) => message,
                    Completion::Succeeded => format!("pod {} no longer exists", self.key),
                };
                Ok(self.deleted_status(message))
            }
        }
    }
}

fn pod_key(pod: &Pod) -> PodKey {
    PodKey::new(pod.namespace().unwrap_or_default(), pod.name_any())
}

/// Terminal outcome of `pod`, `None` while it is still pending or running
pub fn completion_for(pod: &Pod) -> Option<Completion> {
    let phase = pod.status.as_ref()?.phase.as_deref()?;
    match phase {
        "Succeeded" => Some(Completion::Succeeded),
        "Failed" => Some(Completion::Failed(failure_message(pod))),
        _ => None,
    }
}

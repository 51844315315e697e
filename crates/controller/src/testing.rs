//! Helpers for tests that run against a mocked Kubernetes API server.

use crate::builder::{ClusterBuilder, CompletionRegistry};
use crate::resources::EntrypointResolver;
use crate::tasks::config::{ControllerConfig, ImagesConfig};
use crate::tasks::types::{Context, ErrorBackoff};
use kube::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use wiremock::{MockServer, ResponseTemplate};

pub const NAMESPACE: &str = "ns";
pub const BUILD_NAME: &str = "hello";
pub const BUILD_PATH: &str = "/apis/build.platform/v1alpha1/namespaces/ns/builds/hello";
pub const BUILD_STATUS_PATH: &str = "/apis/build.platform/v1alpha1/namespaces/ns/builds/hello/status";
pub const PODS_PATH: &str = "/api/v1/namespaces/ns/pods";

/// A client whose requests all go to `server`
pub fn client_for(server: &MockServer) -> Client {
    let config = kube::Config::new(server.uri().parse().unwrap());
    Client::try_from(config).unwrap()
}

pub fn context_for(client: Client) -> Arc<Context> {
    let resolver = Arc::new(EntrypointResolver::new(Vec::new()).unwrap());
    let registry = Arc::new(CompletionRegistry::new());
    let builder = Arc::new(ClusterBuilder::new(
        client.clone(),
        ImagesConfig::default(),
        resolver.clone(),
        registry.clone(),
    ));
    Arc::new(Context {
        client,
        config: Arc::new(ControllerConfig::default()),
        builder,
        registry,
        resolver,
        backoff: ErrorBackoff::default(),
    })
}

/// Build `ns/hello` with the given spec and status
pub fn build_object(spec: Value, status: Value) -> Value {
    json!({
        "apiVersion": "build.platform/v1alpha1",
        "kind": "Build",
        "metadata": {
            "name": BUILD_NAME,
            "namespace": NAMESPACE,
            "uid": "7c9e6679-7425-40de-944b-e07fc1f90ae7",
            "resourceVersion": "41",
            "creationTimestamp": "2025-03-01T10:00:00Z"
        },
        "spec": spec,
        "status": status
    })
}

pub fn one_step_spec() -> Value {
    json!({
        "steps": [{ "name": "compile", "image": "busybox", "command": ["make"] }],
        "timeout": "10m"
    })
}

/// Status of a build running as pod `ns/<pod>`
pub fn running_status(pod: &str) -> Value {
    json!({
        "builder": "Cluster",
        "cluster": { "namespace": NAMESPACE, "podName": pod },
        "startTime": "2025-03-01T10:00:00Z",
        "conditions": [{ "type": "Succeeded", "status": "Unknown", "reason": "Building" }]
    })
}

/// A failed pod of build `hello` whose single step exited with `code`
pub fn failed_pod(name: &str, code: i32) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": NAMESPACE,
            "labels": { "build.platform/buildName": BUILD_NAME },
            "creationTimestamp": "2025-03-01T10:00:00Z"
        },
        "spec": {
            "initContainers": [
                { "name": "build-step-credential-initializer", "image": "creds-init" },
                { "name": "build-step-place-tools", "image": "entrypoint" }
            ],
            "containers": [{ "name": "build-step-compile", "image": "busybox" }]
        },
        "status": {
            "phase": "Failed",
            "initContainerStatuses": [
                terminated("build-step-credential-initializer", "creds-init", 0),
                terminated("build-step-place-tools", "entrypoint", 0)
            ],
            "containerStatuses": [terminated("build-step-compile", "busybox", code)]
        }
    })
}

fn terminated(name: &str, image: &str, code: i32) -> Value {
    json!({
        "name": name,
        "image": image,
        "imageID": format!("docker-pullable://{image}@sha256:0123"),
        "ready": false,
        "restartCount": 0,
        "state": { "terminated": { "exitCode": code, "finishedAt": "2025-03-01T10:04:00Z" } }
    })
}

/// An API server `Status` error response
pub fn api_error(code: u16, reason: &str) -> ResponseTemplate {
    ResponseTemplate::new(code).set_body_json(json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": format!("{reason} (test)"),
        "reason": reason,
        "code": code
    }))
}

/// JSON bodies of the `method` requests `server` received for `path`
pub async fn bodies_of(server: &MockServer, method: &str, path: &str) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|request| request.method.as_str() == method && request.url.path() == path)
        .map(|request| serde_json::from_slice(&request.body).unwrap_or(Value::Null))
        .collect()
}

/// The `Succeeded` condition inside a build object written to the API
pub fn succeeded_condition(build: &Value) -> &Value {
    build["status"]["conditions"]
        .as_array()
        .and_then(|conditions| conditions.iter().find(|c| c["type"] == "Succeeded"))
        .unwrap()
}

//! Image entrypoint lookup against the Docker Registry HTTP API v2
//!
//! Steps that declare no command run the image's own entrypoint, which the
//! synchronizer has to know up front. Lookups are cached per image reference
//! for the lifetime of the controller.

use crate::credentials::docker::DockerConfig;
use regex::Regex;
use reqwest::{header, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

pub const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

const CONFIG_ACCEPT: &str =
    "application/vnd.docker.container.image.v1+json, application/vnd.oci.image.config.v1+json";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

static CHALLENGE_PARAM: OnceLock<Regex> = OnceLock::new();

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid image reference {0:?}")]
    BadReference(String),

    #[error("failed to build registry HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("unsupported authentication challenge from {url}: {challenge:?}")]
    AuthChallenge { url: String, challenge: String },

    #[error("malformed manifest for {image}: {reason}")]
    MalformedManifest { image: String, reason: String },
}

/// `registry/repository:tag` or `registry/repository@digest`, normalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    /// Tag or digest
    pub reference: String,
}

impl ImageReference {
    pub fn parse(image: &str) -> Result<Self, RegistryError> {
        let bad = || RegistryError::BadReference(image.to_string());
        if image.is_empty() || image.contains(char::is_whitespace) {
            return Err(bad());
        }

        let (name, reference) = match image.split_once('@') {
            Some((name, digest)) => (split_tag(name).0, digest.to_string()),
            None => {
                let (name, tag) = split_tag(image);
                (name, tag.unwrap_or("latest").to_string())
            }
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (normalize_registry(first), rest.to_string())
            }
            Some(_) => (DOCKER_HUB_REGISTRY.to_string(), name.to_string()),
            None => (DOCKER_HUB_REGISTRY.to_string(), format!("library/{name}")),
        };

        if repository.is_empty() || reference.is_empty() || repository.ends_with('/') {
            return Err(bad());
        }
        Ok(Self {
            registry,
            repository,
            reference,
        })
    }
}

/// Split `name:tag`, ignoring a `:port` in the registry part
fn split_tag(name: &str) -> (&str, Option<&str>) {
    let last_segment = name.rfind('/').map_or(0, |idx| idx + 1);
    match name[last_segment..].rfind(':') {
        Some(idx) => {
            let split = last_segment + idx;
            (&name[..split], Some(&name[split + 1..]))
        }
        None => (name, None),
    }
}

fn normalize_registry(host: &str) -> String {
    match host {
        "docker.io" | "index.docker.io" => DOCKER_HUB_REGISTRY.to_string(),
        other => other.to_string(),
    }
}

/// Registry credentials keyed by registry host
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    credentials: HashMap<String, (String, String)>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Add the entries of an image pull secret; earlier entries win
    pub fn add_docker_config(&mut self, config: &DockerConfig) {
        for (server, entry) in &config.auths {
            if let Some(credentials) = entry.credentials() {
                self.credentials
                    .entry(registry_host(server))
                    .or_insert(credentials);
            }
        }
    }

    pub fn credentials_for(&self, registry: &str) -> Option<&(String, String)> {
        self.credentials.get(registry)
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

/// `https://index.docker.io/v1/` -> `registry-1.docker.io`
fn registry_host(server: &str) -> String {
    let without_scheme = server.split_once("://").map_or(server, |(_, rest)| rest);
    let host = without_scheme.split('/').next().unwrap_or(without_scheme);
    normalize_registry(host)
}

/// `Entrypoint` and `Cmd` from an image's runtime config
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageEntrypoint {
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
}

impl ImageEntrypoint {
    pub fn new(entrypoint: &[&str], cmd: &[&str]) -> Self {
        let owned = |parts: &[&str]| parts.iter().map(ToString::to_string).collect();
        Self {
            entrypoint: owned(entrypoint),
            cmd: owned(cmd),
        }
    }

    /// Command line a container runtime runs for a container with no
    /// `command` of its own and the given `args`.
    ///
    /// Declared args replace `Cmd`; `Entrypoint`, when set, is prepended.
    pub fn command_line(&self, args: Vec<String>) -> Vec<String> {
        let tail = if args.is_empty() {
            self.cmd.clone()
        } else {
            args
        };
        self.entrypoint.iter().cloned().chain(tail).collect()
    }
}

/// Resolves image entrypoints and caches them by image reference
pub struct EntrypointResolver {
    http: reqwest::Client,
    cache: Mutex<HashMap<String, ImageEntrypoint>>,
    insecure_registries: Vec<String>,
}

impl EntrypointResolver {
    /// `insecure_registries` are reached over plain HTTP, as are localhost registries
    pub fn new(insecure_registries: Vec<String>) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("build-controller/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(RegistryError::Client)?;

        Ok(Self {
            http,
            cache: Mutex::new(HashMap::new()),
            insecure_registries,
        })
    }

    /// `Entrypoint` and `Cmd` of `image`
    #[instrument(skip(self, auth))]
    pub async fn resolve(
        &self,
        image: &str,
        auth: &RegistryAuth,
    ) -> Result<ImageEntrypoint, RegistryError> {
        if let Some(cached) = self.cached(image) {
            debug!("Entrypoint cache hit for {}", image);
            return Ok(cached);
        }

        let reference = ImageReference::parse(image)?;
        let scheme = if self.is_insecure(&reference.registry) {
            "http"
        } else {
            "https"
        };
        let mut session = RegistrySession {
            http: &self.http,
            base: format!("{scheme}://{}", reference.registry),
            image,
            reference: &reference,
            credentials: auth.credentials_for(&reference.registry),
            authorization: None,
        };
        let entrypoint = session.entrypoint().await?;

        // Concurrent lookups of one image may both reach the registry; both write the same value
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(image.to_string(), entrypoint.clone());

        info!("Resolved entrypoint of {}: {:?}", image, entrypoint);
        Ok(entrypoint)
    }

    fn cached(&self, image: &str) -> Option<ImageEntrypoint> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(image)
            .cloned()
    }

    fn is_insecure(&self, registry: &str) -> bool {
        let host = registry.split(':').next().unwrap_or(registry);
        matches!(host, "localhost" | "127.0.0.1")
            || self.insecure_registries.iter().any(|r| r == registry)
    }

    #[cfg(test)]
    pub(crate) fn seed(&self, image: &str, entrypoint: ImageEntrypoint) {
        self.cache
            .lock()
            .unwrap()
            .insert(image.to_string(), entrypoint);
    }
}

enum Authorization {
    Bearer(String),
    Basic,
}

/// One image lookup; remembers the token obtained from the first challenge
struct RegistrySession<'a> {
    http: &'a reqwest::Client,
    base: String,
    image: &'a str,
    reference: &'a ImageReference,
    credentials: Option<&'a (String, String)>,
    authorization: Option<Authorization>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Vec<ManifestDescriptor>,
    #[serde(default)]
    config: Option<ManifestDescriptor>,
}

#[derive(Deserialize)]
struct ManifestDescriptor {
    digest: String,
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Deserialize)]
struct Platform {
    architecture: String,
    os: String,
}

#[derive(Deserialize)]
struct ImageConfigBlob {
    #[serde(default)]
    config: Option<ImageRuntimeConfig>,
}

#[derive(Deserialize)]
struct ImageRuntimeConfig {
    #[serde(rename = "Entrypoint", default)]
    entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", default)]
    cmd: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

impl RegistrySession<'_> {
    async fn entrypoint(&mut self) -> Result<ImageEntrypoint, RegistryError> {
        let reference = self.reference;
        let mut manifest = self.manifest(&reference.reference).await?;

        let is_index = !manifest.manifests.is_empty()
            || manifest
                .media_type
                .as_deref()
                .is_some_and(|t| t.contains("manifest.list") || t.contains("image.index"));
        if is_index {
            let digest = select_platform(&manifest.manifests)
                .ok_or_else(|| self.malformed("image index lists no manifests"))?;
            manifest = self.manifest(&digest).await?;
        }

        let config_digest = manifest
            .config
            .map(|c| c.digest)
            .ok_or_else(|| self.malformed("manifest has no config descriptor"))?;
        let url = format!(
            "{}/v2/{}/blobs/{config_digest}",
            self.base, self.reference.repository
        );
        let blob: ImageConfigBlob = self.get_json(&url, CONFIG_ACCEPT).await?;

        let runtime = blob.config.unwrap_or(ImageRuntimeConfig {
            entrypoint: None,
            cmd: None,
        });
        Ok(ImageEntrypoint {
            entrypoint: runtime.entrypoint.unwrap_or_default(),
            cmd: runtime.cmd.unwrap_or_default(),
        })
    }

    async fn manifest(&mut self, reference: &str) -> Result<Manifest, RegistryError> {
        let url = format!(
            "{}/v2/{}/manifests/{reference}",
            self.base, self.reference.repository
        );
        self.get_json(&url, MANIFEST_ACCEPT).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &mut self,
        url: &str,
        accept: &str,
    ) -> Result<T, RegistryError> {
        let response = self.get(url, accept).await?;
        let body = response.bytes().await.map_err(|source| RegistryError::Http {
            url: url.to_string(),
            source,
        })?;
        serde_json::from_slice(&body).map_err(|e| self.malformed(&format!("{url}: {e}")))
    }

    async fn get(&mut self, url: &str, accept: &str) -> Result<Response, RegistryError> {
        let response = self.send(url, accept).await?;
        if response.status() != StatusCode::UNAUTHORIZED || self.authorization.is_some() {
            return check_status(url, response);
        }

        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        self.authenticate(url, &challenge).await?;

        let response = self.send(url, accept).await?;
        check_status(url, response)
    }

    async fn send(&self, url: &str, accept: &str) -> Result<Response, RegistryError> {
        let mut request = self.http.get(url).header(header::ACCEPT, accept);
        request = match (&self.authorization, self.credentials) {
            (Some(Authorization::Bearer(token)), _) => request.bearer_auth(token),
            (Some(Authorization::Basic), Some((user, pass))) => request.basic_auth(user, Some(pass)),
            _ => request,
        };
        request.send().await.map_err(|source| RegistryError::Http {
            url: url.to_string(),
            source,
        })
    }

    async fn authenticate(&mut self, url: &str, challenge: &str) -> Result<(), RegistryError> {
        let unsupported = || RegistryError::AuthChallenge {
            url: url.to_string(),
            challenge: challenge.to_string(),
        };
        let (scheme, params) = challenge.split_once(' ').unwrap_or((challenge, ""));

        if scheme.eq_ignore_ascii_case("basic") && self.credentials.is_some() {
            self.authorization = Some(Authorization::Basic);
            return Ok(());
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(unsupported());
        }

        let params = challenge_params(params);
        let realm = params.get("realm").ok_or_else(unsupported)?;
        let scope = params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{}:pull", self.reference.repository));

        let mut query = vec![("scope", scope)];
        if let Some(service) = params.get("service") {
            query.push(("service", service.clone()));
        }
        let mut request = self.http.get(realm.as_str()).query(&query);
        if let Some((user, pass)) = self.credentials {
            request = request.basic_auth(user, Some(pass));
        }
        let response = request.send().await.map_err(|source| RegistryError::Http {
            url: realm.clone(),
            source,
        })?;
        let response = check_status(realm, response)?;
        let token: TokenResponse = response.json().await.map_err(|source| RegistryError::Http {
            url: realm.clone(),
            source,
        })?;

        let token = token.token.or(token.access_token).ok_or_else(unsupported)?;
        debug!("Obtained registry token for {}", self.reference.repository);
        self.authorization = Some(Authorization::Bearer(token));
        Ok(())
    }

    fn malformed(&self, reason: &str) -> RegistryError {
        RegistryError::MalformedManifest {
            image: self.image.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn check_status(url: &str, response: Response) -> Result<Response, RegistryError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(RegistryError::Status {
            url: url.to_string(),
            status: response.status().as_u16(),
        })
    }
}

/// Prefer linux/amd64, else the first listed manifest
fn select_platform(manifests: &[ManifestDescriptor]) -> Option<String> {
    manifests
        .iter()
        .find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == "amd64")
        })
        .or_else(|| manifests.first())
        .map(|m| m.digest.clone())
}

/// `realm="https://auth",service="registry",scope="repository:a:pull"`
fn challenge_params(raw: &str) -> HashMap<String, String> {
    let pattern = CHALLENGE_PARAM
        .get_or_init(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("Invalid regex pattern"));
    pattern
        .captures_iter(raw)
        .map(|caps| (caps[1].to_ascii_lowercase(), caps[2].to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header as header_matcher, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CONFIG_DIGEST: &str = "sha256:0000000000000000000000000000000000000000000000000000000000000001";

    fn registry_of(server: &MockServer) -> String {
        server.uri().trim_start_matches("http://").to_string()
    }

    async fn mount_image(server: &MockServer, repository: &str, config: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path(format!("/v2/{repository}/manifests/v1")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "schemaVersion": 2,
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "config": { "mediaType": "application/vnd.docker.container.image.v1+json", "digest": CONFIG_DIGEST },
                "layers": []
            })))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/v2/{repository}/blobs/{CONFIG_DIGEST}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "config": config })))
            .mount(server)
            .await;
    }

    #[test]
    fn parses_image_references() {
        let r = ImageReference::parse("ubuntu").unwrap();
        assert_eq!(
            (r.registry.as_str(), r.repository.as_str(), r.reference.as_str()),
            (DOCKER_HUB_REGISTRY, "library/ubuntu", "latest")
        );

        let r = ImageReference::parse("user/app:1.0").unwrap();
        assert_eq!(r.repository, "user/app");
        assert_eq!(r.reference, "1.0");

        let r = ImageReference::parse("localhost:5000/team/app").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.reference, "latest");

        let r = ImageReference::parse("gcr.io/proj/img:tag@sha256:abc").unwrap();
        assert_eq!(r.registry, "gcr.io");
        assert_eq!(r.repository, "proj/img");
        assert_eq!(r.reference, "sha256:abc");

        let r = ImageReference::parse("docker.io/library/busybox:1.36").unwrap();
        assert_eq!(r.registry, DOCKER_HUB_REGISTRY);

        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("has space").is_err());
    }

    #[test]
    fn registry_auth_normalizes_docker_hub() {
        let config = DockerConfig::from_dockerconfigjson(
            br#"{"auths": {"https://index.docker.io/v1/": {"auth": "dXNlcjpwYXNz"}}}"#,
        )
        .unwrap();
        let mut auth = RegistryAuth::anonymous();
        auth.add_docker_config(&config);
        assert_eq!(
            auth.credentials_for(DOCKER_HUB_REGISTRY),
            Some(&("user".to_string(), "pass".to_string()))
        );
    }

    #[test]
    fn parses_bearer_challenge() {
        let params = challenge_params(
            r#"realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/ubuntu:pull,push""#,
        );
        assert_eq!(params["realm"], "https://auth.docker.io/token");
        assert_eq!(params["service"], "registry.docker.io");
        assert_eq!(params["scope"], "repository:library/ubuntu:pull,push");
    }

    #[tokio::test]
    async fn resolves_entrypoint_and_caches_it() {
        let server = MockServer::start().await;
        mount_image(
            &server,
            "team/app",
            json!({ "Entrypoint": ["/bin/app", "--serve"], "Cmd": ["--port=80"] }),
        )
        .await;

        let resolver = EntrypointResolver::new(Vec::new()).unwrap();
        let image = format!("{}/team/app:v1", registry_of(&server));
        let auth = RegistryAuth::anonymous();

        let first = resolver.resolve(&image, &auth).await.unwrap();
        let second = resolver.resolve(&image, &auth).await.unwrap();
        assert_eq!(first, ImageEntrypoint::new(&["/bin/app", "--serve"], &["--port=80"]));
        assert_eq!(first, second);
        // Manifest mock expects exactly one request, verified on drop
    }

    #[tokio::test]
    async fn null_entrypoint_keeps_cmd() {
        let server = MockServer::start().await;
        mount_image(&server, "team/shell", json!({ "Entrypoint": null, "Cmd": ["/bin/bash"] })).await;

        let resolver = EntrypointResolver::new(Vec::new()).unwrap();
        let image = format!("{}/team/shell:v1", registry_of(&server));
        let resolved = resolver.resolve(&image, &RegistryAuth::anonymous()).await.unwrap();
        assert_eq!(resolved, ImageEntrypoint::new(&[], &["/bin/bash"]));
        assert_eq!(resolved.command_line(vec!["false".to_string()]), vec!["false"]);
    }

    #[test]
    fn command_line_follows_runtime_rules() {
        let args = |a: &[&str]| a.iter().map(ToString::to_string).collect::<Vec<_>>();

        let with_entrypoint = ImageEntrypoint::new(&["/bin/app"], &["--serve"]);
        assert_eq!(with_entrypoint.command_line(Vec::new()), vec!["/bin/app", "--serve"]);
        assert_eq!(
            with_entrypoint.command_line(args(&["--port", "80"])),
            vec!["/bin/app", "--port", "80"]
        );

        let cmd_only = ImageEntrypoint::new(&[], &["/bin/bash"]);
        assert_eq!(cmd_only.command_line(Vec::new()), vec!["/bin/bash"]);
        assert_eq!(cmd_only.command_line(args(&["false"])), vec!["false"]);
    }

    #[tokio::test]
    async fn follows_bearer_challenge() {
        let server = MockServer::start().await;
        let realm = format!("{}/token", server.uri());

        Mock::given(method("GET"))
            .and(path("/v2/team/private/manifests/v1"))
            .and(header_matcher("authorization", "Bearer secret-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "schemaVersion": 2,
                "config": { "digest": CONFIG_DIGEST }
            })))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/team/private/manifests/v1"))
            .respond_with(ResponseTemplate::new(401).insert_header(
                "WWW-Authenticate",
                format!(r#"Bearer realm="{realm}",service="registry.test",scope="repository:team/private:pull""#)
                    .as_str(),
            ))
            .with_priority(10)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(query_param("service", "registry.test"))
            .and(query_param("scope", "repository:team/private:pull"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "secret-token" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/v2/team/private/blobs/{CONFIG_DIGEST}")))
            .and(header_matcher("authorization", "Bearer secret-token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "config": { "Entrypoint": ["/usr/bin/private"] } })),
            )
            .mount(&server)
            .await;

        let resolver = EntrypointResolver::new(Vec::new()).unwrap();
        let image = format!("{}/team/private:v1", registry_of(&server));
        let resolved = resolver.resolve(&image, &RegistryAuth::anonymous()).await.unwrap();
        assert_eq!(resolved.entrypoint, vec!["/usr/bin/private"]);
    }

    #[tokio::test]
    async fn selects_linux_amd64_from_index() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/team/multi/manifests/v1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "schemaVersion": 2,
                "mediaType": "application/vnd.oci.image.index.v1+json",
                "manifests": [
                    { "digest": "sha256:arm", "platform": { "os": "linux", "architecture": "arm64" } },
                    { "digest": "sha256:amd", "platform": { "os": "linux", "architecture": "amd64" } }
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/team/multi/manifests/sha256:amd"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "schemaVersion": 2,
                "config": { "digest": CONFIG_DIGEST }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/v2/team/multi/blobs/{CONFIG_DIGEST}")))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "config": { "Entrypoint": ["/amd64"] } })),
            )
            .mount(&server)
            .await;

        let resolver = EntrypointResolver::new(Vec::new()).unwrap();
        let image = format!("{}/team/multi:v1", registry_of(&server));
        let resolved = resolver.resolve(&image, &RegistryAuth::anonymous()).await.unwrap();
        assert_eq!(resolved.entrypoint, vec!["/amd64"]);
    }

    #[tokio::test]
    async fn reports_missing_images() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let resolver = EntrypointResolver::new(Vec::new()).unwrap();
        let image = format!("{}/team/missing:v1", registry_of(&server));
        let err = resolver
            .resolve(&image, &RegistryAuth::anonymous())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Status { status: 404, .. }));
    }
}

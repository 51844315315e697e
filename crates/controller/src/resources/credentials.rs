use super::remote::RegistryAuth;
use crate::credentials::docker::DockerConfig;
use crate::credentials::{flags_for_secret, secret_mount_path, secret_volume_name};
use crate::tasks::types::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, SecretVolumeSource, ServiceAccount, Volume, VolumeMount};
use kube::{Api, Client};
use tracing::{debug, warn};

const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
const DOCKER_CFG_KEY: &str = ".dockercfg";

/// Read access to the objects the compiler consults for credentials
#[async_trait]
pub trait CredentialLookup: Send + Sync {
    async fn service_account(&self, namespace: &str, name: &str) -> Result<Option<ServiceAccount>>;

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
}

/// [`CredentialLookup`] backed by the Kubernetes API
pub struct KubeCredentialLookup {
    client: Client,
}

impl KubeCredentialLookup {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CredentialLookup for KubeCredentialLookup {
    async fn service_account(&self, namespace: &str, name: &str) -> Result<Option<ServiceAccount>> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Everything the service account contributes to a build pod
#[derive(Debug, Default)]
pub struct BuildCredentials {
    /// Arguments for the credential initializer
    pub flags: Vec<String>,
    pub volumes: Vec<Volume>,
    pub mounts: Vec<VolumeMount>,
    /// Pull credentials used for entrypoint lookups
    pub registry_auth: RegistryAuth,
}

/// Collect annotated secrets and image pull secrets of `service_account`.
///
/// A missing service account or secret is skipped.
pub async fn gather_credentials(
    lookup: &dyn CredentialLookup,
    namespace: &str,
    service_account: &str,
) -> Result<BuildCredentials> {
    let mut credentials = BuildCredentials::default();

    let Some(account) = lookup.service_account(namespace, service_account).await? else {
        warn!(
            "Service account {}/{} not found, building without credentials",
            namespace, service_account
        );
        return Ok(credentials);
    };

    for reference in account.secrets.iter().flatten() {
        let Some(name) = reference.name.as_deref() else {
            continue;
        };
        let Some(secret) = lookup.secret(namespace, name).await? else {
            warn!("Secret {}/{} referenced by {} not found", namespace, name, service_account);
            continue;
        };

        let flags = flags_for_secret(&secret);
        if flags.is_empty() {
            continue;
        }
        debug!("Secret {} contributes {} credential flag(s)", name, flags.len());
        credentials.flags.extend(flags);
        credentials.volumes.push(Volume {
            name: secret_volume_name(name),
            secret: Some(SecretVolumeSource {
                secret_name: Some(name.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        credentials.mounts.push(VolumeMount {
            name: secret_volume_name(name),
            mount_path: secret_mount_path(name),
            ..Default::default()
        });
    }

    for reference in account.image_pull_secrets.iter().flatten() {
        let Some(secret) = lookup.secret(namespace, &reference.name).await? else {
            warn!("Image pull secret {}/{} not found", namespace, reference.name);
            continue;
        };
        let Some(data) = secret.data.as_ref() else {
            continue;
        };

        let parsed = if let Some(json) = data.get(DOCKER_CONFIG_JSON_KEY) {
            DockerConfig::from_dockerconfigjson(&json.0)
        } else if let Some(cfg) = data.get(DOCKER_CFG_KEY) {
            DockerConfig::from_dockercfg(&cfg.0)
        } else {
            continue;
        };
        match parsed {
            Ok(config) => credentials.registry_auth.add_docker_config(&config),
            Err(e) => warn!("Ignoring malformed image pull secret {}: {}", reference.name, e),
        }
    }

    Ok(credentials)
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::HashMap;

    /// In-memory lookup keyed by `namespace/name`
    #[derive(Default)]
    pub struct FakeCredentialLookup {
        pub service_accounts: HashMap<String, ServiceAccount>,
        pub secrets: HashMap<String, Secret>,
    }

    impl FakeCredentialLookup {
        pub fn with_service_account(mut self, namespace: &str, account: ServiceAccount) -> Self {
            let name = account.metadata.name.clone().unwrap_or_default();
            self.service_accounts.insert(format!("{namespace}/{name}"), account);
            self
        }

        pub fn with_secret(mut self, namespace: &str, secret: Secret) -> Self {
            let name = secret.metadata.name.clone().unwrap_or_default();
            self.secrets.insert(format!("{namespace}/{name}"), secret);
            self
        }
    }

    #[async_trait]
    impl CredentialLookup for FakeCredentialLookup {
        async fn service_account(&self, namespace: &str, name: &str) -> Result<Option<ServiceAccount>> {
            Ok(self.service_accounts.get(&format!("{namespace}/{name}")).cloned())
        }

        async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
            Ok(self.secrets.get(&format!("{namespace}/{name}")).cloned())
        }
    }
}

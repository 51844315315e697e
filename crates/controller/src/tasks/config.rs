//! Build Controller Configuration
//!
//! Loaded from the mounted ConfigMap file; every section has defaults so a
//! missing or partial file still yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main controller configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Tool images injected into every build pod
    #[serde(default)]
    pub images: ImagesConfig,

    /// Namespace to watch; all namespaces when unset
    #[serde(default)]
    pub namespace: Option<String>,

    /// Timeout handler configuration
    #[serde(default)]
    pub timeout: TimeoutConfig,

    /// Health server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Image registry access used to resolve step entrypoints
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// Images for the containers the compiler adds around user steps
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImagesConfig {
    /// Writes docker/git credentials into the build home directory
    #[serde(rename = "credsInit", default = "default_creds_init_image")]
    pub creds_init: ImageConfig,

    /// Clones git sources
    #[serde(rename = "gitInit", default = "default_git_init_image")]
    pub git_init: ImageConfig,

    /// Fetches object storage sources
    #[serde(rename = "gcsFetcher", default = "default_gcs_fetcher_image")]
    pub gcs_fetcher: ImageConfig,

    /// Ships the step entrypoint binary
    #[serde(default = "default_entrypoint_image")]
    pub entrypoint: ImageConfig,
}

/// Image configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ImageConfig {
    /// Image repository (e.g., "ghcr.io/5dlabs/build-git-init")
    pub repository: String,

    /// Image tag (e.g., "latest", "v0.1.0")
    pub tag: String,
}

impl ImageConfig {
    fn new(repository: &str, tag: &str) -> Self {
        Self {
            repository: repository.to_string(),
            tag: tag.to_string(),
        }
    }

    /// Returns `true` when both repository and tag are populated.
    pub fn is_configured(&self) -> bool {
        !self.repository.trim().is_empty() && !self.tag.trim().is_empty()
    }

    /// Full image reference, `repository:tag`
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

fn default_creds_init_image() -> ImageConfig {
    ImageConfig::new("ghcr.io/5dlabs/build-creds-init", "latest")
}

fn default_git_init_image() -> ImageConfig {
    ImageConfig::new("ghcr.io/5dlabs/build-git-init", "latest")
}

fn default_gcs_fetcher_image() -> ImageConfig {
    ImageConfig::new("gcr.io/cloud-builders/gcs-fetcher", "latest")
}

fn default_entrypoint_image() -> ImageConfig {
    ImageConfig::new("ghcr.io/5dlabs/build-entrypoint", "latest")
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            creds_init: default_creds_init_image(),
            git_init: default_git_init_image(),
            gcs_fetcher: default_gcs_fetcher_image(),
            entrypoint: default_entrypoint_image(),
        }
    }
}

/// Timeout handler configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    /// Seconds between sweeps over running builds
    #[serde(rename = "checkIntervalSeconds", default = "default_check_interval")]
    pub check_interval_seconds: u64,
}

fn default_check_interval() -> u64 {
    10
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: default_check_interval(),
        }
    }
}

impl TimeoutConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }
}

/// Health server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// Image registry access
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// Registries reached over plain HTTP (localhost registries always are)
    #[serde(rename = "insecureRegistries", default)]
    pub insecure_registries: Vec<String>,
}

impl ControllerConfig {
    /// Validate that configuration has required fields
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let images = [
            ("credsInit", &self.images.creds_init),
            ("gitInit", &self.images.git_init),
            ("gcsFetcher", &self.images.gcs_fetcher),
            ("entrypoint", &self.images.entrypoint),
        ];
        for (key, image) in images {
            if !image.is_configured() {
                return Err(anyhow::anyhow!(
                    "Image configuration for '{key}' must specify both repository and tag."
                ));
            }
        }

        if self.timeout.check_interval_seconds == 0 {
            return Err(anyhow::anyhow!(
                "timeout.checkIntervalSeconds must be greater than zero"
            ));
        }

        if let Some(namespace) = &self.namespace {
            if namespace.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "namespace must not be empty when set; omit it to watch all namespaces"
                ));
            }
        }

        Ok(())
    }

    /// Load configuration from mounted ConfigMap file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }
}

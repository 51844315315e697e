//! Credential materialization
//!
//! The compiler matches annotated secrets of the build's service account and
//! hands them to the credential initializer as `-<kind>=<secret>=<url>` flags.
//! [`materialize`] turns those flags back into docker and git configuration
//! under the build's home directory. The initializer image that calls it is
//! built and shipped separately (`images.credsInit` in the controller config).

pub mod docker;
pub mod git;

use k8s_openapi::api::core::v1::Secret;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Where secret volumes are mounted inside the credential initializer
pub const SECRETS_ROOT: &str = "/var/build-secrets";

pub const BASIC_AUTH_SECRET_TYPE: &str = "kubernetes.io/basic-auth";
pub const SSH_AUTH_SECRET_TYPE: &str = "kubernetes.io/ssh-auth";

/// The credential flavours the initializer understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    BasicDocker,
    BasicGit,
    SshGit,
}

impl CredentialKind {
    pub const ALL: [CredentialKind; 3] = [
        CredentialKind::BasicDocker,
        CredentialKind::BasicGit,
        CredentialKind::SshGit,
    ];

    pub fn flag_name(self) -> &'static str {
        match self {
            CredentialKind::BasicDocker => "basic-docker",
            CredentialKind::BasicGit => "basic-git",
            CredentialKind::SshGit => "ssh-git",
        }
    }

    /// Annotation keys starting with this prefix carry the target URL
    pub fn annotation_prefix(self) -> &'static str {
        match self {
            CredentialKind::BasicDocker => "build.platform/docker-",
            CredentialKind::BasicGit | CredentialKind::SshGit => "build.platform/git-",
        }
    }

    pub fn secret_type(self) -> &'static str {
        match self {
            CredentialKind::BasicDocker | CredentialKind::BasicGit => BASIC_AUTH_SECRET_TYPE,
            CredentialKind::SshGit => SSH_AUTH_SECRET_TYPE,
        }
    }

    pub fn flag(self, secret: &str, url: &str) -> String {
        format!("-{}={secret}={url}", self.flag_name())
    }

    fn from_flag_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.flag_name() == name)
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("malformed credential flag {0:?}, expected -<kind>=<secret>=<url>")]
    InvalidFlag(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("docker config serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One parsed credential flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialEntry {
    pub kind: CredentialKind,
    pub secret: String,
    pub url: String,
}

impl CredentialEntry {
    pub fn parse(flag: &str) -> Result<Self, CredentialError> {
        let invalid = || CredentialError::InvalidFlag(flag.to_string());

        let body = flag
            .strip_prefix("--")
            .or_else(|| flag.strip_prefix('-'))
            .ok_or_else(invalid)?;
        let (kind, rest) = body.split_once('=').ok_or_else(invalid)?;
        let (secret, url) = rest.split_once('=').ok_or_else(invalid)?;
        if secret.is_empty() || url.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            kind: CredentialKind::from_flag_name(kind).ok_or_else(invalid)?,
            secret: secret.to_string(),
            url: url.to_string(),
        })
    }

    fn secret_file(&self, secrets_root: &Path, key: &str) -> Result<String, CredentialError> {
        let path = secrets_root.join(&self.secret).join(key);
        std::fs::read_to_string(&path)
            .map(|value| value.trim_end_matches('\n').to_string())
            .map_err(|source| CredentialError::Read { path, source })
    }
}

/// Flags contributed by one secret, in annotation key order
pub fn flags_for_secret(secret: &Secret) -> Vec<String> {
    let Some(name) = secret.metadata.name.as_deref() else {
        return Vec::new();
    };
    let Some(annotations) = secret.metadata.annotations.as_ref() else {
        return Vec::new();
    };
    let secret_type = secret.type_.as_deref().unwrap_or_default();

    let mut flags = Vec::new();
    for (key, url) in annotations {
        for kind in CredentialKind::ALL {
            if key.starts_with(kind.annotation_prefix()) && secret_type == kind.secret_type() {
                flags.push(kind.flag(name, url));
            }
        }
    }
    flags
}

pub fn secret_volume_name(secret: &str) -> String {
    format!("secret-volume-{secret}")
}

pub fn secret_mount_path(secret: &str) -> String {
    format!("{SECRETS_ROOT}/{secret}")
}

/// Write docker and git credentials for `flags` into `home`.
///
/// Secret contents are read from `<secrets_root>/<secret>/<key>`.
pub fn materialize(flags: &[String], secrets_root: &Path, home: &Path) -> Result<(), CredentialError> {
    let entries = flags
        .iter()
        .map(|flag| CredentialEntry::parse(flag))
        .collect::<Result<Vec<_>, _>>()?;

    let of_kind = |kind: CredentialKind| -> Vec<CredentialEntry> {
        entries.iter().filter(|e| e.kind == kind).cloned().collect()
    };

    let docker = of_kind(CredentialKind::BasicDocker);
    if !docker.is_empty() {
        let path = docker::write_config(&docker, secrets_root, home)?;
        info!("Wrote {} docker credential(s) to {}", docker.len(), path.display());
    }

    let basic_git = of_kind(CredentialKind::BasicGit);
    if !basic_git.is_empty() {
        git::write_basic_credentials(&basic_git, secrets_root, home)?;
        info!("Wrote {} git basic-auth credential(s)", basic_git.len());
    }

    let ssh_git = of_kind(CredentialKind::SshGit);
    if !ssh_git.is_empty() {
        git::write_ssh_credentials(&ssh_git, secrets_root, home)?;
        info!("Wrote {} git ssh credential(s)", ssh_git.len());
    }

    debug!("Credential materialization complete for {} flag(s)", entries.len());
    Ok(())
}

pub(crate) fn write_file(path: &Path, contents: &str) -> Result<(), CredentialError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| CredentialError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, contents).map_err(|source| CredentialError::Write {
        path: path.to_path_buf(),
        source,
    })
}

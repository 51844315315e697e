use super::{write_file, CredentialEntry, CredentialError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// `~/.docker/config.json` layout, also the payload of `.dockerconfigjson` secrets
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: BTreeMap<String, DockerAuthEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct DockerAuthEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// base64 of `username:password`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

impl DockerAuthEntry {
    pub fn basic(username: &str, password: &str) -> Self {
        Self {
            username: Some(username.to_string()),
            password: Some(password.to_string()),
            auth: Some(STANDARD.encode(format!("{username}:{password}"))),
        }
    }

    /// Username and password, from the explicit fields or the encoded `auth`
    pub fn credentials(&self) -> Option<(String, String)> {
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            return Some((user.clone(), pass.clone()));
        }
        let decoded = STANDARD.decode(self.auth.as_deref()?).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        Some((user.to_string(), pass.to_string()))
    }
}

impl DockerConfig {
    /// Parse a `kubernetes.io/dockerconfigjson` payload
    pub fn from_dockerconfigjson(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Parse a legacy `kubernetes.io/dockercfg` payload (a bare map of registries)
    pub fn from_dockercfg(data: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(Self {
            auths: serde_json::from_slice(data)?,
        })
    }
}

/// Write `<home>/.docker/config.json` for the docker entries
pub fn write_config(
    entries: &[CredentialEntry],
    secrets_root: &Path,
    home: &Path,
) -> Result<PathBuf, CredentialError> {
    let mut config = DockerConfig::default();
    for entry in entries {
        let username = entry.secret_file(secrets_root, "username")?;
        let password = entry.secret_file(secrets_root, "password")?;
        config
            .auths
            .insert(entry.url.clone(), DockerAuthEntry::basic(&username, &password));
    }

    let path = home.join(".docker").join("config.json");
    write_file(&path, &serde_json::to_string_pretty(&config)?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{materialize, CredentialKind};

    fn write_secret(root: &Path, name: &str, files: &[(&str, &str)]) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for (key, value) in files {
            std::fs::write(dir.join(key), value).unwrap();
        }
    }

    #[test]
    fn writes_docker_config_with_encoded_auth() {
        let secrets = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        write_secret(secrets.path(), "gcr", &[("username", "bot"), ("password", "s3cret\n")]);

        materialize(
            &[CredentialKind::BasicDocker.flag("gcr", "https://gcr.io")],
            secrets.path(),
            home.path(),
        )
        .unwrap();

        let written = std::fs::read(home.path().join(".docker/config.json")).unwrap();
        let config = DockerConfig::from_dockerconfigjson(&written).unwrap();
        let entry = &config.auths["https://gcr.io"];
        assert_eq!(entry.auth.as_deref(), Some("Ym90OnMzY3JldA=="));
        assert_eq!(
            entry.credentials(),
            Some(("bot".to_string(), "s3cret".to_string()))
        );
    }

    #[test]
    fn decodes_auth_only_entries() {
        let cfg = DockerConfig::from_dockercfg(br#"{"quay.io": {"auth": "dXNlcjpwYXNz"}}"#).unwrap();
        assert_eq!(
            cfg.auths["quay.io"].credentials(),
            Some(("user".to_string(), "pass".to_string()))
        );
    }
}

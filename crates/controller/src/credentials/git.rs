use super::{write_file, CredentialEntry, CredentialError};
use std::path::Path;

/// Write `.git-credentials` and a `.gitconfig` that uses the store helper
pub fn write_basic_credentials(
    entries: &[CredentialEntry],
    secrets_root: &Path,
    home: &Path,
) -> Result<(), CredentialError> {
    let mut store = String::new();
    let mut gitconfig = String::from("[credential]\n\thelper = store\n");

    for entry in entries {
        let username = entry.secret_file(secrets_root, "username")?;
        let password = entry.secret_file(secrets_root, "password")?;
        let (scheme, host) = entry
            .url
            .split_once("://")
            .unwrap_or(("https", entry.url.as_str()));

        store.push_str(&format!("{scheme}://{username}:{password}@{host}\n"));
        gitconfig.push_str(&format!(
            "[credential \"{scheme}://{host}\"]\n\tusername = {username}\n"
        ));
    }

    write_file(&home.join(".git-credentials"), &store)?;
    write_file(&home.join(".gitconfig"), &gitconfig)
}

/// Write one private key per secret plus the ssh config selecting it per host
pub fn write_ssh_credentials(
    entries: &[CredentialEntry],
    secrets_root: &Path,
    home: &Path,
) -> Result<(), CredentialError> {
    let ssh_dir = home.join(".ssh");
    let mut config = String::new();
    let mut known_hosts = String::new();

    for entry in entries {
        let key = entry.secret_file(secrets_root, "ssh-privatekey")?;
        let key_path = ssh_dir.join(format!("id_{}", entry.secret));
        write_file(&key_path, &format!("{key}\n"))?;
        restrict_permissions(&key_path)?;

        let host = ssh_host(&entry.url);
        config.push_str(&format!(
            "Host {host}\n    HostName {host}\n    IdentityFile {}\n",
            key_path.display()
        ));

        // known_hosts is optional in ssh-auth secrets
        if let Ok(hosts) = entry.secret_file(secrets_root, "known_hosts") {
            known_hosts.push_str(&hosts);
            known_hosts.push('\n');
        }
    }

    write_file(&ssh_dir.join("config"), &config)?;
    if !known_hosts.is_empty() {
        write_file(&ssh_dir.join("known_hosts"), &known_hosts)?;
    }
    Ok(())
}

/// `ssh://git@github.com:22/org` -> `github.com`
fn ssh_host(url: &str) -> &str {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let without_user = without_scheme
        .split_once('@')
        .map_or(without_scheme, |(_, rest)| rest);
    without_user
        .split([':', '/'])
        .next()
        .unwrap_or(without_user)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), CredentialError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|source| {
        CredentialError::Write {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), CredentialError> {
    Ok(())
}

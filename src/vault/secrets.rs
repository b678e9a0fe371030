//! Typed per-host configuration read from the secrets backend.
//!
//! One entry at `config/{hostname}` names the volumes, the restic profile,
//! and the repositories for this host; each of those is its own secret under
//! `gocrypt/`, `restic/`, and `git/`. Reads are refused while the backend is
//! sealed.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{AuthError, VaultError};

use super::VaultClient;

/// Top-level host entry at `config/{hostname}`.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    /// Comma-separated gocryptfs volume names.
    #[serde(default)]
    pub gocryptfs: String,
    /// Restic profile name.
    #[serde(default)]
    pub restic: String,
    /// Comma-separated git profile names.
    #[serde(default)]
    pub git: String,
    /// Home directory checkouts are resolved against.
    pub home: String,
}

impl HostConfig {
    pub fn gocryptfs_names(&self) -> Vec<&str> {
        split_names(&self.gocryptfs)
    }

    pub fn git_names(&self) -> Vec<&str> {
        split_names(&self.git)
    }
}

fn split_names(raw: &str) -> Vec<&str> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .collect()
}

/// One gocryptfs volume at `gocrypt/data/{name}`.
#[derive(Debug, Clone, Deserialize)]
pub struct GocryptVolume {
    /// Encrypted (cipher) directory.
    pub path: String,
    /// Target mount point.
    #[serde(rename = "mount-path")]
    pub mount_path: String,
    /// Mount passphrase, piped to gocryptfs on stdin.
    pub pw: SecretString,
    /// Pass -allow_other to the mount.
    #[serde(default)]
    pub allow: bool,
    /// Idle timeout handed to `gocryptfs -i`.
    #[serde(default)]
    pub duration: Option<String>,
    /// Volume name, filled from the profile key.
    #[serde(skip)]
    pub name: String,
}

/// Restic settings at `restic/data/{name}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ResticProfile {
    /// Repository location (`s3:...` or a path).
    pub repo: String,
    /// Path to back up.
    pub path: String,
    /// Newline-delimited exclude patterns.
    #[serde(default)]
    pub exclude: String,
    /// Repository password.
    pub pw: SecretString,
    /// S3 access key id, when the repository lives on S3.
    #[serde(default)]
    pub access_key: String,
    /// S3 secret key.
    #[serde(default)]
    pub secret_key: Option<SecretString>,
}

impl ResticProfile {
    /// Environment restic invocations run with. The variable names are a
    /// stable contract.
    pub fn environment(&self) -> Vec<(String, String)> {
        vec![
            ("RESTIC_REPOSITORY".to_string(), self.repo.clone()),
            (
                "RESTIC_PASSWORD".to_string(),
                self.pw.expose_secret().to_string(),
            ),
            ("AWS_ACCESS_KEY_ID".to_string(), self.access_key.clone()),
            (
                "AWS_SECRET_ACCESS_KEY".to_string(),
                self.secret_key
                    .as_ref()
                    .map(|key| key.expose_secret().to_string())
                    .unwrap_or_default(),
            ),
        ]
    }
}

/// One repository at `git/data/{name}`.
#[derive(Debug, Clone, Deserialize)]
pub struct GitProfile {
    /// Clone URL.
    pub repo: String,
    /// Checkout directory, resolved against the host home when relative.
    pub dir: String,
    /// Personal access token for HTTPS auth.
    #[serde(default)]
    pub personal_token: Option<SecretString>,
    /// Profile name, filled from the profile key.
    #[serde(skip)]
    pub name: String,
}

/// Refuse to read configuration while the backend is sealed.
pub async fn ensure_unsealed(client: &VaultClient) -> Result<(), AuthError> {
    if client.seal_status().await?.sealed {
        return Err(AuthError::Sealed);
    }
    Ok(())
}

pub async fn host_config(
    client: &VaultClient,
    token: &str,
    hostname: &str,
) -> Result<HostConfig, VaultError> {
    let path = format!("config/{hostname}");
    decode(client.read_secret(token, &path).await?, &path)
}

pub async fn gocrypt_volume(
    client: &VaultClient,
    token: &str,
    name: &str,
) -> Result<GocryptVolume, VaultError> {
    let path = format!("gocrypt/data/{name}");
    let mut volume: GocryptVolume = decode(client.read_secret(token, &path).await?, &path)?;
    volume.name = name.to_string();
    Ok(volume)
}

pub async fn restic_profile(
    client: &VaultClient,
    token: &str,
    name: &str,
) -> Result<ResticProfile, VaultError> {
    let path = format!("restic/data/{name}");
    decode(client.read_secret(token, &path).await?, &path)
}

pub async fn git_profile(
    client: &VaultClient,
    token: &str,
    name: &str,
) -> Result<GitProfile, VaultError> {
    let path = format!("git/data/{name}");
    let mut profile: GitProfile = decode(client.read_secret(token, &path).await?, &path)?;
    profile.name = name.to_string();
    Ok(profile)
}

fn decode<T: serde::de::DeserializeOwned>(value: Value, path: &str) -> Result<T, VaultError> {
    serde_json::from_value(value).map_err(|e| VaultError::Malformed {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::testutil::FakeVault;

    #[test]
    fn test_host_config_name_lists() {
        let host: HostConfig = serde_json::from_value(json!({
            "gocryptfs": "data, media,",
            "restic": "home",
            "git": "",
            "home": "/home/me",
        }))
        .unwrap();

        assert_eq!(host.gocryptfs_names(), vec!["data", "media"]);
        assert!(host.git_names().is_empty());
    }

    #[test]
    fn test_gocrypt_volume_field_names() {
        let volume: GocryptVolume = serde_json::from_value(json!({
            "path": "~/.crypt/data",
            "mount-path": "~/data",
            "pw": "hunter2",
            "allow": true,
        }))
        .unwrap();

        assert_eq!(volume.mount_path, "~/data");
        assert!(volume.allow);
        assert_eq!(volume.duration, None);
        assert_eq!(volume.pw.expose_secret(), "hunter2");
    }

    #[test]
    fn test_restic_environment_variable_names() {
        let profile: ResticProfile = serde_json::from_value(json!({
            "repo": "s3:https://s3.example/bucket",
            "path": "/home/me",
            "pw": "repopw",
            "access_key": "AKIA123",
            "secret_key": "shhh",
        }))
        .unwrap();

        let env = profile.environment();
        assert_eq!(
            env,
            vec![
                (
                    "RESTIC_REPOSITORY".to_string(),
                    "s3:https://s3.example/bucket".to_string()
                ),
                ("RESTIC_PASSWORD".to_string(), "repopw".to_string()),
                ("AWS_ACCESS_KEY_ID".to_string(), "AKIA123".to_string()),
                ("AWS_SECRET_ACCESS_KEY".to_string(), "shhh".to_string()),
            ]
        );
    }

    #[test]
    fn test_malformed_profile_reports_path() {
        let err = decode::<ResticProfile>(json!({"repo": "only"}), "restic/data/home").unwrap_err();
        assert!(matches!(err, VaultError::Malformed { path, .. } if path == "restic/data/home"));
    }

    #[tokio::test]
    async fn test_fetch_fills_profile_name() {
        let vault = FakeVault::unsealed();
        vault.add_secret(
            "git/data/dotfiles",
            json!({"repo": "https://git.example/dots.git", "dir": "dots"}),
        );
        let client = VaultClient::new(vault.clone().serve().await).unwrap();

        let profile = git_profile(&client, "tok", "dotfiles").await.unwrap();
        assert_eq!(profile.name, "dotfiles");
        assert_eq!(profile.dir, "dots");
        assert!(profile.personal_token.is_none());
    }

    #[tokio::test]
    async fn test_ensure_unsealed_rejects_sealed_backend() {
        let vault = FakeVault::new(true, 3, 5);
        let client = VaultClient::new(vault.clone().serve().await).unwrap();

        let err = ensure_unsealed(&client).await.unwrap_err();
        assert!(matches!(err, AuthError::Sealed));
    }
}

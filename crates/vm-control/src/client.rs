//! SSH/SFTP client
//!
//! Sessions are strictly per call and never pooled: a compromised VM can
//! at most disturb the single transfer addressed to it, and there is no
//! connection liveness to manage.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::{self, PrivateKey, PrivateKeyWithHashAlg};
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::ControlError;
use crate::host_key::HostKeyPolicy;

/// SSH port every pool VM listens on.
const SSH_PORT: u16 = 22;

/// Cloud-init user-data target inside the VM.
pub const USER_DATA_PATH: &str = "/media/cidata/user-data";
/// Trigger file the VM watches; writing it reboots the VM into a clean
/// state before its address is reused.
pub const REBOOT_PATH: &str = "/media/cidata/reboot";
/// The VM-side SFTP server is chrooted here, so the client addresses
/// files relative to it.
const SFTP_CHROOT_PREFIX: &str = "/media/";

const REBOOT_PAYLOAD: &[u8] = b"reboot";

/// Configuration for the SSH control channel.
#[derive(Debug, Clone)]
pub struct SshControlConfig {
    pub username: String,
    /// PEM/OpenSSH-encoded private key material.
    pub private_key: Option<String>,
    /// Read instead when no inline key is given.
    pub private_key_path: Option<PathBuf>,
    /// Deadline for the handshake and for authentication.
    pub timeout: Duration,
    /// Enables allowlist host-key checking when set; TOFU otherwise.
    pub host_key_allowlist_dir: Option<PathBuf>,
}

/// File-push operations the provider needs from a VM.
#[async_trait]
pub trait VmControl: Send + Sync {
    /// Writes cloud-init user-data into the VM's seed directory.
    async fn send_user_data(&self, ip: IpAddr, user_data: &[u8]) -> Result<(), ControlError>;

    /// Writes the reboot trigger file.
    async fn send_reboot_file(&self, ip: IpAddr) -> Result<(), ControlError>;
}

#[derive(Debug)]
pub struct SshControlClient {
    username: String,
    key: Arc<PrivateKey>,
    policy: HostKeyPolicy,
    timeout: Duration,
}

impl SshControlClient {
    /// Loads key material and the host-key policy. Fails fast on unusable
    /// configuration so operators hear about it at startup, not on the
    /// first pod.
    pub fn new(config: SshControlConfig) -> Result<Self, ControlError> {
        let key = match (&config.private_key, &config.private_key_path) {
            (Some(pem), _) if !pem.trim().is_empty() => keys::decode_secret_key(pem, None)
                .map_err(|err| ControlError::InvalidKey(format!("inline private key: {err}")))?,
            (_, Some(path)) => keys::load_secret_key(path, None).map_err(|err| {
                ControlError::InvalidKey(format!("private key at {}: {err}", path.display()))
            })?,
            _ => {
                return Err(ControlError::InvalidKey(
                    "no private key configured".to_string(),
                ))
            }
        };

        let policy = match &config.host_key_allowlist_dir {
            Some(dir) => HostKeyPolicy::allowlist_from_dir(dir)?,
            None => HostKeyPolicy::trust_on_first_use(),
        };

        Ok(Self {
            username: config.username,
            key: Arc::new(key),
            policy,
            timeout: config.timeout,
        })
    }

    async fn connect(&self, ip: IpAddr) -> Result<client::Handle<TrustHandler>, ControlError> {
        let address = SocketAddr::new(ip, SSH_PORT);
        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: Some(self.timeout),
            ..Default::default()
        });
        let handler = TrustHandler {
            policy: self.policy.clone(),
        };

        let mut handle =
            tokio::time::timeout(self.timeout, client::connect(ssh_config, address, handler))
                .await
                .map_err(|_| {
                    ControlError::unreachable(format!(
                        "handshake with {address} timed out after {:?}",
                        self.timeout
                    ))
                })??;

        let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
        let key = PrivateKeyWithHashAlg::new(Arc::clone(&self.key), hash_alg);
        let auth = tokio::time::timeout(
            self.timeout,
            handle.authenticate_publickey(&self.username, key),
        )
        .await
        .map_err(|_| {
            ControlError::unreachable(format!(
                "authentication with {address} timed out after {:?}",
                self.timeout
            ))
        })??;

        if !matches!(auth, client::AuthResult::Success) {
            return Err(ControlError::AuthFailed(format!(
                "public-key auth rejected for user {}",
                self.username
            )));
        }

        Ok(handle)
    }

    async fn send_file(
        &self,
        ip: IpAddr,
        remote_path: &str,
        contents: &[u8],
    ) -> Result<(), ControlError> {
        let handle = self.connect(ip).await?;
        let result = transfer(&handle, remote_path, contents).await;
        if let Err(err) = handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("SSH disconnect from {} was not clean: {}", ip, err);
        }
        result
    }
}

/// Runs the SFTP subsystem on a fresh channel and writes the file,
/// temp-then-rename when the server supports it.
async fn transfer(
    handle: &client::Handle<TrustHandler>,
    remote_path: &str,
    contents: &[u8],
) -> Result<(), ControlError> {
    let channel = handle.channel_open_session().await?;
    channel.request_subsystem(true, "sftp").await?;
    let sftp = SftpSession::new(channel.into_stream())
        .await
        .map_err(ControlError::transfer)?;

    let target = chrooted_path(remote_path);
    let staging = format!("{target}.tmp");
    write_remote(&sftp, &staging, contents).await?;
    if let Err(err) = sftp.rename(staging.clone(), target.to_string()).await {
        // Some servers refuse RENAME onto an existing file; fall back to a
        // truncating write of the target itself.
        debug!(
            "Rename onto {} failed ({}), falling back to a direct write",
            target, err
        );
        if let Err(err) = sftp.remove_file(staging).await {
            warn!("Could not remove staging file: {}", err);
        }
        write_remote(&sftp, target, contents).await?;
    }

    Ok(())
}

async fn write_remote(
    sftp: &SftpSession,
    path: &str,
    contents: &[u8],
) -> Result<(), ControlError> {
    let mut file = sftp.create(path).await.map_err(ControlError::transfer)?;
    file.write_all(contents)
        .await
        .map_err(ControlError::transfer)?;
    file.shutdown().await.map_err(ControlError::transfer)?;
    Ok(())
}

/// Maps an absolute VM path to what the chrooted SFTP server expects.
fn chrooted_path(remote_path: &str) -> &str {
    remote_path
        .strip_prefix(SFTP_CHROOT_PREFIX)
        .unwrap_or(remote_path)
}

struct TrustHandler {
    policy: HostKeyPolicy,
}

impl client::Handler for TrustHandler {
    type Error = ControlError;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        self.policy.check(server_public_key)
    }
}

#[async_trait]
impl VmControl for SshControlClient {
    async fn send_user_data(&self, ip: IpAddr, user_data: &[u8]) -> Result<(), ControlError> {
        debug!("Sending {} bytes of user-data to VM {}", user_data.len(), ip);
        self.send_file(ip, USER_DATA_PATH, user_data).await
    }

    async fn send_reboot_file(&self, ip: IpAddr) -> Result<(), ControlError> {
        debug!("Sending reboot trigger to VM {}", ip);
        self.send_file(ip, REBOOT_PATH, REBOOT_PAYLOAD).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chroot_prefix_is_stripped() {
        assert_eq!(chrooted_path(USER_DATA_PATH), "cidata/user-data");
        assert_eq!(chrooted_path(REBOOT_PATH), "cidata/reboot");
        // paths outside the chroot pass through untouched
        assert_eq!(chrooted_path("/var/lib/other"), "/var/lib/other");
    }

    #[test]
    fn missing_key_is_rejected_at_construction() {
        let err = SshControlClient::new(SshControlConfig {
            username: "peerpod".to_string(),
            private_key: None,
            private_key_path: None,
            timeout: Duration::from_secs(5),
            host_key_allowlist_dir: None,
        })
        .unwrap_err();
        assert!(matches!(err, ControlError::InvalidKey(_)));
    }

    #[test]
    fn garbage_inline_key_is_rejected_at_construction() {
        let err = SshControlClient::new(SshControlConfig {
            username: "peerpod".to_string(),
            private_key: Some("not a pem".to_string()),
            private_key_path: None,
            timeout: Duration::from_secs(5),
            host_key_allowlist_dir: None,
        })
        .unwrap_err();
        assert!(matches!(err, ControlError::InvalidKey(_)));
    }

    #[test]
    fn unreadable_key_path_is_rejected_at_construction() {
        let err = SshControlClient::new(SshControlConfig {
            username: "peerpod".to_string(),
            private_key: None,
            private_key_path: Some(PathBuf::from("/nonexistent/id_ed25519")),
            timeout: Duration::from_secs(5),
            host_key_allowlist_dir: None,
        })
        .unwrap_err();
        assert!(matches!(err, ControlError::InvalidKey(_)));
    }
}

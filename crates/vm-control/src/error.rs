//! Control channel errors

use thiserror::Error;

type Cause = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while talking to a pool VM.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The VM did not answer, or the handshake timed out.
    #[error("VM unreachable: {source}")]
    Unreachable {
        #[source]
        source: Cause,
    },

    /// The VM refused our key.
    #[error("SSH authentication failed: {0}")]
    AuthFailed(String),

    /// The VM presented a host key outside the trust policy.
    #[error("host key rejected: {fingerprint}")]
    HostKeyRejected { fingerprint: String },

    /// The SFTP upload itself failed.
    #[error("file transfer failed: {source}")]
    TransferFailed {
        #[source]
        source: Cause,
    },

    /// Configured private key material could not be read or parsed.
    /// Startup-fatal; failing on every create would be worse.
    #[error("invalid SSH key: {0}")]
    InvalidKey(String),

    /// The host-key allowlist directory could not be loaded.
    #[error("invalid host-key allowlist: {0}")]
    InvalidHostKey(String),
}

impl ControlError {
    pub(crate) fn unreachable(source: impl Into<Cause>) -> Self {
        Self::Unreachable {
            source: source.into(),
        }
    }

    pub(crate) fn transfer(source: impl Into<Cause>) -> Self {
        Self::TransferFailed {
            source: source.into(),
        }
    }
}

impl From<russh::Error> for ControlError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::UnknownKey => Self::HostKeyRejected {
                fingerprint: "<refused by handler>".to_string(),
            },
            russh::Error::IO(io) => Self::unreachable(io),
            other => Self::transfer(other),
        }
    }
}

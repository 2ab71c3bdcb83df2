//! Host-key trust policy
//!
//! Two modes. Allowlist: a directory of authorized-key files is loaded at
//! startup and a presented key must be byte-equal to one of them. TOFU:
//! every presented key is accepted and its fingerprint logged for audit;
//! deliberately stateless within the process, so operators who want
//! strict trust must configure the allowlist.

use std::fs;
use std::path::Path;

use russh::keys::{HashAlg, PublicKey};
use tracing::{info, warn};

use crate::error::ControlError;

/// How presented VM host keys are judged.
#[derive(Debug, Clone)]
pub enum HostKeyPolicy {
    /// Only keys byte-equal to one of the pre-approved public keys pass.
    Allowlist(Vec<PublicKey>),
    /// Accept and log the fingerprint; nothing is persisted.
    TrustOnFirstUse,
}

impl HostKeyPolicy {
    pub fn trust_on_first_use() -> Self {
        Self::TrustOnFirstUse
    }

    /// Loads every authorized-keys-format file in `dir`. Unparsable lines
    /// are skipped with a warning; an allowlist with no usable key at all
    /// is a configuration error.
    pub fn allowlist_from_dir(dir: &Path) -> Result<Self, ControlError> {
        let entries = fs::read_dir(dir).map_err(|err| {
            ControlError::InvalidHostKey(format!("reading {}: {err}", dir.display()))
        })?;

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                ControlError::InvalidHostKey(format!("reading {}: {err}", dir.display()))
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let contents = fs::read_to_string(&path).map_err(|err| {
                ControlError::InvalidHostKey(format!("reading {}: {err}", path.display()))
            })?;
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match PublicKey::from_openssh(line) {
                    Ok(key) => keys.push(key),
                    Err(err) => {
                        warn!("Skipping unparsable host key in {}: {}", path.display(), err);
                    }
                }
            }
        }

        if keys.is_empty() {
            return Err(ControlError::InvalidHostKey(format!(
                "no usable host keys found in {}",
                dir.display()
            )));
        }
        info!(
            "Loaded {} authorized host keys from {}",
            keys.len(),
            dir.display()
        );
        Ok(Self::Allowlist(keys))
    }

    /// Judges a presented server key.
    pub fn check(&self, presented: &PublicKey) -> Result<bool, ControlError> {
        let fingerprint = presented.fingerprint(HashAlg::Sha256).to_string();
        match self {
            Self::Allowlist(allowed) => {
                if allowed
                    .iter()
                    .any(|key| key.key_data() == presented.key_data())
                {
                    Ok(true)
                } else {
                    Err(ControlError::HostKeyRejected { fingerprint })
                }
            }
            Self::TrustOnFirstUse => {
                info!("Trusting VM host key on first use: {}", fingerprint);
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::public::{Ed25519PublicKey, KeyData};

    fn test_key(seed: u8) -> PublicKey {
        PublicKey::new(
            KeyData::Ed25519(Ed25519PublicKey([seed; 32])),
            format!("key-{seed}@pool"),
        )
    }

    #[test]
    fn allowlist_accepts_listed_keys_only() {
        let dir = tempfile::tempdir().unwrap();
        let listed = test_key(1);
        fs::write(
            dir.path().join("vm1.pub"),
            listed.to_openssh().unwrap(),
        )
        .unwrap();

        let policy = HostKeyPolicy::allowlist_from_dir(dir.path()).unwrap();
        assert!(policy.check(&listed).unwrap());

        let err = policy.check(&test_key(2)).unwrap_err();
        assert!(matches!(err, ControlError::HostKeyRejected { .. }));
    }

    #[test]
    fn allowlist_matches_on_key_data_not_comment() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("vm1.pub"),
            test_key(1).to_openssh().unwrap(),
        )
        .unwrap();

        let policy = HostKeyPolicy::allowlist_from_dir(dir.path()).unwrap();
        let same_key_other_comment =
            PublicKey::new(KeyData::Ed25519(Ed25519PublicKey([1; 32])), "renamed");
        assert!(policy.check(&same_key_other_comment).unwrap());
    }

    #[test]
    fn allowlist_skips_comments_and_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let listed = test_key(3);
        fs::write(
            dir.path().join("keys"),
            format!("# pool VMs\n\n{}\nnot a key line\n", listed.to_openssh().unwrap()),
        )
        .unwrap();

        let policy = HostKeyPolicy::allowlist_from_dir(dir.path()).unwrap();
        assert!(policy.check(&listed).unwrap());
    }

    #[test]
    fn empty_allowlist_directory_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = HostKeyPolicy::allowlist_from_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ControlError::InvalidHostKey(_)));
    }

    #[test]
    fn missing_allowlist_directory_is_a_config_error() {
        let err =
            HostKeyPolicy::allowlist_from_dir(Path::new("/nonexistent/allowlist")).unwrap_err();
        assert!(matches!(err, ControlError::InvalidHostKey(_)));
    }

    #[test]
    fn tofu_accepts_anything() {
        let policy = HostKeyPolicy::trust_on_first_use();
        assert!(policy.check(&test_key(9)).unwrap());
    }
}

//! Shared types for keyward.
//!
//! keyward is an SSH agent that never holds private keys: every signature is
//! delegated to a separate vault daemon.  This crate holds the pieces every
//! other crate agrees on: the decoded [`Secret`] metadata, the
//! [`VaultClient`] contract, and the daemon configuration.

use std::time::Duration;

pub mod config;
pub mod vault;

pub use vault::RpcVaultClient;

/// Public metadata for one vault-held key, with its group chain resolved.
///
/// No field here is secret: `public_data` is public key material and the
/// handle pair is meaningless outside the vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    /// Opaque vault handle for the stored secret.
    pub file_id: String,
    /// Opaque vault capability handle.
    pub cap_id: String,
    /// Key family discriminator (e.g. `"ecdsa-p256"`, `"ed25519"`).
    pub secret_type: String,
    pub public_data: Vec<u8>,
    /// Parent group, fully resolved.  `None` for root secrets.
    pub group: Option<Box<Secret>>,
}

impl Secret {
    /// Name of the direct parent group, if any.
    pub fn group_name(&self) -> Option<&str> {
        self.group.as_deref().map(|g| g.name.as_str())
    }

    /// Group chain from the direct parent up to the root.
    pub fn ancestors(&self) -> impl Iterator<Item = &Secret> {
        std::iter::successors(self.group.as_deref(), |s| s.group.as_deref())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum VaultError {
    #[error("vault unavailable: {0}")]
    Unavailable(String),
    #[error("vault denied request: {0}")]
    Denied(String),
    #[error("malformed vault response: {0}")]
    Protocol(String),
    #[error("vault did not answer within {0:?}")]
    Timeout(Duration),
}

/// The two vault operations the agent depends on.
///
/// Implemented by [`RpcVaultClient`] for the real daemon; tests supply
/// in-process mocks.
#[async_trait::async_trait]
pub trait VaultClient: Send + Sync + std::fmt::Debug {
    /// Export the public half of `name` in the vault's internal encoding,
    /// base64 wrapped.
    async fn export_public_data(&self, name: &str) -> Result<String, VaultError>;

    /// Ask the vault to sign `challenge` with `name` (scoped by `group`, empty
    /// for root secrets).  Returns the raw signature blob.
    async fn sign(&self, name: &str, group: &str, challenge: &[u8]) -> Result<Vec<u8>, VaultError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(name: &str, group: Option<Secret>) -> Secret {
        Secret {
            name: name.to_string(),
            file_id: format!("{name}-file"),
            cap_id: format!("{name}-cap"),
            secret_type: "ed25519".to_string(),
            public_data: vec![1, 2, 3],
            group: group.map(Box::new),
        }
    }

    #[test]
    fn root_secret_has_no_group_name() {
        assert_eq!(secret("k1", None).group_name(), None);
    }

    #[test]
    fn ancestors_walk_to_root() {
        let root = secret("root", None);
        let mid = secret("mid", Some(root));
        let leaf = secret("leaf", Some(mid));

        assert_eq!(leaf.group_name(), Some("mid"));
        let chain: Vec<&str> = leaf.ancestors().map(|s| s.name.as_str()).collect();
        assert_eq!(chain, ["mid", "root"]);
    }
}

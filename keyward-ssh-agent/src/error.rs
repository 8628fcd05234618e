use std::path::PathBuf;

use keyward_core::VaultError;
use keyward_store::StoreError;

/// Failures of keyring lookups and delegated signing.
#[derive(Debug, thiserror::Error)]
pub enum KeyringError {
    #[error("key not found")]
    KeyNotFound,

    /// The vault could not be reached, refused, or timed out.  The keyring
    /// is left unchanged.
    #[error("signing delegation failed: {0}")]
    Delegation(#[from] VaultError),

    #[error("vault returned an unusable signature: {0}")]
    InvalidSignature(String),

    /// The client asked for a signature algorithm this agent will not
    /// produce, such as SHA-1 `ssh-rsa`.  The vault is not contacted.
    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("key requires confirmation before use, which this agent cannot provide")]
    ConfirmationUnavailable,

    #[error("keyring lock poisoned")]
    Poisoned,
}

/// Failures decoding a public key exported by the vault.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("exported data is not base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("exported secret is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported secret type for SSH: {0:?}")]
    UnsupportedKeyType(String),

    #[error("invalid public key material: {0}")]
    InvalidKey(String),
}

/// Daemon-level failures.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("cannot bind agent socket {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("agent socket is no longer usable: {0}")]
    Accept(#[source] std::io::Error),

    #[error("invalid public key for {name}: {reason}")]
    InvalidPublicKey { name: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Keyring(#[from] KeyringError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("import failed: {0}")]
    Import(#[from] ImportError),
}

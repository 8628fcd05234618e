//! Signers the keyring can dispatch to.
//!
//! [`KeySigner`] is the capability set every keyring entry provides.
//! [`DelegatingSigner`] implements it by forwarding the challenge to the
//! vault; there is no local signing path.

use std::sync::Arc;
use std::time::Duration;

use keyward_core::{VaultClient, VaultError};
use ssh_key::{Algorithm, HashAlg, PublicKey, Signature};
use tracing::debug;

use crate::error::KeyringError;

/// Agent sign-request flag asking for `rsa-sha2-256`.
pub const SSH_AGENT_RSA_SHA2_256: u32 = 0x02;
/// Agent sign-request flag asking for `rsa-sha2-512`.
pub const SSH_AGENT_RSA_SHA2_512: u32 = 0x04;

/// Vault round trips longer than this fail the sign request.
pub const DEFAULT_VAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait::async_trait]
pub trait KeySigner: Send + Sync + std::fmt::Debug {
    fn public_key(&self) -> &PublicKey;

    /// Produce a signature over `data`.  `flags` are the agent protocol
    /// sign-request flags.
    async fn sign(&self, data: &[u8], flags: u32) -> Result<Signature, KeyringError>;
}

/// A public key bound to the vault secret that can sign for it.
#[derive(Debug, Clone)]
pub struct DelegatingSigner {
    public_key: PublicKey,
    vault: Arc<dyn VaultClient>,
    secret_name: String,
    group_name: String,
    timeout: Duration,
}

impl DelegatingSigner {
    /// `group_name` is empty for secrets without a group.
    pub fn new(
        public_key: PublicKey,
        vault: Arc<dyn VaultClient>,
        secret_name: impl Into<String>,
        group_name: impl Into<String>,
    ) -> Self {
        Self {
            public_key,
            vault,
            secret_name: secret_name.into(),
            group_name: group_name.into(),
            timeout: DEFAULT_VAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn secret_name(&self) -> &str {
        &self.secret_name
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }
}

#[async_trait::async_trait]
impl KeySigner for DelegatingSigner {
    fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    async fn sign(&self, data: &[u8], flags: u32) -> Result<Signature, KeyringError> {
        let algorithm = signature_algorithm(&self.public_key, flags)?;
        debug!(
            secret = %self.secret_name,
            group = %self.group_name,
            algorithm = %algorithm,
            data_len = data.len(),
            "delegating sign to vault"
        );

        let raw = tokio::time::timeout(
            self.timeout,
            self.vault.sign(&self.secret_name, &self.group_name, data),
        )
        .await
        .map_err(|_| VaultError::Timeout(self.timeout))??;

        Signature::new(algorithm, raw).map_err(|e| KeyringError::InvalidSignature(e.to_string()))
    }
}

/// The SSH signature algorithm to label the vault's bytes with.
///
/// RSA keys sign with the SHA-2 hash the client asked for; legacy SHA-1
/// `ssh-rsa` is refused.  Every other key type has exactly one signature
/// algorithm.
fn signature_algorithm(public_key: &PublicKey, flags: u32) -> Result<Algorithm, KeyringError> {
    match public_key.algorithm() {
        Algorithm::Rsa { .. } => {
            let hash = if flags & SSH_AGENT_RSA_SHA2_512 != 0 {
                HashAlg::Sha512
            } else if flags & SSH_AGENT_RSA_SHA2_256 != 0 {
                HashAlg::Sha256
            } else {
                return Err(KeyringError::UnsupportedAlgorithm(
                    "ssh-rsa (SHA-1); request rsa-sha2-256 or rsa-sha2-512".to_string(),
                ));
            };
            Ok(Algorithm::Rsa { hash: Some(hash) })
        }
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::tests::P256_GENERATOR;
    use crate::test_support::{MockVault, ed25519_key};
    use ssh_key::EcdsaCurve;
    use ssh_key::public::{KeyData, RsaPublicKey};
    use ssh_key::Mpint;

    #[tokio::test]
    async fn sign_returns_vault_bytes_unmodified() {
        let vault = Arc::new(MockVault::signing(vec![0x5a; 64]));
        let signer = DelegatingSigner::new(ed25519_key(1), vault.clone(), "k1", "");

        let sig = signer.sign(b"challenge", 0).await.unwrap();
        assert_eq!(sig.as_bytes(), &[0x5a; 64][..]);
        assert_eq!(sig.algorithm(), Algorithm::Ed25519);
    }

    #[tokio::test]
    async fn sign_forwards_name_group_and_challenge() {
        let vault = Arc::new(MockVault::signing(vec![1; 64]));
        let signer = DelegatingSigner::new(ed25519_key(1), vault.clone(), "k2", "team");

        signer.sign(b"to be signed", 0).await.unwrap();
        assert_eq!(
            vault.calls(),
            vec![(
                "k2".to_string(),
                "team".to_string(),
                b"to be signed".to_vec()
            )]
        );
    }

    #[tokio::test]
    async fn vault_failure_is_delegation_error() {
        let vault = Arc::new(MockVault::failing());
        let signer = DelegatingSigner::new(ed25519_key(1), vault, "k1", "");

        let err = signer.sign(b"x", 0).await.unwrap_err();
        assert!(matches!(
            err,
            KeyringError::Delegation(VaultError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn malformed_signature_is_rejected() {
        // Ed25519 signatures are exactly 64 bytes.
        let vault = Arc::new(MockVault::signing(vec![1; 10]));
        let signer = DelegatingSigner::new(ed25519_key(1), vault, "k1", "");

        let err = signer.sign(b"x", 0).await.unwrap_err();
        assert!(matches!(err, KeyringError::InvalidSignature(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_vault_times_out() {
        let vault = Arc::new(MockVault {
            signature: vec![1; 64],
            sign_delay: Some(Duration::from_secs(3600)),
            ..MockVault::default()
        });
        let signer = DelegatingSigner::new(ed25519_key(1), vault, "k1", "")
            .with_timeout(Duration::from_secs(5));

        let err = signer.sign(b"x", 0).await.unwrap_err();
        assert!(matches!(
            err,
            KeyringError::Delegation(VaultError::Timeout(d)) if d == Duration::from_secs(5)
        ));
    }

    fn rsa_key() -> PublicKey {
        let mut n = vec![0xc5; 256];
        n[255] |= 1;
        let rsa = RsaPublicKey {
            e: Mpint::from_positive_bytes(&[0x01, 0x00, 0x01]).unwrap(),
            n: Mpint::from_positive_bytes(&n).unwrap(),
        };
        PublicKey::new(KeyData::Rsa(rsa), "")
    }

    fn p256_key() -> PublicKey {
        crate::import::vault_key_to_public_key("ecdsa-p256", &P256_GENERATOR).unwrap()
    }

    /// SSH wire form of an ECDSA signature: `mpint r || mpint s`.
    fn ssh_ecdsa_blob(r: [u8; 32], s: [u8; 32]) -> Vec<u8> {
        let mut blob = Vec::new();
        for component in [r, s] {
            blob.extend_from_slice(&32u32.to_be_bytes());
            blob.extend_from_slice(&component);
        }
        blob
    }

    #[test]
    fn non_rsa_algorithm_ignores_flags() {
        let key = ed25519_key(1);
        assert_eq!(
            signature_algorithm(&key, SSH_AGENT_RSA_SHA2_512).unwrap(),
            Algorithm::Ed25519
        );
    }

    #[tokio::test]
    async fn rsa_without_sha2_flag_is_refused_before_the_vault() {
        let vault = Arc::new(MockVault::signing(vec![1; 256]));
        let signer = DelegatingSigner::new(rsa_key(), vault.clone(), "rsa", "");

        let err = signer.sign(b"x", 0).await.unwrap_err();
        assert!(matches!(err, KeyringError::UnsupportedAlgorithm(_)));
        assert!(vault.calls().is_empty());
    }

    #[tokio::test]
    async fn rsa_sha2_flags_pick_the_hash() {
        let vault = Arc::new(MockVault::signing(vec![1; 256]));
        let signer = DelegatingSigner::new(rsa_key(), vault.clone(), "rsa", "");

        let sig = signer.sign(b"x", SSH_AGENT_RSA_SHA2_512).await.unwrap();
        assert_eq!(
            sig.algorithm(),
            Algorithm::Rsa {
                hash: Some(HashAlg::Sha512)
            }
        );
        let sig = signer.sign(b"x", SSH_AGENT_RSA_SHA2_256).await.unwrap();
        assert_eq!(
            sig.algorithm(),
            Algorithm::Rsa {
                hash: Some(HashAlg::Sha256)
            }
        );
        assert_eq!(vault.calls().len(), 2);
    }

    #[tokio::test]
    async fn p256_accepts_ssh_encoded_signature() {
        let blob = ssh_ecdsa_blob([0x11; 32], [0x22; 32]);
        let vault = Arc::new(MockVault::signing(blob.clone()));
        let signer = DelegatingSigner::new(p256_key(), vault, "k1", "");

        let sig = signer.sign(b"challenge", 0).await.unwrap();
        assert_eq!(
            sig.algorithm(),
            Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP256
            }
        );
        assert_eq!(sig.as_bytes(), &blob[..]);
    }

    #[tokio::test]
    async fn p256_rejects_der_signature() {
        // ASN.1 DER `SEQUENCE { INTEGER r, INTEGER s }` is not the SSH form.
        let mut der = vec![0x30, 0x44, 0x02, 0x20];
        der.extend_from_slice(&[0x11; 32]);
        der.extend_from_slice(&[0x02, 0x20]);
        der.extend_from_slice(&[0x22; 32]);
        let vault = Arc::new(MockVault::signing(der));
        let signer = DelegatingSigner::new(p256_key(), vault, "k1", "");

        let err = signer.sign(b"challenge", 0).await.unwrap_err();
        assert!(matches!(err, KeyringError::InvalidSignature(_)));
    }
}

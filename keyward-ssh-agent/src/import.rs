//! Decoding of public keys exported by the vault.
//!
//! `ExportPublicData` answers with base64 text wrapping a JSON secret:
//!
//! ```text
//! {"Name":"k1","FileId":"…","CapId":"…","SecretType":"ecdsa-p256",
//!  "PublicData":"<b64 vault key encoding>","Group":null}
//! ```
//!
//! The vault's own key encoding depends on the secret type:
//!
//! | `SecretType`                         | `PublicData`                         |
//! |--------------------------------------|--------------------------------------|
//! | `ecdsa`, `ecdsa-p256`, `ECDSA`, …    | SEC1 point (`0x04 ‖ X ‖ Y`)          |
//! | `ed25519`, `ssh-ed25519`             | 32 raw key bytes                     |
//!
//! [`decode_export`] converts it into a [`Secret`] whose `public_data` is an
//! OpenSSH public key line, the form the metadata store keeps.

use base64::prelude::{BASE64_STANDARD, Engine};
use keyward_core::Secret;
use serde::Deserialize;
use ssh_key::PublicKey;
use ssh_key::public::{EcdsaPublicKey, Ed25519PublicKey, KeyData};

use crate::error::ImportError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExportedSecret {
    #[serde(default)]
    name: String,
    #[serde(default)]
    file_id: String,
    #[serde(default)]
    cap_id: String,
    #[serde(default)]
    secret_type: String,
    /// Base64 of the vault's key encoding.
    #[serde(default)]
    public_data: String,
    #[serde(default)]
    group: Option<Box<ExportedSecret>>,
}

impl ExportedSecret {
    /// Group secrets are carried for their names only; their public data
    /// is kept as the vault sent it.
    fn into_group(self) -> Result<Secret, ImportError> {
        Ok(Secret {
            public_data: BASE64_STANDARD.decode(&self.public_data)?,
            group: self.group.map(|g| g.into_group().map(Box::new)).transpose()?,
            name: self.name,
            file_id: self.file_id,
            cap_id: self.cap_id,
            secret_type: self.secret_type,
        })
    }
}

/// Decode an `ExportPublicData` answer into a storable [`Secret`].
///
/// `fallback_name` is used when the vault leaves `Name` empty.
pub fn decode_export(encoded: &str, fallback_name: &str) -> Result<Secret, ImportError> {
    let json = BASE64_STANDARD.decode(encoded.trim())?;
    let exported: ExportedSecret = serde_json::from_slice(&json)?;

    let raw = BASE64_STANDARD.decode(&exported.public_data)?;
    let public_key = vault_key_to_public_key(&exported.secret_type, &raw)?;
    let line = public_key
        .to_openssh()
        .map_err(|e| ImportError::InvalidKey(e.to_string()))?;

    let name = if exported.name.is_empty() {
        fallback_name.to_string()
    } else {
        exported.name
    };

    Ok(Secret {
        name,
        file_id: exported.file_id,
        cap_id: exported.cap_id,
        secret_type: exported.secret_type,
        public_data: line.into_bytes(),
        group: exported
            .group
            .map(|g| g.into_group().map(Box::new))
            .transpose()?,
    })
}

/// Build an SSH public key from the vault's encoding for `secret_type`.
pub fn vault_key_to_public_key(secret_type: &str, raw: &[u8]) -> Result<PublicKey, ImportError> {
    let key_data = match secret_type.to_ascii_lowercase().as_str() {
        "ecdsa" | "ecdsa-p256" | "ecdsa_p256" | "p256" | "ecdsa-sha2-nistp256" => {
            let point = EcdsaPublicKey::from_sec1_bytes(raw)
                .map_err(|e| ImportError::InvalidKey(format!("SEC1 point: {e}")))?;
            KeyData::Ecdsa(point)
        }
        "ed25519" | "ssh-ed25519" => {
            let bytes: [u8; 32] = raw.try_into().map_err(|_| {
                ImportError::InvalidKey(format!(
                    "ed25519 key must be 32 bytes, got {}",
                    raw.len()
                ))
            })?;
            KeyData::Ed25519(Ed25519PublicKey(bytes))
        }
        _ => return Err(ImportError::UnsupportedKeyType(secret_type.to_string())),
    };
    Ok(PublicKey::new(key_data, ""))
}

use std::collections::BTreeMap;

use base64::prelude::{BASE64_STANDARD, Engine};
use keyward_core::Secret;
use serde::{Deserialize, Serialize};

/// On-disk form of a [`Secret`].
///
/// `public_data` is standard base64 and `group` is the parent's name (empty
/// for roots).  Field names are PascalCase so files written by earlier
/// agents load unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SecretRecord {
    #[serde(default)]
    pub file_id: String,
    #[serde(default)]
    pub cap_id: String,
    #[serde(default)]
    pub secret_type: String,
    #[serde(default)]
    pub public_data: String,
    #[serde(default)]
    pub group: String,
}

impl SecretRecord {
    pub fn encode(secret: &Secret) -> Self {
        Self {
            file_id: secret.file_id.clone(),
            cap_id: secret.cap_id.clone(),
            secret_type: secret.secret_type.clone(),
            public_data: BASE64_STANDARD.encode(&secret.public_data),
            group: secret.group_name().unwrap_or_default().to_string(),
        }
    }

    pub fn public_data_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64_STANDARD.decode(&self.public_data)
    }

    /// Parent group name, `None` for roots.
    pub fn group_name(&self) -> Option<&str> {
        (!self.group.is_empty()).then_some(self.group.as_str())
    }
}

/// The whole persisted document: one mapping from name to record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StoreData {
    #[serde(default)]
    pub secrets: BTreeMap<String, SecretRecord>,
}

//! File-backed public key metadata for keyward.
//!
//! The store maps secret names to the public half of vault-held keys and an
//! optional parent group.  It never holds private key material.  The JSON
//! file is the single source of truth; every mutation rewrites it whole.

pub mod error;
pub mod store;
pub mod types;

pub use error::StoreError;
pub use store::{MAX_GROUP_DEPTH, SecretStore};
pub use types::{SecretRecord, StoreData};

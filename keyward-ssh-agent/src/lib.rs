//! Delegating SSH agent for keyward.
//!
//! Serves the standard OpenSSH agent protocol without ever holding a private
//! key.  Every signature is produced by the vault daemon; this crate only
//! knows public keys and the names the vault uses for them.
//!
//! # Architecture
//!
//! ```text
//! SecretStore ── load_keys() ──► Keyring (Arc, RwLock<…>) ◄── AgentSession (per connection)
//!      ▲                            │                               ▲
//!      │ import_key()               │ sign()                   UnixListener
//!      │                            ▼                               │
//!  VaultClient ◄────────── DelegatingSigner                     SshAgent
//! ```
//!
//! The [`Keyring`] holds trait objects implementing [`KeySigner`];
//! [`DelegatingSigner`] is the only implementation today.

pub mod agent;
pub mod error;
pub mod import;
pub mod keyring;
pub mod session;
pub mod signer;

pub use agent::SshAgent;
pub use error::{DaemonError, ImportError, KeyringError};
pub use keyring::{Keyring, KeyringEntry};
pub use session::AgentSession;
pub use signer::{DelegatingSigner, KeySigner};

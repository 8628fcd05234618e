//! In-memory registry of active signers.
//!
//! The [`Keyring`] is what the agent protocol talks to: list identities,
//! sign with one of them, add or drop entries.  It never holds private key
//! material; every entry is a [`KeySigner`] that knows how to get a
//! signature from somewhere else.
//!
//! Thread safety: the entry map sits behind a `std::sync::RwLock`.  The lock
//! is never held across an `.await`: `sign` clones the signer handle out and
//! releases the lock before the vault round trip.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use ssh_agent_lib::proto::Identity;
use ssh_key::public::KeyData;
use ssh_key::{HashAlg, Signature};
use tracing::{debug, warn};

use crate::error::KeyringError;
use crate::signer::KeySigner;

/// A signer plus the policy it was added with.
#[derive(Debug, Clone)]
pub struct KeyringEntry {
    pub signer: Arc<dyn KeySigner>,
    /// Free-form text shown next to the key by `ssh-add -l`.
    pub comment: String,
    /// Drop the entry this long after it was added.  `None` = forever.
    pub lifetime: Option<Duration>,
    pub confirm_before_use: bool,
}

impl KeyringEntry {
    /// An entry with no lifetime and no confirmation.
    pub fn new(signer: Arc<dyn KeySigner>, comment: impl Into<String>) -> Self {
        Self {
            signer,
            comment: comment.into(),
            lifetime: None,
            confirm_before_use: false,
        }
    }
}

#[derive(Debug)]
struct Slot {
    entry: KeyringEntry,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|t| now < t)
    }
}

/// Shared, thread-safe signer registry.
///
/// Create with [`Keyring::new`] and share via [`Arc::clone`].  Entries are
/// keyed by SHA-256 fingerprint; lookups additionally compare the full key
/// data so a match is always exact.
#[derive(Debug, Default)]
pub struct Keyring {
    entries: RwLock<HashMap<String, Slot>>,
}

fn fingerprint(key: &KeyData) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

impl Keyring {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `entry`, replacing any entry for the same public key.
    ///
    /// Returns `true` if an existing entry was replaced.
    pub fn add(&self, entry: KeyringEntry) -> Result<bool, KeyringError> {
        let key_data = entry.signer.public_key().key_data().clone();
        let fp = fingerprint(&key_data);
        let expires_at = entry.lifetime.map(|d| Instant::now() + d);

        let mut guard = self.entries.write().map_err(|_| KeyringError::Poisoned)?;
        let now = Instant::now();
        guard.retain(|_, slot| slot.is_live(now));

        debug!(fingerprint = %fp, comment = %entry.comment, "keyring: adding key");
        let replaced = guard.insert(fp, Slot { entry, expires_at }).is_some();
        Ok(replaced)
    }

    /// Drop the entry for `key`.  Returns `false` if there was none.
    pub fn remove(&self, key: &KeyData) -> Result<bool, KeyringError> {
        let fp = fingerprint(key);
        let mut guard = self.entries.write().map_err(|_| KeyringError::Poisoned)?;
        let exact = guard
            .get(&fp)
            .is_some_and(|slot| slot.entry.signer.public_key().key_data() == key);
        let removed = exact && guard.remove(&fp).is_some();
        debug!(fingerprint = %fp, removed, "keyring: remove key");
        Ok(removed)
    }

    /// Drop every entry.  Returns how many were live.
    pub fn remove_all(&self) -> Result<usize, KeyringError> {
        let mut guard = self.entries.write().map_err(|_| KeyringError::Poisoned)?;
        let now = Instant::now();
        let count = guard.values().filter(|s| s.is_live(now)).count();
        guard.clear();
        debug!(count, "keyring: removed all keys");
        Ok(count)
    }

    /// Public key and comment of every live entry, ordered by comment.
    ///
    /// Never contacts the vault.
    pub fn list(&self) -> Result<Vec<Identity>, KeyringError> {
        let guard = self.entries.read().map_err(|_| KeyringError::Poisoned)?;
        let now = Instant::now();
        let mut identities: Vec<Identity> = guard
            .values()
            .filter(|slot| slot.is_live(now))
            .map(|slot| Identity {
                pubkey: slot.entry.signer.public_key().key_data().clone(),
                comment: slot.entry.comment.clone(),
            })
            .collect();
        identities.sort_by(|a, b| a.comment.cmp(&b.comment));
        Ok(identities)
    }

    /// Sign `data` with the entry registered for exactly `key`.
    ///
    /// A failed signature leaves the registry untouched.
    pub async fn sign(
        &self,
        key: &KeyData,
        data: &[u8],
        flags: u32,
    ) -> Result<Signature, KeyringError> {
        let entry = self.lookup(key)?.ok_or(KeyringError::KeyNotFound)?;

        if entry.confirm_before_use {
            warn!(
                comment = %entry.comment,
                "sign request for key that requires confirmation, refusing"
            );
            return Err(KeyringError::ConfirmationUnavailable);
        }

        entry.signer.sign(data, flags).await
    }

    /// True if a live entry exists for exactly `key`.
    pub fn contains(&self, key: &KeyData) -> bool {
        matches!(self.lookup(key), Ok(Some(_)))
    }

    /// Number of live entries.  Reads through a poisoned lock.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let guard = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        guard.values().filter(|s| s.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &KeyData) -> Result<Option<KeyringEntry>, KeyringError> {
        let guard = self.entries.read().map_err(|_| KeyringError::Poisoned)?;
        let now = Instant::now();
        Ok(guard
            .get(&fingerprint(key))
            .filter(|slot| slot.is_live(now))
            .filter(|slot| slot.entry.signer.public_key().key_data() == key)
            .map(|slot| slot.entry.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::DelegatingSigner;
    use crate::test_support::{MockVault, ed25519_key};
    use keyward_core::{VaultClient, VaultError};

    fn entry(seed: u8, comment: &str, vault: Arc<dyn VaultClient>) -> KeyringEntry {
        let signer = DelegatingSigner::new(ed25519_key(seed), vault, comment, "");
        KeyringEntry::new(Arc::new(signer), comment)
    }

    fn key_data(seed: u8) -> KeyData {
        ed25519_key(seed).key_data().clone()
    }

    #[tokio::test]
    async fn sign_returns_vault_signature() {
        let vault: Arc<dyn VaultClient> = Arc::new(MockVault::signing(vec![0x42; 64]));
        let keyring = Keyring::new();
        keyring.add(entry(1, "k1", vault)).unwrap();

        let sig = keyring.sign(&key_data(1), b"challenge", 0).await.unwrap();
        assert_eq!(sig.as_bytes(), &[0x42; 64][..]);
    }

    #[tokio::test]
    async fn sign_unknown_key_is_not_found() {
        let vault: Arc<dyn VaultClient> = Arc::new(MockVault::signing(vec![0; 64]));
        let keyring = Keyring::new();
        keyring.add(entry(1, "k1", vault)).unwrap();

        let err = keyring.sign(&key_data(2), b"x", 0).await.unwrap_err();
        assert!(matches!(err, KeyringError::KeyNotFound));
    }

    #[tokio::test]
    async fn failed_sign_leaves_keyring_unchanged() {
        let vault: Arc<dyn VaultClient> = Arc::new(MockVault::failing());
        let keyring = Keyring::new();
        keyring.add(entry(1, "k1", vault)).unwrap();

        let err = keyring.sign(&key_data(1), b"x", 0).await.unwrap_err();
        assert!(matches!(
            err,
            KeyringError::Delegation(VaultError::Unavailable(_))
        ));
        assert_eq!(keyring.len(), 1);
        assert!(keyring.contains(&key_data(1)));
    }

    #[test]
    fn list_never_contacts_vault() {
        let vault = Arc::new(MockVault::signing(vec![0; 64]));
        let keyring = Keyring::new();
        keyring.add(entry(1, "alpha", vault.clone())).unwrap();
        keyring.add(entry(2, "beta", vault.clone())).unwrap();

        let ids = keyring.list().unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0].comment, "alpha");
        assert_eq!(ids[0].pubkey, key_data(1));
        assert_eq!(ids[1].comment, "beta");
        assert!(vault.calls().is_empty());
    }

    #[test]
    fn re_adding_replaces() {
        let vault: Arc<dyn VaultClient> = Arc::new(MockVault::signing(vec![0; 64]));
        let keyring = Keyring::new();
        assert!(!keyring.add(entry(1, "old", vault.clone())).unwrap());
        assert!(keyring.add(entry(1, "new", vault)).unwrap());

        let ids = keyring.list().unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].comment, "new");
    }

    #[test]
    fn remove_absent_is_noop() {
        let vault: Arc<dyn VaultClient> = Arc::new(MockVault::signing(vec![0; 64]));
        let keyring = Keyring::new();
        keyring.add(entry(1, "k1", vault)).unwrap();

        assert!(!keyring.remove(&key_data(9)).unwrap());
        assert!(keyring.remove(&key_data(1)).unwrap());
        assert!(!keyring.remove(&key_data(1)).unwrap());
        assert!(keyring.is_empty());
    }

    #[test]
    fn remove_all_clears() {
        let vault: Arc<dyn VaultClient> = Arc::new(MockVault::signing(vec![0; 64]));
        let keyring = Keyring::new();
        for seed in 0..5 {
            keyring.add(entry(seed, &format!("k{seed}"), vault.clone())).unwrap();
        }
        assert_eq!(keyring.remove_all().unwrap(), 5);
        assert!(keyring.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_entries_disappear() {
        let vault: Arc<dyn VaultClient> = Arc::new(MockVault::signing(vec![0; 64]));
        let keyring = Keyring::new();
        let mut short = entry(1, "short", vault.clone());
        short.lifetime = Some(Duration::ZERO);
        keyring.add(short).unwrap();
        keyring.add(entry(2, "forever", vault)).unwrap();

        let ids = keyring.list().unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].comment, "forever");
        assert!(matches!(
            keyring.sign(&key_data(1), b"x", 0).await,
            Err(KeyringError::KeyNotFound)
        ));
    }

    #[tokio::test]
    async fn confirm_before_use_is_refused() {
        let vault = Arc::new(MockVault::signing(vec![0; 64]));
        let keyring = Keyring::new();
        let mut confirm = entry(1, "confirm", vault.clone());
        confirm.confirm_before_use = true;
        keyring.add(confirm).unwrap();

        let err = keyring.sign(&key_data(1), b"x", 0).await.unwrap_err();
        assert!(matches!(err, KeyringError::ConfirmationUnavailable));
        assert!(vault.calls().is_empty());
    }

    #[test]
    fn concurrent_reads_see_consistent_set() {
        const N: u8 = 10;
        let vault: Arc<dyn VaultClient> = Arc::new(MockVault::signing(vec![0; 64]));
        let keyring = Keyring::new();
        for seed in 0..N {
            keyring.add(entry(seed, &format!("k{seed}"), vault.clone())).unwrap();
        }

        std::thread::scope(|scope| {
            let writer = {
                let keyring = Arc::clone(&keyring);
                let vault = vault.clone();
                scope.spawn(move || {
                    for i in 0..500 {
                        // Replace-add an existing key, and add/remove an extra one.
                        keyring.add(entry(0, &format!("k0-{i}"), vault.clone())).unwrap();
                        keyring.add(entry(200, "extra", vault.clone())).unwrap();
                        keyring.remove(&key_data(200)).unwrap();
                    }
                })
            };

            for _ in 0..4 {
                let keyring = Arc::clone(&keyring);
                scope.spawn(move || {
                    for _ in 0..500 {
                        let ids = keyring.list().unwrap();
                        assert!(ids.len() == N as usize || ids.len() == N as usize + 1);
                        let mut keys: Vec<String> =
                            ids.iter().map(|id| fingerprint(&id.pubkey)).collect();
                        keys.sort();
                        keys.dedup();
                        assert_eq!(keys.len(), ids.len(), "duplicate entry observed");
                    }
                });
            }

            writer.join().unwrap();
        });

        assert_eq!(keyring.len(), N as usize);
    }

    #[test]
    fn len_survives_poisoned_lock() {
        let vault: Arc<dyn VaultClient> = Arc::new(MockVault::default());
        let keyring = Keyring::new();
        keyring.add(entry(1, "k1", vault)).unwrap();

        let poisoner = Arc::clone(&keyring);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.entries.write().unwrap();
            panic!("poison the keyring lock");
        })
        .join();

        assert!(keyring.entries.is_poisoned());
        assert_eq!(keyring.len(), 1);
        assert!(!keyring.is_empty());
        assert!(matches!(keyring.list(), Err(KeyringError::Poisoned)));
    }
}

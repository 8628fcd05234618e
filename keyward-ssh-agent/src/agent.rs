//! The agent daemon.
//!
//! [`SshAgent`] owns the [`SecretStore`], the [`Keyring`] and the vault
//! client, and runs the socket accept loop.
//!
//! ## Lifecycle
//!
//! 1. [`SshAgent::start`]: reload the store and register every stored key.
//! 2. [`SshAgent::run_until`]: bind the socket and serve connections, one
//!    task each, until the shutdown future resolves.
//! 3. [`SshAgent::shutdown`]: remove the socket file.

use std::future::Future;
use std::io;
use std::os::unix::fs::{FileTypeExt as _, PermissionsExt as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use keyward_core::{Secret, VaultClient, VaultError};
use keyward_store::SecretStore;
use ssh_key::PublicKey;
use tokio::net::UnixListener;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::DaemonError;
use crate::import;
use crate::keyring::{Keyring, KeyringEntry};
use crate::session::{AgentSession, is_peer_closed, serve_connection};
use crate::signer::{DEFAULT_VAULT_TIMEOUT, DelegatingSigner};

/// Pause before accepting again after a non-connection accept failure.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct SshAgent {
    store: Arc<RwLock<SecretStore>>,
    keyring: Arc<Keyring>,
    vault: Arc<dyn VaultClient>,
    socket_path: PathBuf,
    vault_timeout: Duration,
}

impl std::fmt::Debug for SshAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshAgent")
            .field("socket_path", &self.socket_path)
            .field("keys", &self.keyring.len())
            .finish_non_exhaustive()
    }
}

impl SshAgent {
    pub fn new(
        store: SecretStore,
        vault: Arc<dyn VaultClient>,
        socket_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store: Arc::new(RwLock::new(store)),
            keyring: Keyring::new(),
            vault,
            socket_path: socket_path.into(),
            vault_timeout: DEFAULT_VAULT_TIMEOUT,
        }
    }

    /// Bound every vault round trip (signing and export) by `timeout`.
    pub fn with_vault_timeout(mut self, timeout: Duration) -> Self {
        self.vault_timeout = timeout;
        self
    }

    pub fn keyring(&self) -> &Arc<Keyring> {
        &self.keyring
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Load every stored key into the keyring.  Any failure aborts startup.
    pub async fn start(&self) -> Result<usize, DaemonError> {
        self.load_keys().await
    }

    /// Reload the store and (re-)register every secret in it.
    ///
    /// Re-registering an existing key replaces it, so calling this again
    /// after a store change brings the keyring back in line.
    pub async fn load_keys(&self) -> Result<usize, DaemonError> {
        let secrets = self.list_pub_keys().await?;
        for secret in &secrets {
            self.add_key(secret)?;
        }
        info!(count = secrets.len(), "SSH keys loaded from store");
        Ok(secrets.len())
    }

    /// Fresh view of every stored secret.
    pub async fn list_pub_keys(&self) -> Result<Vec<Secret>, DaemonError> {
        let mut store = self.store.write().await;
        store.reload()?;
        Ok(store.list()?)
    }

    /// Register `secret` with the keyring, backed by a delegating signer.
    ///
    /// Entries never expire and never ask for confirmation.
    pub fn add_key(&self, secret: &Secret) -> Result<(), DaemonError> {
        let public_key = parse_public_key(&secret.name, &secret.public_data)?;
        let signer = DelegatingSigner::new(
            public_key,
            Arc::clone(&self.vault),
            secret.name.clone(),
            secret.group_name().unwrap_or_default(),
        )
        .with_timeout(self.vault_timeout);

        self.keyring
            .add(KeyringEntry::new(Arc::new(signer), secret.name.clone()))?;
        debug!(name = %secret.name, "key registered");
        Ok(())
    }

    /// Fetch `name`'s public key from the vault, persist it and serve it.
    ///
    /// If the stored key cannot be resolved or registered after the store
    /// write, the record is removed again so the store and the keyring never
    /// disagree.
    pub async fn import_key(&self, name: &str) -> Result<Secret, DaemonError> {
        let encoded = tokio::time::timeout(self.vault_timeout, self.vault.export_public_data(name))
            .await
            .map_err(|_| VaultError::Timeout(self.vault_timeout))??;
        let decoded = import::decode_export(&encoded, name)?;

        let mut store = self.store.write().await;
        store.reload()?;
        store.store(&decoded)?;

        let registered = store
            .get(&decoded.name)
            .map_err(DaemonError::from)
            .and_then(|stored| self.add_key(&stored).map(|()| stored));

        match registered {
            Ok(stored) => {
                info!(name = %stored.name, secret_type = %stored.secret_type, "key imported from vault");
                Ok(stored)
            }
            Err(e) => {
                if let Err(rollback) = store.remove(&decoded.name) {
                    warn!(name = %decoded.name, "failed to roll back imported key: {rollback}");
                }
                Err(e)
            }
        }
    }

    /// Remove `name` and its group members from the store and the keyring.
    ///
    /// Works from the raw records, so an entry whose group chain is broken
    /// can still be removed.
    pub async fn remove_key(&self, name: &str) -> Result<Vec<String>, DaemonError> {
        let removed = {
            let mut store = self.store.write().await;
            store.reload()?;
            store.remove_records(name)?
        };

        for (removed_name, record) in &removed {
            let key = record
                .public_data_bytes()
                .map_err(|e| DaemonError::InvalidPublicKey {
                    name: removed_name.clone(),
                    reason: format!("not base64: {e}"),
                })
                .and_then(|bytes| parse_public_key(removed_name, &bytes));
            match key {
                Ok(key) => {
                    self.keyring.remove(key.key_data())?;
                }
                Err(e) => debug!(name = %removed_name, "not evicting unparsable key: {e}"),
            }
        }
        info!(name, removed = removed.len(), "keys removed");
        Ok(removed.into_keys().collect())
    }

    /// Bind the agent socket with mode `0600`.
    ///
    /// A socket file nobody answers on is a leftover from a previous run
    /// and is replaced.  A live socket, or a path that is not a socket,
    /// fails with [`DaemonError::Bind`].
    pub fn bind(&self) -> Result<UnixListener, DaemonError> {
        let path = &self.socket_path;
        let bind_err = |source: io::Error| DaemonError::Bind {
            path: path.clone(),
            source,
        };

        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_socket() => {
                if std::os::unix::net::UnixStream::connect(path).is_ok() {
                    return Err(bind_err(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        "another agent is listening on this socket",
                    )));
                }
                debug!(path = %path.display(), "removing stale agent socket");
                std::fs::remove_file(path).map_err(bind_err)?;
            }
            Ok(_) => {
                return Err(bind_err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "path exists and is not a socket",
                )));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(bind_err(e)),
        }

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(bind_err)?;
        }

        let listener = UnixListener::bind(path).map_err(bind_err)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(bind_err)?;
        Ok(listener)
    }

    /// Accept connections forever, one task per connection.
    ///
    /// Returns only if the listener itself becomes unusable.
    pub async fn serve(&self, listener: UnixListener) -> Result<(), DaemonError> {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let session = AgentSession::new(Arc::clone(&self.keyring));
                    tokio::spawn(async move {
                        match serve_connection(stream, session).await {
                            Ok(()) => debug!("agent connection closed"),
                            Err(e) if is_peer_closed(&e) => {
                                debug!("agent connection closed by peer")
                            }
                            Err(e) => warn!("agent connection error: {e}"),
                        }
                    });
                }
                Err(e) if is_connection_error(&e) => {
                    debug!("accept: connection dropped before handoff: {e}");
                }
                Err(e) if is_listener_unusable(&e) => {
                    return Err(DaemonError::Accept(e));
                }
                Err(e) => {
                    warn!("accept error, retrying in 1 second: {e}");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Bind and serve until the process is killed.
    pub async fn run(&self) -> Result<(), DaemonError> {
        self.run_until(std::future::pending()).await
    }

    /// Bind and serve until `shutdown` resolves, then remove the socket.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<(), DaemonError> {
        let listener = self.bind()?;
        info!(socket = %self.socket_path.display(), "SSH agent listening");

        let result = tokio::select! {
            r = self.serve(listener) => r,
            () = shutdown => {
                info!("SSH agent shutting down");
                Ok(())
            }
        };

        self.shutdown();
        result
    }

    /// Remove the socket file.  Failure is logged, never fatal.
    pub fn shutdown(&self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            warn!(
                path = %self.socket_path.display(),
                "could not remove the agent socket file: {e}"
            );
        }
    }
}

fn parse_public_key(name: &str, public_data: &[u8]) -> Result<PublicKey, DaemonError> {
    let invalid = |reason: String| DaemonError::InvalidPublicKey {
        name: name.to_string(),
        reason,
    };
    let line =
        std::str::from_utf8(public_data).map_err(|e| invalid(format!("not UTF-8: {e}")))?;
    PublicKey::from_openssh(line.trim()).map_err(|e| invalid(e.to_string()))
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

fn is_listener_unusable(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EBADF | libc::EINVAL | libc::ENOTSOCK | libc::EOPNOTSUPP)
    )
}

//! SSH agent protocol session.
//!
//! Framing and message decoding belong to `ssh_agent_lib`; [`AgentSession`]
//! only answers the decoded requests from the shared [`Keyring`].

use std::io;
use std::sync::Arc;

use futures::{SinkExt as _, TryStreamExt as _};
use ssh_agent_lib::agent::Session;
use ssh_agent_lib::codec::Codec;
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{AddIdentity, Identity, RemoveIdentity, Request, Response, SignRequest};
use ssh_key::{HashAlg, Signature};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::keyring::Keyring;

/// One client connection's view of the keyring.  Cheap to clone.
#[derive(Clone, Debug)]
pub struct AgentSession {
    keyring: Arc<Keyring>,
}

impl AgentSession {
    pub fn new(keyring: Arc<Keyring>) -> Self {
        Self { keyring }
    }
}

fn other_err(msg: impl Into<String>) -> AgentError {
    AgentError::other(io::Error::other(msg.into()))
}

#[ssh_agent_lib::async_trait]
impl Session for AgentSession {
    async fn request_identities(&mut self) -> Result<Vec<Identity>, AgentError> {
        let identities = self
            .keyring
            .list()
            .map_err(|e| other_err(e.to_string()))?;
        debug!(count = identities.len(), "request_identities");
        Ok(identities)
    }

    async fn sign(&mut self, request: SignRequest) -> Result<Signature, AgentError> {
        let fingerprint = request.pubkey.fingerprint(HashAlg::Sha256);
        debug!(
            fingerprint = %fingerprint,
            data_len = request.data.len(),
            flags = request.flags,
            "sign"
        );

        self.keyring
            .sign(&request.pubkey, &request.data, request.flags)
            .await
            .map_err(|e| {
                warn!(fingerprint = %fingerprint, "sign failed: {e}");
                other_err(format!("signing failed: {e}"))
            })
    }

    async fn add_identity(&mut self, _identity: AddIdentity) -> Result<(), AgentError> {
        warn!("refusing add_identity: this agent never holds private keys");
        Err(other_err("adding private keys is not supported"))
    }

    async fn remove_identity(&mut self, identity: RemoveIdentity) -> Result<(), AgentError> {
        let removed = self
            .keyring
            .remove(&identity.pubkey)
            .map_err(|e| other_err(e.to_string()))?;
        debug!(removed, "remove_identity");
        Ok(())
    }

    async fn remove_all_identities(&mut self) -> Result<(), AgentError> {
        let count = self
            .keyring
            .remove_all()
            .map_err(|e| other_err(e.to_string()))?;
        debug!(count, "remove_all_identities");
        Ok(())
    }

    async fn lock(&mut self, _key: String) -> Result<(), AgentError> {
        debug!("lock requested, nothing is held locally");
        Err(other_err("lock is not supported"))
    }

    async fn unlock(&mut self, _key: String) -> Result<(), AgentError> {
        debug!("unlock requested, nothing is held locally");
        Err(other_err("unlock is not supported"))
    }
}

/// Serve agent requests on `stream` until the peer disconnects.
///
/// Requests are answered strictly in order.  A failing request is answered
/// with `SSH_AGENT_FAILURE` and the connection stays open; a framing or I/O
/// error ends this connection only.
pub async fn serve_connection<S>(stream: S, mut session: AgentSession) -> Result<(), AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut framed = Framed::new(stream, Codec::<Request, Response>::default());

    while let Some(request) = framed.try_next().await? {
        let response = match session.handle(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!("agent request failed: {e}");
                Response::Failure
            }
        };
        framed.send(response).await?;
    }

    Ok(())
}

/// True if `err` just means the client went away.
pub(crate) fn is_peer_closed(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return matches!(
                io_err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            );
        }
        current = e.source();
    }
    false
}

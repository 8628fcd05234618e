//! JSON-RPC client for the vault daemon.
//!
//! The vault listens on a local Unix socket and speaks newline-delimited
//! JSON-RPC: one request object per line, one response object per line.
//! Each call uses a fresh connection so a half-read response from an
//! abandoned call can never be attributed to the next one.
//!
//! ```text
//! → {"id":1,"method":"Vault.Sign","params":[{"name":"k1","group":"","content":"<b64>"}]}
//! ← {"id":1,"result":"<b64 signature>","error":null}
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use base64::prelude::{BASE64_STANDARD, Engine};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use crate::{VaultClient, VaultError};

const METHOD_EXPORT: &str = "Vault.ExportPublicData";
const METHOD_SIGN: &str = "Vault.Sign";

#[derive(Debug, Serialize)]
struct RpcRequest<'a, P> {
    id: u64,
    method: &'a str,
    params: [P; 1],
}

#[derive(Debug, Serialize)]
struct ExportParams<'a> {
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct SignParams<'a> {
    name: &'a str,
    group: &'a str,
    /// Base64 challenge bytes.
    content: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    id: u64,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// [`VaultClient`] over the vault daemon's Unix socket.
#[derive(Debug)]
pub struct RpcVaultClient {
    socket_path: PathBuf,
    next_id: AtomicU64,
}

impl RpcVaultClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn call<P: Serialize>(&self, method: &str, params: P) -> Result<String, VaultError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_vec(&RpcRequest {
            id,
            method,
            params: [params],
        })
        .map_err(|e| VaultError::Protocol(format!("encode request: {e}")))?;
        line.push(b'\n');

        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            VaultError::Unavailable(format!("connect {}: {e}", self.socket_path.display()))
        })?;
        let (read_half, mut write_half) = stream.into_split();

        write_half
            .write_all(&line)
            .await
            .map_err(|e| VaultError::Unavailable(format!("write request: {e}")))?;

        let mut reader = BufReader::new(read_half);
        let mut response_line = String::new();
        let n = reader
            .read_line(&mut response_line)
            .await
            .map_err(|e| VaultError::Unavailable(format!("read response: {e}")))?;
        if n == 0 {
            return Err(VaultError::Unavailable(
                "vault closed the connection without answering".to_string(),
            ));
        }

        debug!(method, id, "vault rpc answered");
        parse_response(id, &response_line)
    }
}

fn parse_response(expected_id: u64, line: &str) -> Result<String, VaultError> {
    let response: RpcResponse = serde_json::from_str(line.trim_end())
        .map_err(|e| VaultError::Protocol(format!("decode response: {e}")))?;

    if response.id != expected_id {
        return Err(VaultError::Protocol(format!(
            "response id {} does not match request id {expected_id}",
            response.id
        )));
    }
    if let Some(err) = response.error.filter(|e| !e.is_empty()) {
        return Err(VaultError::Denied(err));
    }
    response
        .result
        .ok_or_else(|| VaultError::Protocol("response has neither result nor error".to_string()))
}

#[async_trait::async_trait]
impl VaultClient for RpcVaultClient {
    async fn export_public_data(&self, name: &str) -> Result<String, VaultError> {
        self.call(METHOD_EXPORT, ExportParams { name }).await
    }

    async fn sign(&self, name: &str, group: &str, challenge: &[u8]) -> Result<Vec<u8>, VaultError> {
        let params = SignParams {
            name,
            group,
            content: BASE64_STANDARD.encode(challenge),
        };
        let encoded = self.call(METHOD_SIGN, params).await?;
        BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|e| VaultError::Protocol(format!("signature is not base64: {e}")))
    }
}

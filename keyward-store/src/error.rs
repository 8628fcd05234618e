//! Error types for the metadata store.

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The name is absent, or a group reference does not resolve.
    #[error("no secret exists with name: {0}")]
    NotFound(String),

    #[error("secret with name {0} already exists, please choose a different name")]
    AlreadyExists(String),

    /// Malformed document, bad base64, or a cyclic/over-deep group chain.
    #[error("corrupt secret store: {0}")]
    Corrupt(String),

    #[error("secret store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

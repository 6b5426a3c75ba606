//! Error taxonomy for the object store.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ObjectStoreError>;

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid type: {0}")]
    InvalidType(String),

    #[error("not an object: {0}")]
    NotAnObject(String),

    #[error("session invalid: {0}")]
    SessionInvalid(String),

    #[error("context cancelled")]
    ContextCancelled,

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ObjectStoreError {
    /// Stable error code for the wire protocol.
    pub fn code(&self) -> &'static str {
        match self {
            ObjectStoreError::NotFound(_) => "NOT_FOUND",
            ObjectStoreError::InvalidType(_) => "INVALID_TYPE",
            ObjectStoreError::NotAnObject(_) => "NOT_AN_OBJECT",
            ObjectStoreError::SessionInvalid(_) => "SESSION_INVALID",
            ObjectStoreError::ContextCancelled => "CONTEXT_CANCELLED",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Whether this is one of the two kinds the RPC Facade preserves
    /// across the boundary verbatim; everything else collapses to
    /// "internal" with a descriptive message.
    pub fn is_preserved_at_boundary(&self) -> bool {
        matches!(
            self,
            ObjectStoreError::NotFound(_) | ObjectStoreError::SessionInvalid(_)
        )
    }
}

use tallybridge_core::StorageError;
use thiserror::Error;

use crate::codec::CodecError;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("engine unreachable: {0}")]
    Transport(String),
    #[error("could not parse engine response: {0}")]
    Parse(String),
    #[error("engine rejected the import")]
    EngineRejected(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("storage error: {0}")]
    Storage(StorageError),
    #[error("write serializer is closed")]
    WriterClosed,
}

impl BridgeError {
    /// Stable identifier sent to clients in error replies.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::Transport(_) => "transport_error",
            BridgeError::Parse(_) => "parse_error",
            BridgeError::EngineRejected(_) => "engine_rejected",
            BridgeError::NotFound(_) => "not_found",
            BridgeError::Validation(_) => "validation_error",
            BridgeError::Forbidden(_) => "forbidden",
            BridgeError::Storage(_) => "storage_error",
            BridgeError::WriterClosed => "writer_closed",
        }
    }

    /// Raw engine text worth showing to the client as is.
    pub fn details(&self) -> Option<&str> {
        match self {
            BridgeError::EngineRejected(raw) => Some(raw.as_str()),
            _ => None,
        }
    }
}

impl From<StorageError> for BridgeError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::BatchNotFound(id) => BridgeError::NotFound(format!("batch {}", id)),
            StorageError::CompanyNotFound(id) => BridgeError::NotFound(format!("company {}", id)),
            other => BridgeError::Storage(other),
        }
    }
}

impl From<CodecError> for BridgeError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Parse(msg) => BridgeError::Parse(msg),
            other => BridgeError::Validation(other.to_string()),
        }
    }
}

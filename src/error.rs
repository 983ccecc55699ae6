use thiserror::Error;

use crate::store::StoreError;

/// Main error type for certificate orchestration
#[derive(Debug, Error)]
pub enum Error {
    /// A lifecycle operation is already in flight or already done
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("NotFound: {0}")]
    NotFound(String),
    /// The notification stream dropped with a transport-closing error
    #[error("TransientTransport: {0}")]
    TransientTransport(String),
    /// Resource tree construction failed and the tree was rolled back
    #[error("BuildFailure: {0}")]
    BuildFailure(String),
    /// Enrollment or distribution prerequisites are unmet
    #[error("NotReady: {0}")]
    NotReady(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Cancelled: {0}")]
    Cancelled(String),
    /// The synchronizer answered but refused the request
    #[error("Rejected: {0}")]
    Rejected(String),
    #[error("StoreError: {0}")]
    Store(#[from] StoreError),
    #[error("SynchronizerError: {0}")]
    Grpc(#[from] tonic::Status),
    #[error("TransportError: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("UnableToSerializeObject: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("UnableToCreateCertificate: {0}")]
    Certificate(#[from] rcgen::Error),
    #[error("UnableToGenerateKey: {0}")]
    KeyGeneration(String),
    #[error("UnableToDecode: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("KubernetesError: {0}")]
    Kube(#[from] kube::Error),
    #[error("InvalidConfig: {0}")]
    Config(String),
    #[error("TaskFailed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn build_failure(msg: impl Into<String>) -> Self {
        Self::BuildFailure(msg.into())
    }

    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    /// Classify a synchronizer status: the transport-closing sentinel becomes
    /// `TransientTransport`, anything else stays a gRPC error.
    pub fn from_status(status: tonic::Status) -> Self {
        if is_transport_closing(status.message()) {
            Self::TransientTransport(status.message().to_string())
        } else {
            Self::Grpc(status)
        }
    }

    /// Whether the error is the synchronizer's transport-closing sentinel
    pub fn is_transient(&self) -> bool {
        match self {
            Error::TransientTransport(_) => true,
            Error::Grpc(status) => is_transport_closing(status.message()),
            _ => false,
        }
    }
}

/// Message the synchronizer's stream produces when its connection is recycled.
pub const TRANSPORT_CLOSING: &str = "transport is closing";

pub fn is_transport_closing(message: &str) -> bool {
    message.contains(TRANSPORT_CLOSING)
}

use thiserror::Error;

use crate::transport::TransportFault;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("transport fault: {0}")]
    Transport(#[from] TransportFault),
    #[error("bundle load failed for {name}: {message}")]
    BundleLoadFailed { name: String, message: String },
    #[error("unrecognized upcall '{0}'")]
    UnrecognizedUpcall(String),
    #[error("wire decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

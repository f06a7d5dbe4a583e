use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::domain::{BackendKind, OutputEncoding};

#[derive(Debug, Error, Diagnostic)]
pub enum BinderError {
    #[error("invalid sample or variant key: {0}")]
    InvalidKey(String),

    #[error("missing config file databinder.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("backend {backend} cannot deliver {encoding} output")]
    UnsupportedCombination {
        backend: BackendKind,
        encoding: OutputEncoding,
    },

    #[error("delivery request failed: {0}")]
    Delivery(String),

    #[error("delivery backend returned status {status}: {message}")]
    DeliveryStatus { status: u16, message: String },

    #[error("transformation {request_id} ended as {status}")]
    TransformFailed { request_id: String, status: String },

    #[error("reconciliation failed: {0}")]
    Reconciliation(String),

    #[error("transcode failed: {0}")]
    Transcode(String),

    #[error("failed to write manifest: {0}")]
    ManifestWrite(String),

    #[error("failed to read manifest: {0}")]
    ManifestRead(String),

    #[error("orphan cleanup failed: {0}")]
    Cleanup(String),

    #[error("delivery task aborted: {0}")]
    TaskAborted(String),
}

impl BinderError {
    /// Errors confined to a single request; the batch keeps going after these.
    pub fn is_per_request(&self) -> bool {
        matches!(
            self,
            BinderError::Delivery(_)
                | BinderError::DeliveryStatus { .. }
                | BinderError::TransformFailed { .. }
                | BinderError::Reconciliation(_)
                | BinderError::Transcode(_)
                | BinderError::TaskAborted(_)
        )
    }
}

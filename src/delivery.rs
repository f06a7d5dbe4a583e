use std::sync::Arc;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::{BackendKind, CodegenKind, DatasetSpec, DeliveryMode, OutputEncoding};
use crate::error::BinderError;

/// Everything the backend needs to run one transformation.
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    pub dataset: &'a DatasetSpec,
    pub query: &'a str,
    pub backend: BackendKind,
    pub codegen: CodegenKind,
    pub encoding: OutputEncoding,
    pub mode: DeliveryMode,
    pub ignore_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteLocation {
    Local(Utf8PathBuf),
    Uri(String),
}

/// A result file produced by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub name: String,
    pub location: RemoteLocation,
}

impl RemoteFile {
    pub fn local(path: impl Into<Utf8PathBuf>) -> Self {
        let path = path.into();
        let name = path.file_name().unwrap_or(path.as_str()).to_string();
        Self {
            name,
            location: RemoteLocation::Local(path),
        }
    }

    pub fn uri(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: RemoteLocation::Uri(uri.into()),
        }
    }

    /// File name without its last extension. Stable across a transcode, so
    /// transcoded output is reconciled by it.
    pub fn stem(&self) -> &str {
        Utf8Path::new(&self.name).file_stem().unwrap_or(&self.name)
    }
}

/// The remote delivery backend. Implementations own timeouts and retries;
/// the orchestrator records any error as a failure for that request.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn submit(&self, submission: &Submission<'_>) -> Result<Vec<RemoteFile>, BinderError>;

    /// Materialize a file whose location is a URI.
    async fn download(&self, file: &RemoteFile, destination: &Utf8Path) -> Result<(), BinderError> {
        let _ = destination;
        Err(BinderError::Delivery(format!(
            "client cannot download {}",
            file.name
        )))
    }
}

#[async_trait]
impl<T: DeliveryClient + ?Sized> DeliveryClient for Arc<T> {
    async fn submit(&self, submission: &Submission<'_>) -> Result<Vec<RemoteFile>, BinderError> {
        (**self).submit(submission).await
    }

    async fn download(&self, file: &RemoteFile, destination: &Utf8Path) -> Result<(), BinderError> {
        (**self).download(file, destination).await
    }
}

use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::delivery::RemoteFile;
use crate::domain::{BackendKind, FetchRequest, OutputEncoding};
use crate::error::BinderError;
use crate::manifest::ManifestShape;
use crate::store::Mirror;
use crate::transcode::{ParquetToNtuple, Transcoder};

/// Everything that differs between backend kinds and output encodings.
/// One implementation per supported combination, picked once by [`select`].
pub trait DeliveryStrategy: Send + Sync {
    fn shape(&self) -> ManifestShape;

    /// Encoding requested from the backend.
    fn delivery_encoding(&self) -> OutputEncoding;

    fn target_dir(&self, mirror: &Mirror, request: &FetchRequest) -> Utf8PathBuf;

    /// File name used in the mirror for a delivered file.
    fn local_name(&self, file: &RemoteFile) -> String;

    /// Identity of a delivered file within its key directory.
    fn remote_identifier<'a>(&self, file: &'a RemoteFile) -> &'a str {
        &file.name
    }

    /// Identifier of a file already in the mirror, comparable with
    /// [`DeliveryStrategy::remote_identifier`]. `None` for names this
    /// strategy never writes.
    fn identifier(&self, local_name: &str) -> Option<String> {
        Some(local_name.to_string())
    }

    /// Whether delivered files with zero rows are dropped instead of placed.
    fn elides_empty(&self) -> bool {
        false
    }

    fn transcoder(&self) -> Option<Arc<dyn Transcoder>> {
        None
    }
}

/// Columnar files copied as delivered into `{sample}/{variant}/`.
#[derive(Debug, Clone, Copy, Default)]
pub struct VariantCopy;

impl DeliveryStrategy for VariantCopy {
    fn shape(&self) -> ManifestShape {
        ManifestShape::Nested
    }

    fn delivery_encoding(&self) -> OutputEncoding {
        OutputEncoding::Columnar
    }

    fn target_dir(&self, mirror: &Mirror, request: &FetchRequest) -> Utf8PathBuf {
        mirror.variant_dir(&request.sample, &request.variant)
    }

    fn local_name(&self, file: &RemoteFile) -> String {
        file.name.clone()
    }

    fn elides_empty(&self) -> bool {
        true
    }
}

/// Columnar deliveries transcoded into row-based ntuples in `{sample}/{variant}/`.
#[derive(Clone)]
pub struct VariantTranscode {
    transcoder: Arc<dyn Transcoder>,
}

impl VariantTranscode {
    pub fn new(transcoder: Arc<dyn Transcoder>) -> Self {
        Self { transcoder }
    }
}

impl DeliveryStrategy for VariantTranscode {
    fn shape(&self) -> ManifestShape {
        ManifestShape::Nested
    }

    fn delivery_encoding(&self) -> OutputEncoding {
        OutputEncoding::Columnar
    }

    fn target_dir(&self, mirror: &Mirror, request: &FetchRequest) -> Utf8PathBuf {
        mirror.variant_dir(&request.sample, &request.variant)
    }

    fn local_name(&self, file: &RemoteFile) -> String {
        format!("{}.{}", file.stem(), self.transcoder.extension())
    }

    fn remote_identifier<'a>(&self, file: &'a RemoteFile) -> &'a str {
        file.stem()
    }

    fn identifier(&self, local_name: &str) -> Option<String> {
        local_name
            .strip_suffix(self.transcoder.extension())
            .and_then(|rest| rest.strip_suffix('.'))
            .filter(|stem| !stem.is_empty())
            .map(str::to_string)
    }

    fn transcoder(&self) -> Option<Arc<dyn Transcoder>> {
        Some(Arc::clone(&self.transcoder))
    }
}

/// Row files delivered natively and copied into `{sample}/`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleCopy;

impl DeliveryStrategy for SampleCopy {
    fn shape(&self) -> ManifestShape {
        ManifestShape::Flat
    }

    fn delivery_encoding(&self) -> OutputEncoding {
        OutputEncoding::Row
    }

    fn target_dir(&self, mirror: &Mirror, request: &FetchRequest) -> Utf8PathBuf {
        mirror.sample_dir(&request.sample)
    }

    fn local_name(&self, file: &RemoteFile) -> String {
        file.name.clone()
    }
}

pub fn select(
    backend: BackendKind,
    encoding: OutputEncoding,
    zip_vector_columns: bool,
) -> Result<Arc<dyn DeliveryStrategy>, BinderError> {
    match (backend, encoding) {
        (BackendKind::Uproot, OutputEncoding::Columnar) => Ok(Arc::new(VariantCopy)),
        (BackendKind::Uproot, OutputEncoding::Row) => Ok(Arc::new(VariantTranscode::new(
            Arc::new(ParquetToNtuple::new(zip_vector_columns)),
        ))),
        (BackendKind::Xaod, OutputEncoding::Row) => Ok(Arc::new(SampleCopy)),
        (BackendKind::Xaod, OutputEncoding::Columnar) => {
            Err(BinderError::UnsupportedCombination { backend, encoding })
        }
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::LocalSample;
use crate::domain::{SampleKey, VariantKey};
use crate::error::BinderError;
use crate::store::write_bytes_atomic;

pub const MANIFEST_EXTENSION: &str = "json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestShape {
    /// sample -> variant -> files
    Nested,
    /// sample -> files
    Flat,
}

pub type FileSet = BTreeSet<Utf8PathBuf>;

/// Final local file locations for one delivery run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Manifest {
    Nested(BTreeMap<SampleKey, BTreeMap<VariantKey, FileSet>>),
    Flat(BTreeMap<SampleKey, FileSet>),
}

impl Manifest {
    pub fn new(shape: ManifestShape) -> Self {
        match shape {
            ManifestShape::Nested => Manifest::Nested(BTreeMap::new()),
            ManifestShape::Flat => Manifest::Flat(BTreeMap::new()),
        }
    }

    pub fn shape(&self) -> ManifestShape {
        match self {
            Manifest::Nested(_) => ManifestShape::Nested,
            Manifest::Flat(_) => ManifestShape::Flat,
        }
    }

    /// Union `paths` into the entry for the key, creating it if absent.
    /// The variant is ignored for flat manifests.
    pub fn extend<I>(&mut self, sample: &SampleKey, variant: &VariantKey, paths: I)
    where
        I: IntoIterator<Item = Utf8PathBuf>,
    {
        let entry = match self {
            Manifest::Nested(samples) => samples
                .entry(sample.clone())
                .or_default()
                .entry(variant.clone())
                .or_default(),
            Manifest::Flat(samples) => samples.entry(sample.clone()).or_default(),
        };
        entry.extend(paths);
    }

    pub fn contains_sample(&self, sample: &SampleKey) -> bool {
        match self {
            Manifest::Nested(samples) => samples.contains_key(sample),
            Manifest::Flat(samples) => samples.contains_key(sample),
        }
    }

    /// Files recorded for a key. Flat manifests ignore `variant`.
    pub fn files(&self, sample: &SampleKey, variant: Option<&VariantKey>) -> Option<&FileSet> {
        match self {
            Manifest::Nested(samples) => {
                let variants = samples.get(sample)?;
                variants.get(variant?)
            }
            Manifest::Flat(samples) => samples.get(sample),
        }
    }

    pub fn file_count(&self) -> usize {
        match self {
            Manifest::Nested(samples) => samples
                .values()
                .flat_map(|variants| variants.values())
                .map(BTreeSet::len)
                .sum(),
            Manifest::Flat(samples) => samples.values().map(BTreeSet::len).sum(),
        }
    }

    /// Add samples whose files already live on disk. Their regular files are
    /// listed by absolute path; an unreadable directory is logged and
    /// contributes an empty entry.
    pub fn add_local_samples(&mut self, samples: &[LocalSample]) -> Result<(), BinderError> {
        for local in samples {
            if self.shape() == ManifestShape::Nested && local.variant.is_none() {
                return Err(BinderError::InvalidConfig(format!(
                    "local sample {} needs a variant",
                    local.sample
                )));
            }
            let files = match list_local_files(&local.directory) {
                Ok(files) => files,
                Err(err) => {
                    warn!(sample = %local.sample, directory = %local.directory, error = %err, "cannot list local sample");
                    Vec::new()
                }
            };
            debug!(sample = %local.sample, count = files.len(), "adding local sample");
            match (&mut *self, &local.variant) {
                (Manifest::Nested(samples), Some(variant)) => samples
                    .entry(local.sample.clone())
                    .or_default()
                    .entry(variant.clone())
                    .or_default()
                    .extend(files),
                (Manifest::Flat(samples), _) => samples
                    .entry(local.sample.clone())
                    .or_default()
                    .extend(files),
                (Manifest::Nested(_), None) => {}
            }
        }
        Ok(())
    }

    pub fn document_path(root: &Utf8Path, name: &str) -> Utf8PathBuf {
        root.join(format!("{name}.{MANIFEST_EXTENSION}"))
    }

    /// Write the manifest to `{root}/{name}.json`, or, without a name, remove
    /// any manifest documents left in `root` by earlier runs.
    pub fn persist(
        &self,
        root: &Utf8Path,
        name: Option<&str>,
    ) -> Result<Option<Utf8PathBuf>, BinderError> {
        let Some(name) = name else {
            remove_stale_documents(root)?;
            return Ok(None);
        };
        let path = Self::document_path(root, name);
        let content = serde_json::to_vec_pretty(self)
            .map_err(|err| BinderError::ManifestWrite(err.to_string()))?;
        write_bytes_atomic(&path, &content)
            .map_err(|err| BinderError::ManifestWrite(format!("{path}: {err}")))?;
        info!(path = %path, "wrote manifest of delivered file paths");
        Ok(Some(path))
    }

    pub fn load(path: &Utf8Path, shape: ManifestShape) -> Result<Self, BinderError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| BinderError::ManifestRead(format!("{path}: {err}")))?;
        let manifest = match shape {
            ManifestShape::Nested => serde_json::from_str(&content).map(Manifest::Nested),
            ManifestShape::Flat => serde_json::from_str(&content).map(Manifest::Flat),
        };
        manifest.map_err(|err| BinderError::ManifestRead(format!("{path}: {err}")))
    }
}

/// Shared accumulator updated by every completed request of a batch.
#[derive(Debug)]
pub struct ManifestBuilder {
    inner: Mutex<Manifest>,
}

impl ManifestBuilder {
    pub fn new(shape: ManifestShape) -> Self {
        Self {
            inner: Mutex::new(Manifest::new(shape)),
        }
    }

    pub fn extend<I>(&self, sample: &SampleKey, variant: &VariantKey, paths: I)
    where
        I: IntoIterator<Item = Utf8PathBuf>,
    {
        self.inner.lock().extend(sample, variant, paths);
    }

    pub fn snapshot(&self) -> Manifest {
        self.inner.lock().clone()
    }

    pub fn finish(self) -> Manifest {
        self.inner.into_inner()
    }
}

/// Regular files of `directory`, as absolute paths so they compare equal to
/// mirror paths under the canonical output root.
fn list_local_files(directory: &Utf8Path) -> std::io::Result<Vec<Utf8PathBuf>> {
    let directory = fs::canonicalize(directory.as_std_path())?;
    let mut files = Vec::new();
    for entry in fs::read_dir(&directory)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn remove_stale_documents(root: &Utf8Path) -> Result<(), BinderError> {
    let entries = match fs::read_dir(root.as_std_path()) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(BinderError::ManifestWrite(format!("{root}: {err}"))),
    };
    for entry in entries {
        let entry = entry.map_err(|err| BinderError::ManifestWrite(err.to_string()))?;
        let path = entry.path();
        let is_document = path.is_file()
            && path
                .extension()
                .map(|ext| ext == MANIFEST_EXTENSION)
                .unwrap_or(false);
        if is_document {
            debug!(path = %path.display(), "removing stale manifest");
            fs::remove_file(&path).map_err(|err| {
                BinderError::ManifestWrite(format!("remove {}: {err}", path.display()))
            })?;
        }
    }
    Ok(())
}

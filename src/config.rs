use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{DeliveryMode, OutputEncoding, SampleKey, VariantKey};
use crate::error::BinderError;

pub const DEFAULT_CONCURRENCY: usize = 50;
pub const DEFAULT_OUTPUT_ROOT: &str = "ServiceXData";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressGranularity {
    #[default]
    PerRequest,
    Aggregate,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    #[serde(default)]
    pub output_root: Option<String>,
    #[serde(default)]
    pub output_encoding: Option<OutputEncoding>,
    #[serde(default)]
    pub delivery_mode: Option<DeliveryMode>,
    #[serde(default)]
    pub ignore_cache: bool,
    #[serde(default)]
    pub manifest_name: Option<String>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub progress: Option<ProgressGranularity>,
    #[serde(default)]
    pub zip_vector_columns: bool,
    #[serde(default)]
    pub local_samples: Vec<LocalSampleEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LocalSampleEntry {
    pub name: String,
    #[serde(default)]
    pub variant: Option<String>,
    pub path: String,
}

/// A sample whose files already live on disk and are listed in the manifest
/// without being fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSample {
    pub sample: SampleKey,
    pub variant: Option<VariantKey>,
    pub directory: Utf8PathBuf,
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub output_root: Utf8PathBuf,
    pub output_encoding: OutputEncoding,
    pub delivery_mode: DeliveryMode,
    pub ignore_cache: bool,
    pub manifest_name: Option<String>,
    pub concurrency: usize,
    pub progress: ProgressGranularity,
    pub zip_vector_columns: bool,
    pub local_samples: Vec<LocalSample>,
}

impl DeliveryConfig {
    pub fn new(output_root: impl Into<Utf8PathBuf>, output_encoding: OutputEncoding) -> Self {
        Self {
            output_root: output_root.into(),
            output_encoding,
            delivery_mode: DeliveryMode::default(),
            ignore_cache: false,
            manifest_name: None,
            concurrency: DEFAULT_CONCURRENCY,
            progress: ProgressGranularity::default(),
            zip_vector_columns: false,
            local_samples: Vec::new(),
        }
    }

    pub fn with_manifest_name(mut self, name: impl Into<String>) -> Self {
        self.manifest_name = Some(name.into());
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_progress(mut self, progress: ProgressGranularity) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_zip_vector_columns(mut self, enabled: bool) -> Self {
        self.zip_vector_columns = enabled;
        self
    }

    pub fn with_local_sample(mut self, sample: LocalSample) -> Self {
        self.local_samples.push(sample);
        self
    }

    pub fn validate(&self) -> Result<(), BinderError> {
        if self.concurrency == 0 {
            return Err(BinderError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if let Some(name) = &self.manifest_name {
            let is_plain = !name.trim().is_empty()
                && !name.contains('/')
                && !name.contains('\\')
                && name != ".."
                && name != ".";
            if !is_plain {
                return Err(BinderError::InvalidConfig(format!(
                    "manifest name must be a plain file name: {name}"
                )));
            }
        }
        Ok(())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<DeliveryConfig, BinderError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("databinder.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(BinderError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| BinderError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| BinderError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<DeliveryConfig, BinderError> {
        let local_samples = config
            .local_samples
            .into_iter()
            .map(|entry| -> Result<LocalSample, BinderError> {
                Ok(LocalSample {
                    sample: entry.name.parse()?,
                    variant: entry.variant.map(|value| value.parse()).transpose()?,
                    directory: Utf8PathBuf::from(entry.path),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let resolved = DeliveryConfig {
            output_root: Utf8PathBuf::from(
                config
                    .output_root
                    .unwrap_or_else(|| DEFAULT_OUTPUT_ROOT.to_string()),
            ),
            output_encoding: config.output_encoding.unwrap_or(OutputEncoding::Columnar),
            delivery_mode: config.delivery_mode.unwrap_or_default(),
            ignore_cache: config.ignore_cache,
            manifest_name: config.manifest_name,
            concurrency: config.concurrency.unwrap_or(DEFAULT_CONCURRENCY),
            progress: config.progress.unwrap_or_default(),
            zip_vector_columns: config.zip_vector_columns,
            local_samples,
        };
        resolved.validate()?;
        Ok(resolved)
    }
}

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::BinderError;

static KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.+-]*$").expect("valid key regex"));

fn parse_key(value: &str) -> Result<String, BinderError> {
    let trimmed = value.trim();
    if !KEY_PATTERN.is_match(trimmed) {
        return Err(BinderError::InvalidKey(value.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Name of a logical sample; also the first directory level of the mirror.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SampleKey(String);

impl SampleKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SampleKey {
    type Err = BinderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self(parse_key(value)?))
    }
}

impl TryFrom<String> for SampleKey {
    type Error = BinderError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SampleKey> for String {
    fn from(value: SampleKey) -> Self {
        value.0
    }
}

/// Name of a sub-division of a sample (a tree/record collection).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VariantKey(String);

impl VariantKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VariantKey {
    type Err = BinderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self(parse_key(value)?))
    }
}

impl TryFrom<String> for VariantKey {
    type Error = BinderError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VariantKey> for String {
    fn from(value: VariantKey) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Uproot,
    Xaod,
}

impl BackendKind {
    /// Whether results are split per variant on disk and in the manifest.
    pub fn has_variant_axis(self) -> bool {
        matches!(self, BackendKind::Uproot)
    }

    pub fn native_encoding(self) -> OutputEncoding {
        match self {
            BackendKind::Uproot => OutputEncoding::Columnar,
            BackendKind::Xaod => OutputEncoding::Row,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Uproot => write!(f, "uproot"),
            BackendKind::Xaod => write!(f, "xaod"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodegenKind {
    Uproot,
    Python,
    Atlasr21,
}

impl fmt::Display for CodegenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodegenKind::Uproot => write!(f, "uproot"),
            CodegenKind::Python => write!(f, "python"),
            CodegenKind::Atlasr21 => write!(f, "atlasr21"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputEncoding {
    #[serde(alias = "parquet")]
    Columnar,
    #[serde(alias = "root")]
    Row,
}

impl OutputEncoding {
    /// Value of the `result-format` field sent to the backend.
    pub fn result_format(self) -> &'static str {
        match self {
            OutputEncoding::Columnar => "parquet",
            OutputEncoding::Row => "root-file",
        }
    }
}

impl fmt::Display for OutputEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputEncoding::Columnar => write!(f, "columnar"),
            OutputEncoding::Row => write!(f, "row"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    LocalPath,
    #[default]
    LocalCache,
    ObjectStore,
}

impl DeliveryMode {
    pub fn result_destination(self) -> &'static str {
        match self {
            DeliveryMode::LocalPath => "volume",
            DeliveryMode::LocalCache | DeliveryMode::ObjectStore => "object-store",
        }
    }
}

/// Remote dataset identifier: a single dataset id or an explicit file list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DatasetSpec {
    Single(String),
    Files(Vec<String>),
}

impl fmt::Display for DatasetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetSpec::Single(did) => write!(f, "{did}"),
            DatasetSpec::Files(files) => write!(f, "{}", files.join(",")),
        }
    }
}

/// One unit of work for the scheduler. Several requests may share a
/// (sample, variant) key; their files are merged into one mirror entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub sample: SampleKey,
    pub variant: VariantKey,
    pub dataset: DatasetSpec,
    pub query: String,
    pub backend: BackendKind,
    pub codegen: CodegenKind,
}

impl FetchRequest {
    pub fn label(&self) -> String {
        if self.backend.has_variant_axis() {
            format!("{} - {}", self.sample, self.variant)
        } else {
            self.sample.to_string()
        }
    }
}

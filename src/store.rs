use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::{Builder, TempPath};
use tracing::debug;

use crate::domain::{SampleKey, VariantKey};

/// On-disk layout of the local mirror rooted at the output directory.
#[derive(Debug, Clone)]
pub struct Mirror {
    root: Utf8PathBuf,
}

impl Mirror {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn sample_dir(&self, sample: &SampleKey) -> Utf8PathBuf {
        self.root.join(sample.as_str())
    }

    pub fn variant_dir(&self, sample: &SampleKey, variant: &VariantKey) -> Utf8PathBuf {
        self.sample_dir(sample).join(variant.as_str())
    }

    pub fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(self.root.as_std_path())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Linked,
    Copied,
    AlreadyPresent,
}

pub async fn ensure_dir(dir: &Utf8Path) -> io::Result<()> {
    tokio::fs::create_dir_all(dir.as_std_path()).await
}

/// Names of regular files in `dir`. In-progress copies (dot-prefixed) are
/// skipped unless `include_hidden` is set. A missing directory lists as empty.
pub async fn list_file_names(dir: &Utf8Path, include_hidden: bool) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir.as_std_path()).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(names),
        Err(err) => return Err(err),
    };
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !include_hidden && name.starts_with('.') {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

/// Names of subdirectories of `dir`.
pub async fn list_dir_names(dir: &Utf8Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir.as_std_path()).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(names),
        Err(err) => return Err(err),
    };
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        if let Ok(name) = entry.file_name().into_string() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Put `source` at `dest`, hard-linking when possible and copying otherwise.
/// An existing `dest` (e.g. placed concurrently by a sibling request) is kept.
pub async fn place_file(source: &Utf8Path, dest: &Utf8Path) -> io::Result<Placement> {
    match tokio::fs::hard_link(source.as_std_path(), dest.as_std_path()).await {
        Ok(()) => {
            debug!(source = %source, dest = %dest, "linked");
            return Ok(Placement::Linked);
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            return Ok(Placement::AlreadyPresent);
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(err),
        Err(_) => {}
    }

    let parent = dest
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let staged = staging_path(parent)?;
    tokio::fs::copy(source.as_std_path(), &staged).await?;
    staged.persist(dest.as_std_path()).map_err(|err| err.error)?;
    debug!(source = %source, dest = %dest, "copied");
    Ok(Placement::Copied)
}

/// Fresh hidden file in `dir` for a file being materialized. Removed on drop
/// unless persisted.
pub fn staging_path(dir: &Utf8Path) -> io::Result<TempPath> {
    Ok(Builder::new()
        .prefix(".databinder")
        .suffix(".partial")
        .tempfile_in(dir.as_std_path())?
        .into_temp_path())
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent.as_std_path())?;
    let mut temp = Builder::new()
        .prefix(".databinder")
        .tempfile_in(parent.as_std_path())?;
    io::Write::write_all(&mut temp, content)?;
    temp.persist(path.as_std_path()).map_err(|err| err.error)?;
    Ok(())
}

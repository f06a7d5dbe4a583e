//! Removal of mirror content that the final manifest no longer references.
//!
//! Cleanup only ever deletes local files and directories; the manifest is the
//! reference set and is never modified, so a run can be repeated safely.
//! Keys that had a failed request in the batch are protected and left as-is.

use std::collections::HashSet;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{SampleKey, VariantKey};
use crate::error::BinderError;
use crate::manifest::{FileSet, Manifest};
use crate::store;

/// A (sample, variant) key whose directory must not be touched.
/// `variant` is `None` for flat manifests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtectedKey {
    pub sample: SampleKey,
    pub variant: Option<VariantKey>,
}

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed_dirs: Vec<Utf8PathBuf>,
    pub removed_files: Vec<Utf8PathBuf>,
    pub errors: Vec<BinderError>,
    pub cancelled: bool,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && !self.cancelled
    }
}

/// Background cleanup started after the manifest is finalized. Await it with
/// [`CleanupHandle::join`], stop it with [`CleanupHandle::cancel`], or drop it
/// to let it finish on its own. Until it finishes, the output directory may
/// still contain files the manifest does not list.
#[derive(Debug)]
pub struct CleanupHandle {
    task: JoinHandle<CleanupReport>,
    cancel: CancellationToken,
}

impl CleanupHandle {
    pub fn spawn(root: Utf8PathBuf, manifest: Manifest, protected: HashSet<ProtectedKey>) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let report = remove_orphans(&root, &manifest, &protected, &token).await;
            info!(
                dirs = report.removed_dirs.len(),
                files = report.removed_files.len(),
                errors = report.errors.len(),
                "orphan cleanup finished"
            );
            report
        });
        Self { task, cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> CleanupReport {
        match self.task.await {
            Ok(report) => report,
            Err(err) => CleanupReport {
                errors: vec![BinderError::Cleanup(format!("cleanup task failed: {err}"))],
                cancelled: err.is_cancelled(),
                ..CleanupReport::default()
            },
        }
    }
}

pub async fn remove_orphans(
    root: &Utf8Path,
    manifest: &Manifest,
    protected: &HashSet<ProtectedKey>,
    cancel: &CancellationToken,
) -> CleanupReport {
    let mut sweep = Sweep {
        manifest,
        protected,
        cancel,
        report: CleanupReport::default(),
    };
    sweep.run(root).await;
    sweep.report
}

struct Sweep<'a> {
    manifest: &'a Manifest,
    protected: &'a HashSet<ProtectedKey>,
    cancel: &'a CancellationToken,
    report: CleanupReport,
}

impl Sweep<'_> {
    async fn run(&mut self, root: &Utf8Path) {
        let Some(samples) = self.list_dirs(root).await else {
            return;
        };
        for name in samples {
            let dir = root.join(&name);
            let Ok(sample) = name.parse::<SampleKey>() else {
                self.remove_dir(&dir).await;
                continue;
            };
            match self.manifest {
                Manifest::Nested(_) => self.sweep_nested_sample(&sample, &dir).await,
                Manifest::Flat(_) => self.sweep_flat_sample(&sample, &dir).await,
            }
            if self.report.cancelled {
                return;
            }
        }
    }

    async fn sweep_nested_sample(&mut self, sample: &SampleKey, dir: &Utf8Path) {
        let has_protected = self.protected.iter().any(|key| &key.sample == sample);
        if !self.manifest.contains_sample(sample) && !has_protected {
            self.remove_dir(dir).await;
            return;
        }

        // Nested manifests list nothing at sample level.
        self.sweep_files(dir, None).await;

        let Some(variants) = self.list_dirs(dir).await else {
            return;
        };
        for name in variants {
            let variant_dir = dir.join(&name);
            let Ok(variant) = name.parse::<VariantKey>() else {
                self.remove_dir(&variant_dir).await;
                continue;
            };
            let key = ProtectedKey {
                sample: sample.clone(),
                variant: Some(variant.clone()),
            };
            if self.protected.contains(&key) {
                debug!(dir = %variant_dir, "skipping key with failed requests");
                continue;
            }
            match self.manifest.files(sample, Some(&variant)) {
                Some(expected) => self.sweep_key_dir(&variant_dir, expected).await,
                None => self.remove_dir(&variant_dir).await,
            }
            if self.report.cancelled {
                return;
            }
        }
    }

    async fn sweep_flat_sample(&mut self, sample: &SampleKey, dir: &Utf8Path) {
        let key = ProtectedKey {
            sample: sample.clone(),
            variant: None,
        };
        if self.protected.contains(&key) {
            debug!(dir = %dir, "skipping key with failed requests");
            return;
        }
        match self.manifest.files(sample, None) {
            Some(expected) => self.sweep_key_dir(dir, expected).await,
            None => self.remove_dir(dir).await,
        }
    }

    /// Delete every file and subdirectory of a key directory not in `expected`.
    async fn sweep_key_dir(&mut self, dir: &Utf8Path, expected: &FileSet) {
        self.sweep_files(dir, Some(expected)).await;
        let Some(subdirs) = self.list_dirs(dir).await else {
            return;
        };
        for name in subdirs {
            self.remove_dir(&dir.join(name)).await;
        }
    }

    async fn sweep_files(&mut self, dir: &Utf8Path, expected: Option<&FileSet>) {
        let names = match store::list_file_names(dir, true).await {
            Ok(names) => names,
            Err(err) => {
                self.error(format!("list {dir}: {err}"));
                return;
            }
        };
        for name in names {
            let path = dir.join(name);
            if expected.is_some_and(|files| files.contains(&path)) {
                continue;
            }
            self.remove_file(&path).await;
        }
    }

    async fn list_dirs(&mut self, dir: &Utf8Path) -> Option<Vec<String>> {
        match store::list_dir_names(dir).await {
            Ok(names) => Some(names),
            Err(err) => {
                self.error(format!("list {dir}: {err}"));
                None
            }
        }
    }

    fn should_stop(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            self.report.cancelled = true;
        }
        self.report.cancelled
    }

    async fn remove_dir(&mut self, dir: &Utf8Path) {
        if self.should_stop() {
            return;
        }
        debug!(dir = %dir, "deleting directory not in manifest");
        match tokio::fs::remove_dir_all(dir.as_std_path()).await {
            Ok(()) => self.report.removed_dirs.push(dir.to_path_buf()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => self.error(format!("remove {dir}: {err}")),
        }
    }

    async fn remove_file(&mut self, path: &Utf8Path) {
        if self.should_stop() {
            return;
        }
        debug!(path = %path, "deleting file not in manifest");
        match tokio::fs::remove_file(path.as_std_path()).await {
            Ok(()) => self.report.removed_files.push(path.to_path_buf()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => self.error(format!("remove {path}: {err}")),
        }
    }

    fn error(&mut self, message: String) {
        warn!(error = %message, "orphan cleanup");
        self.report.errors.push(BinderError::Cleanup(message));
    }
}

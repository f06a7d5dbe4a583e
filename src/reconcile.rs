use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::delivery::{DeliveryClient, RemoteFile, RemoteLocation};
use crate::domain::FetchRequest;
use crate::error::BinderError;
use crate::manifest::ManifestBuilder;
use crate::store::{self, Mirror, Placement};
use crate::strategy::DeliveryStrategy;
use crate::transcode::{self, TranscodeOutcome};

/// What one reconciliation did to the mirror.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Files newly linked, copied or transcoded into the mirror.
    pub placed: usize,
    /// Files already present and left untouched.
    pub skipped: usize,
    /// Sources with no rows, dropped instead of placed.
    pub elided: usize,
    /// Local paths contributed to the manifest.
    pub paths: Vec<Utf8PathBuf>,
}

/// Brings a key's mirror directory up to date with one request's result and
/// records the contributed paths. Never deletes: files from sibling requests
/// sharing the key are left for the batch-wide orphan cleanup.
#[derive(Clone)]
pub struct Reconciler {
    mirror: Mirror,
    strategy: Arc<dyn DeliveryStrategy>,
    manifest: Arc<ManifestBuilder>,
}

impl Reconciler {
    pub fn new(
        mirror: Mirror,
        strategy: Arc<dyn DeliveryStrategy>,
        manifest: Arc<ManifestBuilder>,
    ) -> Self {
        Self {
            mirror,
            strategy,
            manifest,
        }
    }

    pub async fn reconcile(
        &self,
        client: &dyn DeliveryClient,
        request: &FetchRequest,
        files: &[RemoteFile],
    ) -> Result<ReconcileOutcome, BinderError> {
        let target = self.strategy.target_dir(&self.mirror, request);
        store::ensure_dir(&target)
            .await
            .map_err(|err| BinderError::Reconciliation(format!("create {target}: {err}")))?;

        let mut remote: BTreeMap<&str, &RemoteFile> = BTreeMap::new();
        for file in files {
            match remote.entry(self.strategy.remote_identifier(file)) {
                Entry::Vacant(slot) => {
                    slot.insert(file);
                }
                Entry::Occupied(slot) if slot.get().location == file.location => {}
                Entry::Occupied(slot) => {
                    return Err(BinderError::Reconciliation(format!(
                        "{} and {} both map to {} in {target}",
                        slot.get().name,
                        file.name,
                        slot.key()
                    )));
                }
            }
        }

        let local: HashSet<String> = store::list_file_names(&target, false)
            .await
            .map_err(|err| BinderError::Reconciliation(format!("list {target}: {err}")))?
            .iter()
            .filter_map(|name| self.strategy.identifier(name))
            .collect();

        let mut outcome = ReconcileOutcome::default();
        for (id, file) in remote {
            let dest = target.join(self.strategy.local_name(file));
            if local.contains(id) {
                outcome.skipped += 1;
                outcome.paths.push(dest);
                continue;
            }
            if self.materialize(client, request, file, &dest).await? {
                outcome.placed += 1;
                outcome.paths.push(dest);
            } else {
                outcome.elided += 1;
            }
        }

        debug!(
            key = %request.label(),
            placed = outcome.placed,
            skipped = outcome.skipped,
            elided = outcome.elided,
            "reconciled"
        );
        self.manifest
            .extend(&request.sample, &request.variant, outcome.paths.iter().cloned());
        Ok(outcome)
    }

    /// Returns false when the file was elided rather than written.
    async fn materialize(
        &self,
        client: &dyn DeliveryClient,
        request: &FetchRequest,
        file: &RemoteFile,
        dest: &Utf8Path,
    ) -> Result<bool, BinderError> {
        let mut staged = None;
        let source = match &file.location {
            RemoteLocation::Local(path) => path.clone(),
            RemoteLocation::Uri(_) => {
                let dir = dest.parent().unwrap_or(self.mirror.root());
                let temp = store::staging_path(dir)
                    .map_err(|err| BinderError::Reconciliation(format!("stage {dest}: {err}")))?;
                let path = Utf8Path::from_path(&temp)
                    .ok_or_else(|| {
                        BinderError::Reconciliation(format!("non-utf8 staging path for {dest}"))
                    })?
                    .to_path_buf();
                client.download(file, &path).await?;
                staged = Some(temp);
                path
            }
        };

        if let Some(transcoder) = self.strategy.transcoder() {
            let container = request.variant.to_string();
            let dst = dest.to_path_buf();
            let outcome = tokio::task::spawn_blocking(move || {
                transcoder.transcode(&container, &source, &dst)
            })
            .await
            .map_err(|err| BinderError::Transcode(err.to_string()))??;
            return Ok(matches!(outcome, TranscodeOutcome::Written { .. }));
        }

        if self.strategy.elides_empty() {
            let src = source.clone();
            let rows = tokio::task::spawn_blocking(move || transcode::parquet_row_count(&src))
                .await
                .map_err(|err| BinderError::Transcode(err.to_string()))??;
            if rows == 0 {
                debug!(source = %source, "no rows, not placed");
                return Ok(false);
            }
        }

        match staged {
            Some(temp) => temp
                .persist(dest.as_std_path())
                .map(|()| true)
                .map_err(|err| BinderError::Reconciliation(format!("place {dest}: {}", err.error))),
            None => store::place_file(&source, dest)
                .await
                .map(|placement| {
                    if placement == Placement::AlreadyPresent {
                        debug!(dest = %dest, "placed concurrently by a sibling request");
                    }
                    true
                })
                .map_err(|err| {
                    BinderError::Reconciliation(format!("place {source} -> {dest}: {err}"))
                }),
        }
    }
}

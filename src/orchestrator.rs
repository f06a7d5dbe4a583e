use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cleanup::{CleanupHandle, ProtectedKey};
use crate::config::{DeliveryConfig, ProgressGranularity};
use crate::delivery::{DeliveryClient, Submission};
use crate::domain::{BackendKind, FetchRequest};
use crate::error::BinderError;
use crate::manifest::{Manifest, ManifestBuilder, ManifestShape};
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::store::Mirror;
use crate::strategy::{self, DeliveryStrategy};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

/// A request that did not complete, kept alongside the partial manifest.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub request: FetchRequest,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl FailureRecord {
    fn new(request: FetchRequest, error: &BinderError) -> Self {
        Self {
            request,
            error: error.to_string(),
            failed_at: Utc::now(),
        }
    }
}

#[derive(Debug)]
pub struct DeliveryReport {
    pub manifest: Manifest,
    pub manifest_path: Option<Utf8PathBuf>,
    pub failures: Vec<FailureRecord>,
    /// Orphan cleanup runs in the background once the manifest is written.
    /// Until it is joined, stale files may still be visible in the output root.
    pub cleanup: CleanupHandle,
}

impl DeliveryReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs one delivery batch: concurrent fetches, mirror reconciliation,
/// manifest persistence and orphan cleanup.
pub struct Orchestrator<C: DeliveryClient + 'static> {
    client: Arc<C>,
    config: DeliveryConfig,
    backend: BackendKind,
    strategy: Arc<dyn DeliveryStrategy>,
    mirror: Mirror,
    gate: Arc<Semaphore>,
}

struct TaskContext<C: DeliveryClient + 'static> {
    client: Arc<C>,
    gate: Arc<Semaphore>,
    reconciler: Reconciler,
    config: DeliveryConfig,
    strategy: Arc<dyn DeliveryStrategy>,
}

impl<C: DeliveryClient + 'static> Orchestrator<C> {
    pub fn new(client: C, config: DeliveryConfig, backend: BackendKind) -> Result<Self, BinderError> {
        let strategy =
            strategy::select(backend, config.output_encoding, config.zip_vector_columns)?;
        Self::with_strategy(client, config, backend, strategy)
    }

    pub fn with_strategy(
        client: C,
        config: DeliveryConfig,
        backend: BackendKind,
        strategy: Arc<dyn DeliveryStrategy>,
    ) -> Result<Self, BinderError> {
        config.validate()?;
        if strategy.shape() == ManifestShape::Nested {
            if let Some(local) = config.local_samples.iter().find(|s| s.variant.is_none()) {
                return Err(BinderError::InvalidConfig(format!(
                    "local sample {} needs a variant for {backend} output",
                    local.sample
                )));
            }
        }

        let root = Mirror::new(config.output_root.clone());
        root.ensure_root().map_err(|err| {
            BinderError::InvalidConfig(format!("cannot create {}: {err}", config.output_root))
        })?;
        let absolute = std::fs::canonicalize(root.root().as_std_path())
            .map_err(|err| BinderError::InvalidConfig(err.to_string()))
            .and_then(|path| {
                Utf8PathBuf::from_path_buf(path).map_err(|_| {
                    BinderError::InvalidConfig("non-utf8 output directory".to_string())
                })
            })?;

        Ok(Self {
            client: Arc::new(client),
            gate: Arc::new(Semaphore::new(config.concurrency)),
            config,
            backend,
            strategy,
            mirror: Mirror::new(absolute),
        })
    }

    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    pub fn shape(&self) -> ManifestShape {
        self.strategy.shape()
    }

    /// Deliver every request and return the manifest with the failures.
    /// Only a failure to persist the manifest is returned as an error.
    pub async fn deliver(
        &self,
        requests: Vec<FetchRequest>,
        sink: &dyn ProgressSink,
    ) -> Result<DeliveryReport, BinderError> {
        let started = Instant::now();
        let total = requests.len();
        info!(backend = %self.backend, requests = total, "starting delivery");

        let builder = Arc::new(ManifestBuilder::new(self.strategy.shape()));
        let context = Arc::new(TaskContext {
            client: Arc::clone(&self.client),
            gate: Arc::clone(&self.gate),
            reconciler: Reconciler::new(
                self.mirror.clone(),
                Arc::clone(&self.strategy),
                Arc::clone(&builder),
            ),
            config: self.config.clone(),
            strategy: Arc::clone(&self.strategy),
        });

        let mut failures = Vec::new();
        let mut pending = BTreeMap::new();
        let mut tasks = JoinSet::new();
        let mut progress = Progress::new(total, self.config.progress);

        for (index, request) in requests.into_iter().enumerate() {
            debug!(key = %request.label(), dataset = %request.dataset, "queued");
            if request.backend != self.backend {
                let err = BinderError::InvalidConfig(format!(
                    "request for {} targets {} but this delivery uses {}",
                    request.label(),
                    request.backend,
                    self.backend
                ));
                progress.failed(sink, &request, &err);
                failures.push(FailureRecord::new(request, &err));
                continue;
            }
            pending.insert(index, request.clone());
            let context = Arc::clone(&context);
            tasks.spawn(async move {
                let outcome = run_request(&context, &request).await;
                (index, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (index, outcome) = match joined {
                Ok(done) => done,
                Err(err) => {
                    warn!(error = %err, "delivery task did not complete");
                    continue;
                }
            };
            let Some(request) = pending.remove(&index) else {
                continue;
            };
            match outcome {
                Ok(outcome) => progress.delivered(sink, &request, &outcome),
                Err(err) => {
                    progress.failed(sink, &request, &err);
                    failures.push(FailureRecord::new(request, &err));
                }
            }
        }

        for request in pending.into_values() {
            let err = BinderError::TaskAborted(request.label());
            progress.failed(sink, &request, &err);
            failures.push(FailureRecord::new(request, &err));
        }

        drop(context);
        let mut manifest = match Arc::try_unwrap(builder) {
            Ok(builder) => builder.finish(),
            Err(shared) => shared.snapshot(),
        };
        manifest.add_local_samples(&self.config.local_samples)?;

        let manifest_path =
            manifest.persist(self.mirror.root(), self.config.manifest_name.as_deref())?;

        let protected = failures
            .iter()
            .map(|failure| ProtectedKey {
                sample: failure.request.sample.clone(),
                variant: match manifest.shape() {
                    ManifestShape::Nested => Some(failure.request.variant.clone()),
                    ManifestShape::Flat => None,
                },
            })
            .collect::<HashSet<_>>();
        let cleanup =
            CleanupHandle::spawn(self.mirror.root().to_path_buf(), manifest.clone(), protected);

        let elapsed = started.elapsed();
        sink.event(ProgressEvent {
            message: format!(
                "delivery finished: {} of {total} requests delivered, {} files",
                total - failures.len(),
                manifest.file_count()
            ),
            elapsed: Some(elapsed),
        });
        info!(
            delivered = total - failures.len(),
            failed = failures.len(),
            files = manifest.file_count(),
            elapsed_ms = elapsed.as_millis() as u64,
            "delivery finished"
        );

        Ok(DeliveryReport {
            manifest,
            manifest_path,
            failures,
            cleanup,
        })
    }
}

async fn run_request<C: DeliveryClient + 'static>(
    context: &TaskContext<C>,
    request: &FetchRequest,
) -> Result<ReconcileOutcome, BinderError> {
    let submission = Submission {
        dataset: &request.dataset,
        query: &request.query,
        backend: request.backend,
        codegen: request.codegen,
        encoding: context.strategy.delivery_encoding(),
        mode: context.config.delivery_mode,
        ignore_cache: context.config.ignore_cache,
    };

    let files = {
        let _permit = context
            .gate
            .acquire()
            .await
            .map_err(|err| BinderError::TaskAborted(err.to_string()))?;
        debug!(key = %request.label(), "submitting");
        context.client.submit(&submission).await?
    };

    context
        .reconciler
        .reconcile(context.client.as_ref(), request, &files)
        .await
}

struct Progress {
    total: usize,
    done: usize,
    failed: usize,
    granularity: ProgressGranularity,
    started: Instant,
}

impl Progress {
    fn new(total: usize, granularity: ProgressGranularity) -> Self {
        Self {
            total,
            done: 0,
            failed: 0,
            granularity,
            started: Instant::now(),
        }
    }

    fn delivered(&mut self, sink: &dyn ProgressSink, request: &FetchRequest, outcome: &ReconcileOutcome) {
        self.done += 1;
        let line = format!(
            "{} is delivered ({} new, {} unchanged, {} empty)",
            request.label(),
            outcome.placed,
            outcome.skipped,
            outcome.elided
        );
        info!("{line}");
        self.emit(sink, line);
    }

    fn failed(&mut self, sink: &dyn ProgressSink, request: &FetchRequest, err: &BinderError) {
        self.done += 1;
        self.failed += 1;
        let line = format!("{} failed: {err}", request.label());
        warn!("{line}");
        self.emit(sink, line);
    }

    fn emit(&self, sink: &dyn ProgressSink, line: String) {
        let message = match self.granularity {
            ProgressGranularity::PerRequest => line,
            ProgressGranularity::Aggregate => format!(
                "delivered {}/{} ({} failed)",
                self.done, self.total, self.failed
            ),
        };
        sink.event(ProgressEvent {
            message,
            elapsed: Some(self.started.elapsed()),
        });
    }
}

use std::collections::HashMap;
use std::fs::File;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrow::array::Int64Array;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use assert_matches::assert_matches;
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use parquet::arrow::ArrowWriter;

use databinder::config::{DeliveryConfig, LocalSample, ProgressGranularity};
use databinder::delivery::{DeliveryClient, RemoteFile, Submission};
use databinder::domain::{
    BackendKind, CodegenKind, DatasetSpec, FetchRequest, OutputEncoding, SampleKey, VariantKey,
};
use databinder::error::BinderError;
use databinder::manifest::{Manifest, ManifestShape};
use databinder::orchestrator::{Orchestrator, ProgressEvent, ProgressSink};

#[derive(Default)]
struct MockServiceX {
    results: Mutex<HashMap<String, Result<Vec<Utf8PathBuf>, String>>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
    delays: Mutex<HashMap<String, Duration>>,
}

impl MockServiceX {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn serve(&self, dataset: &str, files: Vec<Utf8PathBuf>) {
        self.results
            .lock()
            .unwrap()
            .insert(dataset.to_string(), Ok(files));
    }

    fn slow(&self, dataset: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(dataset.to_string(), delay);
    }

    fn fail(&self, dataset: &str, message: &str) {
        self.results
            .lock()
            .unwrap()
            .insert(dataset.to_string(), Err(message.to_string()));
    }
}

#[async_trait]
impl DeliveryClient for MockServiceX {
    async fn submit(&self, submission: &Submission<'_>) -> Result<Vec<RemoteFile>, BinderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = submission.dataset.to_string();
        let delay = self
            .delays
            .lock()
            .unwrap()
            .get(&key)
            .copied()
            .unwrap_or(self.delay);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let result = self.results.lock().unwrap().get(&key).cloned();
        match result {
            Some(Ok(files)) => Ok(files.into_iter().map(RemoteFile::local).collect()),
            Some(Err(message)) => Err(BinderError::Delivery(message)),
            None => Err(BinderError::Delivery(format!("unknown dataset {key}"))),
        }
    }
}

#[derive(Default)]
struct RecordingSink {
    lines: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: ProgressEvent) {
        self.lines.lock().unwrap().push(event.message);
    }
}

fn workspace() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let base = Utf8PathBuf::from_path_buf(temp.path().canonicalize().unwrap()).unwrap();
    (temp, base)
}

fn source_files(dir: &Utf8Path, names: &[&str]) -> Vec<Utf8PathBuf> {
    std::fs::create_dir_all(dir).unwrap();
    names
        .iter()
        .map(|name| {
            let path = dir.join(name);
            if name.ends_with(".parquet") {
                write_parquet(&path, vec![1, 2]);
            } else {
                std::fs::write(&path, format!("payload {name}")).unwrap();
            }
            path
        })
        .collect()
}

fn write_parquet(path: &Utf8Path, values: Vec<i64>) {
    let schema = Arc::new(Schema::new(vec![Field::new("event", DataType::Int64, false)]));
    let batch =
        RecordBatch::try_new(schema.clone(), vec![Arc::new(Int64Array::from(values))]).unwrap();
    let file = File::create(path).unwrap();
    let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
    if batch.num_rows() > 0 {
        writer.write(&batch).unwrap();
    }
    writer.close().unwrap();
}

fn request(sample: &str, variant: &str, dataset: &str, backend: BackendKind) -> FetchRequest {
    FetchRequest {
        sample: sample.parse().unwrap(),
        variant: variant.parse().unwrap(),
        dataset: DatasetSpec::Single(dataset.to_string()),
        query: "(lambda e: e.jet_pt)".to_string(),
        backend,
        codegen: CodegenKind::Uproot,
    }
}

fn key(sample: &str, variant: &str) -> (SampleKey, VariantKey) {
    (sample.parse().unwrap(), variant.parse().unwrap())
}

fn names_in(dir: &Utf8Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn requests_sharing_a_key_are_merged() {
    let (_temp, base) = workspace();
    let mock = Arc::new(MockServiceX::default());
    mock.serve("d1", source_files(&base.join("src1"), &["a.parquet", "b.parquet"]));
    mock.serve("d2", source_files(&base.join("src2"), &["b.parquet", "c.parquet"]));

    let config = DeliveryConfig::new(base.join("out"), OutputEncoding::Columnar)
        .with_manifest_name("servicex");
    let orchestrator =
        Orchestrator::new(Arc::clone(&mock), config, BackendKind::Uproot).unwrap();
    let sink = RecordingSink::default();
    let report = orchestrator
        .deliver(
            vec![
                request("ttH", "nominal", "d1", BackendKind::Uproot),
                request("ttH", "nominal", "d2", BackendKind::Uproot),
            ],
            &sink,
        )
        .await
        .unwrap();
    assert!(report.is_complete());

    let root = orchestrator.mirror().root().to_path_buf();
    let (sample, variant) = key("ttH", "nominal");
    let files = report.manifest.files(&sample, Some(&variant)).unwrap();
    let expected: Vec<Utf8PathBuf> = ["a.parquet", "b.parquet", "c.parquet"]
        .iter()
        .map(|name| root.join("ttH/nominal").join(name))
        .collect();
    assert_eq!(files.iter().cloned().collect::<Vec<_>>(), expected);

    let cleanup = report.cleanup.join().await;
    assert!(cleanup.is_clean());
    assert_eq!(
        names_in(&root.join("ttH/nominal")),
        vec!["a.parquet", "b.parquet", "c.parquet"]
    );

    let manifest_path = report.manifest_path.unwrap();
    assert_eq!(manifest_path, root.join("servicex.json"));
    let persisted = Manifest::load(&manifest_path, ManifestShape::Nested).unwrap();
    assert_eq!(persisted, report.manifest);

    let lines = sink.lines();
    assert!(lines.iter().any(|line| line.starts_with("ttH - nominal is delivered")));
}

#[tokio::test]
async fn second_run_places_nothing() {
    let (_temp, base) = workspace();
    let mock = Arc::new(MockServiceX::default());
    mock.serve("d1", source_files(&base.join("src"), &["a.parquet", "b.parquet"]));

    let config = DeliveryConfig::new(base.join("out"), OutputEncoding::Columnar);
    let orchestrator =
        Orchestrator::new(Arc::clone(&mock), config, BackendKind::Uproot).unwrap();
    let requests = vec![request("ttH", "nominal", "d1", BackendKind::Uproot)];

    let first = orchestrator
        .deliver(requests.clone(), &RecordingSink::default())
        .await
        .unwrap();
    first.cleanup.join().await;

    let sink = RecordingSink::default();
    let second = orchestrator.deliver(requests, &sink).await.unwrap();
    second.cleanup.join().await;

    assert_eq!(first.manifest, second.manifest);
    assert!(
        sink.lines()
            .iter()
            .any(|line| line == "ttH - nominal is delivered (0 new, 2 unchanged, 0 empty)")
    );
    assert_eq!(mock.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_request_does_not_stop_the_batch() {
    let (_temp, base) = workspace();
    let mock = Arc::new(MockServiceX::default());
    mock.serve("d1", source_files(&base.join("src1"), &["a.parquet"]));
    mock.fail("d2", "transform exploded");
    mock.serve("d3", source_files(&base.join("src3"), &["c.parquet"]));
    mock.serve("d4", source_files(&base.join("src4"), &["d.parquet"]));

    let root = base.join("out");
    let kept = root.join("ttW/nominal/old.parquet");
    std::fs::create_dir_all(kept.parent().unwrap()).unwrap();
    std::fs::write(&kept, b"previous run").unwrap();

    let config = DeliveryConfig::new(root, OutputEncoding::Columnar);
    let orchestrator =
        Orchestrator::new(Arc::clone(&mock), config, BackendKind::Uproot).unwrap();
    let sink = RecordingSink::default();
    let report = orchestrator
        .deliver(
            vec![
                request("ttH", "nominal", "d1", BackendKind::Uproot),
                request("ttW", "nominal", "d2", BackendKind::Uproot),
                request("ttZ", "nominal", "d3", BackendKind::Uproot),
                request("tt", "jets", "d4", BackendKind::Uproot),
            ],
            &sink,
        )
        .await
        .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].request.label(), "ttW - nominal");
    assert!(report.failures[0].error.contains("transform exploded"));
    let (ttw, _) = key("ttW", "nominal");
    assert!(!report.manifest.contains_sample(&ttw));
    assert_eq!(report.manifest.file_count(), 3);
    for (sample, variant) in [("ttH", "nominal"), ("ttZ", "nominal"), ("tt", "jets")] {
        let (sample, variant) = key(sample, variant);
        assert_eq!(
            report.manifest.files(&sample, Some(&variant)).map(|files| files.len()),
            Some(1)
        );
    }
    assert!(
        sink.lines()
            .iter()
            .any(|line| line.starts_with("ttW - nominal failed:"))
    );

    let cleanup = report.cleanup.join().await;
    assert!(cleanup.is_clean());
    assert!(kept.exists());
}

#[tokio::test]
async fn in_flight_requests_respect_the_limit() {
    let (_temp, base) = workspace();
    let mock = Arc::new(MockServiceX::with_delay(Duration::from_millis(30)));
    let mut requests = Vec::new();
    for idx in 0..6 {
        let dataset = format!("d{idx}");
        let files = source_files(&base.join(&dataset), &["part.parquet"]);
        mock.serve(&dataset, files);
        requests.push(request(&format!("s{idx}"), "nominal", &dataset, BackendKind::Uproot));
    }

    let config = DeliveryConfig::new(base.join("out"), OutputEncoding::Columnar)
        .with_concurrency(2)
        .with_progress(ProgressGranularity::Aggregate);
    let orchestrator =
        Orchestrator::new(Arc::clone(&mock), config, BackendKind::Uproot).unwrap();
    let sink = RecordingSink::default();
    let report = orchestrator.deliver(requests, &sink).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(report.manifest.file_count(), 6);
    assert_eq!(mock.calls.load(Ordering::SeqCst), 6);
    let peak = mock.peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak in-flight was {peak}");
    assert!(sink.lines().iter().any(|line| line == "delivered 6/6 (0 failed)"));
}

#[tokio::test]
async fn cleanup_removes_files_dropped_from_the_result() {
    let (_temp, base) = workspace();
    let mock = Arc::new(MockServiceX::default());
    let files = source_files(&base.join("src"), &["a.parquet", "b.parquet"]);
    mock.serve("d1", files.clone());

    let root = base.join("out");
    std::fs::create_dir_all(root.join("stale")).unwrap();
    std::fs::write(root.join("stale/x.parquet"), b"x").unwrap();
    std::fs::create_dir_all(root.join("ttH/old_tree")).unwrap();
    std::fs::write(root.join("ttH/old_tree/y.parquet"), b"y").unwrap();

    let config = DeliveryConfig::new(root.clone(), OutputEncoding::Columnar)
        .with_manifest_name("servicex");
    let orchestrator =
        Orchestrator::new(Arc::clone(&mock), config, BackendKind::Uproot).unwrap();
    let requests = vec![request("ttH", "nominal", "d1", BackendKind::Uproot)];

    let first = orchestrator
        .deliver(requests.clone(), &RecordingSink::default())
        .await
        .unwrap();
    let cleanup = first.cleanup.join().await;
    assert!(cleanup.is_clean());
    assert!(!root.join("stale").exists());
    assert!(!root.join("ttH/old_tree").exists());

    mock.serve("d1", vec![files[0].clone()]);
    let second = orchestrator
        .deliver(requests, &RecordingSink::default())
        .await
        .unwrap();
    let cleanup = second.cleanup.join().await;
    assert!(cleanup.is_clean());

    assert_eq!(names_in(&root.join("ttH/nominal")), vec!["a.parquet"]);
    assert!(cleanup.removed_files.contains(&root.join("ttH/nominal/b.parquet")));
    assert!(root.join("servicex.json").exists());
}

#[tokio::test]
async fn unnamed_manifest_removes_stale_documents() {
    let (_temp, base) = workspace();
    let mock = Arc::new(MockServiceX::default());
    mock.serve("d1", source_files(&base.join("src"), &["a.parquet"]));

    let root = base.join("out");
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("old.json"), b"{}").unwrap();

    let config = DeliveryConfig::new(root.clone(), OutputEncoding::Columnar);
    let orchestrator =
        Orchestrator::new(Arc::clone(&mock), config, BackendKind::Uproot).unwrap();
    let report = orchestrator
        .deliver(
            vec![request("ttH", "nominal", "d1", BackendKind::Uproot)],
            &RecordingSink::default(),
        )
        .await
        .unwrap();

    assert!(report.manifest_path.is_none());
    assert!(!root.join("old.json").exists());
}

#[tokio::test]
async fn transcoding_elides_empty_sources() {
    let (_temp, base) = workspace();
    let src = base.join("src");
    std::fs::create_dir_all(&src).unwrap();
    write_parquet(&src.join("full.parquet"), vec![1, 2, 3]);
    write_parquet(&src.join("empty.parquet"), Vec::new());

    let mock = Arc::new(MockServiceX::default());
    mock.serve("d1", vec![src.join("full.parquet"), src.join("empty.parquet")]);

    let config = DeliveryConfig::new(base.join("out"), OutputEncoding::Row);
    let orchestrator =
        Orchestrator::new(Arc::clone(&mock), config, BackendKind::Uproot).unwrap();
    let report = orchestrator
        .deliver(
            vec![request("ttH", "nominal", "d1", BackendKind::Uproot)],
            &RecordingSink::default(),
        )
        .await
        .unwrap();
    report.cleanup.join().await;

    let root = orchestrator.mirror().root().to_path_buf();
    let dir = root.join("ttH/nominal");
    assert_eq!(names_in(&dir), vec!["full.ntuple.jsonl"]);
    assert_eq!(report.manifest.file_count(), 1);

    let content = std::fs::read_to_string(dir.join("full.ntuple.jsonl")).unwrap();
    let mut lines = content.lines();
    let header: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
    assert_eq!(header["container"], "nominal");
    assert_eq!(header["rows"], 3);
    assert_eq!(lines.count(), 3);
}

#[tokio::test]
async fn sample_only_backend_writes_a_flat_manifest() {
    let (_temp, base) = workspace();
    let mock = Arc::new(MockServiceX::default());
    mock.serve("data15", source_files(&base.join("src"), &["x.root", "y.root"]));

    let config = DeliveryConfig::new(base.join("out"), OutputEncoding::Row);
    let orchestrator =
        Orchestrator::new(Arc::clone(&mock), config, BackendKind::Xaod).unwrap();
    assert_eq!(orchestrator.shape(), ManifestShape::Flat);

    let sink = RecordingSink::default();
    let report = orchestrator
        .deliver(
            vec![request("data15", "CollectionTree", "data15", BackendKind::Xaod)],
            &sink,
        )
        .await
        .unwrap();

    let root = orchestrator.mirror().root().to_path_buf();
    let (sample, _) = key("data15", "CollectionTree");
    let files = report.manifest.files(&sample, None).unwrap();
    assert!(files.contains(&root.join("data15/x.root")));
    assert_eq!(files.len(), 2);
    assert!(sink.lines().iter().any(|line| line.starts_with("data15 is delivered")));
}

#[tokio::test]
async fn local_samples_are_listed_by_absolute_path() {
    let (_temp, base) = workspace();
    let mock = Arc::new(MockServiceX::default());
    mock.serve("d1", source_files(&base.join("src"), &["a.parquet"]));
    let local_dir = base.join("ntuples");
    source_files(&local_dir, &["data.parquet"]);

    let config = DeliveryConfig::new(base.join("out"), OutputEncoding::Columnar).with_local_sample(
        LocalSample {
            sample: "data".parse().unwrap(),
            variant: Some("nominal".parse().unwrap()),
            directory: local_dir.clone(),
        },
    );
    let orchestrator =
        Orchestrator::new(Arc::clone(&mock), config, BackendKind::Uproot).unwrap();
    let report = orchestrator
        .deliver(
            vec![request("ttH", "nominal", "d1", BackendKind::Uproot)],
            &RecordingSink::default(),
        )
        .await
        .unwrap();

    let (sample, variant) = key("data", "nominal");
    let files = report.manifest.files(&sample, Some(&variant)).unwrap();
    assert!(files.contains(&local_dir.join("data.parquet")));
}

#[test]
fn rejects_unsupported_combinations() {
    let (_temp, base) = workspace();
    let config = DeliveryConfig::new(base.join("out"), OutputEncoding::Columnar);
    let result = Orchestrator::new(MockServiceX::default(), config, BackendKind::Xaod);
    assert_matches!(result.err(), Some(BinderError::UnsupportedCombination { .. }));
}

#[test]
fn nested_local_sample_needs_a_variant() {
    let (_temp, base) = workspace();
    let config = DeliveryConfig::new(base.join("out"), OutputEncoding::Columnar).with_local_sample(
        LocalSample {
            sample: "data".parse().unwrap(),
            variant: None,
            directory: base.join("ntuples"),
        },
    );
    let result = Orchestrator::new(MockServiceX::default(), config, BackendKind::Uproot);
    assert_matches!(result.err(), Some(BinderError::InvalidConfig(_)));
}

#[tokio::test]
async fn mismatched_backend_is_recorded_as_failure() {
    let (_temp, base) = workspace();
    let mock = Arc::new(MockServiceX::default());
    let config = DeliveryConfig::new(base.join("out"), OutputEncoding::Columnar);
    let orchestrator =
        Orchestrator::new(Arc::clone(&mock), config, BackendKind::Uproot).unwrap();
    let report = orchestrator
        .deliver(
            vec![request("data15", "tree", "data15", BackendKind::Xaod)],
            &RecordingSink::default(),
        )
        .await
        .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn numbered_replicas_are_kept_apart() {
    let (_temp, base) = workspace();
    let mock = Arc::new(MockServiceX::default());
    mock.serve(
        "data15",
        source_files(
            &base.join("src"),
            &["DAOD_PHYS._000001.pool.root.1", "DAOD_PHYS._000001.pool.root.2"],
        ),
    );

    let config = DeliveryConfig::new(base.join("out"), OutputEncoding::Row);
    let orchestrator =
        Orchestrator::new(Arc::clone(&mock), config, BackendKind::Xaod).unwrap();
    let report = orchestrator
        .deliver(
            vec![request("data15", "CollectionTree", "data15", BackendKind::Xaod)],
            &RecordingSink::default(),
        )
        .await
        .unwrap();
    report.cleanup.join().await;

    assert!(report.failures.is_empty()); // == report.is_complete(); field access avoids partial-move borrow error
    assert_eq!(report.manifest.file_count(), 2);
    let root = orchestrator.mirror().root().to_path_buf();
    assert_eq!(
        names_in(&root.join("data15")),
        vec!["DAOD_PHYS._000001.pool.root.1", "DAOD_PHYS._000001.pool.root.2"]
    );
}

#[tokio::test]
async fn same_name_from_two_locations_fails_the_request() {
    let (_temp, base) = workspace();
    let mock = Arc::new(MockServiceX::default());
    let mut files = source_files(&base.join("src1"), &["x.root"]);
    files.extend(source_files(&base.join("src2"), &["x.root"]));
    mock.serve("d1", files);
    mock.serve("d2", source_files(&base.join("src3"), &["y.root"]));

    let config = DeliveryConfig::new(base.join("out"), OutputEncoding::Row);
    let orchestrator =
        Orchestrator::new(Arc::clone(&mock), config, BackendKind::Xaod).unwrap();
    let report = orchestrator
        .deliver(
            vec![
                request("s1", "CollectionTree", "d1", BackendKind::Xaod),
                request("s2", "CollectionTree", "d2", BackendKind::Xaod),
            ],
            &RecordingSink::default(),
        )
        .await
        .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].request.label(), "s1");
    assert!(report.failures[0].error.contains("x.root"));
    assert_eq!(report.manifest.file_count(), 1);
}

#[tokio::test]
async fn files_differing_only_in_extension_are_distinct() {
    let (_temp, base) = workspace();
    let mock = Arc::new(MockServiceX::default());
    mock.serve("d1", source_files(&base.join("src"), &["a.parquet"]));

    let root = base.join("out");
    let stale = root.join("ttH/nominal/a.root");
    std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
    std::fs::write(&stale, b"old format").unwrap();

    let config = DeliveryConfig::new(root.clone(), OutputEncoding::Columnar);
    let orchestrator =
        Orchestrator::new(Arc::clone(&mock), config, BackendKind::Uproot).unwrap();
    let report = orchestrator
        .deliver(
            vec![request("ttH", "nominal", "d1", BackendKind::Uproot)],
            &RecordingSink::default(),
        )
        .await
        .unwrap();
    let cleanup = report.cleanup.join().await;
    assert!(cleanup.is_clean());

    let (sample, variant) = key("ttH", "nominal");
    let files = report.manifest.files(&sample, Some(&variant)).unwrap();
    for path in files {
        assert!(path.exists(), "{path} is listed but missing");
    }
    assert_eq!(names_in(&root.join("ttH/nominal")), vec!["a.parquet"]);
}

#[tokio::test]
async fn empty_columnar_files_are_not_placed() {
    let (_temp, base) = workspace();
    let src = base.join("src");
    std::fs::create_dir_all(&src).unwrap();
    write_parquet(&src.join("full.parquet"), vec![1, 2, 3]);
    write_parquet(&src.join("empty.parquet"), Vec::new());

    let mock = Arc::new(MockServiceX::default());
    mock.serve("d1", vec![src.join("full.parquet"), src.join("empty.parquet")]);

    let config = DeliveryConfig::new(base.join("out"), OutputEncoding::Columnar);
    let orchestrator =
        Orchestrator::new(Arc::clone(&mock), config, BackendKind::Uproot).unwrap();
    let sink = RecordingSink::default();
    let report = orchestrator
        .deliver(vec![request("ttH", "nominal", "d1", BackendKind::Uproot)], &sink)
        .await
        .unwrap();
    report.cleanup.join().await;

    let root = orchestrator.mirror().root().to_path_buf();
    assert_eq!(names_in(&root.join("ttH/nominal")), vec!["full.parquet"]);
    assert_eq!(report.manifest.file_count(), 1);
    assert!(
        sink.lines()
            .iter()
            .any(|line| line == "ttH - nominal is delivered (1 new, 0 unchanged, 1 empty)")
    );
}

#[tokio::test]
async fn relative_local_sample_inside_the_output_root_survives_cleanup() {
    let scratch = tempfile::Builder::new()
        .prefix(".databinder-test")
        .tempdir_in(".")
        .unwrap();
    let relative = Utf8PathBuf::from(scratch.path().file_name().unwrap().to_str().unwrap());
    let out = relative.join("out");
    let local_dir = out.join("data");
    source_files(&local_dir, &["x.root"]);

    let mock = Arc::new(MockServiceX::default());
    let config = DeliveryConfig::new(out.clone(), OutputEncoding::Row).with_local_sample(
        LocalSample {
            sample: "data".parse().unwrap(),
            variant: None,
            directory: local_dir.clone(),
        },
    );
    let orchestrator =
        Orchestrator::new(Arc::clone(&mock), config, BackendKind::Xaod).unwrap();
    let report = orchestrator
        .deliver(Vec::new(), &RecordingSink::default())
        .await
        .unwrap();
    let cleanup = report.cleanup.join().await;
    assert!(cleanup.is_clean());

    let root = orchestrator.mirror().root().to_path_buf();
    let (sample, _) = key("data", "CollectionTree");
    let files = report.manifest.files(&sample, None).unwrap();
    assert_eq!(
        files.iter().cloned().collect::<Vec<_>>(),
        vec![root.join("data/x.root")]
    );
    assert!(cleanup.removed_files.is_empty());
    assert!(local_dir.join("x.root").exists());
}

#[tokio::test]
async fn progress_follows_completion_order() {
    let (_temp, base) = workspace();
    let mock = Arc::new(MockServiceX::default());
    mock.serve("slow", source_files(&base.join("src1"), &["a.parquet"]));
    mock.serve("fast", source_files(&base.join("src2"), &["b.parquet"]));
    mock.slow("slow", Duration::from_millis(300));

    let config = DeliveryConfig::new(base.join("out"), OutputEncoding::Columnar);
    let orchestrator =
        Orchestrator::new(Arc::clone(&mock), config, BackendKind::Uproot).unwrap();
    let sink = RecordingSink::default();
    let report = orchestrator
        .deliver(
            vec![
                request("ttH", "nominal", "slow", BackendKind::Uproot),
                request("ttW", "nominal", "fast", BackendKind::Uproot),
            ],
            &sink,
        )
        .await
        .unwrap();
    assert!(report.is_complete());

    let lines = sink.lines();
    let position = |prefix: &str| {
        lines
            .iter()
            .position(|line| line.starts_with(prefix))
            .unwrap()
    };
    assert!(position("ttW - nominal is delivered") < position("ttH - nominal is delivered"));
}

#[tokio::test]
async fn manifest_write_failure_reaches_the_caller() {
    let (_temp, base) = workspace();
    let mock = Arc::new(MockServiceX::default());
    mock.serve("d1", source_files(&base.join("src"), &["a.parquet"]));

    let root = base.join("out");
    std::fs::create_dir_all(root.join("servicex.json")).unwrap();

    let config = DeliveryConfig::new(root, OutputEncoding::Columnar).with_manifest_name("servicex");
    let orchestrator =
        Orchestrator::new(Arc::clone(&mock), config, BackendKind::Uproot).unwrap();
    let result = orchestrator
        .deliver(
            vec![request("ttH", "nominal", "d1", BackendKind::Uproot)],
            &RecordingSink::default(),
        )
        .await;
    assert_matches!(result.err(), Some(BinderError::ManifestWrite(_)));
}

#[tokio::test]
async fn missing_source_fails_only_its_request() {
    let (_temp, base) = workspace();
    let mock = Arc::new(MockServiceX::default());
    mock.serve("d1", vec![base.join("gone/x.root")]);
    mock.serve("d2", source_files(&base.join("src"), &["y.root"]));

    let config = DeliveryConfig::new(base.join("out"), OutputEncoding::Row);
    let orchestrator =
        Orchestrator::new(Arc::clone(&mock), config, BackendKind::Xaod).unwrap();
    let report = orchestrator
        .deliver(
            vec![
                request("s1", "CollectionTree", "d1", BackendKind::Xaod),
                request("s2", "CollectionTree", "d2", BackendKind::Xaod),
            ],
            &RecordingSink::default(),
        )
        .await
        .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].request.label(), "s1");
    assert!(report.failures[0].error.starts_with("reconciliation failed"));
    let (s2, _) = key("s2", "CollectionTree");
    assert_eq!(report.manifest.files(&s2, None).map(|files| files.len()), Some(1));
}

use std::fs;
use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tokio_util::sync::CancellationToken;

use databinder::cleanup::remove_orphans;
use databinder::config::ConfigLoader;
use databinder::domain::{BackendKind, FetchRequest};
use databinder::error::BinderError;
use databinder::logging;
use databinder::manifest::{Manifest, ManifestShape};
use databinder::orchestrator::{Orchestrator, ProgressSink};
use databinder::output::{JsonOutput, LogOutput};
use databinder::servicex::ServiceXHttpClient;

#[derive(Parser)]
#[command(name = "databinder")]
#[command(about = "Deliver transformed datasets into a reconciled local mirror")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch every request and update the local mirror")]
    Deliver(DeliverArgs),
    #[command(about = "Remove mirror content not listed in a persisted manifest")]
    Clean(CleanArgs),
}

#[derive(Args)]
struct DeliverArgs {
    /// JSON list of fetch requests.
    requests: Utf8PathBuf,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    endpoint: String,

    #[arg(long)]
    cache_dir: Option<Utf8PathBuf>,

    /// Seconds a transformation may run before its request is failed.
    #[arg(long)]
    deadline: Option<u64>,

    #[arg(long)]
    json: bool,

    /// Return without waiting for orphan cleanup.
    #[arg(long)]
    no_wait: bool,
}

#[derive(Args)]
struct CleanArgs {
    manifest: Utf8PathBuf,

    #[arg(long)]
    root: Utf8PathBuf,

    #[arg(long, value_parser = parse_backend)]
    backend: BackendKind,
}

fn parse_backend(value: &str) -> Result<BackendKind, String> {
    match value {
        "uproot" => Ok(BackendKind::Uproot),
        "xaod" => Ok(BackendKind::Xaod),
        other => Err(format!("unknown backend {other}")),
    }
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<BinderError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &BinderError) -> u8 {
    match error {
        BinderError::MissingConfig
        | BinderError::ConfigRead(_)
        | BinderError::ConfigParse(_)
        | BinderError::InvalidConfig(_)
        | BinderError::InvalidKey(_)
        | BinderError::UnsupportedCombination { .. } => 2,
        err if err.is_per_request() => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    logging::init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;

    match cli.command {
        Commands::Deliver(args) => runtime.block_on(run_deliver(args)),
        Commands::Clean(args) => runtime.block_on(run_clean(args)),
    }
}

async fn run_deliver(args: DeliverArgs) -> miette::Result<()> {
    let config = ConfigLoader::resolve(args.config.as_deref())?;
    let content = fs::read_to_string(args.requests.as_std_path())
        .map_err(|err| BinderError::ConfigParse(format!("{}: {err}", args.requests)))?;
    let requests: Vec<FetchRequest> =
        serde_json::from_str(&content).map_err(|err| BinderError::ConfigParse(err.to_string()))?;
    let backend = requests
        .first()
        .map(|request| request.backend)
        .ok_or_else(|| BinderError::InvalidConfig("no requests to deliver".to_string()))?;

    let mut client = match args.cache_dir {
        Some(dir) => ServiceXHttpClient::with_cache_dir(args.endpoint, dir)?,
        None => ServiceXHttpClient::new(args.endpoint)?,
    };
    if let Some(secs) = args.deadline {
        client = client.with_deadline(Duration::from_secs(secs));
    }
    let orchestrator = Orchestrator::new(client, config, backend)?;

    let sink: &dyn ProgressSink = if args.json { &JsonOutput } else { &LogOutput };
    let report = orchestrator.deliver(requests, sink).await?;

    if args.json {
        JsonOutput::print_report(&report).into_diagnostic()?;
    } else {
        print_summary(&report);
    }

    let failed = report.failures.len();
    if !args.no_wait {
        let cleanup = report.cleanup.join().await;
        for err in &cleanup.errors {
            eprintln!("cleanup: {err}");
        }
    }
    if failed > 0 {
        return Err(miette::Report::msg(format!("{failed} requests failed")));
    }
    Ok(())
}

async fn run_clean(args: CleanArgs) -> miette::Result<()> {
    let shape = if args.backend.has_variant_axis() {
        ManifestShape::Nested
    } else {
        ManifestShape::Flat
    };
    let manifest = Manifest::load(&args.manifest, shape)?;
    let root = fs::canonicalize(args.root.as_std_path())
        .ok()
        .and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
        .ok_or_else(|| BinderError::InvalidConfig(format!("cannot resolve {}", args.root)))?;
    let report = remove_orphans(
        &root,
        &manifest,
        &Default::default(),
        &CancellationToken::new(),
    )
    .await;
    println!(
        "removed {} directories and {} files",
        report.removed_dirs.len(),
        report.removed_files.len()
    );
    match report.errors.into_iter().next() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn print_summary(report: &databinder::orchestrator::DeliveryReport) {
    println!(
        "delivered {} files, {} failed requests",
        report.manifest.file_count(),
        report.failures.len()
    );
    if let Some(path) = &report.manifest_path {
        println!("manifest: {path}");
    }
    for failure in &report.failures {
        println!("  {} failed: {}", failure.request.label(), failure.error);
    }
}

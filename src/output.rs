use std::io::{self, Write};

use serde::Serialize;
use tracing::info;

use crate::manifest::Manifest;
use crate::orchestrator::{DeliveryReport, FailureRecord, ProgressEvent, ProgressSink};

/// Machine-readable summary of a finished delivery.
#[derive(Debug, Serialize)]
pub struct DeliverySummary<'a> {
    pub manifest: &'a Manifest,
    pub manifest_path: Option<&'a str>,
    pub files: usize,
    pub failures: &'a [FailureRecord],
}

impl<'a> From<&'a DeliveryReport> for DeliverySummary<'a> {
    fn from(report: &'a DeliveryReport) -> Self {
        Self {
            manifest: &report.manifest,
            manifest_path: report.manifest_path.as_deref().map(|path| path.as_str()),
            files: report.manifest.file_count(),
            failures: &report.failures,
        }
    }
}

/// Silent during delivery; prints the final report as JSON on stdout.
pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &DeliveryReport) -> io::Result<()> {
        Self::print_json(&DeliverySummary::from(report))
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Forwards progress lines to the tracing subscriber.
pub struct LogOutput;

impl ProgressSink for LogOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}

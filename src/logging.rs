//! Training events and the sinks that consume them.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use csv::Writer;
use log::{error, info, warn};
use serde::Serialize;

/// Periodic report emitted by the training engine.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub epoch: usize,
    pub update: usize,
    pub lr: f32,
    /// Average per-word cost since the start of the epoch.
    pub avg_cost: f64,
    pub sentences: usize,
    pub words: usize,
    #[serde(serialize_with = "as_secs")]
    pub elapsed: Duration,
}

fn as_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Result of a validation pass or another notable outcome.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EvaluationEvent {
    pub title: String,
    pub message: String,
    pub severity: Severity,
}

impl EvaluationEvent {
    pub fn new(title: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            severity,
        }
    }
}

/// Receives engine notifications. All methods default to no-ops.
pub trait TrainingObserver: Send {
    fn on_epoch_begin(&mut self, _epoch: usize) {}

    fn on_progress(&mut self, _event: &ProgressEvent) {}

    fn on_evaluation(&mut self, _event: &EvaluationEvent) {}

    fn on_epoch_end(&mut self, _epoch: usize, _avg_cost: f64) {}
}

/// Writes events through the `log` facade.
#[derive(Default)]
pub struct LogObserver;

impl TrainingObserver for LogObserver {
    fn on_progress(&mut self, event: &ProgressEvent) {
        info!("{}", format_progress(event));
    }

    fn on_evaluation(&mut self, event: &EvaluationEvent) {
        let line = format!("{}: {}", event.title, event.message);
        match event.severity {
            Severity::Info => info!("{line}"),
            Severity::Warning => warn!("{line}"),
            Severity::Error => error!("{line}"),
        }
    }
}

/// One CSV/JSONL row.
#[derive(Serialize)]
pub struct MetricRecord {
    pub epoch: usize,
    pub step: usize,
    pub cost: f64,
    pub lr: f32,
    pub words: usize,
    pub kind: &'static str,
}

const JSONL_FILE: &str = "metrics.jsonl";
const CSV_FILE: &str = "metrics.csv";

/// Directory of one training run: `<log_dir>/<experiment>`, defaulting to
/// `runs/<unix seconds>`.
pub fn run_dir(log_dir: Option<&str>, experiment: Option<&str>) -> PathBuf {
    let run = match experiment {
        Some(name) => name.to_string(),
        None => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
            .to_string(),
    };
    Path::new(log_dir.unwrap_or("runs")).join(run)
}

fn append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Appends every progress and epoch record of a run to `metrics.jsonl` and
/// `metrics.csv`. Resuming a run keeps appending to the same files; the CSV
/// header is only written when the file is created.
pub struct MetricsLogger {
    run_dir: PathBuf,
    jsonl: File,
    table: Writer<File>,
}

impl MetricsLogger {
    pub fn open(run_dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&run_dir)?;
        let csv_path = run_dir.join(CSV_FILE);
        let fresh = fs::metadata(&csv_path).map_or(true, |m| m.len() == 0);
        let table = csv::WriterBuilder::new()
            .has_headers(fresh)
            .from_writer(append(&csv_path)?);
        let jsonl = append(&run_dir.join(JSONL_FILE))?;
        Ok(Self { run_dir, jsonl, table })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn record(&mut self, row: &MetricRecord) {
        if let Err(e) = self.write(row) {
            warn!("cannot write metrics to {}: {e}", self.run_dir.display());
        }
    }

    fn write(&mut self, row: &MetricRecord) -> io::Result<()> {
        serde_json::to_writer(&mut self.jsonl, row)?;
        self.jsonl.write_all(b"\n")?;
        self.table.serialize(row)?;
        self.table.flush()
    }
}

impl TrainingObserver for MetricsLogger {
    fn on_progress(&mut self, event: &ProgressEvent) {
        self.record(&MetricRecord {
            epoch: event.epoch,
            step: event.update,
            cost: event.avg_cost,
            lr: event.lr,
            words: event.words,
            kind: "train",
        });
    }

    fn on_epoch_end(&mut self, epoch: usize, avg_cost: f64) {
        self.record(&MetricRecord {
            epoch,
            step: 0,
            cost: avg_cost,
            lr: 0.0,
            words: 0,
            kind: "epoch",
        });
    }
}

pub fn format_progress(e: &ProgressEvent) -> String {
    let secs = e.elapsed.as_secs_f64().max(1e-9);
    format!(
        "Epoch {} update {} lr {:.6} cost/word {:.4} sentences {} words {} ({:.1} words/s)",
        e.epoch,
        e.update,
        e.lr,
        e.avg_cost,
        e.sentences,
        e.words,
        e.words as f64 / secs
    )
}

/// Format a message reporting the total number of matrix operations.
pub fn format_total_ops(count: usize) -> String {
    format!("Total matrix ops: {}", count)
}

/// Format a checkpoint saved message.
pub fn format_checkpoint_saved(epoch: usize, update: usize, avg_cost: f64) -> String {
    format!(
        "Checkpoint saved at epoch {} update {}: avg cost/word {:.4}",
        epoch, update, avg_cost
    )
}

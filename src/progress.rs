//! Analyze-run progress reporting.
//!
//! Reports observable progress during `mfl analyze` so operators see how
//! far a run has gotten and how many items errored. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts. The orchestrator is
//! decoupled from any particular sink: it only sees the reporter trait.

use std::io::Write;

/// A single progress event for an analyze run.
#[derive(Clone, Debug)]
pub enum AnalyzeProgressEvent {
    /// Counting candidate chains; totals not yet known.
    Scanning { operation: String },
    /// Batch processing underway: completed items out of total, with errors.
    Processing {
        operation: String,
        completed: u64,
        total: u64,
        errors: u64,
    },
    /// A checkpoint was flushed at `completed` items.
    Checkpointed { operation: String, completed: u64 },
}

/// Reports analyze progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: AnalyzeProgressEvent);
}

/// Human-friendly progress on stderr: "analyze email-analysis  1,234 / 5,000 items (3 errors)".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: AnalyzeProgressEvent) {
        let line = match &event {
            AnalyzeProgressEvent::Scanning { operation } => {
                format!("analyze {}  scanning...\n", operation)
            }
            AnalyzeProgressEvent::Processing {
                operation,
                completed,
                total,
                errors,
            } => {
                let errs = if *errors > 0 {
                    format!(" ({} errors)", errors)
                } else {
                    String::new()
                };
                format!(
                    "analyze {}  {} / {} items{}\n",
                    operation,
                    format_number(*completed),
                    format_number(*total),
                    errs
                )
            }
            AnalyzeProgressEvent::Checkpointed {
                operation,
                completed,
            } => {
                format!(
                    "analyze {}  checkpoint at {} items\n",
                    operation,
                    format_number(*completed)
                )
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: AnalyzeProgressEvent) {
        let obj = match &event {
            AnalyzeProgressEvent::Scanning { operation } => serde_json::json!({
                "event": "progress",
                "operation": operation,
                "phase": "scanning"
            }),
            AnalyzeProgressEvent::Processing {
                operation,
                completed,
                total,
                errors,
            } => serde_json::json!({
                "event": "progress",
                "operation": operation,
                "phase": "processing",
                "completed": completed,
                "total": total,
                "errors": errors
            }),
            AnalyzeProgressEvent::Checkpointed {
                operation,
                completed,
            } => serde_json::json!({
                "event": "checkpoint",
                "operation": operation,
                "completed": completed
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: AnalyzeProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    /// Build a reporter for this mode. Caller passes it to the orchestrator.
    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

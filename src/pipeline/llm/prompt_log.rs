//! Append-only JSONL log of model calls.
//!
//! One line per call: `{time, task, model, prompt, response, cached}`.
//! Write failures are logged and swallowed; logging never blocks a stage.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptLogEntry {
    pub time: DateTime<Utc>,
    pub task: String,
    pub model: String,
    pub prompt: String,
    pub response: String,
    #[serde(default)]
    pub cached: bool,
}

#[derive(Debug, Clone)]
pub struct PromptLog {
    path: Option<PathBuf>,
}

impl PromptLog {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// A log that records nothing.
    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&self, entry: &PromptLogEntry) {
        let Some(path) = &self.path else {
            return;
        };
        append_json_line(path, entry);
    }
}

/// Append one serialized value as a line. Never panics.
pub(crate) fn append_json_line<T: Serialize>(path: &Path, value: &T) {
    let line = match serde_json::to_string(value) {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "JSONL log: failed to serialize");
            return;
        }
    };

    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{line}"));

    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "JSONL log: failed to append");
    }
}

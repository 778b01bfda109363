//! Core types for stage execution and the run manifest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

impl StageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Terminal states never change again within a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// What a stage reports back when it returns normally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Finished; lists the artifacts it wrote (possibly none).
    Completed { outputs: Vec<String> },
    /// Nothing to do (e.g. an optional tool is not installed). Not a failure.
    Skipped { reason: String },
    /// Finished, but downstream stages are meaningless (e.g. nothing was
    /// discovered). The runner skips everything after this stage.
    ShortCircuit { outputs: Vec<String>, reason: String },
}

impl StageOutcome {
    pub fn completed(outputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::Completed {
            outputs: outputs.into_iter().map(Into::into).collect(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }
}

/// Execution record for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub state: StageState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    #[serde(default)]
    pub outputs: Vec<String>,
    pub error: Option<String>,
    pub skip_reason: Option<String>,
}

impl StageRecord {
    pub fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: StageState::Pending,
            started_at: None,
            finished_at: None,
            duration_ms: 0,
            outputs: Vec::new(),
            error: None,
            skip_reason: None,
        }
    }

    pub fn skipped(name: &str, reason: impl Into<String>) -> Self {
        Self {
            state: StageState::Skipped,
            skip_reason: Some(reason.into()),
            ..Self::pending(name)
        }
    }
}

/// Progress events for an optional observer.
#[derive(Debug, Clone, PartialEq)]
pub enum StageEvent {
    Started { stage_count: usize },
    StageStarted { index: usize, name: String },
    StageFinished { index: usize, name: String, state: StageState },
    Completed { done: usize, failed: usize, skipped: usize, duration_ms: u64 },
}

/// Written to `run.json` after the last stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: Uuid,
    pub target: String,
    pub pipeline: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageRecord>,
}

/// Summary returned by the runner.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub records: Vec<StageRecord>,
    pub duration_ms: u64,
    /// Reason given by the stage that short-circuited the run, if any.
    pub short_circuit: Option<String>,
}

impl RunReport {
    pub fn count(&self, state: StageState) -> usize {
        self.records.iter().filter(|r| r.state == state).count()
    }

    pub fn record(&self, name: &str) -> Option<&StageRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn all_done(&self) -> bool {
        self.records.iter().all(|r| r.state == StageState::Done)
    }
}

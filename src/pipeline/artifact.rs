//! Per-run artifact directory.
//!
//! **Layout**:
//! ```text
//! {root}/{target-slug}/run{YYYYmmddHHMMSS}/
//!   run.json              manifest written by the stage runner
//!   prompt_log.jsonl      model calls
//!   <stage outputs>       one named file per artifact
//! ```
//!
//! Writes replace the whole file (temp file + rename). There is no locking;
//! the last writer wins. Readers treat a missing file as "not produced".

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Invalid artifact name: {0:?}")]
    InvalidName(String),

    #[error("Artifact {name} is not valid JSON: {source}")]
    Json {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One execution of a pipeline against one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub dir: PathBuf,
}

impl Run {
    /// Create a fresh run directory under `root`.
    pub fn create(root: &Path, target: &str, started_at: DateTime<Utc>) -> Result<Self, ArtifactError> {
        let dir = root
            .join(target_slug(target))
            .join(format!("run{}", started_at.format("%Y%m%d%H%M%S")));
        std::fs::create_dir_all(&dir)?;

        tracing::info!(run_target = target, dir = %dir.display(), "Run directory created");

        Ok(Self {
            id: Uuid::new_v4(),
            target: target.to_string(),
            started_at,
            dir,
        })
    }

    /// Attach to an existing (or not yet created) run directory.
    ///
    /// Identity (id, target, start time) comes from the run manifest when one
    /// exists, so re-running a stage keeps the run it belongs to. Without a
    /// manifest the start time is taken from a `runYYYYmmddHHMMSS` directory
    /// name, or now.
    pub fn open(dir: impl Into<PathBuf>, target: &str) -> Result<Self, ArtifactError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        match ArtifactStore::new(&dir).read_json::<StoredIdentity>(config::MANIFEST_FILE) {
            Ok(Some(stored)) => {
                if stored.target != target {
                    tracing::warn!(
                        run_target = target,
                        stored_target = %stored.target,
                        "Run directory belongs to another target, keeping the stored one"
                    );
                }
                return Ok(Self {
                    id: stored.run_id,
                    target: stored.target,
                    started_at: stored.started_at,
                    dir,
                });
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, dir = %dir.display(), "Unreadable run manifest, starting a new identity");
            }
        }

        let started_at = started_from_dir_name(&dir).unwrap_or_else(Utc::now);
        Ok(Self {
            id: Uuid::new_v4(),
            target: target.to_string(),
            started_at,
            dir,
        })
    }

    pub fn artifacts(&self) -> ArtifactStore {
        ArtifactStore::new(&self.dir)
    }
}

/// The identifying subset of a run manifest.
#[derive(Deserialize)]
struct StoredIdentity {
    run_id: Uuid,
    target: String,
    started_at: DateTime<Utc>,
}

fn started_from_dir_name(dir: &Path) -> Option<DateTime<Utc>> {
    let stamp = dir.file_name()?.to_str()?.strip_prefix("run")?;
    NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Directory-safe form of a target: anything outside `[A-Za-z0-9._-]`
/// becomes `_`, capped at 64 chars.
pub fn target_slug(target: &str) -> String {
    let slug: String = target
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    let slug = slug.trim_start_matches('.');
    if slug.is_empty() {
        "target".to_string()
    } else {
        slug.to_string()
    }
}

/// Reject anything that is not a single plain file name.
pub fn validate_name(name: &str) -> Result<(), ArtifactError> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
        || name.len() > 255;
    if bad {
        Err(ArtifactError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

/// Named files inside one run directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, name: &str) -> Result<PathBuf, ArtifactError> {
        validate_name(name)?;
        Ok(self.dir.join(name))
    }

    /// Write (or overwrite) an artifact.
    pub fn write(&self, name: &str, content: &[u8]) -> Result<PathBuf, ArtifactError> {
        let path = self.path_of(name)?;
        std::fs::create_dir_all(&self.dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(content)?;
        tmp.persist(&path).map_err(|e| ArtifactError::Io(e.error))?;

        tracing::debug!(artifact = name, size = content.len(), "Artifact written");
        Ok(path)
    }

    pub fn write_text(&self, name: &str, text: &str) -> Result<PathBuf, ArtifactError> {
        self.write(name, text.as_bytes())
    }

    /// Pretty-printed JSON.
    pub fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<PathBuf, ArtifactError> {
        let json = serde_json::to_vec_pretty(value).map_err(|source| ArtifactError::Json {
            name: name.to_string(),
            source,
        })?;
        self.write(name, &json)
    }

    /// `None` when the artifact has not been produced.
    pub fn read(&self, name: &str) -> Result<Option<Vec<u8>>, ArtifactError> {
        let path = self.path_of(name)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn read_to_string(&self, name: &str) -> Result<Option<String>, ArtifactError> {
        Ok(self
            .read(name)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, ArtifactError> {
        match self.read(name)? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| ArtifactError::Json {
                    name: name.to_string(),
                    source,
                }),
        }
    }

    /// Append a line to a text artifact, creating it if needed.
    pub fn append_line(&self, name: &str, line: &str) -> Result<(), ArtifactError> {
        let path = self.path_of(name)?;
        std::fs::create_dir_all(&self.dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_of(name).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Artifact names in the run directory, sorted.
    pub fn list(&self) -> Result<Vec<String>, ArtifactError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

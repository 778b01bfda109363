//! Append-only JSONL record log, de-duplicated on one key field.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;

use super::artifact::ArtifactError;

#[derive(Debug)]
pub struct RecordLog {
    path: PathBuf,
    key_field: String,
    seen: HashSet<String>,
    records: Vec<Value>,
}

impl RecordLog {
    /// Load the log at `path` (missing = empty). Malformed lines and records
    /// without the key are skipped; later duplicates of a key are dropped.
    pub fn load(path: impl Into<PathBuf>, key_field: &str) -> Result<Self, ArtifactError> {
        let path = path.into();
        let mut log = Self {
            path,
            key_field: key_field.to_string(),
            seen: HashSet::new(),
            records: Vec::new(),
        };

        let content = match std::fs::read_to_string(&log.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(log),
            Err(e) => return Err(e.into()),
        };

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(record) => match log.key_of(&record) {
                    Some(key) => {
                        if log.seen.insert(key) {
                            log.records.push(record);
                        }
                    }
                    None => tracing::debug!(line = lineno + 1, "Record without key skipped"),
                },
                Err(e) => tracing::warn!(
                    path = %log.path.display(),
                    line = lineno + 1,
                    error = %e,
                    "Malformed record line skipped"
                ),
            }
        }

        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    /// Key value as a string (numbers and bools are stringified).
    pub fn key_of(&self, record: &Value) -> Option<String> {
        match record.get(&self.key_field)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    /// Append a record. Returns `false` (and writes nothing) when the record
    /// lacks the key or the key is already present.
    pub fn append(&mut self, record: Value) -> Result<bool, ArtifactError> {
        let Some(key) = self.key_of(&record) else {
            return Ok(false);
        };
        if self.seen.contains(&key) {
            return Ok(false);
        }

        let line = serde_json::to_string(&record).map_err(|source| ArtifactError::Json {
            name: self.path.display().to_string(),
            source,
        })?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;

        self.seen.insert(key);
        self.records.push(record);
        Ok(true)
    }

    pub fn records(&self) -> &[Value] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

//! Result cache keyed by a content hash of the normalized query.
//!
//! `JsonFileCache` keeps the whole map in memory and rewrites the backing file
//! on every `put`. There is no locking: concurrent writers race and the last
//! write wins.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error on cache file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cache serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Deterministic key for a query: whitespace runs collapse to one space,
/// the result is trimmed and hashed with SHA-256 (lowercase hex).
pub fn cache_key(input: &str) -> String {
    let normalized = normalize(input);
    format!("{:x}", Sha256::digest(normalized.as_bytes()))
}

fn normalize(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: serde_json::Value,
    /// Normalized query the key was derived from (for humans inspecting the file).
    #[serde(default)]
    pub source: String,
    pub stored_at: DateTime<Utc>,
}

pub trait ResultCache {
    fn get(&self, key: &str) -> Option<serde_json::Value>;

    fn put(&mut self, key: &str, source: &str, value: serde_json::Value) -> Result<(), CacheError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process cache; lives as long as the run.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: BTreeMap<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultCache for MemoryCache {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.get(key).map(|e| e.value.clone())
    }

    fn put(&mut self, key: &str, source: &str, value: serde_json::Value) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                source: normalize(source),
                stored_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Whole-file JSON cache.
#[derive(Debug)]
pub struct JsonFileCache {
    path: PathBuf,
    entries: BTreeMap<String, CacheEntry>,
}

impl JsonFileCache {
    /// Load the cache at `path`. A missing file is an empty cache; an
    /// unreadable or corrupt one is logged and treated as empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Cache file is corrupt, starting empty"
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Cache file unreadable, starting empty"
                );
                BTreeMap::new()
            }
        };

        tracing::debug!(path = %path.display(), entries = entries.len(), "Cache loaded");
        Self { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    fn save(&self) -> Result<(), CacheError> {
        let io_err = |source| CacheError::Io {
            path: self.path.clone(),
            source,
        };
        let dir = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => parent,
            None => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(io_err)?;

        // Temp file in the same directory, renamed over the target.
        let json = serde_json::to_vec_pretty(&self.entries)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

impl ResultCache for JsonFileCache {
    fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.get(key).map(|e| e.value.clone())
    }

    fn put(&mut self, key: &str, source: &str, value: serde_json::Value) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                source: normalize(source),
                stored_at: Utc::now(),
            },
        );
        self.save()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

//! Structured-response parser for free-text model replies.
//!
//! Model output is untrusted. The parser looks for a JSON object at the end of
//! the reply and decodes it into a fixed shape. Whatever goes wrong, the caller
//! gets a `StructuredResponse`: either the parsed record or a fallback record
//! of the same shape plus a diagnostic note. It never panics and never errors.

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How much of the raw reply is kept in a fallback note.
pub const NOTE_PREFIX_CHARS: usize = 200;

/// A record shape with a fixed set of named fields and a deterministic
/// fallback value.
pub trait ResponseShape: Sized + DeserializeOwned {
    /// Fields that must be present in the decoded object.
    const FIELDS: &'static [&'static str];

    fn fallback() -> Self;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FallbackReason {
    NoJson,
    InvalidJson(String),
    MissingField(String),
    CallFailed(String),
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoJson => write!(f, "no JSON object in reply"),
            Self::InvalidJson(e) => write!(f, "invalid JSON ({e})"),
            Self::MissingField(name) => write!(f, "missing field `{name}`"),
            Self::CallFailed(e) => write!(f, "model call failed ({e})"),
        }
    }
}

/// Decoded model reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StructuredResponse<T> {
    Parsed {
        record: T,
    },
    Fallback {
        record: T,
        note: String,
        reason: FallbackReason,
    },
}

impl<T> StructuredResponse<T> {
    pub fn record(&self) -> &T {
        match self {
            Self::Parsed { record } | Self::Fallback { record, .. } => record,
        }
    }

    pub fn into_record(self) -> T {
        match self {
            Self::Parsed { record } | Self::Fallback { record, .. } => record,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }

    pub fn note(&self) -> Option<&str> {
        match self {
            Self::Parsed { .. } => None,
            Self::Fallback { note, .. } => Some(note),
        }
    }

    pub fn fallback_reason(&self) -> Option<&FallbackReason> {
        match self {
            Self::Parsed { .. } => None,
            Self::Fallback { reason, .. } => Some(reason),
        }
    }
}

/// Build the fallback response for `raw` with the given reason.
pub fn fallback_response<T>(record: T, reason: FallbackReason, raw: &str) -> StructuredResponse<T> {
    StructuredResponse::Fallback {
        note: fallback_note(&reason, raw),
        record,
        reason,
    }
}

/// `"<reason>: <first 200 chars of raw>"`
pub fn fallback_note(reason: &FallbackReason, raw: &str) -> String {
    let prefix: String = raw.chars().take(NOTE_PREFIX_CHARS).collect();
    format!("{reason}: {prefix}")
}

/// Parse a reply into a typed record.
pub fn parse_structured<T: ResponseShape>(raw: &str) -> StructuredResponse<T> {
    match decode_typed::<T>(raw) {
        Ok(record) => StructuredResponse::Parsed { record },
        Err(reason) => {
            tracing::debug!(reason = %reason, "Structured response fell back");
            fallback_response(T::fallback(), reason, raw)
        }
    }
}

fn decode_typed<T: ResponseShape>(raw: &str) -> Result<T, FallbackReason> {
    let object = extract_json_object(raw)?;
    require_fields(&object, T::FIELDS.iter().copied())?;
    serde_json::from_value(Value::Object(object))
        .map_err(|e| FallbackReason::InvalidJson(e.to_string()))
}

fn require_fields<'a>(
    object: &Map<String, Value>,
    fields: impl IntoIterator<Item = &'a str>,
) -> Result<(), FallbackReason> {
    for field in fields {
        if !object.contains_key(field) {
            return Err(FallbackReason::MissingField(field.to_string()));
        }
    }
    Ok(())
}

// ──────────────────────────────────────────────
// Runtime-defined shapes
// ──────────────────────────────────────────────

/// One requested field and the value it takes in a fallback record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default = "default_fallback_value")]
    pub fallback: Value,
}

fn default_fallback_value() -> Value {
    Value::String("unknown".into())
}

/// A shape declared at runtime (pipeline definitions).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResponseTemplate {
    pub fields: Vec<FieldSpec>,
}

impl ResponseTemplate {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Record with every requested field set to its fallback value.
    pub fn fallback_record(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|f| (f.name.clone(), f.fallback.clone()))
            .collect()
    }

    /// Parse a reply. The parsed record keeps only the requested fields.
    /// An empty template accepts any object as-is.
    pub fn parse(&self, raw: &str) -> StructuredResponse<Map<String, Value>> {
        match self.decode(raw) {
            Ok(record) => StructuredResponse::Parsed { record },
            Err(reason) => {
                tracing::debug!(reason = %reason, "Structured response fell back");
                fallback_response(self.fallback_record(), reason, raw)
            }
        }
    }

    fn decode(&self, raw: &str) -> Result<Map<String, Value>, FallbackReason> {
        let object = extract_json_object(raw)?;
        if self.fields.is_empty() {
            return Ok(object);
        }
        require_fields(&object, self.field_names())?;
        Ok(self
            .fields
            .iter()
            .filter_map(|f| object.get(&f.name).map(|v| (f.name.clone(), v.clone())))
            .collect())
    }

    /// Validate a previously stored record (e.g. a cache hit) against this shape.
    pub fn accepts(&self, record: &Map<String, Value>) -> bool {
        self.field_names().all(|name| record.contains_key(name))
    }
}

// ──────────────────────────────────────────────
// Extraction
// ──────────────────────────────────────────────

/// Find and decode the trailing JSON object of a model reply.
///
/// Tries the last non-empty line first, then the last top-level `{...}` span
/// anywhere in the text.
pub fn extract_json_object(raw: &str) -> Result<Map<String, Value>, FallbackReason> {
    let text = strip_model_artifacts(raw);

    let mut last_error = None;

    if let Some(line) = text.lines().map(str::trim).rev().find(|l| !l.is_empty()) {
        if line.starts_with('{') {
            match decode_object(&repair_quotes(line)) {
                Ok(obj) => return Ok(obj),
                Err(e) => last_error = Some(e),
            }
        }
    }

    match last_object_span(&text).or_else(|| last_single_quoted_span(&text)) {
        Some(obj) => Ok(obj),
        None => Err(last_error.unwrap_or(FallbackReason::NoJson)),
    }
}

/// Multi-line Python-style dicts: repair quotes from the first `{` after
/// which no double quote appears, then scan again.
fn last_single_quoted_span(text: &str) -> Option<Map<String, Value>> {
    let start = text
        .match_indices('{')
        .map(|(idx, _)| idx)
        .find(|&idx| !text[idx..].contains('"'))?;
    let candidate = &text[start..];
    if !candidate.contains('\'') {
        return None;
    }
    last_object_span(&repair_quotes(candidate))
}

fn decode_object(candidate: &str) -> Result<Map<String, Value>, FallbackReason> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(obj)) => Ok(obj),
        Ok(_) => Err(FallbackReason::InvalidJson("top-level value is not an object".into())),
        Err(e) => Err(FallbackReason::InvalidJson(e.to_string())),
    }
}

/// Models sometimes emit Python-style dicts. Swap quotes when the candidate
/// uses single quotes exclusively.
fn repair_quotes(candidate: &str) -> String {
    if candidate.contains('\'') && !candidate.contains('"') {
        tracing::debug!("Reply uses single quotes, repairing before decode");
        candidate.replace('\'', "\"")
    } else {
        candidate.to_string()
    }
}

/// Scan for top-level JSON objects and keep the last one that decodes.
fn last_object_span(text: &str) -> Option<Map<String, Value>> {
    let mut found = None;
    let mut pos = 0;

    while let Some(offset) = text[pos..].find('{') {
        let start = pos + offset;
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(Value::Object(obj))) => {
                pos = start + stream.byte_offset();
                found = Some(obj);
            }
            _ => pos = start + 1,
        }
    }

    found
}

static THINK_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));
static UNUSED_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<unused\d+>").expect("valid regex"));

/// Remove reasoning blocks, stray tokenizer markers and code fences.
pub fn strip_model_artifacts(raw: &str) -> String {
    let text = THINK_BLOCK_RE.replace_all(raw, "");
    let text = UNUSED_TOKEN_RE.replace_all(&text, "");
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

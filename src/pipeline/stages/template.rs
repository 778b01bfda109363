//! Placeholder substitution for stage arguments and prompts.
//!
//! Known placeholders: `{target}`, `{run_dir}`, `{artifact:<name>}`,
//! `{record}`, `{previous}`. Anything else, or a placeholder with no value in
//! the current context, is left as written.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::context::RunContext;
use crate::pipeline::artifact::ArtifactStore;

/// Artifact contents longer than this are cut before substitution.
pub const MAX_ARTIFACT_CHARS: usize = 3000;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{(target|run_dir|record|previous|artifact:[^{}\s]+)\}").expect("valid regex")
});

pub struct TemplateVars<'a> {
    pub target: &'a str,
    pub artifacts: &'a ArtifactStore,
    pub record: Option<&'a str>,
    pub previous: Option<&'a str>,
}

impl<'a> TemplateVars<'a> {
    pub fn from_context(ctx: &'a RunContext) -> Self {
        Self {
            target: ctx.target(),
            artifacts: ctx.artifacts(),
            record: None,
            previous: None,
        }
    }

    pub fn record(mut self, record: &'a str) -> Self {
        self.record = Some(record);
        self
    }

    pub fn previous(mut self, previous: Option<&'a str>) -> Self {
        self.previous = previous;
        self
    }

    fn resolve(&self, name: &str) -> Option<String> {
        match name {
            "target" => Some(self.target.to_string()),
            "run_dir" => Some(self.artifacts.dir().display().to_string()),
            "record" => self.record.map(str::to_string),
            "previous" => self.previous.map(str::to_string),
            other => {
                let artifact = other.strip_prefix("artifact:")?;
                match self.artifacts.read_to_string(artifact) {
                    Ok(Some(text)) => Some(truncate_chars(&text, MAX_ARTIFACT_CHARS)),
                    Ok(None) => Some(String::new()),
                    Err(e) => {
                        tracing::warn!(artifact, error = %e, "Artifact unreadable for template");
                        Some(String::new())
                    }
                }
            }
        }
    }
}

pub fn render(template: &str, vars: &TemplateVars<'_>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            vars.resolve(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Whether `template` mentions `{name}`.
pub fn mentions(template: &str, name: &str) -> bool {
    template.contains(&format!("{{{name}}}"))
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

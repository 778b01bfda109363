//! Declarative pipeline definitions (JSON).
//!
//! ```json
//! {
//!   "name": "triage",
//!   "stages": [
//!     { "kind": "command", "name": "discover", "program": "lister",
//!       "args": ["{target}"], "output": "entities.txt", "halt_if_empty": true },
//!     { "kind": "query", "name": "assess", "prompt": "Assess:\n{artifact:entities.txt}",
//!       "fields": { "risk": "unknown" }, "output": "assessment.json",
//!       "requires": ["entities.txt"] },
//!     { "kind": "report", "name": "report", "include": ["assessment.json"] }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::artifact::validate_name;
use super::response::{FieldSpec, ResponseTemplate};
use super::stage::{Stage, StageRunner};
use super::stages::{CommandStage, QueryStage, ReportStage};
use crate::config;

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("Cannot read pipeline definition {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid pipeline definition: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Pipeline '{0}' has no stages")]
    Empty(String),

    #[error("Duplicate stage name: {0}")]
    DuplicateStage(String),

    #[error("Stage '{stage}': invalid artifact name '{name}'")]
    InvalidArtifact { stage: String, name: String },

    #[error("Stage '{stage}': {reason}")]
    InvalidRefine { stage: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub stages: Vec<StageDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageDefinition {
    Command(CommandStageDef),
    Query(QueryStageDef),
    Report(ReportStageDef),
}

/// Run an external program and store its stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStageDef {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    pub output: String,
    /// Skip (instead of failing) when the program is not on PATH.
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub requires: Vec<String>,
    /// Stop the pipeline when this stage yields nothing.
    #[serde(default)]
    pub halt_if_empty: bool,
    /// Also collect stdout JSON lines into a de-duplicated record log.
    #[serde(default)]
    pub records: Option<RecordsDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordsDef {
    pub log: String,
    pub key: String,
}

/// Ask the model for a structured answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryStageDef {
    pub name: String,
    /// Task label for logs and the cache; defaults to the stage name.
    #[serde(default)]
    pub task: Option<String>,
    pub prompt: String,
    /// Requested field → value used when the reply is unusable.
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    pub output: String,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub for_each: Option<ForEachDef>,
    #[serde(default)]
    pub refine: Option<RefineDef>,
}

/// Query once per record of a JSONL artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForEachDef {
    pub input: String,
    pub key: String,
}

/// Re-ask while `field` holds one of the `retry_on` values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefineDef {
    pub max_iterations: u32,
    pub field: String,
    #[serde(default)]
    pub retry_on: Vec<Value>,
}

/// Markdown summary of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportStageDef {
    pub name: String,
    #[serde(default = "default_report_output")]
    pub output: String,
    #[serde(default)]
    pub include: Vec<String>,
}

fn default_timeout_secs() -> u64 {
    config::DEFAULT_TASK_TIMEOUT_SECS
}

fn default_report_output() -> String {
    "report.md".to_string()
}

impl StageDefinition {
    pub fn name(&self) -> &str {
        match self {
            Self::Command(def) => &def.name,
            Self::Query(def) => &def.name,
            Self::Report(def) => &def.name,
        }
    }

    /// Every artifact name this stage reads or writes.
    fn artifact_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        match self {
            Self::Command(def) => {
                names.push(&def.output);
                names.extend(def.requires.iter().map(String::as_str));
                if let Some(records) = &def.records {
                    names.push(&records.log);
                }
            }
            Self::Query(def) => {
                names.push(&def.output);
                names.extend(def.requires.iter().map(String::as_str));
                if let Some(for_each) = &def.for_each {
                    names.push(&for_each.input);
                }
            }
            Self::Report(def) => {
                names.push(&def.output);
                names.extend(def.include.iter().map(String::as_str));
            }
        }
        names
    }

    fn build(&self) -> Box<dyn Stage> {
        match self {
            Self::Command(def) => Box::new(CommandStage::new(def.clone())),
            Self::Query(def) => Box::new(QueryStage::new(def.clone())),
            Self::Report(def) => Box::new(ReportStage::new(def.clone())),
        }
    }
}

impl QueryStageDef {
    pub fn task_label(&self) -> &str {
        self.task.as_deref().unwrap_or(&self.name)
    }

    pub fn template(&self) -> ResponseTemplate {
        ResponseTemplate::new(
            self.fields
                .iter()
                .map(|(name, fallback)| FieldSpec {
                    name: name.clone(),
                    fallback: fallback.clone(),
                })
                .collect(),
        )
    }
}

impl PipelineDefinition {
    /// Read, parse and validate a definition file.
    pub fn load(path: &Path) -> Result<Self, DefinitionError> {
        let text = std::fs::read_to_string(path).map_err(|source| DefinitionError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let definition = Self::from_json(&text)?;
        tracing::info!(
            pipeline = %definition.name,
            stages = definition.stages.len(),
            path = %path.display(),
            "Pipeline definition loaded"
        );
        Ok(definition)
    }

    pub fn from_json(text: &str) -> Result<Self, DefinitionError> {
        let definition: Self = serde_json::from_str(text)?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.stages.is_empty() {
            return Err(DefinitionError::Empty(self.name.clone()));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name()) {
                return Err(DefinitionError::DuplicateStage(stage.name().to_string()));
            }
            for name in stage.artifact_names() {
                if validate_name(name).is_err() {
                    return Err(DefinitionError::InvalidArtifact {
                        stage: stage.name().to_string(),
                        name: name.to_string(),
                    });
                }
            }
            if let StageDefinition::Query(def) = stage {
                if let Some(refine) = &def.refine {
                    if refine.max_iterations == 0 {
                        return Err(DefinitionError::InvalidRefine {
                            stage: def.name.clone(),
                            reason: "refine.max_iterations must be at least 1".into(),
                        });
                    }
                    if !def.fields.is_empty() && !def.fields.contains_key(&refine.field) {
                        return Err(DefinitionError::InvalidRefine {
                            stage: def.name.clone(),
                            reason: format!("refine.field '{}' is not a requested field", refine.field),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn build_stages(&self) -> Vec<Box<dyn Stage>> {
        self.stages.iter().map(StageDefinition::build).collect()
    }

    pub fn runner(&self) -> StageRunner {
        StageRunner::new(self.build_stages()).with_name(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE: &str = r#"{
        "name": "triage",
        "stages": [
            { "kind": "command", "name": "discover", "program": "lister",
              "args": ["{target}"], "output": "entities.txt", "halt_if_empty": true,
              "records": { "log": "entities.jsonl", "key": "id" } },
            { "kind": "query", "name": "assess", "prompt": "Assess {record}",
              "fields": { "risk": "unknown", "summary": "" },
              "output": "assessment.json",
              "for_each": { "input": "entities.jsonl", "key": "id" },
              "refine": { "max_iterations": 3, "field": "risk", "retry_on": ["unknown"] } },
            { "kind": "report", "name": "report", "include": ["assessment.json"] }
        ]
    }"#;

    #[test]
    fn parses_all_stage_kinds_with_defaults() {
        let def = PipelineDefinition::from_json(SAMPLE).unwrap();
        assert_eq!(def.name, "triage");
        assert_eq!(def.stages.len(), 3);

        let StageDefinition::Command(cmd) = &def.stages[0] else {
            panic!("expected command stage");
        };
        assert_eq!(cmd.timeout_secs, config::DEFAULT_TASK_TIMEOUT_SECS);
        assert!(!cmd.optional);
        assert!(cmd.halt_if_empty);
        assert_eq!(cmd.records.as_ref().unwrap().key, "id");

        let StageDefinition::Query(query) = &def.stages[1] else {
            panic!("expected query stage");
        };
        assert_eq!(query.task_label(), "assess");
        assert_eq!(query.refine.as_ref().unwrap().retry_on, vec![json!("unknown")]);

        let StageDefinition::Report(report) = &def.stages[2] else {
            panic!("expected report stage");
        };
        assert_eq!(report.output, "report.md");
    }

    #[test]
    fn template_follows_fields() {
        let def = PipelineDefinition::from_json(SAMPLE).unwrap();
        let StageDefinition::Query(query) = &def.stages[1] else {
            panic!("expected query stage");
        };
        let template = query.template();
        assert_eq!(template.field_names().collect::<Vec<_>>(), vec!["risk", "summary"]);
        assert_eq!(
            Value::Object(template.fallback_record()),
            json!({"risk": "unknown", "summary": ""})
        );
    }

    #[test]
    fn builds_runner_in_order() {
        let def = PipelineDefinition::from_json(SAMPLE).unwrap();
        let runner = def.runner();
        assert_eq!(runner.stage_names(), vec!["discover", "assess", "report"]);
    }

    #[test]
    fn rejects_empty_pipeline() {
        let err = PipelineDefinition::from_json(r#"{"name": "x", "stages": []}"#).unwrap_err();
        assert!(matches!(err, DefinitionError::Empty(_)));
    }

    #[test]
    fn rejects_duplicate_names() {
        let text = r#"{"name": "x", "stages": [
            {"kind": "report", "name": "r"},
            {"kind": "report", "name": "r", "output": "other.md"}
        ]}"#;
        let err = PipelineDefinition::from_json(text).unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateStage(name) if name == "r"));
    }

    #[test]
    fn rejects_path_like_artifacts() {
        let text = r#"{"name": "x", "stages": [
            {"kind": "command", "name": "c", "program": "p", "output": "../escape.txt"}
        ]}"#;
        let err = PipelineDefinition::from_json(text).unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidArtifact { name, .. } if name == "../escape.txt"));
    }

    #[test]
    fn rejects_zero_refine_budget() {
        let text = r#"{"name": "x", "stages": [
            {"kind": "query", "name": "q", "prompt": "p", "output": "q.json",
             "refine": {"max_iterations": 0, "field": "a"}}
        ]}"#;
        let err = PipelineDefinition::from_json(text).unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidRefine { .. }));
    }

    #[test]
    fn rejects_refine_on_unrequested_field() {
        let text = r#"{"name": "x", "stages": [
            {"kind": "query", "name": "q", "prompt": "p", "output": "q.json",
             "fields": {"risk": "unknown"},
             "refine": {"max_iterations": 2, "field": "score"}}
        ]}"#;
        let err = PipelineDefinition::from_json(text).unwrap_err();
        assert!(err.to_string().contains("score"));
    }

    #[test]
    fn unknown_kind_is_parse_error() {
        let text = r#"{"name": "x", "stages": [{"kind": "teleport", "name": "t"}]}"#;
        assert!(matches!(
            PipelineDefinition::from_json(text).unwrap_err(),
            DefinitionError::Parse(_)
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = PipelineDefinition::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, DefinitionError::Read { .. }));
    }

    #[test]
    fn bundled_sample_is_valid() {
        let def = PipelineDefinition::from_json(include_str!("../../pipelines/sample.json")).unwrap();
        assert_eq!(def.stages.len(), 4);
    }

    #[cfg(unix)]
    #[test]
    fn sample_pipeline_runs_end_to_end() {
        use crate::context::RunContext;
        use crate::pipeline::artifact::Run;
        use crate::pipeline::cache::MemoryCache;
        use crate::pipeline::invoker::ProcessInvoker;
        use crate::pipeline::llm::ScriptedLlmClient;
        use crate::pipeline::stage::StageState;

        let dir = tempfile::tempdir().unwrap();
        let def = PipelineDefinition::from_json(include_str!("../../pipelines/sample.json")).unwrap();
        let run = Run::create(dir.path(), "example.test", chrono::Utc::now()).unwrap();
        let llm = ScriptedLlmClient::replying(["{\"summary\": \"a test host\", \"category\": \"host\"}"]);
        let mut ctx = RunContext::new(
            run,
            Box::new(llm),
            Box::new(ProcessInvoker),
            Box::new(MemoryCache::new()),
        );

        let report = def.runner().run(&mut ctx, None);

        assert_eq!(report.count(StageState::Failed), 0);
        assert_eq!(report.record("entities").unwrap().state, StageState::Done);
        assert_eq!(report.record("assess").unwrap().state, StageState::Done);
        assert_eq!(report.record("report").unwrap().state, StageState::Done);

        let assessment: Vec<Value> = ctx.artifacts().read_json("assessment.json").unwrap().unwrap();
        assert_eq!(assessment[0]["key"], "example.test");
        assert_eq!(assessment[0]["response"]["record"]["category"], "host");
        let md = ctx.artifacts().read_to_string("report.md").unwrap().unwrap();
        assert!(md.contains("a test host"));
        assert!(ctx.artifacts().exists(config::MANIFEST_FILE));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(PipelineDefinition::load(&path).unwrap().name, "triage");
    }
}

//! Query stage: ask the model for a structured answer and store it.
//!
//! The stored artifact is the tagged `StructuredResponse`, so a reader can
//! tell a parsed answer from a fallback. In `for_each` mode the artifact is an
//! array of `{ "key", "response" }` objects, one per input record.

use serde_json::{json, Map, Value};

use super::template::{mentions, render, TemplateVars};
use crate::context::{LlmQuery, RunContext};
use crate::pipeline::definition::{QueryStageDef, RefineDef};
use crate::pipeline::focus::refine;
use crate::pipeline::records::RecordLog;
use crate::pipeline::response::{ResponseTemplate, StructuredResponse};
use crate::pipeline::stage::{Stage, StageError, StageOutcome};

type Answer = StructuredResponse<Map<String, Value>>;

pub struct QueryStage {
    def: QueryStageDef,
    template: ResponseTemplate,
}

impl QueryStage {
    pub fn new(def: QueryStageDef) -> Self {
        let template = def.template();
        Self { def, template }
    }

    /// Render the prompt. `{previous}` is empty until there is a previous answer.
    fn prompt(&self, ctx: &RunContext, record: Option<&str>, previous: Option<&str>) -> String {
        let mut vars = TemplateVars::from_context(ctx).previous(Some(previous.unwrap_or_default()));
        if let Some(record) = record {
            vars = vars.record(record);
        }
        let mut prompt = render(&self.def.prompt, &vars);

        if let Some(previous) = previous {
            if !mentions(&self.def.prompt, "previous") {
                prompt.push_str("\n\nYour previous answer was not specific enough:\n");
                prompt.push_str(previous);
            }
        }
        prompt
    }

    fn query(&self, prompt: String) -> LlmQuery {
        let query = LlmQuery::new(self.def.task_label(), prompt);
        match &self.def.system {
            Some(system) => query.system(system),
            None => query,
        }
    }

    fn ask(&self, ctx: &mut RunContext, record: Option<&str>) -> Answer {
        let Some(refine_def) = &self.def.refine else {
            let query = self.query(self.prompt(ctx, record, None));
            return ctx.query_template(&query, &self.template);
        };

        let refined = refine(
            refine_def.max_iterations,
            |iteration, previous: Option<&Answer>| {
                let previous = previous.map(|answer| Value::Object(answer.record().clone()).to_string());
                let query = self.query(self.prompt(ctx, record, previous.as_deref()));
                tracing::debug!(stage = %self.def.name, iteration, "Refinement attempt");
                // Rejected answers stay out of the cache so a repeated prompt
                // still reaches the model.
                ctx.query_template_where(&query, &self.template, |record| {
                    field_accepted(record, refine_def)
                })
            },
            |answer| !answer.is_fallback() && field_accepted(answer.record(), refine_def),
        );

        tracing::info!(
            stage = %self.def.name,
            iterations = refined.iterations,
            accepted = refined.accepted,
            "Refinement finished"
        );
        refined.value
    }

    fn ask_each(&self, ctx: &mut RunContext) -> Result<Vec<Value>, StageError> {
        let Some(for_each) = &self.def.for_each else {
            return Ok(Vec::new());
        };
        let log = RecordLog::load(ctx.artifacts().path_of(&for_each.input)?, &for_each.key)?;

        let mut results = Vec::with_capacity(log.len());
        for record in log.records() {
            let key = log.key_of(record).unwrap_or_default();
            let record_json = serde_json::to_string(record)?;
            let answer = self.ask(ctx, Some(&record_json));
            if answer.is_fallback() {
                tracing::warn!(stage = %self.def.name, key = %key, "Fallback answer for record");
            }
            results.push(json!({
                "key": key,
                "response": serde_json::to_value(&answer)?,
            }));
        }
        Ok(results)
    }
}

/// The watched field is present and holds none of the retry values.
fn field_accepted(record: &Map<String, Value>, refine_def: &RefineDef) -> bool {
    record
        .get(&refine_def.field)
        .is_some_and(|value| !refine_def.retry_on.contains(value))
}

impl Stage for QueryStage {
    fn name(&self) -> &str {
        &self.def.name
    }

    fn requires(&self) -> Vec<String> {
        let mut requires = self.def.requires.clone();
        if let Some(for_each) = &self.def.for_each {
            if !requires.contains(&for_each.input) {
                requires.push(for_each.input.clone());
            }
        }
        requires
    }

    fn run(&self, ctx: &mut RunContext) -> Result<StageOutcome, StageError> {
        if self.def.for_each.is_some() {
            let results = self.ask_each(ctx)?;
            tracing::info!(stage = %self.def.name, records = results.len(), "Per-record answers stored");
            ctx.artifacts().write_json(&self.def.output, &results)?;
        } else {
            let answer = self.ask(ctx, None);
            if let Some(note) = answer.note() {
                tracing::info!(stage = %self.def.name, note, "Stored fallback answer");
            }
            ctx.artifacts().write_json(&self.def.output, &answer)?;
        }
        Ok(StageOutcome::completed([self.def.output.as_str()]))
    }
}

//! Report stage: markdown summary of the run so far.

use std::fmt::Write as _;

use serde_json::Value;

use crate::context::RunContext;
use crate::pipeline::definition::ReportStageDef;
use crate::pipeline::stage::{Stage, StageError, StageOutcome, StageRecord};

pub struct ReportStage {
    def: ReportStageDef,
}

impl ReportStage {
    pub fn new(def: ReportStageDef) -> Self {
        Self { def }
    }

    fn render(&self, ctx: &RunContext) -> String {
        let run = ctx.run();
        let mut md = String::new();

        let _ = writeln!(md, "# Run report: {}\n", run.target);
        let _ = writeln!(md, "- Run id: `{}`", run.id);
        let _ = writeln!(md, "- Started: {}", run.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
        let _ = writeln!(md, "- Directory: `{}`\n", run.dir.display());

        md.push_str("## Stages\n\n");
        md.push_str("| Stage | State | Duration (ms) | Notes |\n");
        md.push_str("|---|---|---|---|\n");
        for record in ctx.history() {
            let _ = writeln!(
                md,
                "| {} | {} | {} | {} |",
                record.name,
                record.state,
                record.duration_ms,
                notes(record)
            );
        }

        for name in &self.def.include {
            let _ = writeln!(md, "\n## {name}\n");
            md.push_str(&artifact_section(ctx, name));
        }

        md
    }
}

fn notes(record: &StageRecord) -> String {
    let text = if let Some(error) = &record.error {
        error.clone()
    } else if let Some(reason) = &record.skip_reason {
        reason.clone()
    } else {
        record.outputs.join(", ")
    };
    text.replace('|', "\\|").replace('\n', " ")
}

fn artifact_section(ctx: &RunContext, name: &str) -> String {
    match ctx.artifacts().read_to_string(name) {
        Ok(Some(text)) => {
            if name.ends_with(".json") {
                if let Ok(value) = serde_json::from_str::<Value>(&text) {
                    let pretty = serde_json::to_string_pretty(&value).unwrap_or(text);
                    return format!("```json\n{pretty}\n```\n");
                }
            }
            format!("```text\n{}\n```\n", text.trim_end())
        }
        Ok(None) => "_not produced_\n".to_string(),
        Err(e) => {
            tracing::warn!(artifact = name, error = %e, "Artifact unreadable for report");
            format!("_unreadable: {e}_\n")
        }
    }
}

impl Stage for ReportStage {
    fn name(&self) -> &str {
        &self.def.name
    }

    fn run(&self, ctx: &mut RunContext) -> Result<StageOutcome, StageError> {
        let report = self.render(ctx);
        ctx.artifacts().write_text(&self.def.output, &report)?;
        tracing::info!(output = %self.def.output, "Run report written");
        Ok(StageOutcome::completed([self.def.output.as_str()]))
    }
}

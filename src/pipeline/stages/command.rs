//! Command stage: run an external program and keep its stdout.

use std::time::Duration;

use serde_json::Value;

use super::template::{render, TemplateVars};
use crate::context::RunContext;
use crate::pipeline::definition::CommandStageDef;
use crate::pipeline::invoker::{TaskOutcome, TaskSpec};
use crate::pipeline::records::RecordLog;
use crate::pipeline::stage::{Stage, StageError, StageOutcome};

pub struct CommandStage {
    def: CommandStageDef,
}

impl CommandStage {
    pub fn new(def: CommandStageDef) -> Self {
        Self { def }
    }

    fn task(&self, ctx: &RunContext) -> TaskSpec {
        let vars = TemplateVars::from_context(ctx);
        TaskSpec::new(
            render(&self.def.program, &vars),
            Duration::from_secs(self.def.timeout_secs),
        )
        .args(self.def.args.iter().map(|arg| render(arg, &vars)))
        .working_dir(ctx.artifacts().dir())
    }

    /// Add each JSON object line of `stdout` to the record log. Returns the
    /// number of new records and the log size.
    fn collect_records(&self, ctx: &RunContext, stdout: &str) -> Result<(usize, usize), StageError> {
        let Some(records) = &self.def.records else {
            return Ok((0, 0));
        };
        let path = ctx.artifacts().path_of(&records.log)?;
        let mut log = RecordLog::load(path, &records.key)?;

        let mut added = 0;
        for line in stdout.lines().map(str::trim).filter(|l| l.starts_with('{')) {
            match serde_json::from_str::<Value>(line) {
                Ok(record) => {
                    if log.append(record)? {
                        added += 1;
                    }
                }
                Err(e) => tracing::debug!(error = %e, "Non-JSON output line ignored"),
            }
        }
        Ok((added, log.len()))
    }
}

impl Stage for CommandStage {
    fn name(&self) -> &str {
        &self.def.name
    }

    fn requires(&self) -> Vec<String> {
        self.def.requires.clone()
    }

    fn run(&self, ctx: &mut RunContext) -> Result<StageOutcome, StageError> {
        let task = self.task(ctx);

        if self.def.optional && !ctx.invoker().is_available(&task.program) {
            return Ok(StageOutcome::skipped(format!(
                "program '{}' not found on PATH",
                task.program
            )));
        }

        let stdout = match ctx.invoke(&task) {
            TaskOutcome::Completed(output) => {
                tracing::info!(
                    stage = %self.def.name,
                    bytes = output.stdout.len(),
                    duration_ms = output.duration_ms,
                    "Task completed"
                );
                output.stdout
            }
            TaskOutcome::NoResult(reason) => {
                tracing::warn!(stage = %self.def.name, reason = %reason, "Task produced no result");
                String::new()
            }
        };

        ctx.artifacts().write_text(&self.def.output, &stdout)?;
        let mut outputs = vec![self.def.output.clone()];

        let (added, total) = self.collect_records(ctx, &stdout)?;
        if let Some(records) = &self.def.records {
            tracing::info!(stage = %self.def.name, added, total, "Records collected");
            if ctx.artifacts().exists(&records.log) {
                outputs.push(records.log.clone());
            }
        }

        if self.def.halt_if_empty {
            let empty = match &self.def.records {
                Some(_) => total == 0,
                None => stdout.trim().is_empty(),
            };
            if empty {
                return Ok(StageOutcome::ShortCircuit {
                    outputs,
                    reason: format!("stage '{}' produced no results", self.def.name),
                });
            }
        }

        Ok(StageOutcome::Completed { outputs })
    }
}

//! StageRunner: executes stages in order against one run.
//!
//! Runs sequentially. A stage that errors (or panics) is recorded as Failed
//! and the next stage starts anyway; only a short-circuit stops the pipeline.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use chrono::Utc;

use super::error::StageError;
use super::traits::Stage;
use super::types::*;
use crate::config;
use crate::context::RunContext;

pub struct StageRunner {
    stages: Vec<Box<dyn Stage>>,
    pipeline_name: Option<String>,
}

impl StageRunner {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self {
            stages,
            pipeline_name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.pipeline_name = Some(name.into());
        self
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage, then write the run manifest.
    pub fn run(&self, ctx: &mut RunContext, progress_fn: Option<&dyn Fn(StageEvent)>) -> RunReport {
        let span = ctx.span().clone();
        let _guard = span.enter();

        let start = Instant::now();
        let emit = |event: StageEvent| {
            if let Some(progress) = progress_fn {
                progress(event);
            }
        };

        emit(StageEvent::Started {
            stage_count: self.stages.len(),
        });
        tracing::info!(stages = self.stages.len(), "Pipeline started");

        let mut records = Vec::with_capacity(self.stages.len());
        let mut short_circuit: Option<(String, String)> = None;

        for (index, stage) in self.stages.iter().enumerate() {
            let name = stage.name().to_string();

            let record = if let Some((by, reason)) = &short_circuit {
                tracing::info!(stage = %name, by = %by, "Skipping stage after short-circuit");
                StageRecord::skipped(&name, format!("{by} short-circuited the run: {reason}"))
            } else {
                emit(StageEvent::StageStarted {
                    index,
                    name: name.clone(),
                });
                let (record, halt) = execute(stage.as_ref(), ctx);
                if let Some(reason) = halt {
                    short_circuit = Some((name.clone(), reason));
                }
                record
            };

            emit(StageEvent::StageFinished {
                index,
                name,
                state: record.state,
            });
            ctx.push_history(record.clone());
            records.push(record);
        }

        let report = RunReport {
            duration_ms: start.elapsed().as_millis() as u64,
            short_circuit: short_circuit.map(|(_, reason)| reason),
            records,
        };

        self.write_manifest(ctx, report.records.clone());

        emit(StageEvent::Completed {
            done: report.count(StageState::Done),
            failed: report.count(StageState::Failed),
            skipped: report.count(StageState::Skipped),
            duration_ms: report.duration_ms,
        });
        tracing::info!(
            done = report.count(StageState::Done),
            failed = report.count(StageState::Failed),
            skipped = report.count(StageState::Skipped),
            duration_ms = report.duration_ms,
            "Pipeline finished"
        );

        report
    }

    /// Run a single stage by name against the current run directory and
    /// merge its record into the existing manifest. `None` if no stage has
    /// that name.
    pub fn run_stage(&self, ctx: &mut RunContext, name: &str) -> Option<StageRecord> {
        let stage = self.stages.iter().find(|s| s.name() == name)?;
        let span = ctx.span().clone();
        let _guard = span.enter();

        let (record, halt) = execute(stage.as_ref(), ctx);
        if let Some(reason) = halt {
            tracing::info!(stage = name, reason = %reason, "Stage requested short-circuit");
        }
        ctx.push_history(record.clone());

        let mut stages = match ctx.artifacts().read_json::<RunManifest>(config::MANIFEST_FILE) {
            Ok(Some(manifest)) => manifest.stages,
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "Existing run manifest unreadable, replacing it");
                Vec::new()
            }
        };
        match stages.iter_mut().find(|r| r.name == name) {
            Some(existing) => *existing = record.clone(),
            None => stages.push(record.clone()),
        }
        self.write_manifest(ctx, stages);

        Some(record)
    }

    fn write_manifest(&self, ctx: &RunContext, stages: Vec<StageRecord>) {
        let manifest = RunManifest {
            run_id: ctx.run().id,
            target: ctx.target().to_string(),
            pipeline: self.pipeline_name.clone(),
            started_at: ctx.run().started_at,
            finished_at: Utc::now(),
            stages,
        };
        if let Err(e) = ctx.artifacts().write_json(config::MANIFEST_FILE, &manifest) {
            tracing::warn!(error = %e, "Failed to write run manifest");
        }
    }
}

/// Run one stage through its state machine. Returns the record and, when
/// the stage short-circuited, the reason.
fn execute(stage: &dyn Stage, ctx: &mut RunContext) -> (StageRecord, Option<String>) {
    let name = stage.name();

    let missing: Vec<String> = stage
        .requires()
        .into_iter()
        .filter(|artifact| !ctx.artifacts().exists(artifact))
        .collect();
    if !missing.is_empty() {
        let reason = format!("missing precondition: {}", missing.join(", "));
        tracing::info!(stage = name, reason = %reason, "Stage skipped");
        return (StageRecord::skipped(name, reason), None);
    }

    let mut record = StageRecord::pending(name);
    record.state = StageState::Running;
    record.started_at = Some(Utc::now());
    let start = Instant::now();
    tracing::info!(stage = name, "Stage running");

    let result = catch_unwind(AssertUnwindSafe(|| stage.run(ctx)))
        .unwrap_or_else(|payload| Err(StageError::Panicked(panic_message(payload.as_ref()))));

    record.duration_ms = start.elapsed().as_millis() as u64;
    record.finished_at = Some(Utc::now());

    let mut halt = None;
    match result {
        Ok(StageOutcome::Completed { outputs }) => {
            record.state = StageState::Done;
            record.outputs = outputs;
        }
        Ok(StageOutcome::Skipped { reason }) => {
            record.state = StageState::Skipped;
            record.skip_reason = Some(reason);
        }
        Ok(StageOutcome::ShortCircuit { outputs, reason }) => {
            record.state = StageState::Done;
            record.outputs = outputs;
            halt = Some(reason);
        }
        Err(e) => {
            tracing::error!(stage = name, error = %e, "Stage failed, continuing with next stage");
            record.state = StageState::Failed;
            record.error = Some(e.to_string());
        }
    }

    tracing::info!(
        stage = name,
        state = %record.state,
        duration_ms = record.duration_ms,
        "Stage finished"
    );
    (record, halt)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::artifact::Run;
    use crate::pipeline::cache::MemoryCache;
    use crate::pipeline::invoker::ProcessInvoker;
    use crate::pipeline::llm::MockLlmClient;
    use std::cell::RefCell;

    /// Writes `output` with fixed content, or fails, depending on `mode`.
    struct TestStage {
        name: &'static str,
        requires: Vec<String>,
        mode: Mode,
    }

    enum Mode {
        Write(&'static str),
        Fail,
        Panic,
        Halt,
    }

    impl TestStage {
        fn new(name: &'static str, mode: Mode) -> Self {
            Self {
                name,
                requires: Vec::new(),
                mode,
            }
        }

        fn requiring(mut self, artifact: &str) -> Self {
            self.requires.push(artifact.to_string());
            self
        }
    }

    impl Stage for TestStage {
        fn name(&self) -> &str {
            self.name
        }

        fn requires(&self) -> Vec<String> {
            self.requires.clone()
        }

        fn run(&self, ctx: &mut RunContext) -> Result<StageOutcome, StageError> {
            match self.mode {
                Mode::Write(output) => {
                    ctx.artifacts().write_text(output, self.name)?;
                    Ok(StageOutcome::completed([output]))
                }
                Mode::Fail => Err(StageError::Failed("tool exploded".into())),
                Mode::Panic => panic!("stage bug"),
                Mode::Halt => Ok(StageOutcome::ShortCircuit {
                    outputs: vec![],
                    reason: "no entities discovered".into(),
                }),
            }
        }
    }

    fn context(dir: &std::path::Path) -> RunContext {
        let run = Run::open(dir, "example.test").unwrap();
        RunContext::new(
            run,
            Box::new(MockLlmClient::new("")),
            Box::new(ProcessInvoker),
            Box::new(MemoryCache::new()),
        )
    }

    #[test]
    fn failure_does_not_stop_later_stages() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let runner = StageRunner::new(vec![
            Box::new(TestStage::new("discover", Mode::Write("found.txt"))),
            Box::new(TestStage::new("broken", Mode::Fail)),
            Box::new(TestStage::new("crashy", Mode::Panic)),
            Box::new(TestStage::new("summarize", Mode::Write("summary.txt"))),
        ]);

        let report = runner.run(&mut ctx, None);

        assert_eq!(report.record("discover").unwrap().state, StageState::Done);
        let broken = report.record("broken").unwrap();
        assert_eq!(broken.state, StageState::Failed);
        assert_eq!(broken.error.as_deref(), Some("tool exploded"));
        let crashy = report.record("crashy").unwrap();
        assert_eq!(crashy.state, StageState::Failed);
        assert!(crashy.error.as_deref().unwrap().contains("stage bug"));
        assert_eq!(report.record("summarize").unwrap().state, StageState::Done);
        assert!(ctx.artifacts().exists("summary.txt"));
    }

    #[test]
    fn missing_precondition_skips_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let runner = StageRunner::new(vec![Box::new(
            TestStage::new("dependent", Mode::Write("derived.txt")).requiring("input.json"),
        )]);

        let report = runner.run(&mut ctx, None);

        let record = report.record("dependent").unwrap();
        assert_eq!(record.state, StageState::Skipped);
        assert!(record.skip_reason.as_deref().unwrap().contains("input.json"));
        assert!(record.error.is_none());
        assert!(!ctx.artifacts().exists("derived.txt"));
    }

    #[test]
    fn precondition_written_upstream_is_satisfied() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let runner = StageRunner::new(vec![
            Box::new(TestStage::new("first", Mode::Write("input.json"))),
            Box::new(TestStage::new("second", Mode::Write("derived.txt")).requiring("input.json")),
        ]);

        let report = runner.run(&mut ctx, None);
        assert!(report.all_done());
    }

    #[test]
    fn short_circuit_skips_downstream() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let runner = StageRunner::new(vec![
            Box::new(TestStage::new("discover", Mode::Halt)),
            Box::new(TestStage::new("analyze", Mode::Write("a.txt"))),
            Box::new(TestStage::new("report", Mode::Write("r.txt"))),
        ]);

        let report = runner.run(&mut ctx, None);

        assert_eq!(report.record("discover").unwrap().state, StageState::Done);
        assert_eq!(report.short_circuit.as_deref(), Some("no entities discovered"));
        for name in ["analyze", "report"] {
            let r = report.record(name).unwrap();
            assert_eq!(r.state, StageState::Skipped);
            assert!(r.skip_reason.as_deref().unwrap().contains("discover"));
        }
        assert!(!ctx.artifacts().exists("a.txt"));
        assert_eq!(report.count(StageState::Failed), 0);
    }

    #[test]
    fn manifest_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let runner = StageRunner::new(vec![
            Box::new(TestStage::new("one", Mode::Write("one.txt"))),
            Box::new(TestStage::new("two", Mode::Fail)),
        ])
        .with_name("demo");

        runner.run(&mut ctx, None);

        let manifest: RunManifest = ctx
            .artifacts()
            .read_json(config::MANIFEST_FILE)
            .unwrap()
            .unwrap();
        assert_eq!(manifest.pipeline.as_deref(), Some("demo"));
        assert_eq!(manifest.target, "example.test");
        assert_eq!(manifest.stages.len(), 2);
        assert_eq!(manifest.stages[0].outputs, vec!["one.txt"]);
        assert_eq!(manifest.stages[1].state, StageState::Failed);
    }

    #[test]
    fn progress_events_are_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let runner = StageRunner::new(vec![
            Box::new(TestStage::new("a", Mode::Write("a.txt"))),
            Box::new(TestStage::new("b", Mode::Fail)),
        ]);
        let events = RefCell::new(Vec::new());
        let observer = |e: StageEvent| events.borrow_mut().push(e);

        runner.run(&mut ctx, Some(&observer));

        let events = events.into_inner();
        assert_eq!(events.len(), 6);
        assert_eq!(events[0], StageEvent::Started { stage_count: 2 });
        assert_eq!(
            events[4],
            StageEvent::StageFinished {
                index: 1,
                name: "b".into(),
                state: StageState::Failed
            }
        );
        assert!(matches!(
            events[5],
            StageEvent::Completed {
                done: 1,
                failed: 1,
                skipped: 0,
                ..
            }
        ));
    }

    #[test]
    fn history_is_visible_to_later_stages() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let runner = StageRunner::new(vec![
            Box::new(TestStage::new("a", Mode::Write("a.txt"))),
            Box::new(TestStage::new("b", Mode::Fail)),
        ]);
        runner.run(&mut ctx, None);
        let names: Vec<_> = ctx.history().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn run_stage_merges_into_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        let runner = StageRunner::new(vec![
            Box::new(TestStage::new("a", Mode::Write("a.txt"))),
            Box::new(TestStage::new("b", Mode::Write("b.txt"))),
        ]);

        let record = runner.run_stage(&mut ctx, "b").unwrap();
        assert_eq!(record.state, StageState::Done);
        runner.run_stage(&mut ctx, "a").unwrap();
        runner.run_stage(&mut ctx, "b").unwrap();
        assert!(runner.run_stage(&mut ctx, "missing").is_none());

        let manifest: RunManifest = ctx
            .artifacts()
            .read_json(config::MANIFEST_FILE)
            .unwrap()
            .unwrap();
        let names: Vec<_> = manifest.stages.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn rerunning_a_stage_keeps_run_identity() {
        let dir = tempfile::tempdir().unwrap();
        let runner = StageRunner::new(vec![
            Box::new(TestStage::new("a", Mode::Write("a.txt"))),
            Box::new(TestStage::new("b", Mode::Write("b.txt"))),
        ]);

        let mut ctx = context(dir.path());
        runner.run(&mut ctx, None);
        let first: RunManifest = ctx
            .artifacts()
            .read_json(config::MANIFEST_FILE)
            .unwrap()
            .unwrap();

        // A later invocation attaches to the same directory
        let mut again = context(dir.path());
        assert_eq!(again.run().id, first.run_id);
        runner.run_stage(&mut again, "b").unwrap();

        let second: RunManifest = again
            .artifacts()
            .read_json(config::MANIFEST_FILE)
            .unwrap()
            .unwrap();
        assert_eq!(second.run_id, first.run_id);
        assert_eq!(second.started_at, first.started_at);
        assert_eq!(second.target, "example.test");
        assert_eq!(second.stages.len(), 2);
    }
}

//! Run context: everything a stage needs, passed explicitly.
//!
//! Holds the run identity, artifact store, external collaborators (model
//! client, task invoker), the result cache and the prompt log. The tracing span
//! it carries tags every stage log line with the run's target and id.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::config;
use crate::pipeline::artifact::{ArtifactStore, Run};
use crate::pipeline::cache::{cache_key, ResultCache};
use crate::pipeline::invoker::{TaskInvoker, TaskOutcome, TaskSpec};
use crate::pipeline::llm::{LlmClient, PromptLog, PromptLogEntry};
use crate::pipeline::response::{
    fallback_response, parse_structured, FallbackReason, ResponseShape, ResponseTemplate,
    StructuredResponse,
};
use crate::pipeline::stage::StageRecord;

/// One model request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmQuery {
    pub task: String,
    pub prompt: String,
    pub system: String,
    /// Explicit cache key; derived from model, task, system and prompt when unset.
    pub cache_key: Option<String>,
}

impl LlmQuery {
    pub fn new(task: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            prompt: prompt.into(),
            system: "Output valid JSON only.".into(),
            cache_key: None,
        }
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    fn source(&self, model: &str) -> String {
        format!("{model}\n{}\n{}\n{}", self.task, self.system, self.prompt)
    }

    pub fn key_for(&self, model: &str) -> String {
        self.cache_key
            .clone()
            .unwrap_or_else(|| cache_key(&self.source(model)))
    }
}

pub struct RunContext {
    run: Run,
    artifacts: ArtifactStore,
    llm: Box<dyn LlmClient>,
    invoker: Box<dyn TaskInvoker>,
    cache: Box<dyn ResultCache>,
    prompt_log: PromptLog,
    model: String,
    history: Vec<StageRecord>,
    span: tracing::Span,
}

impl RunContext {
    pub fn new(
        run: Run,
        llm: Box<dyn LlmClient>,
        invoker: Box<dyn TaskInvoker>,
        cache: Box<dyn ResultCache>,
    ) -> Self {
        let span = tracing::info_span!(
            "run",
            run_target = %run.target,
            run_id = %run.id,
        );
        let artifacts = run.artifacts();
        let prompt_log = PromptLog::at(run.dir.join(config::PROMPT_LOG_FILE));
        Self {
            run,
            artifacts,
            llm,
            invoker,
            cache,
            prompt_log,
            model: config::DEFAULT_MODEL.to_string(),
            history: Vec::new(),
            span,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_prompt_log(mut self, log: PromptLog) -> Self {
        self.prompt_log = log;
        self
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn target(&self) -> &str {
        &self.run.target
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn llm(&self) -> &dyn LlmClient {
        self.llm.as_ref()
    }

    pub fn invoker(&self) -> &dyn TaskInvoker {
        self.invoker.as_ref()
    }

    pub fn cache(&self) -> &dyn ResultCache {
        self.cache.as_ref()
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Records of stages that have finished so far in this run.
    pub fn history(&self) -> &[StageRecord] {
        &self.history
    }

    pub(crate) fn push_history(&mut self, record: StageRecord) {
        self.history.push(record);
    }

    /// Run an external task. Never fails; see `TaskOutcome`.
    pub fn invoke(&self, task: &TaskSpec) -> TaskOutcome {
        tracing::info!(task = %task.display(), "Invoking external task");
        self.invoker.invoke(task)
    }

    /// Ask the model for a typed record, going through the cache.
    pub fn query<T>(&mut self, query: &LlmQuery) -> StructuredResponse<T>
    where
        T: ResponseShape + Serialize,
    {
        self.query_with(
            query,
            parse_structured::<T>,
            T::fallback,
            |value| serde_json::from_value(value).ok(),
            |record| serde_json::to_value(record).ok(),
        )
    }

    /// Ask the model for a record whose shape is defined at runtime.
    pub fn query_template(
        &mut self,
        query: &LlmQuery,
        template: &ResponseTemplate,
    ) -> StructuredResponse<Map<String, Value>> {
        self.query_template_where(query, template, |_| true)
    }

    /// Like `query_template`, but a parsed record is only cached when `keep`
    /// holds for it. A rejected record is asked for again on the next call.
    pub fn query_template_where(
        &mut self,
        query: &LlmQuery,
        template: &ResponseTemplate,
        keep: impl Fn(&Map<String, Value>) -> bool,
    ) -> StructuredResponse<Map<String, Value>> {
        self.query_with(
            query,
            |raw| template.parse(raw),
            || template.fallback_record(),
            |value| match value {
                Value::Object(map) if template.accepts(&map) => Some(map),
                _ => None,
            },
            |record| keep(record).then(|| Value::Object(record.clone())),
        )
    }

    /// Cache lookup → model call → parse → cache store. Only parsed records
    /// that `store` maps to a value are cached; a fallback is retried on the
    /// next call.
    fn query_with<R>(
        &mut self,
        query: &LlmQuery,
        decode: impl Fn(&str) -> StructuredResponse<R>,
        fallback: impl FnOnce() -> R,
        restore: impl Fn(Value) -> Option<R>,
        store: impl Fn(&R) -> Option<Value>,
    ) -> StructuredResponse<R> {
        let key = query.key_for(&self.model);

        if let Some(record) = self.cache.get(&key).and_then(restore) {
            tracing::debug!(task = %query.task, key = %key, "Cache hit, skipping model call");
            self.log_prompt(query, "", true);
            return StructuredResponse::Parsed { record };
        }

        let raw = match self.llm.generate(&self.model, &query.prompt, &query.system) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(task = %query.task, error = %e, "Model call failed, using fallback");
                return fallback_response(fallback(), FallbackReason::CallFailed(e.to_string()), "");
            }
        };
        self.log_prompt(query, &raw, false);

        let response = decode(&raw);
        match &response {
            StructuredResponse::Parsed { record } => {
                if let Some(value) = store(record) {
                    if let Err(e) = self.cache.put(&key, &query.source(&self.model), value) {
                        tracing::warn!(error = %e, "Failed to store result in cache");
                    }
                }
            }
            StructuredResponse::Fallback { reason, .. } => {
                tracing::warn!(task = %query.task, reason = %reason, "Model reply unusable, using fallback");
            }
        }
        response
    }

    fn log_prompt(&self, query: &LlmQuery, response: &str, cached: bool) {
        self.prompt_log.record(&PromptLogEntry {
            time: chrono::Utc::now(),
            task: query.task.clone(),
            model: self.model.clone(),
            prompt: query.prompt.clone(),
            response: response.to_string(),
            cached,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::cache::MemoryCache;
    use crate::pipeline::invoker::{NoResultReason, ProcessInvoker};
    use crate::pipeline::llm::{LlmError, MockLlmClient, ScriptedLlmClient};
    use crate::pipeline::response::FieldSpec;
    use serde::Deserialize;
    use serde_json::json;
    use std::rc::Rc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Verdict {
        risk: String,
        #[serde(default)]
        notes: String,
    }

    impl ResponseShape for Verdict {
        const FIELDS: &'static [&'static str] = &["risk"];

        fn fallback() -> Self {
            Self {
                risk: "unknown".into(),
                notes: String::new(),
            }
        }
    }

    fn context(dir: &std::path::Path, llm: Box<dyn LlmClient>) -> RunContext {
        let run = Run::open(dir, "example.test").unwrap();
        RunContext::new(run, llm, Box::new(ProcessInvoker), Box::new(MemoryCache::new()))
    }

    #[test]
    fn cached_key_skips_second_model_call() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Rc::new(MockLlmClient::new(
            "Thinking...\n{\"risk\": \"low\", \"notes\": \"quiet\"}",
        ));
        let mut ctx = context(dir.path(), Box::new(mock.clone()));
        let query = LlmQuery::new("assess", "assess the thing").cache_key("k1");

        assert!(ctx.cache().get("k1").is_none());

        let first: StructuredResponse<Verdict> = ctx.query(&query);
        assert!(!first.is_fallback());
        assert_eq!(mock.calls(), 1);
        assert_eq!(ctx.cache().get("k1"), Some(json!({"risk": "low", "notes": "quiet"})));

        let second: StructuredResponse<Verdict> = ctx.query(&query);
        assert_eq!(second, first);
        assert_eq!(mock.calls(), 1, "second call must be served from cache");
    }

    #[test]
    fn fallback_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlmClient::replying(["no idea", "{\"risk\": \"high\"}"]);
        let mut ctx = context(dir.path(), Box::new(llm));
        let query = LlmQuery::new("assess", "p");

        let first: StructuredResponse<Verdict> = ctx.query(&query);
        assert!(first.is_fallback());
        assert!(first.note().unwrap().contains("no idea"));
        assert!(ctx.cache().is_empty());

        let second: StructuredResponse<Verdict> = ctx.query(&query);
        assert_eq!(second.record().risk, "high");
        assert_eq!(ctx.cache().len(), 1);
    }

    #[test]
    fn model_error_becomes_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let llm = ScriptedLlmClient::new([Err(LlmError::Timeout(3))]);
        let mut ctx = context(dir.path(), Box::new(llm));

        let resp: StructuredResponse<Verdict> = ctx.query(&LlmQuery::new("assess", "p"));
        assert_eq!(resp.record(), &Verdict::fallback());
        assert!(matches!(
            resp.fallback_reason(),
            Some(FallbackReason::CallFailed(_))
        ));
    }

    #[test]
    fn template_query_uses_cache_and_validates_shape() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Rc::new(MockLlmClient::new("{\"summary\": \"ok\", \"score\": 3}"));
        let mut ctx = context(dir.path(), Box::new(mock.clone()));
        let template = ResponseTemplate::new(vec![FieldSpec {
            name: "summary".into(),
            fallback: json!(""),
        }]);
        let query = LlmQuery::new("summarize", "p");

        let a = ctx.query_template(&query, &template);
        let b = ctx.query_template(&query, &template);
        assert_eq!(Value::Object(a.into_record()), json!({"summary": "ok"}));
        assert_eq!(Value::Object(b.into_record()), json!({"summary": "ok"}));
        assert_eq!(mock.calls(), 1);

        // A cached record that does not fit a stricter template is ignored
        let stricter = ResponseTemplate::new(vec![FieldSpec {
            name: "verdict".into(),
            fallback: json!("unknown"),
        }]);
        let c = ctx.query_template(&query, &stricter);
        assert!(c.is_fallback());
        assert_eq!(mock.calls(), 2);
    }

    #[test]
    fn rejected_record_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let llm = Rc::new(ScriptedLlmClient::replying([
            "{\"summary\": \"unknown\"}",
            "{\"summary\": \"a host\"}",
        ]));
        let mut ctx = context(dir.path(), Box::new(llm.clone()));
        let template = ResponseTemplate::new(vec![FieldSpec {
            name: "summary".into(),
            fallback: json!("unknown"),
        }]);
        let query = LlmQuery::new("summarize", "p");
        let keep = |record: &Map<String, Value>| record.get("summary") != Some(&json!("unknown"));

        let first = ctx.query_template_where(&query, &template, keep);
        assert!(!first.is_fallback());
        assert!(ctx.cache().is_empty());

        let second = ctx.query_template_where(&query, &template, keep);
        assert_eq!(Value::Object(second.into_record()), json!({"summary": "a host"}));
        assert_eq!(llm.prompts().len(), 2);
        assert_eq!(ctx.cache().len(), 1);
    }

    #[test]
    fn derived_key_depends_on_model() {
        let q = LlmQuery::new("t", "p");
        assert_ne!(q.key_for("a"), q.key_for("b"));
        assert_eq!(q.key_for("a"), q.key_for("a"));
        assert_eq!(q.clone().cache_key("fixed").key_for("a"), "fixed");
    }

    #[test]
    fn prompt_log_records_calls() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), Box::new(MockLlmClient::new("{\"risk\": \"low\"}")));
        let query = LlmQuery::new("assess", "p");
        let _: StructuredResponse<Verdict> = ctx.query(&query);
        let _: StructuredResponse<Verdict> = ctx.query(&query);

        let log = std::fs::read_to_string(dir.path().join(config::PROMPT_LOG_FILE)).unwrap();
        let entries: Vec<PromptLogEntry> = log
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].cached);
        assert!(entries[1].cached);
    }

    #[cfg(unix)]
    #[test]
    fn invoke_delegates_to_invoker() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Box::new(MockLlmClient::new("")));
        let outcome = ctx.invoke(&TaskSpec::new("false", std::time::Duration::from_secs(5)));
        assert!(matches!(
            outcome,
            TaskOutcome::NoResult(NoResultReason::NonZeroExit { .. })
        ));
    }
}

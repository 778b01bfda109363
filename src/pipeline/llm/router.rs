//! Model router: asks the model which installed model suits a task.
//!
//! Resolution order:
//! 1. Installed models from the server (none reachable → default)
//! 2. Model's own pick, parsed as a structured response
//! 3. Default model when the pick is a fallback, empty, or not installed

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::prompt_log::append_json_line;
use super::LlmClient;
use crate::pipeline::response::{parse_structured, ResponseShape};

const ROUTER_SYSTEM: &str = "You are a model routing assistant. Output valid JSON only.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelChoice {
    pub model: String,
    #[serde(default)]
    pub reason: String,
}

impl ResponseShape for ModelChoice {
    const FIELDS: &'static [&'static str] = &["model"];

    fn fallback() -> Self {
        Self {
            model: String::new(),
            reason: "fallback to default".into(),
        }
    }
}

#[derive(Serialize)]
struct ChoiceLogEntry<'a> {
    time: DateTime<Utc>,
    task: &'a str,
    context: Option<&'a str>,
    model: &'a str,
    reason: &'a str,
}

pub struct ModelRouter {
    default_model: String,
    choices_log: Option<PathBuf>,
}

impl ModelRouter {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            default_model: default_model.into(),
            choices_log: None,
        }
    }

    /// Append every decision to a JSONL file.
    pub fn with_choices_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.choices_log = Some(path.into());
        self
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn choose(&self, llm: &dyn LlmClient, task: &str, context: Option<&str>) -> ModelChoice {
        let choice = self.resolve(llm, task, context);

        tracing::info!(
            task,
            model = %choice.model,
            reason = %choice.reason,
            "Model selected"
        );

        if let Some(path) = &self.choices_log {
            append_json_line(
                path,
                &ChoiceLogEntry {
                    time: Utc::now(),
                    task,
                    context,
                    model: &choice.model,
                    reason: &choice.reason,
                },
            );
        }

        choice
    }

    fn resolve(&self, llm: &dyn LlmClient, task: &str, context: Option<&str>) -> ModelChoice {
        let installed = match llm.list_models() {
            Ok(models) if !models.is_empty() => models,
            Ok(_) => return self.default_choice("no models installed"),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot list models, using default");
                return self.default_choice("model server unavailable");
            }
        };

        if installed.len() == 1 {
            return ModelChoice {
                model: installed[0].clone(),
                reason: "only installed model".into(),
            };
        }

        let prompt = routing_prompt(task, context, &installed);
        let reply = match llm.generate(&self.default_model, &prompt, ROUTER_SYSTEM) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(task, error = %e, "Routing call failed, using default");
                return self.default_choice("routing call failed");
            }
        };

        let parsed = parse_structured::<ModelChoice>(&reply);
        if parsed.is_fallback() {
            return self.default_choice("fallback to default");
        }

        let choice = parsed.into_record();
        let picked = choice.model.trim();
        if picked.is_empty() {
            return self.default_choice("router returned no model");
        }
        if !installed.iter().any(|m| m.starts_with(picked)) {
            return self.default_choice(&format!("suggested model {picked} is not installed"));
        }

        ModelChoice {
            model: picked.to_string(),
            reason: choice.reason,
        }
    }

    fn default_choice(&self, reason: &str) -> ModelChoice {
        ModelChoice {
            model: self.default_model.clone(),
            reason: reason.to_string(),
        }
    }
}

fn routing_prompt(task: &str, context: Option<&str>, installed: &[String]) -> String {
    format!(
        "Select the best model for a task.\n\
         Task: {task}\n\
         Context: {}\n\
         Installed models: {}\n\n\
         Return JSON on the last line:\n\
         {{\"model\": \"<one of the installed models>\", \"reason\": \"...\"}}",
        context.unwrap_or("none"),
        installed.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::llm::{LlmError, MockLlmClient, ScriptedLlmClient};

    fn models() -> Vec<String> {
        vec!["mistral:7b-instruct".into(), "llama3:8b".into()]
    }

    #[test]
    fn accepts_installed_pick() {
        let llm = MockLlmClient::new(r#"{"model": "llama3:8b", "reason": "better at summaries"}"#)
            .with_models(models());
        let choice = ModelRouter::new("mistral:7b-instruct").choose(&llm, "summarize", None);
        assert_eq!(choice.model, "llama3:8b");
        assert_eq!(choice.reason, "better at summaries");
    }

    #[test]
    fn unparseable_reply_uses_default() {
        let llm = MockLlmClient::new("I'd go with llama probably").with_models(models());
        let choice = ModelRouter::new("mistral:7b-instruct").choose(&llm, "t", Some("ctx"));
        assert_eq!(choice.model, "mistral:7b-instruct");
        assert_eq!(choice.reason, "fallback to default");
    }

    #[test]
    fn uninstalled_pick_uses_default() {
        let llm = MockLlmClient::new(r#"{"model": "gpt-99", "reason": "x"}"#).with_models(models());
        let choice = ModelRouter::new("mistral:7b-instruct").choose(&llm, "t", None);
        assert_eq!(choice.model, "mistral:7b-instruct");
        assert!(choice.reason.contains("gpt-99"));
    }

    #[test]
    fn single_installed_model_skips_routing_call() {
        let llm = MockLlmClient::new("unused").with_models(vec!["phi3:mini".into()]);
        let choice = ModelRouter::new("mistral").choose(&llm, "t", None);
        assert_eq!(choice.model, "phi3:mini");
        assert_eq!(llm.calls(), 0);
    }

    #[test]
    fn failed_call_uses_default() {
        let llm = ScriptedLlmClient::new([Err(LlmError::Timeout(5))]).with_models(models());
        let choice = ModelRouter::new("mistral:7b-instruct").choose(&llm, "t", None);
        assert_eq!(choice.model, "mistral:7b-instruct");
        assert_eq!(choice.reason, "routing call failed");
    }

    #[test]
    fn choices_are_logged() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("model_choices.jsonl");
        let llm = MockLlmClient::new(r#"{"model": "llama3:8b"}"#).with_models(models());

        ModelRouter::new("mistral:7b-instruct")
            .with_choices_log(&log)
            .choose(&llm, "classify", Some("short text"));

        let line = std::fs::read_to_string(&log).unwrap();
        let v: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(v["task"], "classify");
        assert_eq!(v["model"], "llama3:8b");
        assert_eq!(v["context"], "short text");
    }

    #[test]
    fn prompt_lists_installed_models() {
        let prompt = routing_prompt("t", None, &models());
        assert!(prompt.contains("mistral:7b-instruct, llama3:8b"));
        assert!(prompt.contains("Context: none"));
    }
}

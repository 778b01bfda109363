pub mod ollama;
pub mod prompt_log;
pub mod router;

pub use ollama::*;
pub use prompt_log::*;
pub use router::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Model server is not reachable at {0}")]
    Connection(String),

    #[error("Model server returned error (status {status}): {body}")]
    Server { status: u16, body: String },

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Response parsing error: {0}")]
    ResponseParsing(String),
}

/// Text-generation backend.
pub trait LlmClient {
    fn generate(&self, model: &str, prompt: &str, system: &str) -> Result<String, LlmError>;

    fn list_models(&self) -> Result<Vec<String>, LlmError>;

    /// Prefix match, so `mistral` matches `mistral:7b-instruct`.
    fn is_model_available(&self, model: &str) -> Result<bool, LlmError> {
        let models = self.list_models()?;
        Ok(models.iter().any(|m| m.starts_with(model)))
    }
}

/// Lets one client be shared between a run context and its observer.
impl<C: LlmClient + ?Sized> LlmClient for std::rc::Rc<C> {
    fn generate(&self, model: &str, prompt: &str, system: &str) -> Result<String, LlmError> {
        (**self).generate(model, prompt, system)
    }

    fn list_models(&self) -> Result<Vec<String>, LlmError> {
        (**self).list_models()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_client_is_object_safe() {
        fn _assert(_: &dyn LlmClient) {}
    }

    #[test]
    fn error_messages_name_the_problem() {
        let e = LlmError::Server {
            status: 500,
            body: "boom".into(),
        };
        assert_eq!(e.to_string(), "Model server returned error (status 500): boom");
        assert_eq!(LlmError::Timeout(30).to_string(), "Request timed out after 30s");
    }
}

pub mod invoker; // External task invocation with timeout
pub mod cache;
pub mod response; // Structured-response parsing with fallback
pub mod artifact;
pub mod records; // De-duplicated JSONL record logs
pub mod focus;
pub mod llm;
pub mod stage;
pub mod stages; // Built-in stage kinds
pub mod definition; // Declarative pipeline files

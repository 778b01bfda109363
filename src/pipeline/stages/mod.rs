//! Built-in stage kinds used by declarative pipelines.

pub mod command;
pub mod query;
pub mod report;
pub mod template;

pub use command::CommandStage;
pub use query::QueryStage;
pub use report::ReportStage;

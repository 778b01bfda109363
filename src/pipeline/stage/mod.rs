//! Stage pipeline
//!
//! Runs an ordered list of stages against one run directory. Each stage reads
//! named artifacts written by earlier stages and writes its own.
//!
//! ## Lifecycle (per stage)
//! ```text
//! Pending → Running → Done | Failed
//! Pending → Skipped          (missing precondition or upstream short-circuit)
//! ```
//!
//! A failing stage never stops the run. Only an explicit short-circuit skips
//! the remaining stages.

pub mod error;
pub mod types;
pub mod traits;
pub mod runner;

pub use error::StageError;
pub use types::*;
pub use traits::*;
pub use runner::StageRunner;

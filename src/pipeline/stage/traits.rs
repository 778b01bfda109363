//! The stage boundary.

use super::error::StageError;
use super::types::StageOutcome;
use crate::context::RunContext;

/// One discrete step of a pipeline.
pub trait Stage {
    fn name(&self) -> &str;

    /// Artifacts that must exist before this stage can run. When any is
    /// missing the runner skips the stage without calling `run`.
    fn requires(&self) -> Vec<String> {
        Vec::new()
    }

    fn run(&self, ctx: &mut RunContext) -> Result<StageOutcome, StageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_is_object_safe() {
        fn _assert(_: &dyn Stage) {}
    }
}

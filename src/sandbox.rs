mod runner;
mod verdict;
mod workspace;

pub use runner::{Invocation, execute};
pub use verdict::{Evaluation, Sanitizer, Verdict, describe_mismatch, evaluate};
pub use workspace::{Workspace, WorkspaceManager};

/// What one run of the submission against one test produced
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// Stdout went past the output limit and was cut there
    pub output_truncated: bool,
    /// `None` when killed by a signal or on timeout
    pub exit_code: Option<i32>,
    pub wall_time_ms: u64,
}

use std::time::Duration;

use anyhow::Result;

use crate::config::{DEFAULT_MAX_OUTPUT_BYTES, GraderConfig};
use crate::sandbox::{
    Evaluation, Invocation, Sanitizer, Verdict, Workspace, WorkspaceManager, evaluate, execute,
};
use crate::store::ResultStore;
use crate::submission::SubmissionDescriptor;

const WORKSPACE_FAILURE: &str = "System error: unable to prepare the submission for testing";
const SPAWN_FAILURE: &str = "System error: unable to start the submission";

/// Lifecycle of one grading run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Running,
    Passed,
    Failed(Verdict),
}

impl RunState {
    fn finish(verdict: &Verdict) -> Self {
        if verdict.is_ok() {
            Self::Passed
        } else {
            Self::Failed(verdict.clone())
        }
    }
}

/// Final outcome of a grading run as handed back to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradeReport {
    pub submission_id: String,
    pub verdict: Verdict,
    /// Wall time of the last test that ran, in milliseconds
    pub elapsed_time: u64,
}

/// Grades submissions against a shared scratch directory
///
/// A `Grader` holds no per-submission state, so one instance may serve
/// any number of concurrent runs.
#[derive(Debug, Clone)]
pub struct Grader {
    workspaces: WorkspaceManager,
    strict_exit_code: bool,
    max_output_bytes: usize,
}

impl Grader {
    pub fn new(workspaces: WorkspaceManager, strict_exit_code: bool) -> Self {
        Self {
            workspaces,
            strict_exit_code,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    /// Caps the bytes kept from each output stream of every test
    pub fn with_output_limit(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    pub fn from_config(config: &GraderConfig) -> Result<Self> {
        let workspaces = WorkspaceManager::new(config.scratch_dir()?, config.extension.clone());
        Ok(Self::new(workspaces, config.strict_exit_code)
            .with_output_limit(config.max_output_bytes))
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Runs the whole grading lifecycle for one submission
    ///
    /// Always produces exactly one verdict, releases the workspace before the
    /// verdict is written, and writes it to `store` exactly once. Nothing is
    /// returned as an error: infrastructure faults become a runtime error
    /// verdict and a failed store write is only logged.
    pub async fn grade<S: ResultStore>(
        &self,
        submission: &SubmissionDescriptor,
        store: &S,
    ) -> GradeReport {
        let id = submission.submission_id.as_str();
        let mut state = RunState::Pending;
        log::debug!("Submission {id} is {state:?}");

        let (verdict, elapsed_time) = match self.workspaces.acquire(id, &submission.source_code) {
            Ok(workspace) => {
                state = RunState::Running;
                log::debug!("Submission {id} is {state:?}");

                let result = self.run_tests(submission, &workspace).await;
                if let Err(e) = workspace.release() {
                    log::error!("{e:#}");
                }
                result
            }
            Err(e) => {
                log::error!("Failed to acquire workspace for submission {id}: {e:#}");
                (
                    Verdict::RuntimeError {
                        message: WORKSPACE_FAILURE.to_string(),
                    },
                    0,
                )
            }
        };

        state = RunState::finish(&verdict);
        log::info!("Submission {id} finished as {state:?} in {elapsed_time} ms");

        if let Err(e) = store.record_verdict(id, &verdict, elapsed_time).await {
            log::error!("Failed to record verdict of submission {id}: {e:#}");
        }

        GradeReport {
            submission_id: id.to_string(),
            verdict,
            elapsed_time,
        }
    }

    /// Runs tests in order and stops at the first one that does not pass
    async fn run_tests(
        &self,
        submission: &SubmissionDescriptor,
        workspace: &Workspace,
    ) -> (Verdict, u64) {
        let id = submission.submission_id.as_str();
        let options = submission.option_args();
        let invocation = Invocation {
            command: &submission.invocation_command,
            options: &options,
        };
        let time_limit = Duration::from_secs(submission.time_limit_seconds);

        let cwd = std::env::current_dir().ok();
        let mut sanitizer = Sanitizer::new(id)
            .mask_path(workspace.scratch_dir())
            .mask_path(self.workspaces.scratch_dir());
        if let Some(cwd) = &cwd {
            sanitizer = sanitizer.mask_path(cwd);
        }

        let mut elapsed_time = 0;
        for (idx, case) in submission.test_suite.iter().enumerate() {
            let test = idx + 1;
            let outcome = match execute(
                invocation,
                workspace.path(),
                workspace.scratch_dir(),
                &case.input,
                time_limit,
                self.max_output_bytes,
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::error!("Submission {id} test {test}: {e:#}");
                    let verdict = Verdict::RuntimeError {
                        message: SPAWN_FAILURE.to_string(),
                    };
                    return (verdict, elapsed_time);
                }
            };
            elapsed_time = outcome.wall_time_ms;
            log::debug!(
                "Submission {id} test {test} took {elapsed_time} ms (timed out: {})",
                outcome.timed_out
            );

            let evaluation = evaluate(
                test,
                &outcome,
                &case.expected_output,
                &sanitizer,
                self.strict_exit_code,
            );
            if let Evaluation::Stop(verdict) = evaluation {
                return (verdict, elapsed_time);
            }
        }

        (Verdict::Ok, elapsed_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_from_verdict() {
        assert_eq!(RunState::finish(&Verdict::Ok), RunState::Passed);
        let tle = Verdict::TimeLimitExceeded { test: 2 };
        assert_eq!(RunState::finish(&tle), RunState::Failed(tle));
    }
}

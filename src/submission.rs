use anyhow::{Result, bail};
use serde::Deserialize;

const MAX_SUBMISSION_ID_LEN: usize = 128;

/// One `(input, expected_output)` pair of a submission's test suite
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
}

impl TestCase {
    pub fn new(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expected_output: expected_output.into(),
        }
    }
}

/// Everything needed to grade one submission
///
/// The descriptor is moved into the grading run that owns it and is never
/// mutated afterwards. Tests run in the order of `test_suite`.
#[derive(Deserialize, Debug, Clone)]
pub struct SubmissionDescriptor {
    pub submission_id: String,
    pub source_code: String,
    pub time_limit_seconds: u64,
    pub invocation_command: String,
    #[serde(default)]
    pub invocation_options: String,
    pub test_suite: Vec<TestCase>,
}

impl SubmissionDescriptor {
    /// Checks the descriptor before it is accepted for grading
    ///
    /// The identifier names the workspace file, so it is restricted to
    /// characters that are safe in a file name on every platform.
    pub fn validate(&self) -> Result<()> {
        let id = &self.submission_id;
        if id.is_empty() || id.len() > MAX_SUBMISSION_ID_LEN {
            bail!("Submission id must be 1 to {MAX_SUBMISSION_ID_LEN} characters long");
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            bail!("Submission id {id:?} contains characters other than [A-Za-z0-9_-]");
        }
        if self.time_limit_seconds == 0 {
            bail!("Time limit of submission {id} must be at least 1 second");
        }
        if self.invocation_command.trim().is_empty() {
            bail!("Invocation command of submission {id} is empty");
        }
        Ok(())
    }

    /// Options split into individual arguments, in order
    pub fn option_args(&self) -> Vec<&str> {
        self.invocation_options.split_whitespace().collect()
    }
}

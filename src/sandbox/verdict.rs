use std::borrow::Cow;
use std::fmt;
use std::path::{Component, Path};

use super::ExecutionOutcome;

const PATH_PLACEHOLDER: &str = "*";
const SUBMISSION_PLACEHOLDER: &str = "solution";

/// Longest line quoted in a wrong answer description, in characters
const MAX_QUOTED_LINE: usize = 256;
/// Longest runtime error message kept from stderr, in characters
const MAX_ERROR_MESSAGE: usize = 4096;
const ELLIPSIS: &str = "...";

const OUTPUT_LIMIT_EXCEEDED: &str = "Output limit exceeded.";

/// Final classification of a grading run
///
/// Test indices are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    TimeLimitExceeded { test: usize },
    RuntimeError { message: String },
    WrongAnswer { test: usize, diff: String },
}

impl Verdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// The text stored in the result store and shown to the submitter
impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("OK"),
            Self::TimeLimitExceeded { test } => write!(f, "Time limit exceeded on test {test}"),
            Self::RuntimeError { message } => f.write_str(message),
            Self::WrongAnswer { test, diff } => write!(f, "Error:\nIn test {test}.\n{diff}"),
        }
    }
}

/// Result of evaluating one test
#[derive(Debug, PartialEq, Eq)]
pub enum Evaluation {
    Continue,
    Stop(Verdict),
}

/// Things that must never reach the submitter verbatim
#[derive(Debug)]
pub struct Sanitizer<'a> {
    paths: Vec<&'a Path>,
    submission_id: &'a str,
}

impl<'a> Sanitizer<'a> {
    pub fn new(submission_id: &'a str) -> Self {
        Self {
            paths: Vec::new(),
            submission_id,
        }
    }

    /// Adds a directory whose absolute path is masked with `*`
    pub fn mask_path(mut self, path: &'a Path) -> Self {
        self.paths.push(path);
        self
    }

    pub fn sanitize(&self, message: &str) -> String {
        let mut paths: Vec<String> = self
            .paths
            .iter()
            .filter(|p| is_maskable(p))
            .map(|p| p.to_string_lossy().trim_end_matches('/').to_string())
            .collect();
        // Nested directories: mask the longest first so no fragment survives
        paths.sort_by_key(|p| std::cmp::Reverse(p.len()));
        paths.dedup();

        let mut sanitized = message.to_string();
        for path in &paths {
            sanitized = sanitized.replace(path.as_str(), PATH_PLACEHOLDER);
        }
        if !self.submission_id.is_empty() {
            sanitized = sanitized.replace(self.submission_id, SUBMISSION_PLACEHOLDER);
        }
        sanitized
    }
}

/// Any absolute directory except `/` itself
fn is_maskable(path: &Path) -> bool {
    path.is_absolute() && path.components().any(|c| matches!(c, Component::Normal(_)))
}

/// Cuts `text` after `max_chars` characters and marks the cut
fn clip(text: &str, max_chars: usize) -> Cow<'_, str> {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => Cow::Owned(format!("{}{ELLIPSIS}", &text[..end])),
        None => Cow::Borrowed(text),
    }
}

/// Classifies one test outcome
///
/// Checked in order: timeout, non-empty stderr, (optionally) non-zero exit,
/// output over the limit, then output comparison.
pub fn evaluate(
    test: usize,
    outcome: &ExecutionOutcome,
    expected_output: &str,
    sanitizer: &Sanitizer<'_>,
    strict_exit_code: bool,
) -> Evaluation {
    if outcome.timed_out {
        return Evaluation::Stop(Verdict::TimeLimitExceeded { test });
    }

    if !outcome.stderr.is_empty() {
        let message = sanitizer.sanitize(&outcome.stderr);
        return Evaluation::Stop(Verdict::RuntimeError {
            message: clip(&message, MAX_ERROR_MESSAGE).into_owned(),
        });
    }

    if outcome.exit_code != Some(0) {
        if strict_exit_code {
            let message = match outcome.exit_code {
                Some(code) => format!("Process exited with code {code}"),
                None => "Process terminated by a signal".to_string(),
            };
            return Evaluation::Stop(Verdict::RuntimeError { message });
        }
        log::warn!(
            "Test {test} exited with {:?} and empty stderr, judging output only",
            outcome.exit_code
        );
    }

    if outcome.output_truncated {
        return Evaluation::Stop(Verdict::WrongAnswer {
            test,
            diff: OUTPUT_LIMIT_EXCEEDED.to_string(),
        });
    }

    match describe_mismatch(expected_output, &outcome.stdout) {
        None => Evaluation::Continue,
        Some(diff) => Evaluation::Stop(Verdict::WrongAnswer { test, diff }),
    }
}

/// Compares outputs line by line after dropping trailing whitespace
///
/// Returns `None` on a match, otherwise a description of the line count
/// difference or of the first differing line. Quoted lines are cut after
/// 256 characters.
pub fn describe_mismatch(expected: &str, actual: &str) -> Option<String> {
    let expected_lines: Vec<&str> = expected.trim_end().lines().collect();
    let actual_lines: Vec<&str> = actual.trim_end().lines().collect();

    if expected_lines.len() != actual_lines.len() {
        return Some(format!(
            "Expected {} line(s), got {} line(s).",
            expected_lines.len(),
            actual_lines.len()
        ));
    }

    expected_lines
        .iter()
        .zip(&actual_lines)
        .position(|(e, a)| e != a)
        .map(|i| {
            format!(
                "Line {}: expected \"{}\", got \"{}\".",
                i + 1,
                clip(expected_lines[i], MAX_QUOTED_LINE),
                clip(actual_lines[i], MAX_QUOTED_LINE)
            )
        })
}

#![cfg(unix)]

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use pretty_assertions::assert_eq;

use grader::grader::{GradeReport, Grader};
use grader::sandbox::{Verdict, WorkspaceManager};
use grader::store::MemoryStore;
use grader::submission::{SubmissionDescriptor, TestCase};

// Global counter to ensure unique scratch directories
static SCRATCH_COUNTER: AtomicU32 = AtomicU32::new(0);

const DOUBLE: &str = "read x\necho $((x * 2))\n";

// Test guard that removes the scratch directory on drop
struct ScratchGuard {
    dir: PathBuf,
}

impl ScratchGuard {
    fn new() -> Self {
        let n = SCRATCH_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("grader-it-{}-{n}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        Self { dir }
    }

    fn grader(&self) -> Grader {
        Grader::new(WorkspaceManager::new(&self.dir, "sh"), false)
    }

    fn workspace_files(&self) -> usize {
        fs::read_dir(&self.dir).map(|d| d.count()).unwrap_or(0)
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

fn two_tests() -> Vec<TestCase> {
    vec![TestCase::new("1\n", "2"), TestCase::new("2\n", "4")]
}

fn submission(id: &str, source_code: &str, tests: Vec<TestCase>) -> SubmissionDescriptor {
    SubmissionDescriptor {
        submission_id: id.to_string(),
        source_code: source_code.to_string(),
        time_limit_seconds: 1,
        invocation_command: "sh".to_string(),
        invocation_options: String::new(),
        test_suite: tests,
    }
}

async fn grade(
    guard: &ScratchGuard,
    submission: &SubmissionDescriptor,
) -> (GradeReport, MemoryStore) {
    let store = MemoryStore::new();
    store.insert_pending(&submission.submission_id).unwrap();
    let report = guard.grader().grade(submission, &store).await;
    (report, store)
}

#[tokio::test]
async fn test_correct_submission_is_ok() {
    let guard = ScratchGuard::new();
    let sub = submission("ok-1", DOUBLE, two_tests());

    let (report, store) = grade(&guard, &sub).await;

    assert_eq!(report.verdict, Verdict::Ok);
    let record = store.fetch("ok-1").unwrap();
    assert!(record.is_finished());
    assert_eq!(record.verdict.as_deref(), Some("OK"));
    assert_eq!(record.elapsed_time, Some(report.elapsed_time));
    assert_eq!(guard.workspace_files(), 0);
}

#[tokio::test]
async fn test_hanging_submission_times_out_on_first_test() {
    let guard = ScratchGuard::new();
    let marker = guard.dir.with_extension("marker");
    let source = format!("echo run >> '{}'\nwhile :; do :; done\n", marker.display());
    let sub = submission("tle-1", &source, two_tests());

    let (report, store) = grade(&guard, &sub).await;

    assert_eq!(report.verdict, Verdict::TimeLimitExceeded { test: 1 });
    assert!(report.elapsed_time >= 1000);
    assert_eq!(
        store.fetch("tle-1").unwrap().verdict.as_deref(),
        Some("Time limit exceeded on test 1")
    );
    // The second test never ran
    assert_eq!(fs::read_to_string(&marker).unwrap(), "run\n");
    assert_eq!(guard.workspace_files(), 0);
    fs::remove_file(marker).unwrap();
}

#[tokio::test]
async fn test_timeout_on_later_test_stops_there() {
    let guard = ScratchGuard::new();
    let source = "read x\nif [ \"$x\" = 2 ]; then sleep 30; fi\necho $((x * 2))\n";
    let tests = vec![
        TestCase::new("1\n", "2"),
        TestCase::new("2\n", "4"),
        TestCase::new("3\n", "6"),
    ];
    let sub = submission("tle-2", source, tests);

    let (report, _) = grade(&guard, &sub).await;

    assert_eq!(report.verdict, Verdict::TimeLimitExceeded { test: 2 });
    assert_eq!(report.verdict.to_string(), "Time limit exceeded on test 2");
}

#[tokio::test]
async fn test_wrong_answer_names_test_and_line() {
    let guard = ScratchGuard::new();
    let sub = submission("wa-1", "read x\necho 3\n", two_tests());

    let (report, store) = grade(&guard, &sub).await;

    let text = store.fetch("wa-1").unwrap().verdict.unwrap();
    assert!(text.starts_with("Error:\nIn test 1.\n"));
    assert!(text.contains("expected \"2\""));
    assert!(text.contains("got \"3\""));
    assert_eq!(text, report.verdict.to_string());
}

#[tokio::test]
async fn test_wrong_answer_reports_line_counts() {
    let guard = ScratchGuard::new();
    let sub = submission(
        "wa-2",
        "read x\necho $((x * 2))\necho extra\n",
        two_tests(),
    );

    let (report, _) = grade(&guard, &sub).await;

    assert_eq!(
        report.verdict,
        Verdict::WrongAnswer {
            test: 1,
            diff: "Expected 1 line(s), got 2 line(s).".to_string()
        }
    );
}

#[tokio::test]
async fn test_first_failure_wins() {
    let guard = ScratchGuard::new();
    // Correct on test 1, wrong on test 2, would be wrong on test 3 as well
    let tests = vec![
        TestCase::new("1\n", "2"),
        TestCase::new("2\n", "5"),
        TestCase::new("3\n", "7"),
    ];
    let sub = submission("wa-3", DOUBLE, tests);

    let (report, _) = grade(&guard, &sub).await;

    assert_eq!(
        report.verdict,
        Verdict::WrongAnswer {
            test: 2,
            diff: "Line 1: expected \"5\", got \"4\".".to_string()
        }
    );
}

#[tokio::test]
async fn test_runtime_error_is_sanitized() {
    let guard = ScratchGuard::new();
    let id = "c0ffee-secret-id";
    let source = "echo \"failure in $0 at $(pwd)\" >&2\nexit 1\n";
    let sub = submission(id, source, two_tests());

    let (report, store) = grade(&guard, &sub).await;

    let Verdict::RuntimeError { message } = &report.verdict else {
        panic!("expected a runtime error, got {:?}", report.verdict);
    };
    let scratch = fs::canonicalize(&guard.dir).unwrap_or(guard.dir.clone());
    assert!(!message.contains(id));
    assert!(!message.contains(scratch.to_str().unwrap()));
    assert!(!message.contains(guard.dir.to_str().unwrap()));
    assert!(message.contains("solution"));
    assert_eq!(message, "failure in */solution.sh at *\n");
    assert_eq!(store.fetch(id).unwrap().verdict.as_deref(), Some(message.as_str()));
    assert_eq!(guard.workspace_files(), 0);
}

#[tokio::test]
async fn test_missing_interpreter_is_a_runtime_error() {
    let guard = ScratchGuard::new();
    let mut sub = submission("spawn-1", DOUBLE, two_tests());
    sub.invocation_command = "/nonexistent/interpreter".to_string();

    let (report, store) = grade(&guard, &sub).await;

    let Verdict::RuntimeError { message } = &report.verdict else {
        panic!("expected a runtime error, got {:?}", report.verdict);
    };
    assert!(!message.contains("/nonexistent"));
    assert_eq!(report.elapsed_time, 0);
    assert!(store.fetch("spawn-1").unwrap().is_finished());
    assert_eq!(guard.workspace_files(), 0);
}

#[tokio::test]
async fn test_unwritable_scratch_dir_is_a_runtime_error() {
    let guard = ScratchGuard::new();
    fs::create_dir_all(guard.dir.parent().unwrap()).unwrap();
    // A regular file where the scratch directory should be
    fs::write(&guard.dir, "not a directory").unwrap();
    let sub = submission("io-1", DOUBLE, two_tests());

    let (report, store) = grade(&guard, &sub).await;

    assert!(matches!(report.verdict, Verdict::RuntimeError { .. }));
    assert!(store.fetch("io-1").unwrap().is_finished());
    fs::remove_file(&guard.dir).unwrap();
}

#[tokio::test]
async fn test_options_are_passed_before_workspace() {
    let guard = ScratchGuard::new();
    let mut sub = submission("opts-1", "read x\necho $((x * 2))\n", two_tests());
    // `sh -e script` still runs the script, with errexit enabled
    sub.invocation_options = "-e".to_string();

    let (report, _) = grade(&guard, &sub).await;

    assert_eq!(report.verdict, Verdict::Ok);
}

#[tokio::test]
async fn test_workspace_path_with_shell_metacharacters_is_safe() {
    let n = SCRATCH_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!("grader it $(touch pwned) ;{n}"));
    let grader = Grader::new(WorkspaceManager::new(&dir, "sh"), false);
    let store = MemoryStore::new();
    let sub = submission("meta-1", DOUBLE, two_tests());

    let report = grader.grade(&sub, &store).await;

    assert_eq!(report.verdict, Verdict::Ok);
    assert!(!dir.join("pwned").exists());
    let _ = fs::remove_dir_all(dir);
}

#[tokio::test]
async fn test_empty_test_suite_is_ok() {
    let guard = ScratchGuard::new();
    let sub = submission("empty-1", DOUBLE, Vec::new());

    let (report, _) = grade(&guard, &sub).await;

    assert_eq!(report.verdict, Verdict::Ok);
    assert_eq!(report.elapsed_time, 0);
}

#[tokio::test]
async fn test_regrading_gives_same_verdict_class() {
    let guard = ScratchGuard::new();
    let grader = guard.grader();
    let sub = submission("again-1", "read x\necho 3\n", two_tests());

    let first = grader.grade(&sub, &MemoryStore::new()).await;
    let second = grader.grade(&sub, &MemoryStore::new()).await;

    assert_eq!(first.verdict, second.verdict);
}

#[tokio::test]
async fn test_strict_exit_code() {
    let guard = ScratchGuard::new();
    let source = "read x\necho $((x * 2))\nexit 4\n";
    let sub = submission("exit-1", source, two_tests());

    let lenient = guard.grader().grade(&sub, &MemoryStore::new()).await;
    assert_eq!(lenient.verdict, Verdict::Ok);

    let strict = Grader::new(WorkspaceManager::new(&guard.dir, "sh"), true);
    let report = strict.grade(&sub, &MemoryStore::new()).await;
    assert_eq!(
        report.verdict,
        Verdict::RuntimeError {
            message: "Process exited with code 4".to_string()
        }
    );
}

#[tokio::test]
async fn test_background_process_does_not_outlive_grading() {
    let guard = ScratchGuard::new();
    let marker = guard.dir.with_extension("alive");
    let source = format!(
        "(sleep 2; echo alive > '{}') >/dev/null 2>&1 &\nread x\necho $((x * 2))\n",
        marker.display()
    );
    let sub = submission("bg-1", &source, vec![TestCase::new("1\n", "2")]);

    let (report, _) = grade(&guard, &sub).await;
    assert_eq!(report.verdict, Verdict::Ok);

    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    assert!(!marker.exists());
}

#[tokio::test]
async fn test_oversized_output_is_a_wrong_answer() {
    let guard = ScratchGuard::new();
    let grader = guard.grader().with_output_limit(4096);
    let source =
        "read x\ni=0\nwhile [ $i -lt 1000 ]; do echo 0123456789abcdef; i=$((i+1)); done\n";
    let sub = submission("flood-2", source, two_tests());

    let report = grader.grade(&sub, &MemoryStore::new()).await;

    assert_eq!(
        report.verdict,
        Verdict::WrongAnswer {
            test: 1,
            diff: "Output limit exceeded.".to_string()
        }
    );
    assert_eq!(guard.workspace_files(), 0);
}

#[tokio::test]
async fn test_top_level_scratch_dir_is_sanitized() {
    let n = SCRATCH_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = PathBuf::from(format!("/grader-it-{}-{n}", std::process::id()));
    // Only possible where the root directory is writable
    if fs::create_dir(&dir).is_err() {
        return;
    }
    let grader = Grader::new(WorkspaceManager::new(&dir, "sh"), false);
    let sub = submission("top-1", "echo \"failure in $0\" >&2\n", two_tests());

    let report = grader.grade(&sub, &MemoryStore::new()).await;
    let _ = fs::remove_dir_all(&dir);

    assert_eq!(
        report.verdict,
        Verdict::RuntimeError {
            message: "failure in */solution.sh\n".to_string()
        }
    );
}

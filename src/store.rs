use std::collections::HashMap;

use anyhow::{Result, bail};
use parking_lot::Mutex;
use serde::Serialize;

use crate::create_timestamp;
use crate::sandbox::Verdict;

pub const STATE_PENDING: &str = "Pending";
pub const STATE_FINISHED: &str = "Finished";

/// The persistence boundary of the grading engine
///
/// The grading run calls [`ResultStore::record_verdict`] exactly once, after
/// its workspace has been released. Implementations must refuse a second
/// write for the same submission.
pub trait ResultStore: Send + Sync + 'static {
    fn record_verdict(
        &self,
        submission_id: &str,
        verdict: &Verdict,
        elapsed_time: u64,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// What a caller sees when polling for a submission
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub id: String,
    pub created_time: String,
    pub updated_time: String,
    pub state: String,
    pub verdict: Option<String>,
    pub elapsed_time: Option<u64>,
}

impl SubmissionRecord {
    pub fn is_finished(&self) -> bool {
        self.state == STATE_FINISHED
    }
}

/// Process-local store, useful for embedding and tests
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, SubmissionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a submission as accepted for grading
    pub fn insert_pending(&self, submission_id: &str) -> Result<()> {
        let mut records = self.records.lock();
        if records.contains_key(submission_id) {
            bail!("Submission {submission_id} already exists");
        }
        let now = create_timestamp();
        records.insert(
            submission_id.to_string(),
            SubmissionRecord {
                id: submission_id.to_string(),
                created_time: now.clone(),
                updated_time: now,
                state: STATE_PENDING.to_string(),
                verdict: None,
                elapsed_time: None,
            },
        );
        Ok(())
    }

    pub fn fetch(&self, submission_id: &str) -> Option<SubmissionRecord> {
        self.records.lock().get(submission_id).cloned()
    }
}

impl ResultStore for MemoryStore {
    async fn record_verdict(
        &self,
        submission_id: &str,
        verdict: &Verdict,
        elapsed_time: u64,
    ) -> Result<()> {
        let now = create_timestamp();
        let mut records = self.records.lock();
        let record = records
            .entry(submission_id.to_string())
            .or_insert_with(|| SubmissionRecord {
                id: submission_id.to_string(),
                created_time: now.clone(),
                updated_time: now.clone(),
                state: STATE_PENDING.to_string(),
                verdict: None,
                elapsed_time: None,
            });

        if record.is_finished() {
            bail!("Verdict of submission {submission_id} was already recorded");
        }

        record.state = STATE_FINISHED.to_string();
        record.verdict = Some(verdict.to_string());
        record.elapsed_time = Some(elapsed_time);
        record.updated_time = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pending_then_finished() {
        let store = MemoryStore::new();
        store.insert_pending("abc").unwrap();
        assert!(store.insert_pending("abc").is_err());

        let pending = store.fetch("abc").unwrap();
        assert_eq!(pending.state, STATE_PENDING);
        assert_eq!(pending.verdict, None);

        store.record_verdict("abc", &Verdict::Ok, 12).await.unwrap();
        let finished = store.fetch("abc").unwrap();
        assert!(finished.is_finished());
        assert_eq!(finished.verdict.as_deref(), Some("OK"));
        assert_eq!(finished.elapsed_time, Some(12));
    }

    #[tokio::test]
    async fn test_verdict_is_written_once() {
        let store = MemoryStore::new();
        store.record_verdict("abc", &Verdict::Ok, 1).await.unwrap();
        let second = store
            .record_verdict("abc", &Verdict::TimeLimitExceeded { test: 1 }, 2)
            .await;

        assert!(second.is_err());
        assert_eq!(store.fetch("abc").unwrap().verdict.as_deref(), Some("OK"));
    }
}

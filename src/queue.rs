use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify, oneshot};

use crate::grader::GradeReport;
use crate::submission::SubmissionDescriptor;

pub enum JobMessage {
    FireAndForget {
        submission: SubmissionDescriptor,
    },
    Blocking {
        submission: SubmissionDescriptor,
        responder: oneshot::Sender<GradeReport>,
    },
}

impl JobMessage {
    pub fn id(&self) -> &str {
        match self {
            Self::FireAndForget { submission } => &submission.submission_id,
            Self::Blocking { submission, .. } => &submission.submission_id,
        }
    }
}

pub struct JobQueue {
    queue: Mutex<VecDeque<JobMessage>>,
    notify: Notify,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub async fn push(&self, job: JobMessage) {
        self.queue.lock().await.push_back(job);
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> JobMessage {
        loop {
            if let Some(job) = self.queue.lock().await.pop_front() {
                return job;
            }
            self.notify.notified().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submission::TestCase;

    fn submission(id: &str) -> SubmissionDescriptor {
        SubmissionDescriptor {
            submission_id: id.to_string(),
            source_code: String::new(),
            time_limit_seconds: 1,
            invocation_command: "sh".to_string(),
            invocation_options: String::new(),
            test_suite: vec![TestCase::new("", "")],
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = JobQueue::new();
        queue
            .push(JobMessage::FireAndForget {
                submission: submission("a"),
            })
            .await;
        queue
            .push(JobMessage::FireAndForget {
                submission: submission("b"),
            })
            .await;

        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.pop().await.id(), "a");
        assert_eq!(queue.pop().await.id(), "b");
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = std::sync::Arc::new(JobQueue::new());
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.pop().await.id().to_string() }
        });

        tokio::task::yield_now().await;
        queue
            .push(JobMessage::FireAndForget {
                submission: submission("late"),
            })
            .await;

        assert_eq!(waiter.await.unwrap(), "late");
    }
}

use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::grader::{GradeReport, Grader};
use crate::queue::{JobMessage, JobQueue};
use crate::store::ResultStore;
use crate::submission::SubmissionDescriptor;
use crate::worker::worker;

/// A fixed number of workers grading queued submissions in the background
///
/// At most `workers` grading runs (and so at most `workers` child
/// processes) are alive at once.
pub struct GradingPool {
    queue: Arc<JobQueue>,
    workers: JoinSet<Result<()>>,
    token: CancellationToken,
}

impl GradingPool {
    /// Sweeps stale workspaces and starts the workers
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<S: ResultStore>(n_workers: usize, grader: Grader, store: Arc<S>) -> Result<Self> {
        if n_workers == 0 {
            bail!("The number of grading workers must not be 0");
        }
        grader.workspaces().sweep()?;

        let grader = Arc::new(grader);
        let queue = Arc::new(JobQueue::new());
        let token = CancellationToken::new();

        let mut workers = JoinSet::new();
        for i in 1..=n_workers {
            workers.spawn(worker(
                i,
                grader.clone(),
                store.clone(),
                queue.clone(),
                token.clone(),
            ));
        }

        log::info!("Started grading pool with {n_workers} worker(s)");
        Ok(Self {
            queue,
            workers,
            token,
        })
    }

    /// Queues a submission and returns immediately
    ///
    /// The verdict is delivered only through the result store.
    pub async fn submit(&self, submission: SubmissionDescriptor) -> Result<()> {
        submission.validate()?;
        let submission_id = submission.submission_id.clone();
        self.queue
            .push(JobMessage::FireAndForget { submission })
            .await;
        log::debug!("Queued non-blocking submission {submission_id}");
        Ok(())
    }

    /// Queues a submission and returns a receiver that resolves once it is graded
    ///
    /// The verdict is written to the result store as well.
    pub async fn submit_with_notification(
        &self,
        submission: SubmissionDescriptor,
    ) -> Result<oneshot::Receiver<GradeReport>> {
        submission.validate()?;
        let submission_id = submission.submission_id.clone();
        let (responder, rx) = oneshot::channel();
        self.queue
            .push(JobMessage::Blocking {
                submission,
                responder,
            })
            .await;
        log::debug!("Queued blocking submission {submission_id}");
        Ok(rx)
    }

    /// Queues a submission and waits for its report
    pub async fn grade(&self, submission: SubmissionDescriptor) -> Result<GradeReport> {
        let rx = self.submit_with_notification(submission).await?;
        rx.await
            .map_err(|e| anyhow!("Grading pool dropped the submission: {e}"))
    }

    /// Waits until a worker exits, which only happens on shutdown or a bug
    pub async fn join_next(&mut self) -> Option<Result<()>> {
        self.workers.join_next().await.map(|res| match res {
            Ok(res) => res,
            Err(e) => Err(anyhow!("Worker task failed: {e}")),
        })
    }

    /// Stops accepting work from the queue and waits for in-flight runs to finish
    pub async fn shutdown(mut self) {
        self.token.cancel();
        log::info!("Shutdown signal sent to workers, waiting for them to finish...");

        while let Some(res) = self.workers.join_next().await {
            if let Err(e) = res {
                if e.is_panic() {
                    log::error!("Worker handle panicked: {:?}", e);
                } else {
                    log::error!("Worker handle finished with error: {:?}", e);
                }
            }
        }

        let abandoned = self.queue.len().await;
        if abandoned > 0 {
            log::warn!("{abandoned} queued submission(s) were not graded before shutdown");
        }
        log::info!("Grading pool shut down");
    }
}

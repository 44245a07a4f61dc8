use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::grader::Grader;
use crate::queue::{JobMessage, JobQueue};
use crate::store::ResultStore;

/// Pulls submissions off the queue and grades them one at a time until cancelled
///
/// A run already in progress when the token fires is finished first.
pub async fn worker<S: ResultStore>(
    id: usize,
    grader: Arc<Grader>,
    store: Arc<S>,
    queue: Arc<JobQueue>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    log::info!("Worker {id} initialized");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            job_message = queue.pop() => {
                let submission_id = job_message.id().to_string();
                log::info!("Worker {id} got submission {submission_id} from queue");

                match job_message {
                    JobMessage::FireAndForget { submission } => {
                        grader.grade(&submission, store.as_ref()).await;
                    }
                    JobMessage::Blocking { submission, responder } => {
                        let report = grader.grade(&submission, store.as_ref()).await;
                        if responder.send(report).is_err() {
                            log::warn!(
                                "Caller of submission {submission_id} stopped waiting for its result"
                            );
                        } else {
                            log::debug!("Submission {submission_id} result sent back from worker {id}");
                        }
                    }
                }
            }
        };
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(())
}

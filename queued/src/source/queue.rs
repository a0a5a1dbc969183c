use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::{
    err::AdmissionErr,
    job::{Job, JobValidator},
};

use super::JobSource;

/// Accepts submissions into a bounded queue without ever waiting for room.
#[derive(Debug, Clone)]
pub struct Admission {
    queue: mpsc::Sender<Job>,
    validator: Arc<JobValidator>,
}

/// The receiving end of an [`Admission`] queue.
#[derive(Debug)]
pub struct QueueSource {
    queue: mpsc::Receiver<Job>,
    close: CancellationToken,
}

/// Create a queue holding at most `capacity` jobs.
///
/// The queue closes once every [`Admission`] has been dropped or
/// [`QueueSource::closer`] is cancelled; the source then yields the jobs still
/// buffered and ends.
pub fn bounded(capacity: usize, validator: Arc<JobValidator>) -> (Admission, QueueSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        Admission {
            queue: tx,
            validator,
        },
        QueueSource {
            queue: rx,
            close: CancellationToken::new(),
        },
    )
}

impl Admission {
    /// Validate `body` and enqueue the job it describes.
    pub fn submit(&self, body: &[u8]) -> Result<(), AdmissionErr> {
        let job = self.validator.parse(body)?;
        match self.queue.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                tracing::warn!("Queue is full, rejecting job for {}", job.return_url);
                Err(AdmissionErr::Overloaded)
            }
            Err(TrySendError::Closed(_)) => Err(AdmissionErr::Closed),
        }
    }
}

impl QueueSource {
    /// Cancelling the returned token rejects further submissions.
    pub fn closer(&self) -> CancellationToken {
        self.close.clone()
    }
}

#[async_trait]
impl JobSource for QueueSource {
    async fn next_job(&mut self) -> Option<Job> {
        if self.close.is_cancelled() {
            self.queue.close();
            return self.queue.recv().await;
        }
        tokio::select! {
            biased;
            job = self.queue.recv() => job,
            _ = self.close.cancelled() => {
                self.queue.close();
                self.queue.recv().await
            }
        }
    }
}

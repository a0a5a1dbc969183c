//! Pulling jobs from an external queue-read endpoint.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::job::{Job, JobValidator};

use super::JobSource;

/// Outcome of a single poll.
#[derive(Debug)]
enum Polled {
    Job(Job),
    /// The endpoint has nothing for us right now.
    Empty,
    /// Something went wrong; try again next cycle.
    Failed,
}

/// A [`JobSource`] that repeatedly `GET`s one job from `endpoint`.
#[derive(Debug)]
pub struct PollSource {
    client: reqwest::Client,
    endpoint: String,
    validator: Arc<JobValidator>,
    interval: Duration,
    /// Give up after waiting this long for a single job.
    max_idle_time: Option<Duration>,
    cancel: CancellationToken,
}

impl PollSource {
    pub fn new(
        endpoint: String,
        validator: Arc<JobValidator>,
        interval: Duration,
        max_idle_time: Option<Duration>,
        cancel: CancellationToken,
    ) -> anyhow::Result<PollSource> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(PollSource {
            client,
            endpoint,
            validator,
            interval,
            max_idle_time,
            cancel,
        })
    }

    async fn poll_once(&self) -> Polled {
        let res = match self.client.get(&self.endpoint).send().await {
            Ok(res) => res,
            Err(e) => {
                tracing::warn!("Cannot reach {}: {}", self.endpoint, e);
                return Polled::Failed;
            }
        };

        let status = res.status();
        if status == StatusCode::NOT_FOUND {
            return Polled::Empty;
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            tracing::warn!("Polling {} failed with {}: {}", self.endpoint, status, body);
            return Polled::Failed;
        }

        let body = match res.bytes().await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("Cannot read job from {}: {}", self.endpoint, e);
                return Polled::Failed;
            }
        };
        match self.validator.parse(&body) {
            Ok(job) => Polled::Job(job),
            Err(e) => {
                tracing::error!(
                    "Dropping invalid job from {}: {}\n{}",
                    self.endpoint,
                    e,
                    String::from_utf8_lossy(&body)
                );
                Polled::Failed
            }
        }
    }

    fn idle_expired(&self, waiting_since: Instant) -> bool {
        self.max_idle_time
            .map_or(false, |max| waiting_since.elapsed() >= max)
    }
}

#[async_trait]
impl JobSource for PollSource {
    async fn next_job(&mut self) -> Option<Job> {
        let waiting_since = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            if self.idle_expired(waiting_since) {
                tracing::info!(
                    "No job received for {:?}, giving up",
                    waiting_since.elapsed()
                );
                return None;
            }

            let polled = tokio::select! {
                polled = self.poll_once() => polled,
                _ = self.cancel.cancelled() => return None,
            };
            match polled {
                Polled::Job(job) => return Some(job),
                Polled::Empty => tracing::trace!("No job available"),
                Polled::Failed => {}
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.cancel.cancelled() => return None,
            }
        }
    }
}

//! Background job queue and worker pool
//!
//! Handlers enqueue detached jobs onto a bounded queue that a fixed set of
//! workers drains. Jobs never share the lifetime of the request that created
//! them; each runs under its own deadline. Failures are logged and counted,
//! never reported to a client.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::jmap::JmapError;
use crate::metrics::Metrics;
use crate::sanitize::SanitizeError;

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Jmap(#[from] JmapError),
    #[error(transparent)]
    Sanitize(#[from] SanitizeError),
}

pub type JobResult = Result<(), JobError>;

struct Job {
    id: u64,
    name: &'static str,
    run: BoxFuture<'static, JobResult>,
}

/// Sizing of the queue and pool
#[derive(Debug, Clone, Copy)]
pub struct JobSettings {
    pub queue_size: usize,
    pub workers: usize,
    pub timeout: Duration,
}

/// Handle used to enqueue jobs
pub struct Jobs {
    sender: mpsc::Sender<Job>,
    counter: AtomicU64,
    metrics: Arc<Metrics>,
}

impl Jobs {
    /// Create the queue and spawn the workers
    ///
    /// Workers finish their current job and exit once `shutdown` is cancelled.
    pub fn start(
        settings: JobSettings,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (sender, receiver) = mpsc::channel(settings.queue_size.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (1..=settings.workers.max(1))
            .map(|worker| {
                tokio::spawn(work(
                    worker,
                    Arc::clone(&receiver),
                    settings.timeout,
                    Arc::clone(&metrics),
                    shutdown.clone(),
                ))
            })
            .collect();
        (
            Self {
                sender,
                counter: AtomicU64::new(0),
                metrics,
            },
            workers,
        )
    }

    /// Enqueue `run` under `name`
    ///
    /// Returns the job id, or `None` when the queue is full or closed and the
    /// job was discarded.
    pub fn enqueue(
        &self,
        name: &'static str,
        run: impl Future<Output = JobResult> + Send + 'static,
    ) -> Option<u64> {
        let id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let job = Job {
            id,
            name,
            run: Box::pin(run),
        };
        match self.sender.try_send(job) {
            Ok(()) => {
                trace!(job = name, job_id = id, "queued job");
                Some(id)
            }
            Err(e) => {
                self.metrics.jobs.with_label_values(&[name, "rejected"]).inc();
                warn!(job = name, job_id = id, error = %e, "discarding job");
                None
            }
        }
    }
}

async fn work(
    worker: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    timeout: Duration,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => None,
            job = async { receiver.lock().await.recv().await } => job,
        };
        let Some(job) = next else {
            break;
        };
        let started = Instant::now();
        let outcome = match tokio::time::timeout(timeout, job.run).await {
            Ok(Ok(())) => "success",
            Ok(Err(e)) => {
                warn!(job = job.name, job_id = job.id, error = %e, "job failed");
                "failure"
            }
            Err(_) => {
                warn!(job = job.name, job_id = job.id, timeout_ms = timeout.as_millis() as u64, "job timed out");
                "timeout"
            }
        };
        metrics.jobs.with_label_values(&[job.name, outcome]).inc();
        trace!(
            job = job.name,
            job_id = job.id,
            worker,
            elapsed_ms = started.elapsed().as_millis() as u64,
            outcome,
            "finished job"
        );
    }
    debug!(worker, "job worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jmap::JmapErrorKind;

    fn start(queue_size: usize, timeout: Duration) -> (Jobs, Arc<Metrics>, CancellationToken) {
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        let shutdown = CancellationToken::new();
        let (jobs, _) = Jobs::start(
            JobSettings {
                queue_size,
                workers: 2,
                timeout,
            },
            metrics.clone(),
            shutdown.clone(),
        );
        (jobs, metrics, shutdown)
    }

    fn count(metrics: &Metrics, job: &str, outcome: &str) -> u64 {
        metrics.jobs.with_label_values(&[job, outcome]).get()
    }

    #[tokio::test]
    async fn runs_jobs_and_counts_outcomes() {
        let (jobs, metrics, shutdown) = start(10, Duration::from_secs(1));
        let (tx, mut rx) = mpsc::channel(1);
        let first = jobs.enqueue("ok", async move {
            tx.send(()).await.ok();
            Ok(())
        });
        let second = jobs.enqueue("broken", async {
            Err(JmapError::new(JmapErrorKind::ServerFail, "boom").into())
        });
        assert_eq!((first, second), (Some(1), Some(2)));
        rx.recv().await.expect("job ran");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count(&metrics, "ok", "success"), 1);
        assert_eq!(count(&metrics, "broken", "failure"), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn jobs_are_bounded_by_their_own_deadline() {
        let (jobs, metrics, shutdown) = start(10, Duration::from_millis(10));
        jobs.enqueue("slow", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count(&metrics, "slow", "timeout"), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn full_queue_discards_jobs() {
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        let shutdown = CancellationToken::new();
        let (jobs, _) = Jobs::start(
            JobSettings {
                queue_size: 1,
                workers: 1,
                timeout: Duration::from_secs(1),
            },
            metrics.clone(),
            shutdown.clone(),
        );
        let (started_tx, mut started_rx) = mpsc::channel(1);
        jobs.enqueue("busy", async move {
            started_tx.send(()).await.ok();
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        });
        started_rx.recv().await.expect("worker busy");
        assert!(jobs.enqueue("a", async { Ok(()) }).is_some());
        assert!(jobs.enqueue("b", async { Ok(()) }).is_none());
        assert_eq!(count(&metrics, "b", "rejected"), 1);
        shutdown.cancel();
    }
}

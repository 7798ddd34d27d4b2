use std::sync::Arc;
use std::time::Duration;

use realty_core::{BatchStats, IncomingBatch};
use realty_storage::{BackoffPolicy, RetryDisposition};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::pipeline::{BatchPipeline, PipelineError};
use crate::reporter::{publish_report, TaskReporter};

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub workers: usize,
    pub batch_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSummary {
    pub processed: usize,
    pub failed: usize,
}

/// Fixed set of tasks draining one batch queue until it closes.
pub struct WorkerPool {
    handles: Vec<JoinHandle<PoolSummary>>,
}

impl WorkerPool {
    pub fn spawn(
        pipeline: Arc<BatchPipeline>,
        reporter: Arc<dyn TaskReporter>,
        config: WorkerConfig,
        receiver: mpsc::Receiver<IncomingBatch>,
    ) -> Self {
        let receiver = Arc::new(Mutex::new(receiver));
        let handles = (0..config.workers.max(1))
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    Arc::clone(&pipeline),
                    Arc::clone(&reporter),
                    config,
                    Arc::clone(&receiver),
                ))
            })
            .collect();
        Self { handles }
    }

    pub async fn join(self) -> PoolSummary {
        let mut total = PoolSummary::default();
        for handle in self.handles {
            match handle.await {
                Ok(summary) => {
                    total.processed += summary.processed;
                    total.failed += summary.failed;
                }
                Err(err) => error!(error = %err, "worker task aborted"),
            }
        }
        total
    }
}

async fn run_worker(
    worker_id: usize,
    pipeline: Arc<BatchPipeline>,
    reporter: Arc<dyn TaskReporter>,
    config: WorkerConfig,
    receiver: Arc<Mutex<mpsc::Receiver<IncomingBatch>>>,
) -> PoolSummary {
    let mut summary = PoolSummary::default();
    loop {
        let next = receiver.lock().await.recv().await;
        let Some(batch) = next else {
            break;
        };
        match process_with_retry(&pipeline, &batch, &config).await {
            Ok(stats) => {
                summary.processed += 1;
                publish_report(reporter.as_ref(), &batch, stats).await;
            }
            Err(err) => {
                summary.failed += 1;
                error!(worker_id, task_id = %batch.task_id, error = %err, "batch failed");
            }
        }
    }
    info!(worker_id, processed = summary.processed, failed = summary.failed, "worker stopped");
    summary
}

/// Runs one batch under the timeout, retrying retryable failures with backoff.
pub async fn process_with_retry(
    pipeline: &BatchPipeline,
    batch: &IncomingBatch,
    config: &WorkerConfig,
) -> Result<BatchStats, PipelineError> {
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(config.batch_timeout, pipeline.process(batch)).await
        {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout(config.batch_timeout)),
        };
        match result {
            Ok(stats) => return Ok(stats),
            Err(err)
                if err.disposition() == RetryDisposition::Retryable
                    && attempt < config.backoff.max_retries =>
            {
                let delay = config.backoff.delay_for_attempt(attempt);
                warn!(
                    task_id = %batch.task_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying batch"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

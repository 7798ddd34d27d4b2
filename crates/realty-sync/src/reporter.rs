use anyhow::{anyhow, Result};
use async_trait::async_trait;
use realty_core::{BatchStats, IncomingBatch};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskResults {
    pub created: u64,
    pub updated: u64,
    pub archived: u64,
    pub total_processed: u64,
}

impl From<BatchStats> for TaskResults {
    fn from(stats: BatchStats) -> Self {
        Self {
            created: stats.created,
            updated: stats.updated,
            archived: stats.archived,
            total_processed: stats.total(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub results: TaskResults,
}

impl TaskReport {
    pub fn new(batch: &IncomingBatch, stats: BatchStats) -> Self {
        Self {
            task_id: batch.task_id,
            trace_id: batch.trace_id.clone(),
            results: stats.into(),
        }
    }
}

#[async_trait]
pub trait TaskReporter: Send + Sync {
    async fn report(&self, report: &TaskReport) -> Result<()>;
}

/// Emits reports as structured log events.
#[derive(Debug, Default)]
pub struct TracingTaskReporter;

#[async_trait]
impl TaskReporter for TracingTaskReporter {
    async fn report(&self, report: &TaskReport) -> Result<()> {
        info!(
            task_id = %report.task_id,
            created = report.results.created,
            updated = report.results.updated,
            archived = report.results.archived,
            total_processed = report.results.total_processed,
            "task report"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ChannelTaskReporter {
    tx: mpsc::UnboundedSender<TaskReport>,
}

impl ChannelTaskReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TaskReporter for ChannelTaskReporter {
    async fn report(&self, report: &TaskReport) -> Result<()> {
        self.tx
            .send(report.clone())
            .map_err(|_| anyhow!("task report receiver dropped"))
    }
}

/// Sends the report for a processed batch unless nothing changed. A failed
/// send is logged only; the batch is already committed.
pub async fn publish_report(
    reporter: &dyn TaskReporter,
    batch: &IncomingBatch,
    stats: BatchStats,
) -> Option<TaskReport> {
    if stats.is_empty() {
        debug!(task_id = %batch.task_id, "nothing changed, report skipped");
        return None;
    }
    let report = TaskReport::new(batch, stats);
    if let Err(err) = reporter.report(&report).await {
        error!(task_id = %batch.task_id, error = %err, "failed to publish task report");
        return None;
    }
    Some(report)
}

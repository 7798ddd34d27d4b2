//! Identity resolution and batch consolidation for realty listings.

pub mod champion;
pub mod config;
pub mod fingerprint;
pub mod pipeline;
pub mod reporter;
pub mod worker;

pub use champion::ChampionResolver;
pub use config::IngestConfig;
pub use fingerprint::{geohash_cell, FingerprintConfig, Fingerprinter};
pub use pipeline::{archive_and_reelect, split_batch, BatchPipeline, PipelineError, SplitBatch};
pub use reporter::{
    publish_report, ChannelTaskReporter, TaskReport, TaskReporter, TaskResults,
    TracingTaskReporter,
};
pub use worker::{process_with_retry, PoolSummary, WorkerConfig, WorkerPool};

pub const CRATE_NAME: &str = "realty-sync";

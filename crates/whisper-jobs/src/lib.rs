//! # whisper-jobs
//!
//! Background processing for the extraction pipeline.
//!
//! This crate provides:
//! - The job worker loop (claims queued jobs, bounded concurrency, woken on enqueue)
//! - The extraction pipeline handler (worker call, draft validation,
//!   reconciliation, publish)
//! - Timeout housekeeping so no job is left `processing` forever
//! - Extraction worker adapters (HTTP client, scripted mock)
//!
//! ## Example
//!
//! ```ignore
//! use whisper_db::Database;
//! use whisper_jobs::{ExtractionPipeline, Housekeeper, JobWorker, WorkerConfig};
//!
//! let db = Database::in_memory();
//! let config = WorkerConfig::from_env();
//! let pipeline = ExtractionPipeline::new(db.clone(), extraction_worker, reconciler);
//!
//! let worker = JobWorker::new(db.clone(), config.clone(), pipeline).start();
//! let sweeper = Housekeeper::new(db, config.job_timeout).start();
//!
//! worker.shutdown().await?;
//! sweeper.shutdown().await?;
//! ```

pub mod adapters;
pub mod handler;
pub mod housekeeping;
pub mod pipeline;
pub mod worker;

pub use adapters::{HttpExtractionWorker, HttpWorkerConfig};
#[cfg(any(test, feature = "mock"))]
pub use adapters::{Outcome, ScriptedWorker};
pub use handler::{JobContext, JobHandler, JobResult};
pub use housekeeping::{timeout_message, Housekeeper, HousekeeperHandle};
pub use pipeline::ExtractionPipeline;
pub use worker::{JobWorker, WorkerConfig, WorkerEvent, WorkerHandle};

/// Default polling interval for job processing (milliseconds).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = whisper_core::defaults::JOB_POLL_INTERVAL_MS;

/// Default bound on automatic retries.
pub const DEFAULT_MAX_AUTO_RETRIES: u32 = whisper_core::defaults::JOB_MAX_AUTO_RETRIES;

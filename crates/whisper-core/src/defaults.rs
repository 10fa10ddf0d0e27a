//! Centralized default constants for the extraction pipeline.
//!
//! **This module is the single source of truth** for shared default values.
//! Business-policy values here are only fallbacks; every one of them can be
//! overridden from the environment by the owning crate's config struct.

// =============================================================================
// INGESTION
// =============================================================================

/// Default maximum upload size (25 MiB).
pub const MAX_UPLOAD_BYTES: u64 = 25 * 1024 * 1024;

/// Multipart framing allowance on top of the upload ceiling.
pub const MULTIPART_OVERHEAD_BYTES: u64 = 64 * 1024;

/// MIME type accepted by the ingestion gateway.
pub const PDF_MIME: &str = "application/pdf";

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Default job wall-clock budget in seconds, measured from job creation.
pub const JOB_TIMEOUT_SECS: u64 = 300;

/// Default bound on automatic re-enqueues after a worker-reported failure.
pub const JOB_MAX_AUTO_RETRIES: u32 = 1;

/// Default maximum concurrent jobs per worker.
pub const JOB_MAX_CONCURRENT: usize = 4;

/// Default safety-net queue poll interval in milliseconds.
///
/// The worker is normally woken as soon as a job is queued; this interval
/// only covers jobs inserted by another process.
pub const JOB_POLL_INTERVAL_MS: u64 = 1_000;

/// Default period of the timeout sweeper in milliseconds.
pub const HOUSEKEEPING_INTERVAL_MS: u64 = 1_000;

/// Default poll interval against the external extraction worker.
pub const EXTRACTION_POLL_INTERVAL_MS: u64 = 500;

/// Per-request HTTP timeout against the external extraction worker.
pub const EXTRACTION_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Broadcast capacity for worker events.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// PROGRESS MILESTONES
// =============================================================================

/// Progress once the worker has claimed the job.
pub const PROGRESS_CLAIMED: u8 = 5;

/// Upper bound of the range the extraction worker's own progress maps into.
pub const PROGRESS_EXTRACTED: u8 = 70;

/// Progress once the draft is durably written.
pub const PROGRESS_DRAFT_STORED: u8 = 75;

/// Progress once reconciliation finished (before publish).
pub const PROGRESS_RECONCILED: u8 = 90;

/// Terminal progress.
pub const PROGRESS_DONE: u8 = 100;

// =============================================================================
// RECONCILIATION
// =============================================================================

/// Default minimum acceptable DSCR.
pub const DSCR_MIN: f64 = 1.25;

/// Default number of distinct months a T-12 must cover.
pub const T12_REQUIRED_MONTHS: usize = 12;

/// Default relative tolerance, in percent, for derived-field agreement.
pub const RECONCILE_TOLERANCE_PCT: f64 = 1.0;

/// Earliest plausible lease/loan date year.
pub const MIN_SANE_YEAR: i32 = 1900;

/// Latest plausible lease/loan date year.
pub const MAX_SANE_YEAR: i32 = 2150;

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 3000;

/// Default HTTP bind host.
pub const SERVER_HOST: &str = "0.0.0.0";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_milestones_are_ordered() {
        assert!(PROGRESS_CLAIMED < PROGRESS_EXTRACTED);
        assert!(PROGRESS_EXTRACTED < PROGRESS_DRAFT_STORED);
        assert!(PROGRESS_DRAFT_STORED < PROGRESS_RECONCILED);
        assert!(PROGRESS_RECONCILED < PROGRESS_DONE);
        assert_eq!(PROGRESS_DONE, 100);
    }

    #[test]
    fn sane_year_window() {
        assert!(MIN_SANE_YEAR < MAX_SANE_YEAR);
    }
}

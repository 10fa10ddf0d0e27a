//! # whisper-core
//!
//! Core types, traits, and abstractions for the Property Whisperer document
//! extraction and financial reconciliation pipeline.
//!
//! This crate provides the foundational data structures and trait definitions
//! that the other whisper crates depend on.
//!
//! ## Logging
//!
//! Every crate logs through `tracing` with the same structured fields:
//! `subsystem` (`api`, `db`, `jobs`, `reconcile`, `worker`), `component`,
//! `op`, `document_id`, `job_id`, `content_hash`, `duration_ms`,
//! `size_bytes`, `progress` and `error`.
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, job failed or timed out |
//! | INFO  | Lifecycle events (startup, shutdown), job completions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-item iteration (rules, lines, rent-roll rows) |
//!
//! Tenant names are PII and are never logged, raw or masked.

pub mod defaults;
pub mod draft;
pub mod error;
pub mod file_safety;
pub mod models;
pub mod money;
pub mod pii;
pub mod traits;
pub mod uuid_utils;

#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures;

// Re-export commonly used types at crate root
pub use draft::*;
pub use error::{Error, ErrorKind, Result};
pub use file_safety::{
    compute_content_hash, detect_content_type, sanitize_filename, validate_upload,
    ValidatedUpload,
};
pub use models::*;
pub use money::Money;
pub use pii::{pseudonymize, TenantMasker};
pub use traits::*;
pub use uuid_utils::new_v7;

//! Request-independent services behind the HTTP handlers.

pub mod export;
pub mod ingestion;
pub mod status;

pub use export::{annotate_pdf, build_bundle, AuditBundle, AuditExporter, BUNDLE_FORMAT};
pub use ingestion::IngestionGateway;
pub use status::{DocumentDetail, JobDetail, JobStatusService};

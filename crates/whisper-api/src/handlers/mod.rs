//! HTTP handlers for whisper-api.

pub mod documents;
pub mod jobs;
pub mod system;

pub use documents::SubmitResponse;

//! Extraction worker implementations.

pub mod http;
#[cfg(any(test, feature = "mock"))]
pub mod scripted;

pub use http::{HttpExtractionWorker, HttpWorkerConfig};
#[cfg(any(test, feature = "mock"))]
pub use scripted::{Outcome, ScriptedWorker};

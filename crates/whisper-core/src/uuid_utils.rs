//! UUID v7 utilities for time-ordered identifiers.
//!
//! Document and job ids are UUIDv7 so they sort by creation time, which keeps
//! "latest job for a document" queries and log correlation cheap.

use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
///
/// # Example
///
/// ```
/// use whisper_core::uuid_utils::new_v7;
///
/// let a = new_v7();
/// let b = new_v7();
/// assert!(b > a);
/// ```
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

//! Upload validation for the ingestion gateway.
//!
//! Layers, cheapest first:
//! 1. Size ceiling
//! 2. Magic byte detection (must be a PDF, regardless of declared type)
//! 3. PDF object tree parse (page count)

use tracing::debug;

use crate::defaults::PDF_MIME;
use crate::error::{Error, Result};

/// Facts established about an accepted upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUpload {
    pub content_hash: String,
    pub page_count: u32,
    pub size_bytes: u64,
}

/// Content fingerprint used for deduplication, `blake3:<hex>`.
pub fn compute_content_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("blake3:{}", hash.to_hex())
}

/// Detect the MIME type from magic bytes, if known.
pub fn detect_content_type(data: &[u8]) -> Option<&'static str> {
    infer::get(data).map(|kind| kind.mime_type())
}

/// Validate an upload and derive its fingerprint and page count.
///
/// Errors are all validation-kind: `PayloadTooLarge` above `max_size_bytes`,
/// `UnsupportedMediaType` when the bytes are not a PDF, `InvalidInput` for an
/// empty body or a PDF that cannot be parsed.
pub fn validate_upload(data: &[u8], max_size_bytes: u64) -> Result<ValidatedUpload> {
    let size = data.len() as u64;
    if size == 0 {
        return Err(Error::InvalidInput("empty upload".to_string()));
    }
    if size > max_size_bytes {
        return Err(Error::PayloadTooLarge {
            size,
            limit: max_size_bytes,
        });
    }

    match detect_content_type(data) {
        Some(PDF_MIME) => {}
        Some(other) => return Err(Error::UnsupportedMediaType(other.to_string())),
        None => {
            return Err(Error::UnsupportedMediaType(
                "unrecognized content".to_string(),
            ))
        }
    }

    let doc = lopdf::Document::load_mem(data)
        .map_err(|e| Error::InvalidInput(format!("unreadable PDF: {}", e)))?;
    let page_count = doc.get_pages().len() as u32;
    if page_count == 0 {
        return Err(Error::InvalidInput("PDF has no pages".to_string()));
    }

    let content_hash = compute_content_hash(data);
    debug!(
        content_hash = %content_hash,
        page_count,
        size_bytes = size,
        "Upload validated"
    );

    Ok(ValidatedUpload {
        content_hash,
        page_count,
        size_bytes: size,
    })
}

/// Sanitize a client-supplied filename for storage in metadata.
pub fn sanitize_filename(filename: &str) -> String {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);

    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = sanitized.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "upload.pdf".to_string()
    } else {
        trimmed.chars().take(255).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::sample_pdf;

    #[test]
    fn accepts_pdf_and_counts_pages() {
        let pdf = sample_pdf(3);
        let upload = validate_upload(&pdf, 1024 * 1024).unwrap();
        assert_eq!(upload.page_count, 3);
        assert_eq!(upload.size_bytes, pdf.len() as u64);
        assert!(upload.content_hash.starts_with("blake3:"));
        assert_eq!(upload.content_hash, compute_content_hash(&pdf));
    }

    #[test]
    fn rejects_oversized_before_parsing() {
        let pdf = sample_pdf(1);
        let err = validate_upload(&pdf, 10).unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { limit: 10, .. }));
    }

    #[test]
    fn rejects_non_pdf_magic() {
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        let err = validate_upload(&png, 1024).unwrap_err();
        assert!(matches!(err, Error::UnsupportedMediaType(ref m) if m == "image/png"));

        let err = validate_upload(b"just some text", 1024).unwrap_err();
        assert!(matches!(err, Error::UnsupportedMediaType(_)));
    }

    #[test]
    fn rejects_truncated_pdf() {
        let err = validate_upload(b"%PDF-1.5\n garbage", 1024).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn rejects_empty_body() {
        assert!(matches!(
            validate_upload(&[], 1024),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(compute_content_hash(b"abc"), compute_content_hash(b"abc"));
        assert_ne!(compute_content_hash(b"abc"), compute_content_hash(b"abd"));
    }

    #[test]
    fn sanitize_strips_paths_and_specials() {
        assert_eq!(sanitize_filename("../../etc/om.pdf"), "om.pdf");
        assert_eq!(sanitize_filename("C:\\deals\\t12?.pdf"), "t12_.pdf");
        assert_eq!(sanitize_filename("..."), "upload.pdf");
    }
}

//! Audit/proof exporter.
//!
//! `audit.zip` layout:
//!
//! ```text
//! manifest.json    document, job, content hash, SHA-256 of every other entry
//! record.json      the published ExtractionRecord
//! provenance.json  figure -> page trail
//! proof.pdf        source PDF with one note per referenced page
//! ```
//!
//! Entries carry a fixed timestamp and fixed permissions, so the same record
//! always exports to the same bytes.

use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::time::Instant;

use chrono::{DateTime, Utc};
use lopdf::{dictionary, Object};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use whisper_core::{Document, Error, ExtractionRecord, Result};
use whisper_db::Database;

/// Value of `format` in `manifest.json`.
pub const BUNDLE_FORMAT: &str = "whisper-audit/1";

/// Author shown on proof annotations.
const ANNOTATION_AUTHOR: &str = "Property Whisperer";

#[derive(Serialize)]
struct Manifest<'a> {
    format: &'static str,
    document_id: Uuid,
    job_id: Uuid,
    content_hash: &'a str,
    page_count: u32,
    reconciled_at: DateTime<Utc>,
    files: Vec<ManifestEntry>,
}

#[derive(Serialize)]
struct ManifestEntry {
    name: &'static str,
    sha256: String,
    size_bytes: usize,
}

/// A finished export.
#[derive(Debug, Clone)]
pub struct AuditBundle {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Copy of the source PDF with a text annotation on every page the record
/// cites, listing the figures that page backs. Pages beyond the document are
/// skipped.
pub fn annotate_pdf(source: &[u8], record: &ExtractionRecord) -> Result<Vec<u8>> {
    let mut doc = lopdf::Document::load_mem(source).map_err(pdf_error)?;
    let pages = doc.get_pages();

    let mut figures_by_page: BTreeMap<u32, Vec<&str>> = BTreeMap::new();
    for entry in &record.provenance {
        figures_by_page
            .entry(entry.page)
            .or_default()
            .push(entry.figure.as_str());
    }

    for (page_no, figures) in figures_by_page {
        let Some(&page_id) = pages.get(&page_no) else {
            warn!(page = page_no, "Provenance cites a page outside the document");
            continue;
        };

        let annotation_id = doc.add_object(dictionary! {
            "Type" => "Annot",
            "Subtype" => "Text",
            "Rect" => vec![18.into(), 18.into(), 42.into(), 42.into()],
            "Contents" => Object::string_literal(format!(
                "Source of: {}",
                figures.join(", ")
            )),
            "T" => Object::string_literal(ANNOTATION_AUTHOR),
            "Name" => "Comment",
            "Open" => false,
        });

        let existing = doc
            .get_dictionary(page_id)
            .ok()
            .and_then(|page| page.get(b"Annots").ok())
            .cloned();
        match existing {
            Some(Object::Reference(array_id)) => {
                doc.get_object_mut(array_id)
                    .and_then(|obj| obj.as_array_mut())
                    .map_err(pdf_error)?
                    .push(Object::Reference(annotation_id));
            }
            Some(Object::Array(mut annotations)) => {
                annotations.push(Object::Reference(annotation_id));
                doc.get_dictionary_mut(page_id)
                    .map_err(pdf_error)?
                    .set("Annots", annotations);
            }
            _ => {
                doc.get_dictionary_mut(page_id)
                    .map_err(pdf_error)?
                    .set("Annots", vec![Object::Reference(annotation_id)]);
            }
        }
    }

    let mut out = Vec::new();
    doc.save_to(&mut out)
        .map_err(|e| Error::Internal(format!("failed to write proof PDF: {}", e)))?;
    Ok(out)
}

/// Assemble `audit.zip` for a published record.
pub fn build_bundle(
    document: &Document,
    record: &ExtractionRecord,
    source_pdf: &[u8],
) -> Result<Vec<u8>> {
    let record_json = serde_json::to_vec_pretty(record)?;
    let provenance_json = serde_json::to_vec_pretty(&record.provenance)?;
    let proof = annotate_pdf(source_pdf, record)?;

    let entries: [(&'static str, &[u8]); 3] = [
        ("record.json", &record_json),
        ("provenance.json", &provenance_json),
        ("proof.pdf", &proof),
    ];

    let manifest = Manifest {
        format: BUNDLE_FORMAT,
        document_id: document.id,
        job_id: record.job_id,
        content_hash: &document.content_hash,
        page_count: document.page_count,
        reconciled_at: record.reconciled_at,
        files: entries
            .iter()
            .map(|&(name, bytes)| ManifestEntry {
                name,
                sha256: hex::encode(Sha256::digest(bytes)),
                size_bytes: bytes.len(),
            })
            .collect(),
    };
    let manifest_json = serde_json::to_vec_pretty(&manifest)?;

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let all = std::iter::once(("manifest.json", manifest_json.as_slice())).chain(entries);
    for (name, bytes) in all {
        zip.start_file(name, entry_options()).map_err(zip_error)?;
        zip.write_all(bytes)?;
    }
    Ok(zip.finish().map_err(zip_error)?.into_inner())
}

fn entry_options() -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644)
}

fn pdf_error(e: lopdf::Error) -> Error {
    Error::Internal(format!("failed to annotate PDF: {}", e))
}

fn zip_error(e: zip::result::ZipError) -> Error {
    Error::Internal(format!("failed to write audit bundle: {}", e))
}

/// Loads published records with their source bytes and renders exports.
#[derive(Clone)]
pub struct AuditExporter {
    db: Database,
}

impl AuditExporter {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Build `audit.zip`. `NotFound` unless a completed record exists.
    pub async fn export(&self, document_id: Uuid) -> Result<AuditBundle> {
        let start = Instant::now();
        let (document, record, source) = self.load(document_id).await?;
        let bytes = tokio::task::spawn_blocking(move || build_bundle(&document, &record, &source))
            .await
            .map_err(|e| Error::Internal(format!("export task failed: {}", e)))??;

        info!(
            subsystem = "api",
            component = "exporter",
            document_id = %document_id,
            size_bytes = bytes.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Audit bundle exported"
        );
        Ok(AuditBundle {
            filename: format!("audit-{}.zip", document_id),
            bytes,
        })
    }

    /// Source PDF annotated with the record's provenance.
    pub async fn proof_pdf(&self, document_id: Uuid) -> Result<Vec<u8>> {
        let (_, record, source) = self.load(document_id).await?;
        tokio::task::spawn_blocking(move || annotate_pdf(&source, &record))
            .await
            .map_err(|e| Error::Internal(format!("export task failed: {}", e)))?
    }

    async fn load(&self, document_id: Uuid) -> Result<(Document, ExtractionRecord, Vec<u8>)> {
        let record = self.db.records.get(document_id).await?.ok_or_else(|| {
            Error::NotFound(format!(
                "no completed extraction for document {}",
                document_id
            ))
        })?;
        let document = self
            .db
            .documents
            .get(document_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("document {}", document_id)))?;
        let source = self
            .db
            .blobs
            .get(&document.content_hash)
            .await?
            .ok_or_else(|| {
                Error::Internal(format!("source bytes missing for {}", document.content_hash))
            })?;
        Ok((document, record, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use whisper_core::fixtures::sample_pdf;
    use whisper_core::{ProvenanceEntry, Totals};

    fn record(document_id: Uuid) -> ExtractionRecord {
        ExtractionRecord {
            document_id,
            job_id: Uuid::nil(),
            totals: Totals::default(),
            derivations: Vec::new(),
            t12_lines: Vec::new(),
            rent_roll: Vec::new(),
            debt_terms: None,
            covenants: Vec::new(),
            assumptions: Vec::new(),
            checks: Vec::new(),
            confidences: BTreeMap::new(),
            provenance: vec![
                ProvenanceEntry {
                    figure: "totals.noi".into(),
                    page: 2,
                    snippet: None,
                },
                ProvenanceEntry {
                    figure: "totals.egi".into(),
                    page: 2,
                    snippet: None,
                },
                ProvenanceEntry {
                    figure: "totals.opex".into(),
                    page: 7,
                    snippet: None,
                },
            ],
            reconciled_at: DateTime::parse_from_rfc3339("2026-01-15T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    fn document(pdf: &[u8]) -> Document {
        Document {
            id: Uuid::nil(),
            content_hash: whisper_core::compute_content_hash(pdf),
            page_count: 2,
            size_bytes: pdf.len() as u64,
            filename: None,
            uploaded_at: Utc::now(),
        }
    }

    fn annotations(pdf: &[u8], page_no: u32) -> Vec<String> {
        let doc = lopdf::Document::load_mem(pdf).unwrap();
        let page_id = doc.get_pages()[&page_no];
        let Ok(annots) = doc.get_dictionary(page_id).unwrap().get(b"Annots") else {
            return Vec::new();
        };
        annots
            .as_array()
            .unwrap()
            .iter()
            .map(|r| {
                let annot = doc.get_dictionary(r.as_reference().unwrap()).unwrap();
                match annot.get(b"Contents").unwrap() {
                    Object::String(bytes, _) => String::from_utf8_lossy(bytes).into_owned(),
                    other => panic!("unexpected annotation contents: {other:?}"),
                }
            })
            .collect()
    }

    #[test]
    fn test_proof_annotates_cited_pages_only() {
        let pdf = sample_pdf(2);
        let proof = annotate_pdf(&pdf, &record(Uuid::nil())).unwrap();

        assert!(annotations(&proof, 1).is_empty());
        let notes = annotations(&proof, 2);
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("totals.noi"));
        assert!(notes[0].contains("totals.egi"));
    }

    #[test]
    fn test_bundle_is_deterministic() {
        let pdf = sample_pdf(2);
        let rec = record(Uuid::nil());
        let doc = document(&pdf);

        let first = build_bundle(&doc, &rec, &pdf).unwrap();
        let second = build_bundle(&doc, &rec, &pdf).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_manifest_hashes_match_entries() {
        let pdf = sample_pdf(2);
        let rec = record(Uuid::nil());
        let bundle = build_bundle(&document(&pdf), &rec, &pdf).unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bundle)).unwrap();
        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        for expected in ["manifest.json", "record.json", "provenance.json", "proof.pdf"] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }

        let mut manifest = String::new();
        archive
            .by_name("manifest.json")
            .unwrap()
            .read_to_string(&mut manifest)
            .unwrap();
        let manifest: serde_json::Value = serde_json::from_str(&manifest).unwrap();
        assert_eq!(manifest["format"], BUNDLE_FORMAT);

        for file in manifest["files"].as_array().unwrap() {
            let name = file["name"].as_str().unwrap();
            let mut bytes = Vec::new();
            archive.by_name(name).unwrap().read_to_end(&mut bytes).unwrap();
            assert_eq!(
                file["sha256"].as_str().unwrap(),
                hex::encode(Sha256::digest(&bytes))
            );
        }
    }
}

//! The reconciliation pipeline: normalize, derive, check, score, publishable
//! record.

use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use whisper_core::pii::is_pseudonym;
use whisper_core::{
    CheckStatus, DraftRecord, Error, ExtractionRecord, ProvenanceEntry, Result, TenantMasker,
};

use crate::config::ReconcileConfig;
use crate::confidence::score_sections;
use crate::derive::derive;
use crate::normalize::{masker_for, normalize, NormalizedRecord};
use crate::rules::{RuleContext, RuleRegistry};

/// Turns drafts into reconciled [`ExtractionRecord`]s.
#[derive(Clone)]
pub struct Reconciler {
    config: ReconcileConfig,
    rules: RuleRegistry,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(ReconcileConfig::default())
    }
}

impl Reconciler {
    /// Reconciler with the standard rule set.
    pub fn new(config: ReconcileConfig) -> Self {
        Self {
            config,
            rules: RuleRegistry::standard(),
        }
    }

    pub fn with_rules(mut self, rules: RuleRegistry) -> Self {
        self.rules = rules;
        self
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn rules(&self) -> &RuleRegistry {
        &self.rules
    }

    /// Reconcile a draft into a publishable record.
    ///
    /// `Err` means the engine itself could not produce a trustworthy record
    /// (bad configuration, arithmetic it cannot carry out, or a masking
    /// violation). Problems found *in the data* are reported as checks.
    pub fn reconcile(
        &self,
        document_id: Uuid,
        job_id: Uuid,
        draft: &DraftRecord,
    ) -> Result<ExtractionRecord> {
        self.reconcile_at(document_id, job_id, draft, Utc::now())
    }

    /// [`Self::reconcile`] with an explicit timestamp.
    pub fn reconcile_at(
        &self,
        document_id: Uuid,
        job_id: Uuid,
        draft: &DraftRecord,
        reconciled_at: DateTime<Utc>,
    ) -> Result<ExtractionRecord> {
        let start = Instant::now();
        self.config.validate()?;

        let masker = masker_for(draft)?;
        let normalized = normalize(draft, &masker);
        let derived = derive(&normalized.totals, self.config.tolerance())?;

        let checks = self.rules.run(&RuleContext {
            record: &normalized,
            derived: &derived,
            config: &self.config,
        });
        let confidences =
            score_sections(&normalized, &derived, self.config.t12_required_months);
        let provenance = provenance(&normalized);

        let NormalizedRecord {
            t12_lines,
            rent_roll,
            debt_terms,
            covenants,
            assumptions,
            ..
        } = normalized;

        let record = ExtractionRecord {
            document_id,
            job_id,
            totals: derived.totals,
            derivations: derived.derivations,
            t12_lines,
            rent_roll,
            debt_terms,
            covenants,
            assumptions,
            checks,
            confidences,
            provenance,
            reconciled_at,
        };

        audit_masking(&record, &masker)?;
        for (section, score) in &record.confidences {
            if !(0.0..=1.0).contains(score) {
                return Err(Error::Reconciliation(format!(
                    "confidence for {} out of range: {}",
                    section, score
                )));
            }
        }

        let failed = record
            .checks
            .iter()
            .filter(|c| c.status == CheckStatus::Fail)
            .count();
        let warned = record
            .checks
            .iter()
            .filter(|c| c.status == CheckStatus::Warn)
            .count();
        debug!(
            subsystem = "reconcile",
            component = "engine",
            op = "reconcile",
            document_id = %document_id,
            job_id = %job_id,
            check_count = record.checks.len(),
            failed,
            warned,
            tenant_count = masker.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Reconciled draft"
        );
        Ok(record)
    }
}

/// Audit trail: one entry per figure with a known source page.
fn provenance(record: &NormalizedRecord) -> Vec<ProvenanceEntry> {
    let mut entries = Vec::new();
    for (name, source) in &record.totals_sources {
        entries.push(ProvenanceEntry {
            figure: format!("totals.{}", name),
            page: source.page,
            snippet: source.snippet.clone(),
        });
    }
    for (i, line) in record.t12_lines.iter().enumerate() {
        if let Some(page) = line.source_page {
            entries.push(ProvenanceEntry {
                figure: format!("t12Lines[{}].amount", i),
                page,
                snippet: None,
            });
        }
    }
    for (i, row) in record.rent_roll.iter().enumerate() {
        if let Some(page) = row.source_page {
            entries.push(ProvenanceEntry {
                figure: format!("rentRoll[{}]", i),
                page,
                snippet: None,
            });
        }
    }
    if let Some(page) = record.debt_terms.as_ref().and_then(|d| d.source_page) {
        entries.push(ProvenanceEntry {
            figure: "debtTerms".to_string(),
            page,
            snippet: None,
        });
    }
    for (i, covenant) in record.covenants.iter().enumerate() {
        if let Some(page) = covenant.source_page {
            entries.push(ProvenanceEntry {
                figure: format!("covenants[{}]", i),
                page,
                snippet: None,
            });
        }
    }
    for (i, assumption) in record.assumptions.iter().enumerate() {
        for source in &assumption.source_refs {
            entries.push(ProvenanceEntry {
                figure: format!("assumptions[{}]", i),
                page: source.page,
                snippet: source.snippet.clone(),
            });
        }
    }
    entries
}

/// Final gate before a record may leave the pipeline: every tenant name is a
/// pseudonym and no known raw name survives in any free-text field.
fn audit_masking(record: &ExtractionRecord, masker: &TenantMasker) -> Result<()> {
    for (i, row) in record.rent_roll.iter().enumerate() {
        if let Some(name) = &row.tenant_name {
            if !is_pseudonym(name) {
                return Err(unmasked(format!("rentRoll[{}].tenantName", i)));
            }
        }
    }
    if masker.is_empty() {
        return Ok(());
    }

    let mut texts: Vec<(String, &String)> = Vec::new();
    for (i, line) in record.t12_lines.iter().enumerate() {
        texts.push((format!("t12Lines[{}].category", i), &line.category));
        if let Some(sub) = &line.subcategory {
            texts.push((format!("t12Lines[{}].subcategory", i), sub));
        }
    }
    for (i, row) in record.rent_roll.iter().enumerate() {
        texts.push((format!("rentRoll[{}].unitId", i), &row.unit_id));
        if let Some(esc) = &row.escalations {
            texts.push((format!("rentRoll[{}].escalations", i), esc));
        }
    }
    if let Some(terms) = &record.debt_terms {
        for (name, value) in [("lender", &terms.lender), ("index", &terms.index)] {
            if let Some(value) = value {
                texts.push((format!("debtTerms.{}", name), value));
            }
        }
    }
    for (i, covenant) in record.covenants.iter().enumerate() {
        texts.push((format!("covenants[{}].type", i), &covenant.covenant_type));
        if let Some(freq) = &covenant.frequency {
            texts.push((format!("covenants[{}].frequency", i), freq));
        }
    }
    for (i, assumption) in record.assumptions.iter().enumerate() {
        texts.push((format!("assumptions[{}].text", i), &assumption.text));
        for source in &assumption.source_refs {
            if let Some(snippet) = &source.snippet {
                texts.push((format!("assumptions[{}].sourceRefs", i), snippet));
            }
        }
    }
    for entry in &record.provenance {
        if let Some(snippet) = &entry.snippet {
            texts.push((format!("provenance.{}", entry.figure), snippet));
        }
    }

    match texts.iter().find(|(_, text)| masker.contains_raw_name(text)) {
        Some((location, _)) => Err(unmasked(location.clone())),
        None => Ok(()),
    }
}

fn unmasked(location: String) -> Error {
    // The location only, never the offending text.
    warn!(
        subsystem = "reconcile",
        component = "pii",
        location = %location,
        "Unmasked tenant name detected"
    );
    Error::Reconciliation(format!("unmasked tenant name at {}", location))
}

//! Draft records: raw, unreconciled extraction worker output.
//!
//! A draft carries values exactly as the worker read them (numbers or
//! strings, possibly with currency symbols) together with raw tenant names.
//! It is stored internally and never leaves the pipeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::Assumption;

/// A value as printed in the source: a JSON number or a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(serde_json::Number),
    Text(String),
}

impl RawValue {
    pub fn text(s: impl Into<String>) -> Self {
        RawValue::Text(s.into())
    }

    pub fn number(n: f64) -> Self {
        serde_json::Number::from_f64(n)
            .map(RawValue::Number)
            .unwrap_or_else(|| RawValue::Text(n.to_string()))
    }

    pub fn integer(n: i64) -> Self {
        RawValue::Number(n.into())
    }
}

/// One extracted scalar with its source location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftField {
    pub value: RawValue,
    #[serde(default)]
    pub source_page: Option<u32>,
    #[serde(default)]
    pub snippet: Option<String>,
}

impl DraftField {
    pub fn new(value: RawValue) -> Self {
        Self {
            value,
            source_page: None,
            snippet: None,
        }
    }

    pub fn on_page(mut self, page: u32) -> Self {
        self.source_page = Some(page);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DraftTotals {
    pub gpr: Option<DraftField>,
    pub vacancy: Option<DraftField>,
    pub egi: Option<DraftField>,
    pub opex: Option<DraftField>,
    pub noi: Option<DraftField>,
    pub annual_debt_service: Option<DraftField>,
    pub dscr: Option<DraftField>,
}

impl DraftTotals {
    fn fields(&self) -> [(&'static str, Option<&DraftField>); 7] {
        [
            ("gpr", self.gpr.as_ref()),
            ("vacancy", self.vacancy.as_ref()),
            ("egi", self.egi.as_ref()),
            ("opex", self.opex.as_ref()),
            ("noi", self.noi.as_ref()),
            ("annualDebtService", self.annual_debt_service.as_ref()),
            ("dscr", self.dscr.as_ref()),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.fields().iter().all(|(_, f)| f.is_none())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DraftT12Line {
    pub month: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub amount: Option<RawValue>,
    pub source_page: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DraftRentRow {
    pub unit_id: Option<String>,
    /// Raw tenant name (PII).
    pub tenant_name: Option<String>,
    pub sqft: Option<RawValue>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub base_rent: Option<RawValue>,
    pub escalations: Option<String>,
    pub source_page: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DraftDebtTerms {
    pub lender: Option<String>,
    pub principal: Option<RawValue>,
    pub rate_type: Option<String>,
    pub index: Option<String>,
    pub spread_bps: Option<RawValue>,
    pub all_in_rate: Option<RawValue>,
    pub amortization_months: Option<RawValue>,
    pub io_months: Option<RawValue>,
    pub maturity_date: Option<String>,
    pub rate_cap: Option<RawValue>,
    pub source_page: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DraftCovenant {
    #[serde(rename = "type")]
    pub covenant_type: Option<String>,
    pub threshold: Option<RawValue>,
    pub frequency: Option<String>,
    pub source_page: Option<u32>,
}

/// Worker output before reconciliation. Carries no checks or confidences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DraftRecord {
    pub totals: DraftTotals,
    pub t12_lines: Vec<DraftT12Line>,
    pub rent_roll: Vec<DraftRentRow>,
    pub debt_terms: Option<DraftDebtTerms>,
    pub covenants: Vec<DraftCovenant>,
    pub assumptions: Vec<Assumption>,
    /// Optional per-section OCR confidence hints in [0, 1].
    pub ocr_confidence: BTreeMap<String, f64>,
}

impl DraftRecord {
    /// True when the worker produced no section at all.
    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
            && self.t12_lines.is_empty()
            && self.rent_roll.is_empty()
            && self.debt_terms.is_none()
            && self.covenants.is_empty()
            && self.assumptions.is_empty()
    }

    /// Every `(location, page)` reference in the draft.
    pub fn source_pages(&self) -> Vec<(String, u32)> {
        let mut pages = Vec::new();
        for (name, field) in self.totals.fields() {
            if let Some(page) = field.and_then(|f| f.source_page) {
                pages.push((format!("totals.{}", name), page));
            }
        }
        for (i, line) in self.t12_lines.iter().enumerate() {
            if let Some(page) = line.source_page {
                pages.push((format!("t12Lines[{}]", i), page));
            }
        }
        for (i, row) in self.rent_roll.iter().enumerate() {
            if let Some(page) = row.source_page {
                pages.push((format!("rentRoll[{}]", i), page));
            }
        }
        if let Some(page) = self.debt_terms.as_ref().and_then(|d| d.source_page) {
            pages.push(("debtTerms".to_string(), page));
        }
        for (i, covenant) in self.covenants.iter().enumerate() {
            if let Some(page) = covenant.source_page {
                pages.push((format!("covenants[{}]", i), page));
            }
        }
        for (i, assumption) in self.assumptions.iter().enumerate() {
            for source in &assumption.source_refs {
                pages.push((format!("assumptions[{}]", i), source.page));
            }
        }
        pages
    }

    /// Structural validation against the source document.
    ///
    /// Rejects an empty draft, source pages outside `1..=page_count` and
    /// OCR hints outside `[0, 1]`. Value-level problems are not errors here;
    /// normalization turns them into "unknown" plus a check.
    pub fn validate(&self, page_count: u32) -> Result<()> {
        if self.is_empty() {
            return Err(malformed("draft contains no sections"));
        }
        for (location, page) in self.source_pages() {
            if page == 0 || page > page_count {
                return Err(malformed(format!(
                    "{} references page {} but document has {} pages",
                    location, page, page_count
                )));
            }
        }
        for (section, score) in &self.ocr_confidence {
            if !score.is_finite() || !(0.0..=1.0).contains(score) {
                return Err(malformed(format!(
                    "ocr confidence for {} is out of range",
                    section
                )));
            }
        }
        Ok(())
    }

    /// Decode a draft from worker JSON.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| malformed(e.to_string()))
    }
}

fn malformed(detail: impl std::fmt::Display) -> Error {
    Error::MalformedOutput(detail.to_string())
}

//! Per-section confidence scores.
//!
//! A score in `[0, 1]` combines up to three signals:
//!
//! | Signal | Weight | Source |
//! |--------|--------|--------|
//! | completeness | 0.5 | fraction of required fields present |
//! | agreement | 0.3 | extracted vs recomputed figures, internal consistency |
//! | OCR | 0.2 | worker-supplied hint, when present |
//!
//! Weights of missing signals are redistributed over the present ones.
//! Scores are a pure function of their inputs and rounded to three decimals,
//! so identical input always yields identical output.

use std::collections::BTreeMap;

use whisper_core::{sections, DebtTerms, RateType};

use crate::derive::DerivedTotals;
use crate::normalize::NormalizedRecord;

pub const COMPLETENESS_WEIGHT: f64 = 0.5;
pub const AGREEMENT_WEIGHT: f64 = 0.3;
pub const OCR_WEIGHT: f64 = 0.2;

/// Raw signals for one section.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SectionSignals {
    pub completeness: f64,
    pub agreement: Option<f64>,
    pub ocr: Option<f64>,
}

impl SectionSignals {
    /// Weighted mean of the present signals, rounded to three decimals.
    pub fn score(&self) -> f64 {
        let mut total = COMPLETENESS_WEIGHT * self.completeness;
        let mut weight = COMPLETENESS_WEIGHT;
        if let Some(agreement) = self.agreement {
            total += AGREEMENT_WEIGHT * agreement;
            weight += AGREEMENT_WEIGHT;
        }
        if let Some(ocr) = self.ocr {
            total += OCR_WEIGHT * ocr;
            weight += OCR_WEIGHT;
        }
        round3((total / weight).clamp(0.0, 1.0))
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn fraction(present: usize, required: usize) -> f64 {
    if required == 0 {
        0.0
    } else {
        present as f64 / required as f64
    }
}

/// Score every section. Sections with no extracted data score `0.0`.
pub fn score_sections(
    record: &NormalizedRecord,
    derived: &DerivedTotals,
    t12_required_months: usize,
) -> BTreeMap<String, f64> {
    let ocr = |section: &str| record.ocr_confidence.get(section).copied();
    let mut scores = BTreeMap::new();

    for section in sections::ALL {
        let signals = match section {
            sections::TOTALS => totals_signals(record, derived),
            sections::T12 => t12_signals(record, t12_required_months),
            sections::RENT_ROLL => rent_roll_signals(record),
            sections::DEBT_TERMS => record.debt_terms.as_ref().map(debt_terms_signals),
            sections::COVENANTS => covenants_signals(record),
            sections::ASSUMPTIONS => assumptions_signals(record),
            _ => None,
        };
        let score = signals
            .map(|s| SectionSignals { ocr: ocr(section), ..s }.score())
            .unwrap_or(0.0);
        scores.insert(section.to_string(), score);
    }
    scores
}

fn totals_signals(record: &NormalizedRecord, derived: &DerivedTotals) -> Option<SectionSignals> {
    let t = &record.totals;
    let present = [
        t.gpr.is_some(),
        t.vacancy.is_some(),
        t.egi.is_some(),
        t.opex.is_some(),
        t.noi.is_some(),
        t.annual_debt_service.is_some(),
        t.dscr.is_some(),
    ];
    let count = present.iter().filter(|p| **p).count();
    if count == 0 {
        return None;
    }

    let compared: Vec<f64> = derived
        .derivations
        .iter()
        .filter_map(|d| match (d.within_tolerance, d.relative_diff) {
            (Some(true), _) => Some(1.0),
            (Some(false), Some(diff)) => Some((1.0 - diff).max(0.0)),
            _ => None,
        })
        .collect();
    let agreement = if compared.is_empty() {
        None
    } else {
        Some(compared.iter().sum::<f64>() / compared.len() as f64)
    };

    Some(SectionSignals {
        completeness: fraction(count, present.len()),
        agreement,
        ocr: None,
    })
}

fn t12_signals(record: &NormalizedRecord, required_months: usize) -> Option<SectionSignals> {
    let lines = &record.t12_lines;
    if lines.is_empty() {
        return None;
    }
    let months = record.t12_months().len();

    let mut keys: Vec<(&str, String, Option<String>)> = lines
        .iter()
        .map(|l| {
            (
                l.month.as_str(),
                l.category.to_lowercase(),
                l.subcategory.as_deref().map(str::to_lowercase),
            )
        })
        .collect();
    keys.sort();
    keys.dedup();
    let duplicate_lines = lines.len() - keys.len();

    Some(SectionSignals {
        completeness: fraction(months, required_months).min(1.0),
        agreement: Some(1.0 - fraction(duplicate_lines, lines.len())),
        ocr: None,
    })
}

fn rent_roll_signals(record: &NormalizedRecord) -> Option<SectionSignals> {
    let rows = &record.rent_roll;
    if rows.is_empty() {
        return None;
    }
    let filled: usize = rows
        .iter()
        .map(|r| {
            [
                r.tenant_name.is_some(),
                r.sqft.is_some(),
                r.start_date.is_some(),
                r.end_date.is_some(),
                r.base_rent.is_some(),
            ]
            .iter()
            .filter(|p| **p)
            .count()
        })
        .sum();

    let duplicates = record.duplicate_units();
    let consistent = rows
        .iter()
        .filter(|r| {
            let dates_ok = !matches!((r.start_date, r.end_date), (Some(s), Some(e)) if e < s);
            dates_ok && !duplicates.contains_key(r.unit_id.as_str())
        })
        .count();

    Some(SectionSignals {
        completeness: fraction(filled, rows.len() * 5),
        agreement: Some(fraction(consistent, rows.len())),
        ocr: None,
    })
}

fn debt_terms_signals(terms: &DebtTerms) -> SectionSignals {
    let mut required = vec![
        terms.lender.is_some(),
        terms.principal.is_some(),
        terms.rate_type.is_some(),
        terms.amortization_months.is_some(),
        terms.maturity_date.is_some(),
    ];
    match terms.rate_type {
        Some(RateType::Floating) => {
            required.push(terms.index.is_some());
            required.push(terms.spread_bps.is_some());
        }
        _ => required.push(terms.all_in_rate.is_some()),
    }
    let present = required.iter().filter(|p| **p).count();
    SectionSignals {
        completeness: fraction(present, required.len()),
        agreement: None,
        ocr: None,
    }
}

fn covenants_signals(record: &NormalizedRecord) -> Option<SectionSignals> {
    let covenants = &record.covenants;
    if covenants.is_empty() {
        return None;
    }
    let filled: usize = covenants
        .iter()
        .map(|c| usize::from(c.threshold.is_some()) + usize::from(c.frequency.is_some()))
        .sum();
    Some(SectionSignals {
        completeness: fraction(filled, covenants.len() * 2),
        agreement: None,
        ocr: None,
    })
}

fn assumptions_signals(record: &NormalizedRecord) -> Option<SectionSignals> {
    let assumptions = &record.assumptions;
    if assumptions.is_empty() {
        return None;
    }
    let sourced = assumptions.iter().filter(|a| !a.source_refs.is_empty()).count();
    Some(SectionSignals {
        completeness: fraction(sourced, assumptions.len()),
        agreement: None,
        ocr: None,
    })
}

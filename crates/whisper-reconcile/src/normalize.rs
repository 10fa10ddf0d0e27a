//! Normalization of raw worker output.
//!
//! Turns a [`DraftRecord`] into typed values: numeric strings are coerced,
//! currency symbols dropped, and obviously invalid values (negative square
//! footage, dates outside a sane range) become unknown instead of being
//! guessed. Every value set to unknown is recorded as a
//! [`NormalizationIssue`].
//!
//! This is also the single place where tenant names are masked. Rent-roll
//! names become pseudonyms and every free-text field is passed through the
//! same [`TenantMasker`].

use std::collections::{BTreeMap, HashSet};

use chrono::{Datelike, NaiveDate};

use whisper_core::defaults::{MAX_SANE_YEAR, MIN_SANE_YEAR};
use whisper_core::money::round_ratio;
use whisper_core::{
    Assumption, Covenant, DebtTerms, DraftDebtTerms, DraftField, DraftRecord, DraftTotals,
    Money, RateType, RawValue, RentRollEntry, SourceRef, T12Line, TenantMasker, Totals,
};

/// A value that was present in the draft but could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizationIssue {
    /// Draft location, e.g. `rentRoll[2].sqft`.
    pub location: String,
    pub reason: String,
}

/// Typed, masked view of a draft. Derived totals are not filled in yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedRecord {
    /// Totals exactly as extracted (after coercion).
    pub totals: Totals,
    /// Source location of each extracted total, keyed by camelCase name.
    pub totals_sources: BTreeMap<&'static str, SourceRef>,
    /// Ordered by month, then category, then subcategory.
    pub t12_lines: Vec<T12Line>,
    pub rent_roll: Vec<RentRollEntry>,
    pub debt_terms: Option<DebtTerms>,
    pub covenants: Vec<Covenant>,
    pub assumptions: Vec<Assumption>,
    pub ocr_confidence: BTreeMap<String, f64>,
    pub issues: Vec<NormalizationIssue>,
}

impl NormalizedRecord {
    /// Distinct T-12 months, ascending.
    pub fn t12_months(&self) -> Vec<&str> {
        let mut months: Vec<&str> = self.t12_lines.iter().map(|l| l.month.as_str()).collect();
        months.sort_unstable();
        months.dedup();
        months
    }

    /// Rent-roll rows per unit id, for units that appear more than once.
    pub fn duplicate_units(&self) -> BTreeMap<&str, Vec<&RentRollEntry>> {
        let mut by_unit: BTreeMap<&str, Vec<&RentRollEntry>> = BTreeMap::new();
        for row in &self.rent_roll {
            by_unit.entry(row.unit_id.as_str()).or_default().push(row);
        }
        by_unit.retain(|_, rows| rows.len() > 1);
        by_unit
    }
}

/// Masker covering every raw tenant name in the draft's rent roll.
pub fn masker_for(draft: &DraftRecord) -> whisper_core::Result<TenantMasker> {
    TenantMasker::new(
        draft
            .rent_roll
            .iter()
            .filter_map(|row| row.tenant_name.as_deref()),
    )
}

/// Normalize a draft. Never fails: unusable values become unknown and are
/// listed in [`NormalizedRecord::issues`].
pub fn normalize(draft: &DraftRecord, masker: &TenantMasker) -> NormalizedRecord {
    let mut n = Normalizer {
        masker,
        issues: Vec::new(),
        totals_sources: BTreeMap::new(),
    };

    let totals = n.totals(&draft.totals);
    let t12_lines = n.t12_lines(draft);
    let rent_roll = n.rent_roll(draft);
    let debt_terms = draft.debt_terms.as_ref().map(|d| n.debt_terms(d));
    let covenants = n.covenants(draft);
    let assumptions = n.assumptions(draft);

    NormalizedRecord {
        totals,
        totals_sources: n.totals_sources,
        t12_lines,
        rent_roll,
        debt_terms,
        covenants,
        assumptions,
        ocr_confidence: draft.ocr_confidence.clone(),
        issues: n.issues,
    }
}

struct Normalizer<'a> {
    masker: &'a TenantMasker,
    issues: Vec<NormalizationIssue>,
    totals_sources: BTreeMap<&'static str, SourceRef>,
}

type Coerce<T> = fn(&RawValue) -> Result<T, &'static str>;

impl Normalizer<'_> {
    fn issue(&mut self, location: impl Into<String>, reason: &str) {
        self.issues.push(NormalizationIssue {
            location: location.into(),
            reason: reason.to_string(),
        });
    }

    /// Keep a coerced value, or record why it was dropped.
    fn keep<T>(&mut self, location: impl Into<String>, coerced: Result<T, &'static str>) -> Option<T> {
        match coerced {
            Ok(value) => Some(value),
            Err(reason) => {
                self.issue(location, reason);
                None
            }
        }
    }

    fn raw<T>(&mut self, location: String, value: Option<&RawValue>, coerce: Coerce<T>) -> Option<T> {
        let value = value?;
        self.keep(location, coerce(value))
    }

    fn date(&mut self, location: String, value: Option<&String>) -> Option<NaiveDate> {
        let value = value?;
        if value.trim().is_empty() {
            return None;
        }
        self.keep(location, parse_date(value))
    }

    fn text(&self, value: Option<&String>) -> Option<String> {
        let trimmed = value?.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(self.masker.redact(trimmed))
        }
    }

    fn total<T>(&mut self, name: &'static str, field: Option<&DraftField>, coerce: Coerce<T>) -> Option<T> {
        let field = field?;
        let value = self.keep(format!("totals.{}", name), coerce(&field.value))?;
        if let Some(page) = field.source_page {
            let snippet = self.text(field.snippet.as_ref());
            self.totals_sources.insert(name, SourceRef { page, snippet });
        }
        Some(value)
    }

    fn totals(&mut self, draft: &DraftTotals) -> Totals {
        Totals {
            gpr: self.total("gpr", draft.gpr.as_ref(), non_negative_money),
            vacancy: self.total("vacancy", draft.vacancy.as_ref(), money_magnitude),
            egi: self.total("egi", draft.egi.as_ref(), non_negative_money),
            opex: self.total("opex", draft.opex.as_ref(), money_magnitude),
            noi: self.total("noi", draft.noi.as_ref(), money),
            annual_debt_service: self.total(
                "annualDebtService",
                draft.annual_debt_service.as_ref(),
                non_negative_money,
            ),
            dscr: self
                .total("dscr", draft.dscr.as_ref(), number)
                .map(round_ratio),
        }
    }

    fn t12_lines(&mut self, draft: &DraftRecord) -> Vec<T12Line> {
        let mut lines = Vec::with_capacity(draft.t12_lines.len());
        for (i, line) in draft.t12_lines.iter().enumerate() {
            let at = format!("t12Lines[{}]", i);
            let Some(raw_month) = line.month.as_deref().filter(|m| !m.trim().is_empty()) else {
                self.issue(format!("{}.month", at), "missing month");
                continue;
            };
            let Some(month) = self.keep(format!("{}.month", at), parse_month(raw_month)) else {
                continue;
            };
            let Some(category) = self.text(line.category.as_ref()) else {
                self.issue(format!("{}.category", at), "missing category");
                continue;
            };
            let Some(amount) = line.amount.as_ref() else {
                self.issue(format!("{}.amount", at), "missing amount");
                continue;
            };
            let Some(amount) = self.keep(format!("{}.amount", at), money(amount)) else {
                continue;
            };
            lines.push(T12Line {
                month: month.format("%Y-%m").to_string(),
                category,
                subcategory: self.text(line.subcategory.as_ref()),
                amount,
                source_page: line.source_page,
            });
        }
        lines.sort_by(|a, b| {
            a.month
                .cmp(&b.month)
                .then_with(|| a.category.cmp(&b.category))
                .then_with(|| a.subcategory.cmp(&b.subcategory))
        });
        lines
    }

    fn rent_roll(&mut self, draft: &DraftRecord) -> Vec<RentRollEntry> {
        let mut rows = Vec::with_capacity(draft.rent_roll.len());
        for (i, row) in draft.rent_roll.iter().enumerate() {
            let at = format!("rentRoll[{}]", i);
            let Some(unit_id) = self.text(row.unit_id.as_ref()) else {
                self.issue(format!("{}.unitId", at), "missing unit id");
                continue;
            };
            let tenant_name = row
                .tenant_name
                .as_deref()
                .filter(|name| !name.trim().is_empty())
                .map(|name| self.masker.mask_name(name));

            rows.push(RentRollEntry {
                unit_id,
                tenant_name,
                sqft: self.raw(format!("{}.sqft", at), row.sqft.as_ref(), square_feet),
                start_date: self.date(format!("{}.startDate", at), row.start_date.as_ref()),
                end_date: self.date(format!("{}.endDate", at), row.end_date.as_ref()),
                base_rent: self.raw(
                    format!("{}.baseRent", at),
                    row.base_rent.as_ref(),
                    non_negative_money,
                ),
                escalations: self.text(row.escalations.as_ref()),
                source_page: row.source_page,
            });
        }
        rows
    }

    fn debt_terms(&mut self, draft: &DraftDebtTerms) -> DebtTerms {
        let rate_type = match draft.rate_type.as_deref() {
            Some(raw) if !raw.trim().is_empty() => {
                self.keep("debtTerms.rateType".to_string(), parse_rate_type(raw))
            }
            _ => None,
        };
        DebtTerms {
            lender: self.text(draft.lender.as_ref()),
            principal: self.raw(
                "debtTerms.principal".into(),
                draft.principal.as_ref(),
                non_negative_money,
            ),
            rate_type,
            index: self.text(draft.index.as_ref()),
            spread_bps: self.raw("debtTerms.spreadBps".into(), draft.spread_bps.as_ref(), count),
            all_in_rate: self.raw("debtTerms.allInRate".into(), draft.all_in_rate.as_ref(), rate),
            amortization_months: self.raw(
                "debtTerms.amortizationMonths".into(),
                draft.amortization_months.as_ref(),
                count,
            ),
            io_months: self.raw("debtTerms.ioMonths".into(), draft.io_months.as_ref(), count),
            maturity_date: self.date("debtTerms.maturityDate".into(), draft.maturity_date.as_ref()),
            rate_cap: self.raw("debtTerms.rateCap".into(), draft.rate_cap.as_ref(), rate),
            source_page: draft.source_page,
        }
    }

    fn covenants(&mut self, draft: &DraftRecord) -> Vec<Covenant> {
        let mut covenants = Vec::with_capacity(draft.covenants.len());
        for (i, covenant) in draft.covenants.iter().enumerate() {
            let at = format!("covenants[{}]", i);
            let Some(covenant_type) = self.text(covenant.covenant_type.as_ref()) else {
                self.issue(format!("{}.type", at), "missing covenant type");
                continue;
            };
            covenants.push(Covenant {
                covenant_type,
                threshold: self.raw(format!("{}.threshold", at), covenant.threshold.as_ref(), number),
                frequency: self.text(covenant.frequency.as_ref()),
                source_page: covenant.source_page,
            });
        }
        covenants
    }

    fn assumptions(&mut self, draft: &DraftRecord) -> Vec<Assumption> {
        let mut assumptions = Vec::with_capacity(draft.assumptions.len());
        for (i, assumption) in draft.assumptions.iter().enumerate() {
            let Some(text) = self.text(Some(&assumption.text)) else {
                self.issue(format!("assumptions[{}].text", i), "empty assumption");
                continue;
            };
            let source_refs = assumption
                .source_refs
                .iter()
                .map(|r| SourceRef {
                    page: r.page,
                    snippet: self.text(r.snippet.as_ref()),
                })
                .collect();
            assumptions.push(Assumption { text, source_refs });
        }
        assumptions
    }
}

// =============================================================================
// COERCION
// =============================================================================

/// Coerce a raw amount into money. Integers are whole currency units.
pub fn coerce_money(value: &RawValue) -> Option<Money> {
    match value {
        RawValue::Number(n) => match n.as_i64() {
            Some(units) => units.checked_mul(100).map(Money::from_cents),
            None => n.as_f64().and_then(Money::from_f64),
        },
        RawValue::Text(s) => Money::parse(s),
    }
}

/// Coerce a raw ratio or rate. Accepts trailing `%` or `x` and thousands
/// separators; non-finite values are rejected.
pub fn coerce_number(value: &RawValue) -> Option<f64> {
    let n = match value {
        RawValue::Number(n) => n.as_f64()?,
        RawValue::Text(s) => {
            let trimmed = s.trim().trim_end_matches(['%', 'x', 'X']).trim_end();
            let cleaned: String = trimmed.chars().filter(|c| *c != ',').collect();
            cleaned.parse::<f64>().ok()?
        }
    };
    n.is_finite().then_some(n)
}

fn money(value: &RawValue) -> Result<Money, &'static str> {
    coerce_money(value).ok_or("not a monetary amount")
}

fn non_negative_money(value: &RawValue) -> Result<Money, &'static str> {
    let amount = money(value)?;
    if amount.is_negative() {
        Err("negative amount")
    } else {
        Ok(amount)
    }
}

/// Deductions are often printed negative or in parentheses.
fn money_magnitude(value: &RawValue) -> Result<Money, &'static str> {
    let amount = money(value)?;
    Ok(if amount.is_negative() { -amount } else { amount })
}

fn number(value: &RawValue) -> Result<f64, &'static str> {
    coerce_number(value).ok_or("not a number")
}

fn rate(value: &RawValue) -> Result<f64, &'static str> {
    let n = number(value)?;
    if n < 0.0 {
        Err("negative rate")
    } else {
        Ok(n)
    }
}

fn count(value: &RawValue) -> Result<u32, &'static str> {
    let n = number(value)?;
    if n < 0.0 {
        return Err("negative count");
    }
    let rounded = n.round();
    if rounded > u32::MAX as f64 {
        return Err("count out of range");
    }
    Ok(rounded as u32)
}

fn square_feet(value: &RawValue) -> Result<u32, &'static str> {
    let text;
    let value = match value {
        RawValue::Text(s) => {
            let lowered = s.to_lowercase();
            text = RawValue::Text(
                lowered
                    .trim()
                    .trim_end_matches("sq ft")
                    .trim_end_matches("sqft")
                    .trim_end_matches("sf")
                    .to_string(),
            );
            &text
        }
        other => other,
    };
    match count(value) {
        Err("negative count") => Err("negative square footage"),
        other => other,
    }
}

fn parse_rate_type(raw: &str) -> Result<RateType, &'static str> {
    let lowered = raw.trim().to_lowercase();
    if lowered.contains("fix") {
        Ok(RateType::Fixed)
    } else if ["float", "variable", "adjustable"]
        .iter()
        .any(|k| lowered.contains(k))
    {
        Ok(RateType::Floating)
    } else {
        Err("unrecognized rate type")
    }
}

const DATE_FORMATS: [&str; 6] = [
    "%Y-%m-%d",
    "%m/%d/%Y",
    "%Y/%m/%d",
    "%d %b %Y",
    "%b %d, %Y",
    "%B %d, %Y",
];

/// Parse a calendar date in one of the common statement formats.
pub fn parse_date(input: &str) -> Result<NaiveDate, &'static str> {
    let s = input.trim();
    let date = DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .ok_or("unrecognized date")?;
    sane_year(date)
}

/// Parse a statement month (`2024-01`, `01/2024`, `Jan 2024`, `January-2024`,
/// or a full date) to the first day of that month.
pub fn parse_month(input: &str) -> Result<NaiveDate, &'static str> {
    let s = input.trim();
    let spaced = s.replace(['-', '/'], " ");
    let candidates: [(String, &str); 5] = [
        (s.to_string(), "%Y-%m-%d"),
        (format!("{}-01", s), "%Y-%m-%d"),
        (format!("01/{}", s), "%d/%m/%Y"),
        (format!("01 {}", spaced), "%d %b %Y"),
        (format!("01 {}", spaced), "%d %B %Y"),
    ];
    let date = candidates
        .iter()
        .find_map(|(value, fmt)| NaiveDate::parse_from_str(value, fmt).ok())
        .and_then(|d| d.with_day(1))
        .ok_or("unrecognized month")?;
    sane_year(date)
}

fn sane_year(date: NaiveDate) -> Result<NaiveDate, &'static str> {
    if (MIN_SANE_YEAR..=MAX_SANE_YEAR).contains(&date.year()) {
        Ok(date)
    } else {
        Err("date outside sane range")
    }
}

/// Count of distinct pseudonyms per unit, for duplicate-unit reporting.
pub fn tenants_per_unit(rows: &[&RentRollEntry]) -> usize {
    rows.iter()
        .filter_map(|row| row.tenant_name.as_deref())
        .collect::<HashSet<_>>()
        .len()
}

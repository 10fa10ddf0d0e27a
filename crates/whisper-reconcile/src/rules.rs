//! Consistency rules.
//!
//! Every rule is a plain function from a [`RuleContext`] to zero or one
//! [`Check`]. Rules do not see each other's output, so adding a rule is a
//! matter of registering one more function:
//!
//! ```rust,ignore
//! fn vacancy_cap(ctx: &RuleContext<'_>) -> Option<Check> { ... }
//!
//! let rules = RuleRegistry::standard().with_rule("vacancy-cap", vacancy_cap);
//! ```

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use chrono::{Datelike, Months, NaiveDate};

use whisper_core::money::{relative_diff, round_ratio};
use whisper_core::{Check, CheckStatus, Derivation, Figure, Money};

use crate::config::ReconcileConfig;
use crate::derive::{self, DerivedTotals};
use crate::normalize::{tenants_per_unit, NormalizedRecord};

/// Rule identifiers, also used as check ids.
pub mod ids {
    pub const T12_MONTHS: &str = "t12-months";
    pub const T12_DUPLICATES: &str = "t12-duplicates";
    pub const T12_OPEX_ROLLUP: &str = "t12-opex-rollup";
    pub const NOI_DERIVATION: &str = "noi-derivation";
    pub const EGI_DERIVATION: &str = "egi-derivation";
    pub const DSCR_DERIVATION: &str = "dscr-derivation";
    pub const NOI_SIGN: &str = "noi-sign";
    pub const DSCR_ADEQUATE: &str = "dscr-adequate";
    pub const RENT_ROLL_DATES: &str = "rent-roll-dates";
    pub const RENT_ROLL_DUPLICATE_UNITS: &str = "rent-roll-duplicate-units";
    pub const FIELD_NORMALIZATION: &str = "field-normalization";
}

/// Everything a rule may look at.
pub struct RuleContext<'a> {
    pub record: &'a NormalizedRecord,
    pub derived: &'a DerivedTotals,
    pub config: &'a ReconcileConfig,
}

pub type RuleFn = fn(&RuleContext<'_>) -> Option<Check>;

#[derive(Clone, Copy)]
pub struct Rule {
    pub id: &'static str,
    pub run: RuleFn,
}

/// Ordered set of rules, unique by id.
#[derive(Clone, Default)]
pub struct RuleRegistry {
    rules: Vec<Rule>,
}

impl RuleRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in rule set.
    pub fn standard() -> Self {
        Self::empty()
            .with_rule(ids::T12_MONTHS, t12_months)
            .with_rule(ids::T12_DUPLICATES, t12_duplicates)
            .with_rule(ids::T12_OPEX_ROLLUP, t12_opex_rollup)
            .with_rule(ids::EGI_DERIVATION, egi_derivation)
            .with_rule(ids::NOI_DERIVATION, noi_derivation)
            .with_rule(ids::DSCR_DERIVATION, dscr_derivation)
            .with_rule(ids::NOI_SIGN, noi_sign)
            .with_rule(ids::DSCR_ADEQUATE, dscr_adequate)
            .with_rule(ids::RENT_ROLL_DATES, rent_roll_dates)
            .with_rule(ids::RENT_ROLL_DUPLICATE_UNITS, rent_roll_duplicate_units)
            .with_rule(ids::FIELD_NORMALIZATION, field_normalization)
    }

    /// Register a rule; an existing rule with the same id is replaced in place.
    pub fn register(&mut self, id: &'static str, run: RuleFn) -> &mut Self {
        match self.rules.iter_mut().find(|r| r.id == id) {
            Some(existing) => existing.run = run,
            None => self.rules.push(Rule { id, run }),
        }
        self
    }

    pub fn with_rule(mut self, id: &'static str, run: RuleFn) -> Self {
        self.register(id, run);
        self
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.id).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Run every rule in registration order.
    pub fn run(&self, ctx: &RuleContext<'_>) -> Vec<Check> {
        self.rules.iter().filter_map(|rule| (rule.run)(ctx)).collect()
    }
}

// =============================================================================
// T-12
// =============================================================================

const EXPENSE_MARKERS: [&str; 2] = ["expense", "opex"];

fn is_expense_category(category: &str) -> bool {
    let lowered = category.to_lowercase();
    EXPENSE_MARKERS.iter().any(|m| lowered.contains(m))
}

fn month_date(month: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(&format!("{}-01", month), "%Y-%m-%d").ok()
}

/// Months strictly between the first and last covered month that have no
/// line at all.
fn missing_months(months: &[&str]) -> Vec<String> {
    let dates: Vec<NaiveDate> = months.iter().filter_map(|m| month_date(m)).collect();
    let (Some(first), Some(last)) = (dates.first(), dates.last()) else {
        return Vec::new();
    };
    let mut missing = Vec::new();
    let mut cursor = *first;
    while cursor < *last {
        if !dates.contains(&cursor) {
            missing.push(format!("{}-{:02}", cursor.year(), cursor.month()));
        }
        match cursor.checked_add_months(Months::new(1)) {
            Some(next) => cursor = next,
            None => break,
        }
    }
    missing
}

pub fn t12_months(ctx: &RuleContext<'_>) -> Option<Check> {
    let label = "T-12 covers the required months";
    let required = ctx.config.t12_required_months;
    let months = ctx.record.t12_months();
    let check = |status| Check::new(ids::T12_MONTHS, label, status);

    let (Some(first), Some(last)) = (months.first(), months.last()) else {
        return Some(check(CheckStatus::Warn).with_detail("no T-12 lines extracted"));
    };
    let span = format!("{} to {}", first, last);
    let missing = missing_months(&months);

    if !missing.is_empty() {
        return Some(check(CheckStatus::Warn).with_detail(format!(
            "{} of {} required months ({}); missing {}",
            months.len(),
            required,
            span,
            missing.join(", ")
        )));
    }
    if months.len() < required {
        return Some(check(CheckStatus::Warn).with_detail(format!(
            "{} of {} required months ({})",
            months.len(),
            required,
            span
        )));
    }
    Some(check(CheckStatus::Pass).with_detail(format!(
        "{} distinct months ({})",
        months.len(),
        span
    )))
}

pub fn t12_duplicates(ctx: &RuleContext<'_>) -> Option<Check> {
    let lines = &ctx.record.t12_lines;
    if lines.is_empty() {
        return None;
    }
    let label = "T-12 has one line per month, category and subcategory";

    // (first occurrence, count), in order of first occurrence
    let mut groups: Vec<(usize, usize)> = Vec::new();
    let mut index: HashMap<(&str, String, Option<String>), usize> = HashMap::new();
    for (i, l) in lines.iter().enumerate() {
        let key = (
            l.month.as_str(),
            l.category.to_lowercase(),
            l.subcategory.as_deref().map(str::to_lowercase),
        );
        match index.entry(key) {
            Entry::Occupied(slot) => groups[*slot.get()].1 += 1,
            Entry::Vacant(slot) => {
                slot.insert(groups.len());
                groups.push((i, 1));
            }
        }
    }
    groups.retain(|(_, count)| *count > 1);

    if groups.is_empty() {
        return Some(Check::new(ids::T12_DUPLICATES, label, CheckStatus::Pass));
    }
    let described: Vec<String> = groups
        .iter()
        .map(|(i, count)| {
            let l = &lines[*i];
            match &l.subcategory {
                Some(sub) => format!("{} {} / {} ({} lines)", l.month, l.category, sub, count),
                None => format!("{} {} ({} lines)", l.month, l.category, count),
            }
        })
        .collect();
    Some(
        Check::new(ids::T12_DUPLICATES, label, CheckStatus::Warn)
            .with_detail(format!("duplicate lines: {}", described.join("; "))),
    )
}

pub fn t12_opex_rollup(ctx: &RuleContext<'_>) -> Option<Check> {
    let required = ctx.config.t12_required_months;
    let reported = ctx.record.totals.opex?;
    let months = ctx.record.t12_months();
    if months.len() < required {
        return None;
    }
    let window = &months[months.len() - required..];
    let expenses: Vec<Money> = ctx
        .record
        .t12_lines
        .iter()
        .filter(|l| window.contains(&l.month.as_str()) && is_expense_category(&l.category))
        .map(|l| if l.amount.is_negative() { -l.amount } else { l.amount })
        .collect();
    if expenses.is_empty() {
        return None;
    }
    let rolled_up: Money = expenses.into_iter().sum();
    let diff = relative_diff(rolled_up.cents() as f64, reported.cents() as f64);
    let label = "T-12 expense lines roll up to reported OpEx";
    let detail = format!(
        "T-12 expenses {} vs reported OpEx {} ({})",
        rolled_up,
        reported,
        percent(diff)
    );
    let status = if diff <= ctx.config.tolerance() + 1e-9 {
        CheckStatus::Pass
    } else {
        CheckStatus::Warn
    };
    Some(Check::new(ids::T12_OPEX_ROLLUP, label, status).with_detail(detail))
}

// =============================================================================
// DERIVED FIELDS
// =============================================================================

fn percent(diff: f64) -> String {
    format!("{:.2}% apart", diff * 100.0)
}

fn figure(f: &Figure) -> String {
    match f {
        Figure::Money(m) => m.to_string(),
        Figure::Ratio(r) => format!("{:.2}", r),
    }
}

/// Shared shape of the three derivation rules.
fn derivation_check(
    id: &str,
    label: &str,
    derivation: Option<&Derivation>,
    formula: &str,
    mismatch: CheckStatus,
) -> Option<Check> {
    let d = derivation?;
    match (&d.extracted, &d.recomputed, d.within_tolerance) {
        (Some(extracted), Some(recomputed), Some(true)) => Some(
            Check::new(id, label, CheckStatus::Pass).with_detail(format!(
                "extracted {} agrees with {} = {}",
                figure(extracted),
                formula,
                figure(recomputed)
            )),
        ),
        (Some(extracted), Some(recomputed), _) => Some(
            Check::new(id, label, mismatch).with_detail(format!(
                "extracted {} vs {} = {} ({})",
                figure(extracted),
                formula,
                figure(recomputed),
                percent(d.relative_diff.unwrap_or_default())
            )),
        ),
        (None, Some(recomputed), _) => Some(
            Check::new(id, label, CheckStatus::Pass)
                .with_detail(format!("derived as {} = {}", formula, figure(recomputed))),
        ),
        (Some(extracted), None, _) => Some(Check::new(id, label, CheckStatus::Warn).with_detail(
            format!(
                "extracted {} cannot be verified: inputs to {} missing",
                figure(extracted),
                formula
            ),
        )),
        (None, None, _) => None,
    }
}

pub fn egi_derivation(ctx: &RuleContext<'_>) -> Option<Check> {
    let d = ctx.derived.derivation(derive::EGI)?;
    // An EGI with nothing to check it against is not worth a warning.
    if d.recomputed.is_none() {
        return None;
    }
    derivation_check(
        ids::EGI_DERIVATION,
        "EGI = GPR - vacancy",
        Some(d),
        "GPR - vacancy",
        CheckStatus::Warn,
    )
}

pub fn noi_derivation(ctx: &RuleContext<'_>) -> Option<Check> {
    derivation_check(
        ids::NOI_DERIVATION,
        "NOI = EGI - OpEx",
        ctx.derived.derivation(derive::NOI),
        "EGI - OpEx",
        CheckStatus::Fail,
    )
}

pub fn dscr_derivation(ctx: &RuleContext<'_>) -> Option<Check> {
    let label = "DSCR = NOI / annual debt service";
    if ctx.derived.debt_service_zero {
        return Some(
            Check::new(ids::DSCR_DERIVATION, label, CheckStatus::Warn)
                .with_detail("annual debt service is zero; DSCR is undefined"),
        );
    }
    derivation_check(
        ids::DSCR_DERIVATION,
        label,
        ctx.derived.derivation(derive::DSCR),
        "NOI / debt service",
        CheckStatus::Warn,
    )
}

// =============================================================================
// THRESHOLDS
// =============================================================================

/// Covenant types that account for a negative NOI.
const NEGATIVE_NOI_COVERAGE: [&str; 5] = ["reserve", "guarant", "deficit", "lease-up", "carry"];

pub fn noi_sign(ctx: &RuleContext<'_>) -> Option<Check> {
    let noi = ctx.derived.totals.noi?;
    let label = "NOI is non-negative";
    if !noi.is_negative() {
        return Some(Check::new(ids::NOI_SIGN, label, CheckStatus::Pass));
    }
    let explanation = ctx.record.covenants.iter().find(|c| {
        let lowered = c.covenant_type.to_lowercase();
        NEGATIVE_NOI_COVERAGE.iter().any(|k| lowered.contains(k))
    });
    Some(match explanation {
        Some(covenant) => Check::new(ids::NOI_SIGN, label, CheckStatus::Warn).with_detail(format!(
            "NOI {} is negative; covered by covenant: {}",
            noi, covenant.covenant_type
        )),
        None => Check::new(ids::NOI_SIGN, label, CheckStatus::Fail).with_detail(format!(
            "NOI {} is negative with no covenant explaining it",
            noi
        )),
    })
}

pub fn dscr_adequate(ctx: &RuleContext<'_>) -> Option<Check> {
    let dscr = ctx.derived.totals.dscr?;
    let minimum = round_ratio(ctx.config.dscr_min);
    let status = if round_ratio(dscr) < minimum {
        CheckStatus::Warn
    } else {
        CheckStatus::Pass
    };
    Some(
        Check::new(ids::DSCR_ADEQUATE, "DSCR meets the minimum", status)
            .with_detail(format!("{:.2} vs {:.2} minimum", dscr, minimum)),
    )
}

// =============================================================================
// RENT ROLL
// =============================================================================

pub fn rent_roll_dates(ctx: &RuleContext<'_>) -> Option<Check> {
    let rows = &ctx.record.rent_roll;
    if rows.is_empty() {
        return None;
    }
    let label = "Lease end dates follow start dates";
    let inverted: Vec<&str> = rows
        .iter()
        .filter(|r| matches!((r.start_date, r.end_date), (Some(start), Some(end)) if end < start))
        .map(|r| r.unit_id.as_str())
        .collect();
    if inverted.is_empty() {
        return Some(Check::new(ids::RENT_ROLL_DATES, label, CheckStatus::Pass));
    }
    Some(
        Check::new(ids::RENT_ROLL_DATES, label, CheckStatus::Fail).with_detail(format!(
            "end date before start date for unit(s) {}",
            inverted.join(", ")
        )),
    )
}

pub fn rent_roll_duplicate_units(ctx: &RuleContext<'_>) -> Option<Check> {
    if ctx.record.rent_roll.is_empty() {
        return None;
    }
    let label = "Each unit appears once in the rent roll";
    let duplicates = ctx.record.duplicate_units();
    if duplicates.is_empty() {
        return Some(Check::new(ids::RENT_ROLL_DUPLICATE_UNITS, label, CheckStatus::Pass));
    }
    let described: Vec<String> = duplicates
        .iter()
        .map(|(unit, rows)| {
            format!(
                "unit {} appears {} times ({} distinct tenants)",
                unit,
                rows.len(),
                tenants_per_unit(rows)
            )
        })
        .collect();
    Some(
        Check::new(ids::RENT_ROLL_DUPLICATE_UNITS, label, CheckStatus::Warn)
            .with_detail(described.join("; ")),
    )
}

// =============================================================================
// NORMALIZATION
// =============================================================================

const MAX_LISTED_ISSUES: usize = 5;

pub fn field_normalization(ctx: &RuleContext<'_>) -> Option<Check> {
    let issues = &ctx.record.issues;
    let label = "Extracted values are well-formed";
    if issues.is_empty() {
        return Some(Check::new(ids::FIELD_NORMALIZATION, label, CheckStatus::Pass));
    }
    let mut listed: Vec<String> = issues
        .iter()
        .take(MAX_LISTED_ISSUES)
        .map(|i| format!("{} ({})", i.location, i.reason))
        .collect();
    if issues.len() > MAX_LISTED_ISSUES {
        listed.push(format!("and {} more", issues.len() - MAX_LISTED_ISSUES));
    }
    Some(
        Check::new(ids::FIELD_NORMALIZATION, label, CheckStatus::Warn).with_detail(format!(
            "{} value(s) treated as unknown: {}",
            issues.len(),
            listed.join(", ")
        )),
    )
}

//! Derived-field recomputation.
//!
//! EGI, NOI and DSCR are recomputed from their leaf values and compared with
//! whatever the worker extracted for the same field. Neither value is
//! discarded: the published total is the extracted value when present, else
//! the recomputed one, and both sit side by side in a [`Derivation`].
//!
//! ```text
//! EGI  = GPR - vacancy
//! NOI  = EGI - OpEx
//! DSCR = NOI / annual debt service   (undefined when debt service is 0)
//! ```

use whisper_core::money::{relative_diff, round_ratio};
use whisper_core::{Derivation, Error, Figure, Money, Result, Totals};

pub const EGI: &str = "egi";
pub const NOI: &str = "noi";
pub const DSCR: &str = "dscr";

/// Published totals plus the comparison trail behind them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivedTotals {
    pub totals: Totals,
    /// One entry per derived field that has at least one side.
    pub derivations: Vec<Derivation>,
    /// Debt service was reported as exactly zero, so DSCR is undefined.
    pub debt_service_zero: bool,
}

impl DerivedTotals {
    pub fn derivation(&self, field: &str) -> Option<&Derivation> {
        self.derivations.iter().find(|d| d.field == field)
    }
}

/// Recompute derived fields from `extracted` and compare within `tolerance`
/// (a fraction, `0.01` for 1%).
///
/// Fails only when the arithmetic itself cannot be carried out.
pub fn derive(extracted: &Totals, tolerance: f64) -> Result<DerivedTotals> {
    let mut derivations = Vec::new();

    let egi_recomputed = match (extracted.gpr, extracted.vacancy) {
        (Some(gpr), Some(vacancy)) => Some(
            gpr.checked_sub(vacancy)
                .ok_or_else(|| overflow("EGI"))?,
        ),
        _ => None,
    };
    push_money(&mut derivations, EGI, extracted.egi, egi_recomputed, tolerance);
    let egi = extracted.egi.or(egi_recomputed);

    let noi_recomputed = match (egi, extracted.opex) {
        (Some(egi), Some(opex)) => Some(egi.checked_sub(opex).ok_or_else(|| overflow("NOI"))?),
        _ => None,
    };
    push_money(&mut derivations, NOI, extracted.noi, noi_recomputed, tolerance);
    let noi = extracted.noi.or(noi_recomputed);

    let debt_service = extracted.annual_debt_service;
    let debt_service_zero = debt_service.map(Money::is_zero).unwrap_or(false);
    let dscr_recomputed = match (noi, debt_service) {
        (Some(noi), Some(ads)) => noi.ratio(ads).map(round_ratio),
        _ => None,
    };
    if let Some(value) = dscr_recomputed {
        if !value.is_finite() {
            return Err(Error::Reconciliation(format!(
                "DSCR recomputation produced {}",
                value
            )));
        }
    }
    push_ratio(&mut derivations, DSCR, extracted.dscr, dscr_recomputed, tolerance);

    Ok(DerivedTotals {
        totals: Totals {
            egi,
            noi,
            dscr: extracted.dscr.or(dscr_recomputed),
            ..extracted.clone()
        },
        derivations,
        debt_service_zero,
    })
}

fn overflow(field: &str) -> Error {
    Error::Reconciliation(format!("arithmetic overflow recomputing {}", field))
}

fn push_money(
    out: &mut Vec<Derivation>,
    field: &str,
    extracted: Option<Money>,
    recomputed: Option<Money>,
    tolerance: f64,
) {
    push(
        out,
        field,
        extracted.map(Figure::Money),
        recomputed.map(Figure::Money),
        tolerance,
    );
}

fn push_ratio(
    out: &mut Vec<Derivation>,
    field: &str,
    extracted: Option<f64>,
    recomputed: Option<f64>,
    tolerance: f64,
) {
    push(
        out,
        field,
        extracted.map(Figure::Ratio),
        recomputed.map(Figure::Ratio),
        tolerance,
    );
}

fn push(
    out: &mut Vec<Derivation>,
    field: &str,
    extracted: Option<Figure>,
    recomputed: Option<Figure>,
    tolerance: f64,
) {
    if extracted.is_none() && recomputed.is_none() {
        return;
    }
    let diff = match (extracted, recomputed) {
        (Some(a), Some(b)) => Some(relative_diff(a.as_f64(), b.as_f64())),
        _ => None,
    };
    out.push(Derivation {
        field: field.to_string(),
        extracted,
        recomputed,
        relative_diff: diff.map(|d| (d * 10_000.0).round() / 10_000.0),
        within_tolerance: diff.map(|d| d <= tolerance + 1e-9),
    });
}

//! Business-policy thresholds for reconciliation.
//!
//! All values are configurable from the environment:
//! - `DSCR_MIN` (default: 1.25)
//! - `T12_REQUIRED_MONTHS` (default: 12)
//! - `RECONCILE_TOLERANCE_PCT` (default: 1.0)

use std::env;

use whisper_core::defaults::{DSCR_MIN, RECONCILE_TOLERANCE_PCT, T12_REQUIRED_MONTHS};
use whisper_core::{Error, Result};

/// Thresholds used by the rule set and derived-field comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileConfig {
    /// DSCR below this is a `warn`.
    pub dscr_min: f64,
    /// Distinct months a T-12 must cover.
    pub t12_required_months: usize,
    /// Relative disagreement, in percent, tolerated between an extracted
    /// derived figure and its recomputation.
    pub tolerance_pct: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            dscr_min: DSCR_MIN,
            t12_required_months: T12_REQUIRED_MONTHS,
            tolerance_pct: RECONCILE_TOLERANCE_PCT,
        }
    }
}

impl ReconcileConfig {
    /// Load from the environment, falling back to defaults for unset or
    /// unparsable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            dscr_min: parse_env("DSCR_MIN").unwrap_or(defaults.dscr_min),
            t12_required_months: parse_env("T12_REQUIRED_MONTHS")
                .unwrap_or(defaults.t12_required_months),
            tolerance_pct: parse_env("RECONCILE_TOLERANCE_PCT").unwrap_or(defaults.tolerance_pct),
        }
    }

    pub fn with_dscr_min(mut self, dscr_min: f64) -> Self {
        self.dscr_min = dscr_min;
        self
    }

    pub fn with_t12_required_months(mut self, months: usize) -> Self {
        self.t12_required_months = months;
        self
    }

    pub fn with_tolerance_pct(mut self, pct: f64) -> Self {
        self.tolerance_pct = pct;
        self
    }

    /// Tolerance as a fraction (`1.0` percent -> `0.01`).
    pub fn tolerance(&self) -> f64 {
        self.tolerance_pct / 100.0
    }

    /// Reject values that would make every check meaningless.
    pub fn validate(&self) -> Result<()> {
        if !self.dscr_min.is_finite() || self.dscr_min < 0.0 {
            return Err(Error::Config(format!(
                "DSCR_MIN must be a non-negative number, got {}",
                self.dscr_min
            )));
        }
        if self.t12_required_months == 0 || self.t12_required_months > 120 {
            return Err(Error::Config(format!(
                "T12_REQUIRED_MONTHS must be between 1 and 120, got {}",
                self.t12_required_months
            )));
        }
        if !self.tolerance_pct.is_finite() || !(0.0..=100.0).contains(&self.tolerance_pct) {
            return Err(Error::Config(format!(
                "RECONCILE_TOLERANCE_PCT must be between 0 and 100, got {}",
                self.tolerance_pct
            )));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

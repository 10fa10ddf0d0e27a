//! Fixed-point monetary amounts.
//!
//! All monetary arithmetic in the pipeline happens on integer minor units
//! (cents). Floating point only appears when a ratio is derived from two
//! amounts, and at the presentation layer.

use std::fmt;
use std::ops::{Add, Neg, Sub};

use serde::{Deserialize, Serialize};

/// A monetary amount in minor units (cents) of the record's single currency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    /// Build from minor units.
    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    /// Build from whole currency units.
    pub const fn from_dollars(dollars: i64) -> Self {
        Money(dollars * 100)
    }

    /// Minor units.
    pub const fn cents(self) -> i64 {
        self.0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    /// Presentation-layer conversion to whole units.
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Convert a finite float amount in whole units, rounding half away from
    /// zero to the nearest cent. Returns `None` for NaN, infinities and
    /// values outside the representable range.
    pub fn from_f64(value: f64) -> Option<Money> {
        if !value.is_finite() {
            return None;
        }
        let cents = (value * 100.0).round();
        if cents.abs() >= i64::MAX as f64 {
            return None;
        }
        Some(Money(cents as i64))
    }

    /// Ratio of two amounts, `None` when the denominator is zero.
    pub fn ratio(self, denominator: Money) -> Option<f64> {
        if denominator.is_zero() {
            None
        } else {
            Some(self.0 as f64 / denominator.0 as f64)
        }
    }

    /// Parse a human-formatted amount.
    ///
    /// Accepts currency symbols, thousands separators, surrounding
    /// whitespace, a leading minus sign, accounting-style parentheses for
    /// negatives and any number of decimals (rounded half away from zero to
    /// cents). Returns `None` for anything else.
    pub fn parse(input: &str) -> Option<Money> {
        let mut s = input.trim();
        if s.is_empty() {
            return None;
        }

        let mut negative = false;
        if s.starts_with('(') && s.ends_with(')') {
            negative = true;
            s = s[1..s.len() - 1].trim();
        }
        if let Some(rest) = s.strip_prefix('-') {
            negative = !negative;
            s = rest.trim_start();
        }
        s = s.trim_start_matches(['$', '€', '£']).trim();
        if let Some(rest) = s.strip_prefix("USD") {
            s = rest.trim();
        }
        if let Some(rest) = s.strip_prefix('-') {
            negative = !negative;
            s = rest.trim_start();
        }

        let cleaned: String = s.chars().filter(|c| *c != ',' && *c != '_').collect();
        if cleaned.is_empty() {
            return None;
        }

        let (whole, frac) = match cleaned.split_once('.') {
            Some((w, f)) => (w, f),
            None => (cleaned.as_str(), ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return None;
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit())
        {
            return None;
        }

        let whole_value: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().ok()?
        };

        let mut digits = frac.bytes().map(|b| (b - b'0') as i64);
        let tens = digits.next().unwrap_or(0);
        let ones = digits.next().unwrap_or(0);
        let round_up = digits.next().map(|d| d >= 5).unwrap_or(false);

        let mut cents = whole_value
            .checked_mul(100)?
            .checked_add(tens * 10 + ones)?;
        if round_up {
            cents = cents.checked_add(1)?;
        }
        Some(Money(if negative { -cents } else { cents }))
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0.saturating_sub(rhs.0))
    }
}

impl Neg for Money {
    type Output = Money;

    fn neg(self) -> Money {
        Money(self.0.saturating_neg())
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let abs = self.0.unsigned_abs();
        let whole = (abs / 100).to_string();
        let cents = abs % 100;

        let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
        for (i, ch) in whole.chars().enumerate() {
            if i > 0 && (whole.len() - i) % 3 == 0 {
                grouped.push(',');
            }
            grouped.push(ch);
        }

        if self.0 < 0 {
            write!(f, "-${}.{:02}", grouped, cents)
        } else {
            write!(f, "${}.{:02}", grouped, cents)
        }
    }
}

/// Relative difference `|a - b| / max(|a|, |b|)`, `0.0` when both are zero.
pub fn relative_diff(a: f64, b: f64) -> f64 {
    let scale = a.abs().max(b.abs());
    if scale == 0.0 {
        0.0
    } else {
        (a - b).abs() / scale
    }
}

/// Round a ratio to two decimal places for comparison and display.
pub fn round_ratio(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

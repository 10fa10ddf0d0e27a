//! # whisper-reconcile
//!
//! Reconciliation engine for extracted financial documents.
//!
//! Given a worker draft it:
//! 1. normalizes raw values and masks tenant names ([`normalize`])
//! 2. recomputes EGI, NOI and DSCR and compares them with the extracted
//!    figures ([`derive`])
//! 3. runs the registered consistency rules ([`rules`])
//! 4. scores confidence per section ([`confidence`])
//!
//! The engine is synchronous and has no I/O. Monetary math runs on integer
//! cents; ratios are rounded to two decimals.

pub mod config;
pub mod confidence;
pub mod derive;
pub mod engine;
pub mod normalize;
pub mod rules;

pub use config::ReconcileConfig;
pub use derive::DerivedTotals;
pub use engine::Reconciler;
pub use normalize::{NormalizationIssue, NormalizedRecord};
pub use rules::{ids as rule_ids, Rule, RuleContext, RuleFn, RuleRegistry};

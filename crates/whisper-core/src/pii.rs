//! Tenant-name de-identification.
//!
//! Tenant names are replaced with `tenant-<16 hex>` pseudonyms derived from a
//! BLAKE3 digest of the normalized name. The mapping is deterministic (the
//! same tenant always gets the same pseudonym, different tenants get
//! different ones) and not reversible from the API response.
//!
//! Free text is masked for full names of any length and for the distinctive
//! words of multi-word names, so "Gonzalez renews" is caught when the rent
//! roll lists "Maria Gonzalez". Legal suffixes and common property or
//! accounting vocabulary are never treated as name words.
//!
//! This is display-only de-identification. It is unkeyed, so anyone holding
//! a candidate name can confirm a match; it is not a security control.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use regex::{Regex, RegexBuilder};

use crate::error::{Error, Result};

/// Prefix of every pseudonym.
pub const PSEUDONYM_PREFIX: &str = "tenant-";

/// Shortest word of a multi-word name that is masked on its own.
const MIN_FRAGMENT_LEN: usize = 3;

/// Compiled matcher ceiling. Large rent rolls need more than the regex default.
const PATTERN_SIZE_LIMIT: usize = 64 * (1 << 20);

/// Words that appear in tenant names but identify nobody.
const COMMON_WORDS: &[&str] = &[
    // articles and connectives
    "and", "the", "for", "dba", "aka", "with",
    // legal forms
    "llc", "inc", "ltd", "llp", "plc", "corp", "corporation", "company", "limited",
    "incorporated", "holdings", "holding", "group", "partners", "partnership",
    "associates", "trust", "enterprises", "international", "services", "national",
    // property and accounting vocabulary used in labels and categories
    "store", "stores", "shop", "restaurant", "cafe", "bank", "office", "offices", "retail",
    "medical", "dental", "clinic", "fitness", "salon", "market", "center", "centre",
    "plaza", "suite", "unit", "building", "property", "properties", "realty",
    "management", "parking", "income", "expense", "expenses", "opex", "operating",
    "total", "rent", "rental", "revenue", "reserve", "reserves", "guaranty",
    "guarantee", "guarantor", "deficit", "carry", "lease", "tenant", "tenants",
];

/// Trim, lowercase and collapse internal whitespace.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic pseudonym for a tenant name.
pub fn pseudonymize(name: &str) -> String {
    let digest = blake3::hash(normalize_name(name).as_bytes());
    let hex = digest.to_hex();
    format!("{}{}", PSEUDONYM_PREFIX, &hex.as_str()[..16])
}

/// True if `value` already looks like a pseudonym.
pub fn is_pseudonym(value: &str) -> bool {
    value
        .strip_prefix(PSEUDONYM_PREFIX)
        .map(|hex| hex.len() == 16 && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

/// Masks a known set of tenant names wherever they appear.
pub struct TenantMasker {
    /// Normalized full name -> pseudonym.
    pseudonyms: HashMap<String, String>,
    /// Name words joined by single spaces (full names and fragments) -> pseudonym.
    aliases: HashMap<String, String>,
    /// Distinctive words of multi-word names.
    fragments: HashSet<String>,
    /// Word sequence of every full name, keyed by its first word.
    sequences: HashMap<String, Vec<Vec<String>>>,
    pattern: Option<Regex>,
}

impl TenantMasker {
    /// Build a masker for the given raw names. Blank names are ignored.
    ///
    /// Fails with `Error::Reconciliation` when the matcher cannot be built;
    /// callers must not publish text that was never masked.
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        Self::build(names, PATTERN_SIZE_LIMIT)
    }

    fn build<'a>(names: impl IntoIterator<Item = &'a str>, size_limit: usize) -> Result<Self> {
        let mut pseudonyms = BTreeMap::new();
        for name in names {
            let normalized = normalize_name(name);
            if normalized.is_empty() {
                continue;
            }
            pseudonyms
                .entry(normalized)
                .or_insert_with(|| pseudonymize(name));
        }

        let mut aliases = HashMap::new();
        let mut sequences: HashMap<String, Vec<Vec<String>>> = HashMap::new();
        let mut owners: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
        for (normalized, pseudonym) in &pseudonyms {
            let name_words = words(normalized);
            let Some(first) = name_words.first() else {
                continue;
            };
            aliases
                .entry(name_words.join(" "))
                .or_insert_with(|| pseudonym.clone());
            if name_words.len() > 1 {
                for word in name_words.iter().filter(|w| is_distinctive(w)) {
                    owners.entry(word.clone()).or_default().insert(normalized.as_str());
                }
            }
            sequences
                .entry(first.clone())
                .or_default()
                .push(name_words.clone());
        }

        let mut fragments = HashSet::new();
        for (word, owned_by) in owners {
            if aliases.contains_key(&word) {
                continue;
            }
            // A word shared by several tenants gets its own pseudonym.
            let pseudonym = match owned_by.iter().next() {
                Some(owner) if owned_by.len() == 1 => pseudonyms.get(*owner).cloned(),
                _ => None,
            }
            .unwrap_or_else(|| pseudonymize(&word));
            aliases.insert(word.clone(), pseudonym);
            fragments.insert(word);
        }

        let pattern = match_pattern(pseudonyms.keys(), &fragments)
            .map(|source| {
                RegexBuilder::new(&source)
                    .case_insensitive(true)
                    .size_limit(size_limit)
                    .dfa_size_limit(size_limit)
                    .build()
                    .map_err(|e| {
                        Error::Reconciliation(format!("cannot build tenant-name matcher: {}", e))
                    })
            })
            .transpose()?;

        Ok(Self {
            pseudonyms: pseudonyms.into_iter().collect(),
            aliases,
            fragments,
            sequences,
            pattern,
        })
    }

    /// Number of distinct tenants known to the masker.
    pub fn len(&self) -> usize {
        self.pseudonyms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pseudonyms.is_empty()
    }

    /// Pseudonym for a rent-roll tenant name.
    pub fn mask_name(&self, name: &str) -> String {
        self.pseudonyms
            .get(&normalize_name(name))
            .or_else(|| self.aliases.get(&words(name).join(" ")))
            .cloned()
            .unwrap_or_else(|| pseudonymize(name))
    }

    /// Replace every known tenant name, and every distinctive word of one,
    /// inside free text.
    pub fn redact(&self, text: &str) -> String {
        let Some(pattern) = &self.pattern else {
            return text.to_string();
        };
        pattern
            .replace_all(text, |caps: &regex::Captures<'_>| self.mask_name(&caps[0]))
            .into_owned()
    }

    /// True if a raw tenant name, or a distinctive word of one, occurs in
    /// `text` as whole words. Works on word tokens, not on the redaction
    /// pattern, and skips pseudonyms.
    pub fn contains_raw_name(&self, text: &str) -> bool {
        let tokens = words(text);
        tokens.iter().enumerate().any(|(i, token)| {
            self.fragments.contains(token)
                || self.sequences.get(token).is_some_and(|candidates| {
                    candidates
                        .iter()
                        .any(|seq| tokens[i..].starts_with(seq.as_slice()))
                })
        })
    }
}

/// Alternation over full names (longest first) followed by fragments
/// (longest first). Leftmost-first matching makes a full name win over its
/// own words at the same position.
fn match_pattern<'a>(
    names: impl Iterator<Item = &'a String>,
    fragments: &HashSet<String>,
) -> Option<String> {
    let mut names: Vec<&String> = names.collect();
    names.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    let mut fragments: Vec<&String> = fragments.iter().collect();
    fragments.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

    let mut alternatives = Vec::new();
    for name in names {
        let name_words = words(name);
        let plain = name_words.join(" ") == *name;
        if !plain {
            alternatives.push(exact_pattern(name));
        }
        if !name_words.is_empty() {
            alternatives.push(word_pattern(&name_words));
        }
    }
    alternatives.extend(fragments.into_iter().map(|w| word_pattern(std::slice::from_ref(w))));

    if alternatives.is_empty() {
        None
    } else {
        Some(alternatives.join("|"))
    }
}

/// The normalized name as written, any whitespace between parts, with word
/// boundaries where the name starts or ends with a word character.
fn exact_pattern(normalized: &str) -> String {
    let body = normalized
        .split(' ')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\s+");
    let starts_word = normalized.chars().next().is_some_and(is_word_char);
    let ends_word = normalized.chars().last().is_some_and(is_word_char);
    format!(
        "{}{}{}",
        if starts_word { r"\b" } else { "" },
        body,
        if ends_word { r"\b" } else { "" }
    )
}

/// The name's words separated by any run of non-word characters.
fn word_pattern(name_words: &[String]) -> String {
    let body = name_words
        .iter()
        .map(|w| regex::escape(w))
        .collect::<Vec<_>>()
        .join(r"\W+");
    format!(r"\b{}\b", body)
}

fn is_distinctive(word: &str) -> bool {
    word.chars().count() >= MIN_FRAGMENT_LEN
        && !word.chars().all(|c| c.is_numeric())
        && !COMMON_WORDS.contains(&word)
}

/// Lowercased word tokens. Hyphens split words; pseudonyms are dropped.
fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !(is_word_char(c) || c == '-'))
        .map(str::to_lowercase)
        .filter(|chunk| !is_pseudonym(chunk))
        .flat_map(|chunk| {
            chunk
                .split('-')
                .filter(|w| !w.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masker(names: &[&str]) -> TenantMasker {
        TenantMasker::new(names.iter().copied()).unwrap()
    }

    #[test]
    fn pseudonym_shape() {
        let p = pseudonymize("Acme Holdings LLC");
        assert!(p.starts_with("tenant-"));
        assert_eq!(p.len(), "tenant-".len() + 16);
        assert!(is_pseudonym(&p));
        assert!(!is_pseudonym("tenant-xyz"));
    }

    #[test]
    fn pseudonym_is_deterministic_and_normalized() {
        assert_eq!(
            pseudonymize("Acme Holdings LLC"),
            pseudonymize("  acme   HOLDINGS llc ")
        );
        assert_ne!(pseudonymize("Acme Holdings"), pseudonymize("Acme Holding"));
    }

    #[test]
    fn masker_redacts_free_text() {
        let masker = masker(&["Jane Smith", "Acme Holdings LLC"]);
        let text = "Lease with JANE  smith expires 2027; Acme Holdings LLC holds an option.";
        let redacted = masker.redact(text);
        assert!(!redacted.to_lowercase().contains("jane"));
        assert!(!redacted.to_lowercase().contains("acme"));
        assert!(redacted.contains(&pseudonymize("Jane Smith")));
        assert!(redacted.contains(&pseudonymize("Acme Holdings LLC")));
        assert!(redacted.ends_with("holds an option."));
        assert!(!masker.contains_raw_name(&redacted));
    }

    #[test]
    fn masker_respects_word_boundaries() {
        let masker = masker(&["Ann"]);
        assert_eq!(masker.redact("Annual rent"), "Annual rent");
        assert!(masker.contains_raw_name("Suite 4: Ann"));
        assert!(!masker.contains_raw_name("Annual rent"));
    }

    #[test]
    fn masker_prefers_longest_name() {
        let masker = masker(&["Acme", "Acme Holdings"]);
        let redacted = masker.redact("Acme Holdings and Acme");
        assert_eq!(
            redacted,
            format!("{} and {}", pseudonymize("Acme Holdings"), pseudonymize("Acme"))
        );
    }

    #[test]
    fn masker_handles_regex_metacharacters() {
        let masker = masker(&["Smith & Sons (Retail)"]);
        let redacted = masker.redact("Guarantor: Smith & Sons (Retail).");
        assert_eq!(
            redacted,
            format!("Guarantor: {}.", pseudonymize("Smith & Sons (Retail)"))
        );
    }

    #[test]
    fn short_names_are_masked_in_free_text() {
        let masker = masker(&["Al", "  "]);
        assert_eq!(masker.len(), 1);
        assert_eq!(masker.mask_name("al"), pseudonymize("Al"));
        assert_eq!(
            masker.redact("Al renews at market"),
            format!("{} renews at market", pseudonymize("Al"))
        );
        assert_eq!(masker.redact("Total rent"), "Total rent");
        assert!(masker.contains_raw_name("AL gets 3% bumps"));
        assert!(!masker.contains_raw_name("Total rent, Alan"));
    }

    #[test]
    fn surname_mentions_are_masked() {
        let masker = masker(&["Maria Gonzalez", "Lucas Brandt"]);
        assert_eq!(
            masker.redact("Gonzalez renews; Brandt-era lease"),
            format!(
                "{} renews; {}-era lease",
                pseudonymize("Maria Gonzalez"),
                pseudonymize("Lucas Brandt")
            )
        );
        assert!(masker.contains_raw_name("Gonzalez renews"));
        assert!(masker.contains_raw_name("ask maria"));
    }

    #[test]
    fn shared_words_get_their_own_pseudonym() {
        let masker = masker(&["Ann Smith", "Bob Smith"]);
        assert_eq!(masker.redact("Smith"), pseudonymize("smith"));
        assert_eq!(masker.redact("Bob Smith"), pseudonymize("Bob Smith"));
    }

    #[test]
    fn common_words_are_not_name_words() {
        let masker = masker(&["Acme Holdings LLC", "Harbor Dental Group"]);
        let text = "Holdings LLC pays Dental Group reserve; Total Operating Expenses";
        assert_eq!(masker.redact(text), text);
        assert!(!masker.contains_raw_name(text));
        assert_eq!(masker.redact("Harbor"), pseudonymize("Harbor Dental Group"));
    }

    #[test]
    fn punctuation_between_name_words_is_caught() {
        let masker = masker(&["Al Bo"]);
        let redacted = masker.redact("paid by Al, Bo");
        assert_eq!(redacted, format!("paid by {}", pseudonymize("Al Bo")));
        assert!(masker.contains_raw_name("Al, Bo"));
        assert!(!masker.contains_raw_name(&redacted));
    }

    #[test]
    fn raw_name_check_ignores_pseudonyms() {
        let masker = masker(&["Tenant"]);
        assert!(!masker.contains_raw_name(&pseudonymize("Tenant")));
        assert!(masker.contains_raw_name("the tenant renews"));
    }

    #[test]
    fn matcher_failure_is_an_error() {
        let err = TenantMasker::build(["Harbor Bakery"], 16)
            .err()
            .expect("tiny size limit must fail");
        assert!(matches!(err, Error::Reconciliation(_)));
        assert!(!err.to_string().contains("Harbor"));
    }
}

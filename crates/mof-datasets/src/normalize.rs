//! Canonical spellings for boroughs and suppliers.
//!
//! Both normalizers are pure: the same input always yields the same output,
//! with no I/O, so ingestion, queries and reports agree on every name.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use serde::Deserialize;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::areas::{boroughs, BOROUGH_ALIASES};

/// Known high-value supplier variants, keyed by their baseline-cleaned form.
/// Lookups fold accents, so only one accent spelling of each key is needed.
pub const SUPPLIER_OVERRIDES: &[(&str, &str)] = &[
    ("LES ENTREPRISES MICHAUDVILLE INC", "LES ENTREPRISES MICHAUDVILLE INC"),
    ("ENTREPRISES MICHAUDVILLE INC", "LES ENTREPRISES MICHAUDVILLE INC"),
    ("LES ENTREPRISES MICHAUDVILLE", "LES ENTREPRISES MICHAUDVILLE INC"),
    ("ENTREPRISES MICHAUDVILLE", "LES ENTREPRISES MICHAUDVILLE INC"),
    ("LES ENTREPRISE MICHAUDVILLE INC", "LES ENTREPRISES MICHAUDVILLE INC"),
    ("LES ENTREPRISES MICHAUDVILE INC", "LES ENTREPRISES MICHAUDVILLE INC"),
    ("LES ENTREPRISES MICHAUDVILLE INC.", "LES ENTREPRISES MICHAUDVILLE INC"),
    ("MICHAUDVILLE INC", "LES ENTREPRISES MICHAUDVILLE INC"),
    ("LES ENTREPRISES MICHAUDVILLE LTEE", "LES ENTREPRISES MICHAUDVILLE INC"),
    ("LES ENTREPRISES MICHAUDVILLE, INC", "LES ENTREPRISES MICHAUDVILLE INC"),
    ("LES ENT. MICHAUDVILLE INC", "LES ENTREPRISES MICHAUDVILLE INC"),
    ("ENT. MICHAUDVILLE INC", "LES ENTREPRISES MICHAUDVILLE INC"),
    ("ROXBORO EXCAVATION INC", "ROXBORO EXCAVATION INC"),
    ("ROXBORO EXCAVATION", "ROXBORO EXCAVATION INC"),
    ("EXCAVATION ROXBORO INC", "ROXBORO EXCAVATION INC"),
    ("ROXBORO EXCAVATIONS INC", "ROXBORO EXCAVATION INC"),
    ("HYDRO-QUEBEC", "HYDRO-QUÉBEC"),
    ("HYDRO QUEBEC", "HYDRO-QUÉBEC"),
    ("HYDRO-QUEBEC (SOCIETE D'ETAT)", "HYDRO-QUÉBEC"),
    ("BELL CANADA INC", "BELL CANADA"),
    ("BELL CANADA", "BELL CANADA"),
    ("GROUPE ABF INC", "GROUPE ABF INC"),
    ("GROUPE A.B.F. INC", "GROUPE ABF INC"),
    ("LE GROUPE ABF INC", "GROUPE ABF INC"),
];

static BUILTIN: LazyLock<Normalizer> = LazyLock::new(Normalizer::builtin);

/// Canonical borough name for a raw dataset spelling. Unmapped names come
/// back cleaned but otherwise unchanged.
pub fn normalize_area(raw: &str) -> String {
    BUILTIN.normalize_area(raw)
}

/// Canonical supplier display name for a raw dataset spelling.
pub fn normalize_supplier(raw: &str) -> String {
    BUILTIN.normalize_supplier(raw)
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    area_aliases: HashMap<String, String>,
    supplier_overrides: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AliasFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    aliases: Vec<AliasEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct AliasEntry {
    raw: String,
    canonical: String,
}

impl Normalizer {
    pub fn builtin() -> Self {
        let mut normalizer = Self::default();
        normalizer.extend_area_aliases(boroughs().map(|a| (a.name_fr, a.name_fr)));
        normalizer.extend_area_aliases(BOROUGH_ALIASES.iter().map(|(raw, canonical)| (*raw, *canonical)));
        normalizer.extend_supplier_overrides(SUPPLIER_OVERRIDES.iter().copied());
        normalizer
    }

    /// Built-in tables extended by `rules/area_aliases.yaml` and
    /// `rules/supplier_aliases.yaml` when present. Later entries win.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let mut normalizer = Self::builtin();
        let rules_dir = root.join("rules");

        let areas_path = rules_dir.join("area_aliases.yaml");
        if areas_path.exists() {
            let file = read_alias_file(&areas_path)?;
            normalizer.extend_area_aliases(file.aliases.iter().map(|a| (a.raw.as_str(), a.canonical.as_str())));
        }

        let suppliers_path = rules_dir.join("supplier_aliases.yaml");
        if suppliers_path.exists() {
            let file = read_alias_file(&suppliers_path)?;
            normalizer.extend_supplier_overrides(
                file.aliases.iter().map(|a| (a.raw.as_str(), a.canonical.as_str())),
            );
        }

        Ok(normalizer)
    }

    pub fn extend_area_aliases<'a>(&mut self, entries: impl IntoIterator<Item = (&'a str, &'a str)>) {
        for (raw, canonical) in entries {
            let canonical = clean_area(canonical);
            self.area_aliases
                .entry(fold_key(&canonical))
                .or_insert_with(|| canonical.clone());
            self.area_aliases.insert(fold_key(&clean_area(raw)), canonical);
        }
    }

    pub fn extend_supplier_overrides<'a>(
        &mut self,
        entries: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) {
        for (raw, canonical) in entries {
            self.supplier_overrides
                .insert(fold_key(&supplier_baseline(raw)), canonical.to_string());
        }
    }

    pub fn normalize_area(&self, raw: &str) -> String {
        let cleaned = clean_area(raw);
        if cleaned.is_empty() {
            return cleaned;
        }
        match self.area_aliases.get(&fold_key(&cleaned)) {
            Some(canonical) => canonical.clone(),
            None => cleaned,
        }
    }

    pub fn normalize_supplier(&self, raw: &str) -> String {
        let baseline = supplier_baseline(raw);
        if baseline.is_empty() {
            return baseline;
        }
        match self.supplier_overrides.get(&fold_key(&baseline)) {
            Some(canonical) => canonical.clone(),
            None => baseline,
        }
    }
}

fn read_alias_file(path: &Path) -> Result<AliasFile> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn is_dash_variant(c: char) -> bool {
    matches!(c, '\u{2010}'..='\u{2015}' | '\u{2212}')
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trim, unify dash variants to `-` and collapse whitespace.
fn clean_area(raw: &str) -> String {
    let dashed: String = raw
        .chars()
        .map(|c| if is_dash_variant(c) { '-' } else { c })
        .collect();
    collapse_whitespace(&dashed)
}

/// Case-, accent- and punctuation-variant-insensitive lookup key.
fn fold_key(input: &str) -> String {
    let folded: String = input
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' | '`' => '\'',
            c if is_dash_variant(c) => '-',
            c => c,
        })
        .flat_map(char::to_lowercase)
        .collect();
    collapse_whitespace(&folded)
}

/// Uppercase, single spaces, no incorporation-number suffix and no trailing
/// punctuation.
pub fn supplier_baseline(raw: &str) -> String {
    let mut name = collapse_whitespace(&raw.to_uppercase());
    loop {
        let before = name.len();
        name = strip_incorporation_suffix(&name);
        name = name
            .trim_end_matches(|c: char| matches!(c, ',' | ';' | '.') || c.is_whitespace())
            .to_string();
        if name.len() == before {
            break;
        }
    }
    name
}

/// Drops a trailing `(NEQ 1234567890)`, `(1234567890)` or `#1234567890`.
fn strip_incorporation_suffix(name: &str) -> String {
    if let Some(open) = name.rfind('(') {
        if name.ends_with(')') {
            let inner = &name[open + 1..name.len() - 1];
            let inner = inner.trim().trim_start_matches("NEQ").trim_start_matches(':').trim();
            if !inner.is_empty() && inner.chars().all(|c| c.is_ascii_digit() || c == '-' || c == ' ') {
                return name[..open].trim_end().to_string();
            }
        }
    }
    if let Some(hash) = name.rfind('#') {
        let digits = name[hash + 1..].trim();
        if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
            return name[..hash].trim_end().to_string();
        }
    }
    name.to_string()
}

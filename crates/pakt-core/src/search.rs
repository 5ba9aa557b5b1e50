//! Text search over package names, descriptions and groups.

use crate::error::{Error, Result};
use crate::package::Package;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

/// A term index mapping lower-cased words to the packages containing them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchIndex {
    built_at: DateTime<Utc>,
    package_count: usize,
    terms: BTreeMap<String, BTreeSet<String>>,
}

impl SearchIndex {
    /// Indexes every package yielded by `packages`.
    pub fn build<'a>(packages: impl IntoIterator<Item = &'a Package>) -> Self {
        let mut terms: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut package_count = 0;

        for package in packages {
            package_count += 1;
            let name = package.name.to_lowercase();
            let words = std::iter::once(name.clone())
                .chain(tokenize(&name))
                .chain(tokenize(&package.description))
                .chain(package.groups.iter().flat_map(|g| tokenize(g)));
            for word in words {
                terms.entry(word).or_default().insert(package.name.clone());
            }
        }

        Self {
            built_at: Utc::now(),
            package_count,
            terms,
        }
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn package_count(&self) -> usize {
        self.package_count
    }

    /// Names of the packages matching every term of `query`, best match
    /// first.
    pub fn search(&self, query: &str) -> Vec<String> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() {
            return Vec::new();
        }

        let mut matches: Option<BTreeSet<&String>> = None;
        for term in &query_terms {
            let hits: BTreeSet<&String> = self
                .terms
                .range(term.clone()..)
                .take_while(|(indexed, _)| indexed.starts_with(term.as_str()))
                .flat_map(|(_, names)| names.iter())
                .collect();

            matches = Some(match matches {
                Some(previous) => previous.intersection(&hits).copied().collect(),
                None => hits,
            });
        }

        let needle = query.trim().to_lowercase();
        let mut results: Vec<&String> = matches.unwrap_or_default().into_iter().collect();
        results.sort_by(|a, b| {
            rank(a, &needle)
                .cmp(&rank(b, &needle))
                .then_with(|| a.cmp(b))
        });
        results.into_iter().cloned().collect()
    }

    /// Whether the index is older than the database or covers a different
    /// number of packages.
    pub fn needs_update(&self, database_modified: Option<DateTime<Utc>>, package_count: usize) -> bool {
        if self.package_count != package_count {
            return true;
        }
        database_modified.is_some_and(|modified| modified > self.built_at)
    }

    /// Reads a persisted index. A missing file yields `None`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        let index = serde_json::from_str(&content)
            .map_err(|e| Error::SearchIndexError(format!("{}: {}", path.display(), e)))?;
        Ok(Some(index))
    }

    /// Persists the index, creating the parent directory as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string(self)?;
        std::fs::write(path, content)?;
        debug!("Saved search index with {} terms to {}", self.terms.len(), path.display());
        Ok(())
    }
}

fn rank(name: &str, needle: &str) -> u8 {
    let name = name.to_lowercase();
    if name == needle {
        0
    } else if name.starts_with(needle) {
        1
    } else if name.contains(needle) {
        2
    } else {
        3
    }
}

/// Splits text into lower-cased search terms. Hyphenated words are kept
/// whole and also split into their parts.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in text
        .split(|c: char| !(c.is_alphanumeric() || matches!(c, '-' | '+' | '.')))
        .map(|w| w.trim_matches(|c| matches!(c, '-' | '.')))
        .filter(|w| !w.is_empty())
    {
        let word = word.to_lowercase();
        if word.contains('-') {
            tokens.extend(word.split('-').filter(|p| !p.is_empty()).map(str::to_string));
        }
        tokens.push(word);
    }
    tokens
}

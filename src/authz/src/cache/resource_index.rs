//! Per-principal resource index
//!
//! Maps resources and resource expressions to policy ID sets. Expressions are
//! classified once at insert time:
//!
//! - **prefix** (`^/node/.*$`) and **suffix** (`^.*\.pdf$`) expressions go
//!   into [`PrefixTree`]s keyed by their literal part
//! - **all** expressions (`.*`) match every resource and share the any-resource
//!   bucket with permissions that name no resource at all
//! - everything else is a **generic** expression, matched with one regex test
//!   per distinct expression per lookup

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tracing::warn;

use super::prefix_tree::{IdSet, PrefixTree};

// `\w` is Unicode-aware in the regex crate; resource keys are ASCII words.
static PREFIX_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\^?[0-9A-Za-z_/]+\.\*\$?$").expect("valid prefix pattern"));
static SUFFIX_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\^?\.\*[0-9A-Za-z_/]+\$?$").expect("valid suffix pattern"));
static ALL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\^?\.\*\$?$").expect("valid all pattern"));

/// Pattern class of a resource expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourcePattern {
    /// Literal prefix, decoration stripped
    Prefix(String),
    /// Literal suffix, decoration stripped and reversed
    Suffix(String),
    /// Matches every resource
    All,
    /// Any other regular expression
    Generic,
}

impl ResourcePattern {
    /// Classify a resource expression
    pub fn classify(expression: &str) -> Self {
        if PREFIX_PATTERN.is_match(expression) {
            let literal = expression
                .strip_suffix(".*$")
                .or_else(|| expression.strip_suffix(".*"))
                .unwrap_or(expression);
            let literal = literal.strip_prefix('^').unwrap_or(literal);
            ResourcePattern::Prefix(literal.to_string())
        } else if SUFFIX_PATTERN.is_match(expression) {
            let literal = expression
                .strip_prefix("^.*")
                .or_else(|| expression.strip_prefix(".*"))
                .unwrap_or(expression);
            let literal = literal.strip_suffix('$').unwrap_or(literal);
            ResourcePattern::Suffix(reverse(literal))
        } else if ALL_PATTERN.is_match(expression) {
            ResourcePattern::All
        } else {
            ResourcePattern::Generic
        }
    }
}

fn reverse(value: &str) -> String {
    value.chars().rev().collect()
}

/// Unanchored regex test of `resource` against `expression`
pub fn expression_matches(expression: &str, resource: &str) -> Result<bool, regex::Error> {
    Ok(Regex::new(expression)?.is_match(resource))
}

#[derive(Debug, Clone)]
struct GenericBucket {
    regex: Option<Regex>,
    ids: IdSet,
}

/// Resource to policy ID index for one principal
#[derive(Debug, Default, Clone)]
pub struct ResourceIndex {
    exact: HashMap<String, IdSet>,
    prefix: PrefixTree,
    suffix: PrefixTree,
    generic: HashMap<String, GenericBucket>,
    any: IdSet,
}

impl ResourceIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `id` under an exact resource name
    pub fn insert_resource(&mut self, resource: &str, id: &str) {
        self.exact
            .entry(resource.to_string())
            .or_default()
            .insert(id.to_string());
    }

    /// Remove `id` from an exact resource name
    pub fn remove_resource(&mut self, resource: &str, id: &str) {
        if let Some(ids) = self.exact.get_mut(resource) {
            ids.remove(id);
            if ids.is_empty() {
                self.exact.remove(resource);
            }
        }
    }

    /// Index `id` under a resource expression
    pub fn insert_expression(&mut self, expression: &str, id: &str) {
        match ResourcePattern::classify(expression) {
            ResourcePattern::Prefix(key) => self.prefix.insert(&key, id),
            ResourcePattern::Suffix(key) => self.suffix.insert(&key, id),
            ResourcePattern::All => self.insert_any(id),
            ResourcePattern::Generic => {
                let bucket = self
                    .generic
                    .entry(expression.to_string())
                    .or_insert_with(|| GenericBucket {
                        regex: compile_generic(expression),
                        ids: IdSet::new(),
                    });
                bucket.ids.insert(id.to_string());
            }
        }
    }

    /// Remove `id` from a resource expression
    pub fn remove_expression(&mut self, expression: &str, id: &str) {
        match ResourcePattern::classify(expression) {
            ResourcePattern::Prefix(key) => self.prefix.remove(&key, id),
            ResourcePattern::Suffix(key) => self.suffix.remove(&key, id),
            ResourcePattern::All => self.remove_any(id),
            ResourcePattern::Generic => {
                if let Some(bucket) = self.generic.get_mut(expression) {
                    bucket.ids.remove(id);
                    if bucket.ids.is_empty() {
                        self.generic.remove(expression);
                    }
                }
            }
        }
    }

    /// Index `id` as matching every resource
    pub fn insert_any(&mut self, id: &str) {
        self.any.insert(id.to_string());
    }

    /// Remove `id` from the any-resource bucket
    pub fn remove_any(&mut self, id: &str) {
        self.any.remove(id);
    }

    /// Add every ID whose resource or expression matches `resource`
    ///
    /// IDs in the any-resource bucket are always added.
    pub fn collect_matching(&self, resource: &str, out: &mut IdSet) {
        out.extend(self.any.iter().cloned());

        if let Some(ids) = self.exact.get(resource) {
            out.extend(ids.iter().cloned());
        }

        self.prefix
            .walk_path(resource, |ids| out.extend(ids.iter().cloned()));

        let reversed = reverse(resource);
        self.suffix
            .walk_path(&reversed, |ids| out.extend(ids.iter().cloned()));

        for (expression, bucket) in &self.generic {
            match &bucket.regex {
                Some(regex) if regex.is_match(resource) => out.extend(bucket.ids.iter().cloned()),
                Some(_) => {}
                None => warn!(expression = %expression, "Skipping invalid resource expression"),
            }
        }
    }

    /// Add every indexed ID regardless of resource
    pub fn collect_all(&self, out: &mut IdSet) {
        out.extend(self.any.iter().cloned());
        for ids in self.exact.values() {
            out.extend(ids.iter().cloned());
        }
        self.prefix.walk(|ids| out.extend(ids.iter().cloned()));
        self.suffix.walk(|ids| out.extend(ids.iter().cloned()));
        for bucket in self.generic.values() {
            out.extend(bucket.ids.iter().cloned());
        }
    }

    /// True iff all five buckets are empty
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
            && self.prefix.is_empty()
            && self.suffix.is_empty()
            && self.generic.is_empty()
            && self.any.is_empty()
    }
}

fn compile_generic(expression: &str) -> Option<Regex> {
    match Regex::new(expression) {
        Ok(regex) => Some(regex),
        Err(e) => {
            warn!(expression = %expression, error = %e, "Invalid resource expression");
            None
        }
    }
}

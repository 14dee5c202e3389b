//! Principal and resource indexed cache shared by policies and role policies

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use super::prefix_tree::IdSet;
use super::resource_index::ResourceIndex;
use crate::cel::CompiledCondition;

/// Entry that can be stored in an [`IndexedCache`]
pub trait Indexable {
    /// Identifier, unique within a service
    fn id(&self) -> &str;

    /// Condition expression, if any
    fn condition(&self) -> Option<&str>;

    /// Distinct principals the entry applies to; empty means every principal
    fn index_principals(&self) -> Vec<&str>;

    /// Insert the entry's resources into `index`
    fn insert_into(&self, index: &mut ResourceIndex);

    /// Remove the entry's resources from `index`
    fn remove_from(&self, index: &mut ResourceIndex);
}

/// Entries indexed by principal, then by resource
///
/// Every entry appears in the resource index of each principal it names, or
/// in the any-principal index if it names none. Removal walks the same
/// principals and resources, and drops per-principal indexes once empty.
pub struct IndexedCache<T> {
    entries: HashMap<String, Arc<T>>,
    conditions: HashMap<String, Arc<dyn CompiledCondition>>,
    by_principal: HashMap<String, ResourceIndex>,
    any_principal: ResourceIndex,
}

impl<T> Default for IndexedCache<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            conditions: HashMap::new(),
            by_principal: HashMap::new(),
            any_principal: ResourceIndex::new(),
        }
    }
}

impl<T: Indexable> IndexedCache<T> {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry along with its compiled condition
    ///
    /// An entry with the same ID is replaced.
    pub fn add(&mut self, entry: T, condition: Option<Arc<dyn CompiledCondition>>) {
        let id = entry.id().to_string();
        if self.entries.contains_key(&id) {
            self.remove(&id);
        }

        let principals = entry.index_principals();
        if principals.is_empty() {
            entry.insert_into(&mut self.any_principal);
        } else {
            for principal in principals {
                entry.insert_into(self.by_principal.entry(principal.to_string()).or_default());
            }
        }

        if let Some(condition) = condition {
            self.conditions.insert(id.clone(), condition);
        }
        debug!(id = %id, "Indexed cache entry");
        self.entries.insert(id, Arc::new(entry));
    }

    /// Remove an entry; no-op if absent
    pub fn remove(&mut self, id: &str) -> Option<Arc<T>> {
        let entry = self.entries.remove(id)?;
        self.conditions.remove(id);

        let principals = entry.index_principals();
        if principals.is_empty() {
            entry.remove_from(&mut self.any_principal);
        } else {
            for principal in principals {
                if let Some(index) = self.by_principal.get_mut(principal) {
                    entry.remove_from(index);
                    if index.is_empty() {
                        self.by_principal.remove(principal);
                    }
                }
            }
        }
        debug!(id = %id, "Removed cache entry");
        Some(entry)
    }

    /// Entries reachable from `principals`
    ///
    /// Entries indexed under no principal are always considered. With
    /// `resource` set, only entries whose resources match it are returned;
    /// with `None`, every entry of the matching principals is returned.
    pub fn related(&self, principals: &[String], resource: Option<&str>) -> BTreeMap<String, Arc<T>> {
        let mut ids = IdSet::new();
        collect(&self.any_principal, resource, &mut ids);

        for principal in principals {
            if let Some(index) = self.by_principal.get(principal) {
                collect(index, resource, &mut ids);
            }
        }

        ids.into_iter()
            .filter_map(|id| self.entries.get(&id).map(|entry| (id, entry.clone())))
            .collect()
    }

    /// Entry by ID
    pub fn get(&self, id: &str) -> Option<&Arc<T>> {
        self.entries.get(id)
    }

    /// IDs of every entry
    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Cached compiled condition for an entry
    pub fn condition(&self, id: &str) -> Option<Arc<dyn CompiledCondition>> {
        self.conditions.get(id).cloned()
    }

    /// Cache a compiled condition for an entry that is still present
    pub fn set_condition(&mut self, id: &str, condition: Arc<dyn CompiledCondition>) {
        if self.entries.contains_key(id) {
            self.conditions.insert(id.to_string(), condition);
        }
    }

    /// Drop every compiled condition
    pub fn clear_conditions(&mut self) {
        self.conditions.clear();
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no entry is indexed anywhere
    pub fn is_empty(&self) -> bool {
        self.by_principal.is_empty() && self.any_principal.is_empty()
    }
}

fn collect(index: &ResourceIndex, resource: Option<&str>, out: &mut IdSet) {
    match resource {
        Some(resource) => index.collect_matching(resource, out),
        None => index.collect_all(out),
    }
}

/// Distinct strings, first occurrence order
pub(crate) fn distinct<'a>(values: impl IntoIterator<Item = &'a String>) -> Vec<&'a str> {
    let mut seen = std::collections::HashSet::new();
    values
        .into_iter()
        .map(String::as_str)
        .filter(|v| seen.insert(*v))
        .collect()
}

//! Policy cache

use super::indexed::{distinct, Indexable, IndexedCache};
use super::resource_index::ResourceIndex;
use crate::types::Policy;

/// Policies indexed by principal and resource
pub type PolicyCache = IndexedCache<Policy>;

impl Indexable for Policy {
    fn id(&self) -> &str {
        &self.id
    }

    fn condition(&self) -> Option<&str> {
        Policy::condition(self)
    }

    fn index_principals(&self) -> Vec<&str> {
        distinct(self.principals.iter().flatten())
    }

    fn insert_into(&self, index: &mut ResourceIndex) {
        if self.permissions.is_empty() {
            index.insert_any(&self.id);
            return;
        }
        for permission in &self.permissions {
            if permission.is_any_resource() {
                index.insert_any(&self.id);
            }
            if !permission.resource.is_empty() {
                index.insert_resource(&permission.resource, &self.id);
            }
            if !permission.resource_expression.is_empty() {
                index.insert_expression(&permission.resource_expression, &self.id);
            }
        }
    }

    fn remove_from(&self, index: &mut ResourceIndex) {
        if self.permissions.is_empty() {
            index.remove_any(&self.id);
            return;
        }
        for permission in &self.permissions {
            if permission.is_any_resource() {
                index.remove_any(&self.id);
            }
            if !permission.resource.is_empty() {
                index.remove_resource(&permission.resource, &self.id);
            }
            if !permission.resource_expression.is_empty() {
                index.remove_expression(&permission.resource_expression, &self.id);
            }
        }
    }
}

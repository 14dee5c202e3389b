//! Role policy cache

use super::indexed::{distinct, Indexable, IndexedCache};
use super::resource_index::ResourceIndex;
use crate::types::RolePolicy;

/// Role policies indexed by principal and resource
pub type RolePolicyCache = IndexedCache<RolePolicy>;

impl Indexable for RolePolicy {
    fn id(&self) -> &str {
        &self.id
    }

    fn condition(&self) -> Option<&str> {
        RolePolicy::condition(self)
    }

    fn index_principals(&self) -> Vec<&str> {
        distinct(&self.principals)
    }

    fn insert_into(&self, index: &mut ResourceIndex) {
        if self.is_any_resource() {
            index.insert_any(&self.id);
            return;
        }
        for resource in &self.resources {
            index.insert_resource(resource, &self.id);
        }
        for expression in &self.resource_expressions {
            index.insert_expression(expression, &self.id);
        }
    }

    fn remove_from(&self, index: &mut ResourceIndex) {
        if self.is_any_resource() {
            index.remove_any(&self.id);
            return;
        }
        for resource in &self.resources {
            index.remove_resource(resource, &self.id);
        }
        for expression in &self.resource_expressions {
            index.remove_expression(expression, &self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Effect;

    fn related(cache: &RolePolicyCache, subject: &[&str], resource: &str) -> Vec<String> {
        let subject: Vec<String> = subject.iter().map(|s| s.to_string()).collect();
        cache.related(&subject, Some(resource)).into_keys().collect()
    }

    #[test]
    fn test_role_policy_lookup() {
        let mut cache = RolePolicyCache::new();
        cache.add(
            RolePolicy::new("rp1", Effect::Grant, &["role1"]).with_principals(&["user:bill"]),
            None,
        );
        cache.add(
            RolePolicy::new("rp2", Effect::Grant, &["role2"])
                .with_principals(&["role:role1", "user:alice"])
                .with_resource("/node1"),
            None,
        );
        cache.add(
            RolePolicy::new("rp3", Effect::Deny, &["role3"])
                .with_principals(&["role:role1"])
                .with_resource_expression("^/node/.*$"),
            None,
        );
        cache.add(RolePolicy::new("rp4", Effect::Grant, &["role4"]), None);

        assert_eq!(related(&cache, &["user:bill"], ""), vec!["rp1", "rp4"]);
        assert_eq!(related(&cache, &["role:role1"], "/node1"), vec!["rp2", "rp4"]);
        assert_eq!(related(&cache, &["role:role1"], "/node/x"), vec!["rp3", "rp4"]);
        assert_eq!(related(&cache, &["user:alice"], "/node2"), vec!["rp4"]);
    }

    #[test]
    fn test_role_policy_add_delete_round_trip() {
        let mut cache = RolePolicyCache::new();
        cache.add(
            RolePolicy::new("rp1", Effect::Grant, &["role1"])
                .with_principals(&["user:bill", "user:bill"])
                .with_resource("/a")
                .with_resource_expression(".*b$"),
            None,
        );
        cache.add(RolePolicy::new("rp2", Effect::Deny, &["role2"]), None);
        assert!(!cache.is_empty());

        cache.remove("rp1");
        cache.remove("rp2");
        assert!(cache.is_empty());
        assert!(related(&cache, &["user:bill"], "/a").is_empty());
    }
}

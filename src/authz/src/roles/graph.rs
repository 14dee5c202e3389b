//! Role graph arena
//!
//! Nodes are addressed by role name and edges are name sets, so pruning a
//! role is a matter of deleting its name from its neighbours' sets. The graph
//! may contain cycles; every traversal here carries a visited set.

use std::collections::{BTreeMap, BTreeSet};

/// A role and its grant/deny edges
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleNode {
    /// Presented principals granting the role directly
    pub parent_principals: BTreeSet<String>,
    /// Roles granting this role
    pub parent_roles: BTreeSet<String>,
    /// Roles granted by this role
    pub child_roles: BTreeSet<String>,
    /// Roles denied by this role
    pub denied_roles: BTreeSet<String>,
    /// Roles denying this role
    pub denied_by_roles: BTreeSet<String>,
    /// Presented principals denying this role directly
    pub denied_by_principals: BTreeSet<String>,
}

impl RoleNode {
    /// True if nothing grants the role anymore
    pub fn is_orphaned(&self) -> bool {
        self.parent_roles.is_empty() && self.parent_principals.is_empty()
    }

    fn forget(&mut self, role: &str) {
        self.child_roles.remove(role);
        self.parent_roles.remove(role);
        self.denied_roles.remove(role);
        self.denied_by_roles.remove(role);
    }
}

/// Arena of role nodes keyed by role name
#[derive(Debug, Clone, Default)]
pub struct RoleGraph {
    nodes: BTreeMap<String, RoleNode>,
}

impl RoleGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Node for `role`, created if missing
    pub fn node_mut(&mut self, role: &str) -> &mut RoleNode {
        self.nodes.entry(role.to_string()).or_default()
    }

    /// Node for `role`
    pub fn node(&self, role: &str) -> Option<&RoleNode> {
        self.nodes.get(role)
    }

    /// True if `role` has a node
    pub fn contains(&self, role: &str) -> bool {
        self.nodes.contains_key(role)
    }

    /// Role names in the graph
    pub fn roles(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    /// Keep only nodes and role edges that reference `keep`
    pub fn retain(&mut self, keep: &BTreeSet<String>) {
        self.nodes.retain(|role, _| keep.contains(role));
        for node in self.nodes.values_mut() {
            node.parent_roles.retain(|r| keep.contains(r));
            node.denied_by_roles.retain(|r| keep.contains(r));
            node.child_roles.retain(|r| keep.contains(r));
            node.denied_roles.retain(|r| keep.contains(r));
        }
    }

    /// Roles that some other role in `granted` still denies
    pub fn denied_roles(&self, granted: &BTreeSet<String>) -> BTreeSet<String> {
        self.nodes
            .iter()
            .filter(|(role, node)| !node.denied_by_roles.is_empty() && granted.contains(*role))
            .map(|(role, _)| role.clone())
            .collect()
    }

    /// True if `role` or every grant path above it ends in a denied role
    ///
    /// A role granted directly by a principal is never considered denied
    /// through its ancestors. Roles missing from the graph count as denied.
    pub fn self_or_ancestors_denied(&self, role: &str, denied: &BTreeSet<String>) -> bool {
        let mut path = BTreeSet::new();
        self.self_or_ancestors_denied_inner(role, denied, &mut path)
    }

    fn self_or_ancestors_denied_inner(
        &self,
        role: &str,
        denied: &BTreeSet<String>,
        path: &mut BTreeSet<String>,
    ) -> bool {
        if denied.contains(role) {
            return true;
        }
        let Some(node) = self.nodes.get(role) else {
            return true;
        };
        if !node.parent_principals.is_empty() {
            return false;
        }
        // A cycle back into the current path provides no root.
        if !path.insert(role.to_string()) {
            return true;
        }
        let all_denied = node
            .parent_roles
            .iter()
            .all(|parent| self.self_or_ancestors_denied_inner(parent, denied, path));
        path.remove(role);
        all_denied
    }

    /// True if some role denying `role` is itself not denied
    pub fn can_safely_deny(&self, role: &str, denied: &BTreeSet<String>) -> bool {
        match self.nodes.get(role) {
            Some(node) => node
                .denied_by_roles
                .iter()
                .any(|denier| !self.self_or_ancestors_denied(denier, denied)),
            None => false,
        }
    }

    /// Descendants of `role` that are granted only through `role` or other
    /// such descendants, and by no principal
    pub fn deniable_descendants(&self, role: &str) -> Vec<String> {
        let mut visited = BTreeSet::new();
        visited.insert(role.to_string());
        self.deniable_descendants_inner(role, &mut visited)
    }

    fn deniable_descendants_inner(&self, role: &str, visited: &mut BTreeSet<String>) -> Vec<String> {
        let mut descendants: Vec<String> = Vec::new();
        let Some(node) = self.nodes.get(role) else {
            return descendants;
        };

        for child in &node.child_roles {
            let Some(child_node) = self.nodes.get(child) else {
                continue;
            };
            if visited.contains(child) {
                continue;
            }
            let only_through_denied = child_node
                .parent_roles
                .iter()
                .all(|parent| parent == role || descendants.contains(parent));
            if only_through_denied && child_node.parent_principals.is_empty() {
                visited.insert(child.clone());
                descendants.push(child.clone());
                descendants.extend(self.deniable_descendants_inner(child, visited));
            }
        }
        descendants
    }

    /// Remove `role` and its deniable descendants from the graph and from
    /// `granted`
    ///
    /// Every remaining role left without any grant edge is removed as well.
    pub fn deny_role_and_descendants(&mut self, role: &str, granted: &mut BTreeSet<String>) {
        let mut deleted: BTreeSet<String> = self.deniable_descendants(role).into_iter().collect();
        deleted.insert(role.to_string());

        let mut orphaned = Vec::new();
        for (name, node) in self.nodes.iter_mut() {
            if deleted.contains(name) {
                continue;
            }
            for removed in &deleted {
                node.forget(removed);
            }
            if node.is_orphaned() {
                orphaned.push(name.clone());
            }
        }

        for name in orphaned.iter().chain(deleted.iter()) {
            self.nodes.remove(name);
            granted.remove(name);
        }
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

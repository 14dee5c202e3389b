//! Deny-aware role resolution

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::debug;

use super::graph::RoleGraph;
use crate::error::Result;
use crate::principal::{role_name, role_principal};
use crate::types::RolePolicy;

/// Root used for role policies that name no principal
pub const ANY_PRINCIPAL: &str = "*";

/// Role policies matched by one query, split by effect
#[derive(Debug, Clone, Default)]
pub struct MatchedRolePolicies {
    /// Grant role policies whose condition held
    pub granted: Vec<Arc<RolePolicy>>,
    /// Deny role policies whose condition held
    pub denied: Vec<Arc<RolePolicy>>,
}

/// Where the resolver looks up role policies
pub trait RolePolicySource {
    /// Role policies applying to any of `principals` whose condition holds
    ///
    /// Policies whose ID is in `seen` have already been processed and may be
    /// skipped.
    fn direct_role_policies(
        &mut self,
        principals: &[String],
        seen: &HashSet<String>,
    ) -> Result<MatchedRolePolicies>;
}

/// Resolve every role granted to `principals`
///
/// `principals` are the subject's effective principals before role
/// resolution. The returned set is ordered by name for stable output only.
pub fn resolve_roles<S>(source: &mut S, principals: &[String]) -> Result<BTreeSet<String>>
where
    S: RolePolicySource + ?Sized,
{
    RoleResolver::new(principals).resolve(source, principals)
}

struct RoleResolver {
    rooted: HashSet<String>,
    graph: RoleGraph,
    seen: HashSet<String>,
    granted: BTreeSet<String>,
    direct_denied: BTreeSet<String>,
    denied: BTreeSet<String>,
}

impl RoleResolver {
    fn new(principals: &[String]) -> Self {
        let mut rooted: HashSet<String> = principals.iter().cloned().collect();
        rooted.insert(ANY_PRINCIPAL.to_string());
        Self {
            rooted,
            graph: RoleGraph::new(),
            seen: HashSet::new(),
            granted: BTreeSet::new(),
            direct_denied: BTreeSet::new(),
            denied: BTreeSet::new(),
        }
    }

    fn resolve<S>(mut self, source: &mut S, principals: &[String]) -> Result<BTreeSet<String>>
    where
        S: RolePolicySource + ?Sized,
    {
        // Direct denies first so directly denied roles are never granted.
        let direct = source.direct_role_policies(principals, &self.seen)?;
        for policy in &direct.denied {
            if self.seen.insert(policy.id.clone()) {
                self.apply_deny(policy);
            }
        }
        let mut newly_granted = Vec::new();
        for policy in &direct.granted {
            if self.seen.insert(policy.id.clone()) {
                newly_granted.extend(self.apply_grant(policy));
            }
        }

        while !newly_granted.is_empty() {
            let principals: Vec<String> = newly_granted.iter().map(|r| role_principal(r)).collect();
            let matched = source.direct_role_policies(&principals, &self.seen)?;
            newly_granted.clear();
            for policy in &matched.granted {
                if self.seen.insert(policy.id.clone()) {
                    newly_granted.extend(self.apply_grant(policy));
                }
            }
        }

        let principals: Vec<String> = self.granted.iter().map(|r| role_principal(r)).collect();
        let matched = source.direct_role_policies(&principals, &self.seen)?;
        for policy in &matched.denied {
            if self.seen.insert(policy.id.clone()) {
                self.apply_deny(policy);
            }
        }

        self.graph.retain(&self.granted);
        self.settle_denies();

        debug!(roles = ?self.granted, "Resolved granted roles");
        Ok(self.granted)
    }

    /// Apply role denies until none is left
    fn settle_denies(&mut self) {
        loop {
            let safely_denied: Vec<String> = self
                .denied
                .iter()
                .filter(|role| self.graph.can_safely_deny(role, &self.denied))
                .cloned()
                .collect();

            if safely_denied.is_empty() {
                // Every remaining deny is held up by another denied role.
                // Deny them all, in name order.
                let remaining = std::mem::take(&mut self.denied);
                if !remaining.is_empty() {
                    debug!(roles = ?remaining, "Force denying roles in a deny cycle");
                }
                for role in remaining {
                    self.graph.deny_role_and_descendants(&role, &mut self.granted);
                }
                return;
            }

            for role in &safely_denied {
                self.graph.deny_role_and_descendants(role, &mut self.granted);
                self.denied.remove(role);
            }
            self.denied = self.graph.denied_roles(&self.granted);
        }
    }

    /// Split policy principals into rooted principals and roles
    ///
    /// Rooted principals are the subject's effective principals, built-in
    /// roles included. A policy naming no principal is rooted at `*`, so a
    /// deny of that kind is direct.
    fn split_principals(&self, policy: &RolePolicy) -> (Vec<String>, Vec<String>) {
        if policy.principals.is_empty() {
            return (vec![ANY_PRINCIPAL.to_string()], Vec::new());
        }
        let mut rooted = Vec::new();
        let mut roles = Vec::new();
        for principal in &policy.principals {
            if self.rooted.contains(principal) {
                rooted.push(principal.clone());
            } else if let Some(role) = role_name(principal) {
                roles.push(role.to_string());
            }
        }
        (rooted, roles)
    }

    fn apply_grant(&mut self, policy: &RolePolicy) -> Vec<String> {
        let (parent_principals, parent_roles) = self.split_principals(policy);
        let mut newly_granted = Vec::new();

        for role in &policy.roles {
            if self.direct_denied.contains(role) {
                continue;
            }
            let node = self.graph.node_mut(role);
            node.parent_roles.extend(parent_roles.iter().cloned());
            node.parent_principals.extend(parent_principals.iter().cloned());
            if self.granted.insert(role.clone()) {
                newly_granted.push(role.clone());
            }
        }

        for parent in &parent_roles {
            let children = policy
                .roles
                .iter()
                .filter(|role| !self.direct_denied.contains(*role))
                .cloned()
                .collect::<Vec<_>>();
            self.graph.node_mut(parent).child_roles.extend(children);
        }

        newly_granted
    }

    fn apply_deny(&mut self, policy: &RolePolicy) {
        let (denied_by_principals, denied_by_roles) = self.split_principals(policy);

        for denier in &denied_by_roles {
            self.graph
                .node_mut(denier)
                .denied_roles
                .extend(policy.roles.iter().cloned());
        }

        for role in &policy.roles {
            let node = self.graph.node_mut(role);
            node.denied_by_roles.extend(denied_by_roles.iter().cloned());
            node.denied_by_principals.extend(denied_by_principals.iter().cloned());

            if !denied_by_principals.is_empty() {
                self.direct_denied.insert(role.clone());
            } else if self.granted.contains(role) {
                self.denied.insert(role.clone());
            }
        }
    }
}

//! Principal, resource and permission matching

use tracing::warn;

use super::decision::{Decision, Reason};
use crate::cache::expression_matches;
use crate::types::{Permission, Policy};

/// True if every principal of at least one AND group is presented
///
/// A policy naming no principal matches any subject with principals.
pub fn match_principals(subject: &[String], policy: &[Vec<String>]) -> bool {
    if subject.is_empty() {
        return false;
    }
    if policy.is_empty() {
        return true;
    }
    policy
        .iter()
        .any(|group| group.iter().all(|principal| subject.contains(principal)))
}

/// True if any role policy principal is presented
pub fn match_role_policy_principals(subject: &[String], policy: &[String]) -> bool {
    if subject.is_empty() {
        return false;
    }
    policy.is_empty() || policy.iter().any(|principal| subject.contains(principal))
}

/// True if `resource` is one of `resources` or matches one of `expressions`
///
/// Both lists empty means any resource. Invalid expressions never match.
pub fn match_resource(resource: &str, resources: &[String], expressions: &[String]) -> bool {
    if resources.is_empty() && expressions.is_empty() {
        return true;
    }
    resources.iter().any(|r| r == resource)
        || expressions
            .iter()
            .any(|expression| regex_match(expression, resource))
}

/// True if some permission of `policy` covers `action` on `resource`
pub fn match_resource_action(policy: &Policy, resource: &str, action: &str) -> bool {
    if policy.permissions.is_empty() {
        return true;
    }
    policy.permissions.iter().any(|permission| {
        let resource_matches = permission.is_any_resource()
            || permission.resource == resource
            || (!permission.resource_expression.is_empty()
                && regex_match(&permission.resource_expression, resource));
        resource_matches
            && (permission.actions.is_empty() || permission.actions.iter().any(|a| a == action))
    })
}

fn regex_match(expression: &str, resource: &str) -> bool {
    expression_matches(expression, resource).unwrap_or_else(|e| {
        warn!(expression = %expression, error = %e, "Invalid resource expression");
        false
    })
}

/// Deny overrides grant
pub fn combine(granted: usize, denied: usize) -> Decision {
    if denied > 0 {
        Decision::deny(Reason::DenyPolicyFound)
    } else if granted > 0 {
        Decision::allow(Reason::GrantPolicyFound)
    } else {
        Decision::deny(Reason::NoApplicablePolicies)
    }
}

/// Subtract denied permissions from granted ones
///
/// A denied permission applies to a granted one when it names no resource,
/// names the same resource, or has an expression matching the granted
/// resource. An expression that fails to compile is treated as matching.
/// Denied actions are removed, and a deny without actions removes them all.
/// A granted permission left without actions is dropped.
pub fn calculate_permissions(granted: Vec<Permission>, denied: &[Permission]) -> Vec<Permission> {
    if denied.is_empty() {
        return granted;
    }

    let mut remaining = Vec::with_capacity(granted.len());
    'granted: for mut permission in granted {
        for deny in denied {
            let by_expression = !deny.resource_expression.is_empty()
                && expression_matches(&deny.resource_expression, &permission.resource).unwrap_or(true);
            let applies = deny.is_any_resource() || by_expression || deny.resource == permission.resource;
            if !applies {
                continue;
            }
            if deny.actions.is_empty() {
                continue 'granted;
            }
            permission.actions.retain(|action| !deny.actions.contains(action));
            if permission.actions.is_empty() {
                continue 'granted;
            }
        }
        remaining.push(permission);
    }
    remaining
}

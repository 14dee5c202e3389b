//! Role resolution
//!
//! Computes every role a subject holds through role policies, including roles
//! granted to other roles (`role:<name>` principals), while honouring denies.
//!
//! # Algorithm
//!
//! 1. Role policies matching the subject's own principals are applied, denies
//!    first. A role denied directly by a subject principal is never granted.
//! 2. Granted roles are expanded breadth first through grant policies naming
//!    `role:<name>` principals.
//! 3. Deny policies naming any granted role are applied, recording deny edges.
//! 4. The role graph is pruned to granted roles.
//! 5. Denies are settled round by round: a role is denied once some role
//!    denying it is itself not denied, and its descendants reachable only
//!    through it are dropped with it. When no deny can be settled this way,
//!    the remaining denied roles are all dropped in name order.
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashSet;
//! use std::sync::Arc;
//! use warden_authz::roles::{resolve_roles, MatchedRolePolicies, RolePolicySource};
//! use warden_authz::types::{Effect, RolePolicy};
//!
//! struct Fixed(Vec<Arc<RolePolicy>>);
//!
//! impl RolePolicySource for Fixed {
//!     fn direct_role_policies(
//!         &mut self,
//!         principals: &[String],
//!         seen: &HashSet<String>,
//!     ) -> warden_authz::Result<MatchedRolePolicies> {
//!         let mut matched = MatchedRolePolicies::default();
//!         for policy in &self.0 {
//!             if seen.contains(&policy.id) || !policy.principals.iter().any(|p| principals.contains(p)) {
//!                 continue;
//!             }
//!             match policy.effect {
//!                 Effect::Grant => matched.granted.push(policy.clone()),
//!                 Effect::Deny => matched.denied.push(policy.clone()),
//!             }
//!         }
//!         Ok(matched)
//!     }
//! }
//!
//! let mut source = Fixed(vec![
//!     Arc::new(RolePolicy::new("rp1", Effect::Grant, &["role1"]).with_principals(&["user:bill"])),
//!     Arc::new(RolePolicy::new("rp2", Effect::Grant, &["role2"]).with_principals(&["role:role1"])),
//! ]);
//! let roles = resolve_roles(&mut source, &["user:bill".to_string()]).unwrap();
//! assert_eq!(roles.into_iter().collect::<Vec<_>>(), vec!["role1", "role2"]);
//! ```

pub mod graph;
pub mod resolver;


pub use graph::{RoleGraph, RoleNode};
pub use resolver::{resolve_roles, MatchedRolePolicies, RolePolicySource, ANY_PRINCIPAL};

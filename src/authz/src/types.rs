//! Policy model types
//!
//! These are the shapes the policy store hands to the runtime caches. All of
//! them deserialize from the platform's JSON layout, so a snapshot like
//! `{"services":[{"name":"erp","policies":[...]}]}` loads directly.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique policy identifier within a service
pub type PolicyId = String;

/// Name of the cross-service service
pub const GLOBAL_SERVICE: &str = "global";

/// Policy effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    /// Grant access
    Grant,
    /// Deny access
    Deny,
}

impl std::fmt::Display for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Effect::Grant => write!(f, "grant"),
            Effect::Deny => write!(f, "deny"),
        }
    }
}

/// A resource (or resource expression) with the actions allowed on it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    /// Exact resource name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource: String,

    /// Regular expression over resource names
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_expression: String,

    /// Actions; empty means every action
    #[serde(default)]
    pub actions: Vec<String>,
}

impl Permission {
    /// Permission on an exact resource
    pub fn new(resource: impl Into<String>, actions: &[&str]) -> Self {
        Self {
            resource: resource.into(),
            resource_expression: String::new(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Permission on every resource matching `expression`
    pub fn with_expression(expression: impl Into<String>, actions: &[&str]) -> Self {
        Self {
            resource: String::new(),
            resource_expression: expression.into(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// True if neither a resource nor an expression is set
    pub fn is_any_resource(&self) -> bool {
        self.resource.is_empty() && self.resource_expression.is_empty()
    }
}

/// Grant/deny rule mapping principals to permissions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Policy identifier
    pub id: PolicyId,

    /// Human readable name
    #[serde(default)]
    pub name: String,

    /// Grant or deny
    pub effect: Effect,

    /// Permissions; empty means any permission
    #[serde(default)]
    pub permissions: Vec<Permission>,

    /// OR of AND principal groups; empty means any principal
    #[serde(default)]
    pub principals: Vec<Vec<String>>,

    /// Boolean condition over request attributes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Opaque metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Policy {
    /// Create a policy with no permissions, principals or condition
    pub fn new(id: impl Into<String>, effect: Effect) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            effect,
            permissions: Vec::new(),
            principals: Vec::new(),
            condition: None,
            metadata: HashMap::new(),
        }
    }

    /// Add a permission
    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.push(permission);
        self
    }

    /// Add an AND group of principals
    pub fn with_principals(mut self, group: &[&str]) -> Self {
        self.principals
            .push(group.iter().map(|p| p.to_string()).collect());
        self
    }

    /// Set the condition
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Condition expression, if one is set and non-empty
    pub fn condition(&self) -> Option<&str> {
        self.condition.as_deref().filter(|c| !c.is_empty())
    }
}

/// Grant/deny rule mapping principals to roles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolePolicy {
    /// Role policy identifier
    pub id: PolicyId,

    /// Human readable name
    #[serde(default)]
    pub name: String,

    /// Grant or deny
    pub effect: Effect,

    /// Roles granted or denied
    #[serde(default)]
    pub roles: Vec<String>,

    /// OR list of principals; `role:<name>` entries reference other roles
    #[serde(default)]
    pub principals: Vec<String>,

    /// Exact resources the role applies to
    #[serde(default)]
    pub resources: Vec<String>,

    /// Resource expressions the role applies to
    #[serde(default)]
    pub resource_expressions: Vec<String>,

    /// Boolean condition over request attributes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Opaque metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl RolePolicy {
    /// Create a role policy for `roles` with no principals or resources
    pub fn new(id: impl Into<String>, effect: Effect, roles: &[&str]) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            effect,
            roles: roles.iter().map(|r| r.to_string()).collect(),
            principals: Vec::new(),
            resources: Vec::new(),
            resource_expressions: Vec::new(),
            condition: None,
            metadata: HashMap::new(),
        }
    }

    /// Set the principal list
    pub fn with_principals(mut self, principals: &[&str]) -> Self {
        self.principals = principals.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Add an exact resource
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resources.push(resource.into());
        self
    }

    /// Add a resource expression
    pub fn with_resource_expression(mut self, expression: impl Into<String>) -> Self {
        self.resource_expressions.push(expression.into());
        self
    }

    /// Set the condition
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Condition expression, if one is set and non-empty
    pub fn condition(&self) -> Option<&str> {
        self.condition.as_deref().filter(|c| !c.is_empty())
    }

    /// True if the role policy is not scoped to any resource
    pub fn is_any_resource(&self) -> bool {
        self.resources.is_empty() && self.resource_expressions.is_empty()
    }
}

/// Named container of policies and role policies
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// Service name
    pub name: String,

    /// Free-form service type
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Policies
    #[serde(default)]
    pub policies: Vec<Policy>,

    /// Role policies
    #[serde(default)]
    pub role_policies: Vec<RolePolicy>,

    /// Opaque metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Service {
    /// Create an empty service
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a policy
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policies.push(policy);
        self
    }

    /// Add a role policy
    pub fn with_role_policy(mut self, role_policy: RolePolicy) -> Self {
        self.role_policies.push(role_policy);
        self
    }
}

/// Custom function definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDef {
    /// Function name used in conditions
    pub name: String,

    /// Description
    #[serde(default)]
    pub description: String,

    /// Remote URL called with the arguments
    #[serde(rename = "funcURL", default)]
    pub func_url: String,

    /// URL used when the caller runs next to the function service
    #[serde(rename = "localFuncURL", default)]
    pub local_func_url: String,

    /// PEM encoded CA trusted for https calls
    #[serde(default)]
    pub ca: String,

    /// Cache successful results by arguments
    #[serde(default)]
    pub result_cachable: bool,

    /// Cache lifetime in seconds; 0 keeps results forever
    #[serde(rename = "resultTTL", default)]
    pub result_ttl: i64,

    /// Opaque metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Full content of a policy store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStoreSnapshot {
    /// Custom functions
    #[serde(default)]
    pub functions: Vec<FunctionDef>,

    /// Services
    #[serde(default)]
    pub services: Vec<Service>,
}

impl PolicyStoreSnapshot {
    /// Parse a snapshot from JSON
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

//! Request, decision and diagnosis types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::principal::Principal;
use crate::types::{Effect, Permission, Policy, RolePolicy};

/// The caller being authorized
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    /// Presented principals
    #[serde(default)]
    pub principals: Vec<Principal>,

    /// Identity token type, checked by the token asserter
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token_type: String,

    /// Identity token
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,

    /// Whether the token has already been asserted
    #[serde(default)]
    pub asserted: bool,
}

impl Subject {
    /// Subject without principals or token
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a principal
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principals.push(principal);
        self
    }

    /// Attach an identity token
    pub fn with_token(mut self, token_type: impl Into<String>, token: impl Into<String>) -> Self {
        self.token_type = token_type.into();
        self.token = token.into();
        self
    }

    /// True if the token still has to be checked
    pub fn needs_assertion(&self) -> bool {
        !self.asserted && !self.token_type.is_empty() && !self.token.is_empty()
    }
}

/// An authorization request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    /// Caller; `None` is an anonymous request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,

    /// Target service
    pub service_name: String,

    /// Requested resource
    #[serde(default)]
    pub resource: String,

    /// Requested action
    #[serde(default)]
    pub action: String,

    /// Caller supplied condition attributes
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, Value>,
}

impl RequestContext {
    /// Anonymous request for `action` on `resource` in `service_name`
    pub fn new(
        service_name: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            subject: None,
            service_name: service_name.into(),
            resource: resource.into(),
            action: action.into(),
            attributes: HashMap::new(),
        }
    }

    /// Set the subject
    pub fn with_subject(mut self, subject: Subject) -> Self {
        self.subject = Some(subject);
        self
    }

    /// Add a condition attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Why a decision was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    /// A grant policy matched and no deny policy did
    GrantPolicyFound,
    /// A deny policy matched
    DenyPolicyFound,
    /// The target service is not loaded
    ServiceNotFound,
    /// No policy matched
    NoApplicablePolicies,
    /// Evaluation failed
    ErrorInEvaluation,
    /// The request was recorded in discover mode
    DiscoverMode,
    /// No reason available
    ReasonNotAvailable,
}

impl Reason {
    /// Platform name of the reason
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::GrantPolicyFound => "GRANT_POLICY_FOUND",
            Reason::DenyPolicyFound => "DENY_POLICY_FOUND",
            Reason::ServiceNotFound => "SERVICE_NOT_FOUND",
            Reason::NoApplicablePolicies => "NO_APPLICABLE_POLICIES",
            Reason::ErrorInEvaluation => "ERROR_IN_EVALUATION",
            Reason::DiscoverMode => "DISCOVER_MODE",
            Reason::ReasonNotAvailable => "REASON_NOT_AVAILABLE",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of `is_allowed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the request is allowed
    pub allowed: bool,
    /// Why
    pub reason: Reason,
}

impl Decision {
    /// Allowing decision
    pub fn allow(reason: Reason) -> Self {
        Self { allowed: true, reason }
    }

    /// Denying decision
    pub fn deny(reason: Reason) -> Self {
        Self { allowed: false, reason }
    }
}

/// How a policy took part in a diagnosed decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EvaluationStatus {
    /// The policy decided the outcome
    TakeEffect,
    /// The policy matched but its condition did not hold
    ConditionFailed,
    /// The policy matched after the outcome was already decided
    Ignored,
}

/// A condition and what it evaluated to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatedCondition {
    /// Condition expression
    pub expression: String,
    /// Evaluation result; `None` when the condition was not consulted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<bool>,
}

impl EvaluatedCondition {
    fn new(expression: Option<&str>, result: Option<bool>) -> Option<Self> {
        expression.map(|expression| Self {
            expression: expression.to_string(),
            result,
        })
    }
}

/// A policy recorded by `diagnose`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatedPolicy {
    pub status: EvaluationStatus,
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<Permission>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub principals: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<EvaluatedCondition>,
}

impl EvaluatedPolicy {
    fn new(policy: &Policy, status: EvaluationStatus, result: Option<bool>) -> Self {
        Self {
            status,
            id: policy.id.clone(),
            name: policy.name.clone(),
            effect: policy.effect,
            permissions: policy.permissions.clone(),
            principals: policy.principals.clone(),
            condition: EvaluatedCondition::new(policy.condition(), result),
        }
    }
}

/// A role policy recorded by `diagnose`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatedRolePolicy {
    pub status: EvaluationStatus,
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub effect: Effect,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub principals: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_expressions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<EvaluatedCondition>,
}

/// Everything `diagnose` learned about a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    /// Final decision
    pub allowed: bool,

    /// Reason of the final decision
    pub reason: Reason,

    /// The request, after token assertion
    pub request_context: RequestContext,

    /// Attributes the conditions were evaluated against
    #[serde(default)]
    pub attributes: HashMap<String, Value>,

    /// Roles granted to the subject
    #[serde(default)]
    pub granted_roles: Vec<String>,

    /// Role policies evaluated during role resolution, in evaluation order
    #[serde(default)]
    pub role_policies: Vec<EvaluatedRolePolicy>,

    /// Policies evaluated for the request
    #[serde(default)]
    pub policies: Vec<EvaluatedPolicy>,
}

impl EvaluationResult {
    /// Empty result for `request`
    pub fn new(request: RequestContext) -> Self {
        Self {
            allowed: false,
            reason: Reason::ReasonNotAvailable,
            request_context: request,
            attributes: HashMap::new(),
            granted_roles: Vec::new(),
            role_policies: Vec::new(),
            policies: Vec::new(),
        }
    }

    /// Policies with the given status
    pub fn policies_with_status(&self, status: EvaluationStatus) -> impl Iterator<Item = &EvaluatedPolicy> {
        self.policies.iter().filter(move |p| p.status == status)
    }

    pub(crate) fn record_role_policy(&mut self, policy: &RolePolicy, result: bool) {
        let status = if result {
            EvaluationStatus::TakeEffect
        } else {
            EvaluationStatus::ConditionFailed
        };
        self.role_policies.push(EvaluatedRolePolicy {
            status,
            id: policy.id.clone(),
            name: policy.name.clone(),
            effect: policy.effect,
            roles: policy.roles.clone(),
            principals: policy.principals.clone(),
            resources: policy.resources.clone(),
            resource_expressions: policy.resource_expressions.clone(),
            condition: EvaluatedCondition::new(policy.condition(), Some(result)),
        });
    }

    pub(crate) fn record_failed_policy(&mut self, policy: &Policy) {
        self.policies
            .push(EvaluatedPolicy::new(policy, EvaluationStatus::ConditionFailed, Some(false)));
    }

    /// Record matched policies; the first deny, or else the first grant, takes
    /// effect and every later one is ignored
    pub(crate) fn record_matched_policies<'a, I, J>(&mut self, granted: I, denied: J)
    where
        I: IntoIterator<Item = &'a Policy>,
        J: IntoIterator<Item = &'a Policy>,
    {
        let mut decided = false;
        for policy in denied.into_iter().chain(granted) {
            let evaluated = if decided {
                EvaluatedPolicy::new(policy, EvaluationStatus::Ignored, None)
            } else {
                decided = true;
                EvaluatedPolicy::new(policy, EvaluationStatus::TakeEffect, Some(true))
            };
            self.policies.push(evaluated);
        }
    }
}

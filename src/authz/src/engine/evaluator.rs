//! Synchronous evaluation pipeline
//!
//! Every operation takes the store read lock for its whole duration and,
//! nested inside, the read locks of the target and global services. Each
//! lock is taken once per request; nothing below [`Evaluator::run`] locks
//! again.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use super::context::{populate, PopulatedRequest, TokenAsserter};
use super::decision::{Decision, EvaluationResult, Reason, RequestContext};
use super::matching::{
    calculate_permissions, combine, match_principals, match_resource, match_resource_action,
    match_role_policy_principals,
};
use crate::cache::Indexable;
use crate::cel::{CompiledCondition, EvalContext};
use crate::error::Result;
use crate::function::FunctionTable;
use crate::principal::role_principal;
use crate::roles::{resolve_roles, MatchedRolePolicies, RolePolicySource};
use crate::runtime::{ConditionTarget, ConditionUpdate, RuntimePolicyStore, RuntimeService, ServiceCaches};
use crate::types::{Effect, Permission, Policy};

/// Evaluates requests against a [`RuntimePolicyStore`]
///
/// Usable from any thread; it never awaits.
#[derive(Clone)]
pub struct Evaluator {
    store: Arc<RuntimePolicyStore>,
    asserter: Option<Arc<dyn TokenAsserter>>,
}

impl Evaluator {
    /// Evaluator without a token asserter
    pub fn new(store: Arc<RuntimePolicyStore>) -> Self {
        Self { store, asserter: None }
    }

    /// Check subject tokens with `asserter`
    pub fn with_asserter(mut self, asserter: Arc<dyn TokenAsserter>) -> Self {
        self.asserter = Some(asserter);
        self
    }

    /// The runtime store
    pub fn store(&self) -> &Arc<RuntimePolicyStore> {
        &self.store
    }

    /// Decide whether the request is allowed
    ///
    /// # Errors
    /// `ServiceNotFound` if the target service is not loaded, and
    /// `TokenAssertion` if the subject's token is rejected. Use
    /// [`AuthzError::reason`](crate::AuthzError::reason) for the reason code.
    pub fn is_allowed(&self, request: &RequestContext) -> Result<Decision> {
        self.evaluate(request, None)
    }

    /// Evaluate the request and report every role policy and policy involved
    pub fn diagnose(&self, request: &RequestContext) -> Result<EvaluationResult> {
        let mut result = EvaluationResult::new(request.clone());
        let decision = self.evaluate(request, Some(&mut result))?;
        result.allowed = decision.allowed;
        result.reason = decision.reason;
        Ok(result)
    }

    /// Every role granted to the request's subject, sorted by name
    pub fn get_all_granted_roles(&self, request: &RequestContext) -> Result<Vec<String>> {
        self.run(request, |pipeline| {
            let roles = pipeline.resolve_roles(None)?;
            Ok(roles.into_iter().collect())
        })
    }

    /// Every permission granted to the request's subject on named resources
    ///
    /// Only permissions naming an exact resource are reported; grants through
    /// resource expressions are left out. Denied permissions are subtracted
    /// action by action.
    pub fn get_all_granted_permissions(&self, request: &RequestContext) -> Result<Vec<Permission>> {
        self.run(request, |pipeline| {
            if pipeline.policies_empty() {
                return Ok(Vec::new());
            }
            let roles = pipeline.resolve_roles(None)?;
            let principals = pipeline.principals_with_roles(&roles);
            let (granted, denied) = pipeline.matched_policies(&principals, false, None);

            if denied.iter().any(|policy| policy.permissions.is_empty()) {
                return Ok(Vec::new());
            }

            let granted_permissions: Vec<Permission> = granted
                .iter()
                .flat_map(|policy| policy.permissions.iter())
                .filter(|permission| !permission.resource.is_empty())
                .map(|permission| Permission {
                    resource: permission.resource.clone(),
                    resource_expression: String::new(),
                    actions: permission.actions.clone(),
                })
                .collect();
            let denied_permissions: Vec<Permission> = denied
                .iter()
                .flat_map(|policy| policy.permissions.iter().cloned())
                .collect();

            Ok(calculate_permissions(granted_permissions, &denied_permissions))
        })
    }

    fn evaluate(
        &self,
        request: &RequestContext,
        mut diagnosis: Option<&mut EvaluationResult>,
    ) -> Result<Decision> {
        self.run(request, |pipeline| {
            if let Some(result) = diagnosis.as_deref_mut() {
                result.request_context.subject = pipeline.request.subject.clone();
                result.attributes = pipeline.request.attributes.attributes().clone();
            }

            if pipeline.policies_empty() {
                debug!(service = %request.service_name, "No policies in service");
                return Ok(Decision::deny(Reason::NoApplicablePolicies));
            }

            let roles = pipeline.resolve_roles(diagnosis.as_deref_mut())?;
            let principals = pipeline.principals_with_roles(&roles);
            if let Some(result) = diagnosis.as_deref_mut() {
                result.granted_roles = roles.iter().cloned().collect();
            }

            let (granted, denied) = pipeline.matched_policies(&principals, true, diagnosis.as_deref_mut());
            if let Some(result) = diagnosis {
                result.record_matched_policies(
                    granted.iter().map(|p| p.as_ref()),
                    denied.iter().map(|p| p.as_ref()),
                );
            }

            let decision = combine(granted.len(), denied.len());
            debug!(
                service = %request.service_name,
                resource = %request.resource,
                action = %request.action,
                allowed = decision.allowed,
                reason = %decision.reason,
                "Evaluated request"
            );
            Ok(decision)
        })
    }

    /// Lock the store and the services of `request`, then run `f`
    fn run<R>(&self, request: &RequestContext, f: impl FnOnce(&Pipeline<'_>) -> Result<R>) -> Result<R> {
        let state = self.store.read();
        let populated = populate(&state, request, self.asserter.as_deref())?;

        let service_caches = populated.service.read();
        let global_caches = populated.global.as_ref().map(|global| (global, global.read()));

        let mut views = vec![ServiceView {
            service: &populated.service,
            caches: &*service_caches,
        }];
        if let Some((global, caches)) = &global_caches {
            views.push(ServiceView {
                service: global,
                caches: &**caches,
            });
        }

        let pipeline = Pipeline {
            store: &self.store,
            functions: state.functions(),
            views,
            request: &populated,
        };
        f(&pipeline)
    }
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("asserter", &self.asserter.is_some())
            .finish()
    }
}

struct ServiceView<'a> {
    service: &'a Arc<RuntimeService>,
    caches: &'a ServiceCaches,
}

/// One request with every lock it needs held
struct Pipeline<'a> {
    store: &'a RuntimePolicyStore,
    functions: &'a FunctionTable,
    /// Target service first, then the global service
    views: Vec<ServiceView<'a>>,
    request: &'a PopulatedRequest,
}

impl Pipeline<'_> {
    fn policies_empty(&self) -> bool {
        self.views.iter().all(|view| view.caches.policies.is_empty())
    }

    fn resolve_roles(&self, diagnosis: Option<&mut EvaluationResult>) -> Result<BTreeSet<String>> {
        let mut source = RoleQuery {
            pipeline: self,
            diagnosis,
        };
        resolve_roles(&mut source, &self.request.principals)
    }

    fn principals_with_roles(&self, roles: &BTreeSet<String>) -> Vec<String> {
        let mut principals = self.request.principals.clone();
        principals.extend(roles.iter().map(|role| role_principal(role)));
        principals
    }

    /// Policies applying to `principals` whose condition holds, split by effect
    fn matched_policies(
        &self,
        principals: &[String],
        match_resource: bool,
        mut diagnosis: Option<&mut EvaluationResult>,
    ) -> (Vec<Arc<Policy>>, Vec<Arc<Policy>>) {
        let resource = match_resource.then_some(self.request.resource.as_str());
        let mut granted = Vec::new();
        let mut denied = Vec::new();

        for view in &self.views {
            for (id, policy) in view.caches.policies.related(principals, resource) {
                if !match_principals(principals, &policy.principals) {
                    continue;
                }
                if match_resource
                    && !match_resource_action(&policy, &self.request.resource, &self.request.action)
                {
                    continue;
                }

                let cached = view.caches.policies.condition(&id);
                if self.condition_holds(view.service, ConditionTarget::Policy, policy.as_ref(), cached) {
                    match policy.effect {
                        Effect::Grant => granted.push(policy),
                        Effect::Deny => denied.push(policy),
                    }
                } else if let Some(result) = diagnosis.as_deref_mut() {
                    result.record_failed_policy(&policy);
                }
            }
        }
        (granted, denied)
    }

    /// Evaluate the condition of `entry`, compiling it when it is not cached
    ///
    /// A missing condition holds. Compile and evaluation failures are logged
    /// and count as a condition that does not hold.
    fn condition_holds<T: Indexable>(
        &self,
        service: &Arc<RuntimeService>,
        target: ConditionTarget,
        entry: &T,
        cached: Option<Arc<dyn CompiledCondition>>,
    ) -> bool {
        let Some(expression) = entry.condition() else {
            return true;
        };

        let condition = match cached {
            Some(condition) => condition,
            None => {
                let Ok(condition) = self.store.compile_condition(entry.id(), expression, self.functions) else {
                    return false;
                };
                self.store.publish_condition(ConditionUpdate {
                    service: service.clone(),
                    target,
                    id: entry.id().to_string(),
                    condition: condition.clone(),
                });
                condition
            }
        };

        evaluate_condition(condition.as_ref(), &self.request.attributes, entry.id())
    }
}

fn evaluate_condition(condition: &dyn CompiledCondition, attributes: &EvalContext, id: &str) -> bool {
    match condition.evaluate(attributes) {
        Ok(result) => result,
        Err(e) => {
            warn!(id = %id, expression = %condition.expression(), error = %e, "Condition evaluation failed");
            false
        }
    }
}

/// Role policy lookups for the role resolver
struct RoleQuery<'p, 'a, 'd> {
    pipeline: &'p Pipeline<'a>,
    diagnosis: Option<&'d mut EvaluationResult>,
}

impl RolePolicySource for RoleQuery<'_, '_, '_> {
    fn direct_role_policies(
        &mut self,
        principals: &[String],
        seen: &HashSet<String>,
    ) -> Result<MatchedRolePolicies> {
        let pipeline = self.pipeline;
        let resource = pipeline.request.resource.as_str();
        let mut matched = MatchedRolePolicies::default();

        for view in &pipeline.views {
            for (id, policy) in view.caches.role_policies.related(principals, Some(resource)) {
                if seen.contains(&id) {
                    continue;
                }
                if !match_role_policy_principals(principals, &policy.principals)
                    || !match_resource(resource, &policy.resources, &policy.resource_expressions)
                {
                    continue;
                }

                let cached = view.caches.role_policies.condition(&id);
                let holds = pipeline.condition_holds(
                    view.service,
                    ConditionTarget::RolePolicy,
                    policy.as_ref(),
                    cached,
                );
                if let Some(result) = self.diagnosis.as_deref_mut() {
                    result.record_role_policy(&policy, holds);
                }
                if holds {
                    match policy.effect {
                        Effect::Grant => matched.granted.push(policy),
                        Effect::Deny => matched.denied.push(policy),
                    }
                }
            }
        }
        Ok(matched)
    }
}

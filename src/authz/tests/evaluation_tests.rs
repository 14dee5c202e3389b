//! Request evaluation tests
//!
//! Covers decisions, role resolution, granted permissions, conditions and
//! diagnosis through the synchronous `Evaluator`.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use warden_authz::cel::CelConditionEngine;
use warden_authz::function::{FunctionResolver, HttpFunctionResolver};
use warden_authz::{
    AuthzError, Effect, EvaluationStatus, Evaluator, FunctionDef, Permission, Policy,
    PolicyStoreSnapshot, Principal, Reason, RequestContext, Result, RolePolicy,
    RuntimePolicyStore, Service, Subject,
};

fn runtime_with(snapshot: PolicyStoreSnapshot, resolver: Arc<dyn FunctionResolver>) -> Arc<RuntimePolicyStore> {
    let runtime = RuntimePolicyStore::new(Arc::new(CelConditionEngine::new()), resolver);
    runtime.reload(snapshot);
    Arc::new(runtime)
}

fn evaluator(services: Vec<Service>) -> Evaluator {
    let snapshot = PolicyStoreSnapshot {
        functions: vec![],
        services,
    };
    let resolver = Arc::new(HttpFunctionResolver::new(Duration::from_secs(1)));
    Evaluator::new(runtime_with(snapshot, resolver))
}

fn bill() -> Subject {
    Subject::new().with_principal(Principal::user("bill"))
}

fn request(subject: Subject, service: &str, resource: &str, action: &str) -> RequestContext {
    RequestContext::new(service, resource, action).with_subject(subject)
}

fn grant(id: &str, principal: &str, resource: &str, actions: &[&str]) -> Policy {
    Policy::new(id, Effect::Grant)
        .with_principals(&[principal])
        .with_permission(Permission::new(resource, actions))
}

fn deny(id: &str, principal: &str, resource: &str, actions: &[&str]) -> Policy {
    Policy::new(id, Effect::Deny)
        .with_principals(&[principal])
        .with_permission(Permission::new(resource, actions))
}

// ============================================================================
// DECISION TESTS
// ============================================================================

#[test]
fn test_policy_store_scenario() {
    let snapshot = PolicyStoreSnapshot::from_json(
        r#"{"services":[{"name":"erp","policies":[{"id":"p1","effect":"grant",
            "permissions":[{"resource":"/node1","actions":["get"]}]}]}]}"#,
    )
    .unwrap();
    let evaluator = Evaluator::new(runtime_with(
        snapshot,
        Arc::new(HttpFunctionResolver::new(Duration::from_secs(1))),
    ));

    let decision = evaluator.is_allowed(&request(bill(), "erp", "/node1", "get")).unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.reason, Reason::GrantPolicyFound);

    let decision = evaluator.is_allowed(&request(bill(), "erp", "/node1", "post")).unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, Reason::NoApplicablePolicies);
}

#[test]
fn test_deny_overrides_grant() {
    let evaluator = evaluator(vec![Service::new("erp")
        .with_policy(grant("p1", "user:bill", "/node1", &["get"]))
        .with_policy(deny("p2", "user:bill", "/node1", &["get"]))]);

    let decision = evaluator.is_allowed(&request(bill(), "erp", "/node1", "get")).unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, Reason::DenyPolicyFound);
}

#[test]
fn test_no_policy_denies() {
    let evaluator = evaluator(vec![
        Service::new("erp"),
        Service::new("crm").with_policy(grant("p1", "user:bill", "/node1", &["get"])),
    ]);

    let decision = evaluator.is_allowed(&request(bill(), "erp", "/node1", "get")).unwrap();
    assert_eq!(decision.reason, Reason::NoApplicablePolicies);
    assert!(!decision.allowed);

    let decision = evaluator.is_allowed(&request(bill(), "crm", "/node2", "get")).unwrap();
    assert_eq!(decision.reason, Reason::NoApplicablePolicies);
}

#[test]
fn test_missing_service() {
    let evaluator = evaluator(vec![Service::new("erp")]);
    let err = evaluator
        .is_allowed(&request(bill(), "hr", "/node1", "get"))
        .unwrap_err();

    assert!(matches!(err, AuthzError::ServiceNotFound(ref name) if name == "hr"));
    assert_eq!(err.reason(), Reason::ServiceNotFound);
    assert_eq!(err.code(), Some("SPDL-2001"));
}

#[test]
fn test_idd_scoped_principals() {
    let evaluator = evaluator(vec![Service::new("erp")
        .with_policy(grant("p1", "idd=cisco:user:bill", "/node1", &["get"]))]);
    let check = |principal: Principal| {
        let subject = Subject::new().with_principal(principal);
        evaluator
            .is_allowed(&request(subject, "erp", "/node1", "get"))
            .unwrap()
            .allowed
    };

    assert!(!check(Principal::user("bill")));
    assert!(!check(Principal::user("bill").with_idd("intel")));
    assert!(check(Principal::user("bill").with_idd("cisco")));
}

#[test]
fn test_plain_principal_matches_any_idd() {
    let evaluator = evaluator(vec![Service::new("erp")
        .with_policy(grant("p1", "user:bill", "/node1", &["get"]))]);
    let subject = Subject::new().with_principal(Principal::user("bill").with_idd("cisco"));

    assert!(evaluator
        .is_allowed(&request(subject, "erp", "/node1", "get"))
        .unwrap()
        .allowed);
}

#[test]
fn test_and_principal_groups() {
    let policy = Policy::new("p1", Effect::Grant)
        .with_principals(&["user:bill", "group:admins"])
        .with_permission(Permission::new("/node1", &["get"]));
    let evaluator = evaluator(vec![Service::new("erp").with_policy(policy)]);

    let admin = bill().with_principal(Principal::group("admins"));
    assert!(evaluator.is_allowed(&request(admin, "erp", "/node1", "get")).unwrap().allowed);
    assert!(!evaluator.is_allowed(&request(bill(), "erp", "/node1", "get")).unwrap().allowed);
}

#[test]
fn test_builtin_roles() {
    let evaluator = evaluator(vec![Service::new("erp")
        .with_policy(grant("p1", "role:anonymous_role", "/public", &["get"]))
        .with_policy(grant("p2", "role:authenticated_role", "/private", &["get"]))
        .with_policy(grant("p3", "role:everyone_role", "/shared", &["get"]))]);

    let anonymous = RequestContext::new("erp", "/public", "get");
    assert!(evaluator.is_allowed(&anonymous).unwrap().allowed);
    assert!(!evaluator.is_allowed(&request(bill(), "erp", "/public", "get")).unwrap().allowed);

    assert!(evaluator.is_allowed(&request(bill(), "erp", "/private", "get")).unwrap().allowed);
    assert!(!evaluator
        .is_allowed(&RequestContext::new("erp", "/private", "get"))
        .unwrap()
        .allowed);

    assert!(evaluator.is_allowed(&RequestContext::new("erp", "/shared", "get")).unwrap().allowed);
    assert!(evaluator.is_allowed(&request(bill(), "erp", "/shared", "get")).unwrap().allowed);
}

#[test]
fn test_resource_expressions() {
    let policy = Policy::new("p1", Effect::Grant)
        .with_principals(&["user:bill"])
        .with_permission(Permission::with_expression("^/books/.*$", &["read"]))
        .with_permission(Permission::with_expression("^.*\\.pdf$", &["print"]));
    let evaluator = evaluator(vec![Service::new("library").with_policy(policy)]);

    let allowed = |resource: &str, action: &str| {
        evaluator
            .is_allowed(&request(bill(), "library", resource, action))
            .unwrap()
            .allowed
    };
    assert!(allowed("/books/rust", "read"));
    assert!(!allowed("/magazines/rust", "read"));
    assert!(allowed("/papers/cel.pdf", "print"));
    assert!(!allowed("/papers/cel.pdf", "read"));
}

#[test]
fn test_global_service_policies_apply() {
    let evaluator = evaluator(vec![
        Service::new("erp"),
        Service::new("global").with_policy(grant("g1", "user:bill", "/audit", &["read"])),
    ]);

    let decision = evaluator.is_allowed(&request(bill(), "erp", "/audit", "read")).unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.reason, Reason::GrantPolicyFound);

    let decision = evaluator.is_allowed(&request(bill(), "global", "/audit", "read")).unwrap();
    assert!(decision.allowed);
}

// ============================================================================
// ROLE RESOLUTION TESTS
// ============================================================================

#[test]
fn test_role_transitivity() {
    let evaluator = evaluator(vec![Service::new("erp")
        .with_role_policy(RolePolicy::new("rp1", Effect::Grant, &["role1"]).with_principals(&["user:bill"]))
        .with_role_policy(RolePolicy::new("rp2", Effect::Grant, &["role2"]).with_principals(&["role:role1"]))
        .with_policy(grant("p1", "role:role2", "/node1", &["get"]))]);

    let roles = evaluator
        .get_all_granted_roles(&request(bill(), "erp", "", ""))
        .unwrap();
    assert_eq!(roles, vec!["role1".to_string(), "role2".to_string()]);

    assert!(evaluator.is_allowed(&request(bill(), "erp", "/node1", "get")).unwrap().allowed);

    let alice = Subject::new().with_principal(Principal::user("alice"));
    assert!(evaluator
        .get_all_granted_roles(&request(alice, "erp", "", ""))
        .unwrap()
        .is_empty());
}

#[test]
fn test_role_denied_by_principal_is_excluded() {
    let evaluator = evaluator(vec![Service::new("erp")
        .with_role_policy(RolePolicy::new("rp1", Effect::Grant, &["role1"]).with_principals(&["user:bill"]))
        .with_role_policy(RolePolicy::new("rp2", Effect::Grant, &["role2"]).with_principals(&["role:role1"]))
        .with_role_policy(RolePolicy::new("rp3", Effect::Deny, &["role2"]).with_principals(&["user:bill"]))]);

    let roles = evaluator
        .get_all_granted_roles(&request(bill(), "erp", "", ""))
        .unwrap();
    assert_eq!(roles, vec!["role1".to_string()]);
}

#[test]
fn test_role_denied_by_denied_role_survives() {
    let evaluator = evaluator(vec![Service::new("erp")
        .with_role_policy(
            RolePolicy::new("rp1", Effect::Grant, &["role1", "role3"]).with_principals(&["user:bill"]),
        )
        .with_role_policy(RolePolicy::new("rp2", Effect::Grant, &["role2"]).with_principals(&["role:role1"]))
        .with_role_policy(RolePolicy::new("rp3", Effect::Deny, &["role2"]).with_principals(&["role:role3"]))
        .with_role_policy(RolePolicy::new("rp4", Effect::Deny, &["role3"]).with_principals(&["user:bill"]))]);

    let roles = evaluator
        .get_all_granted_roles(&request(bill(), "erp", "", ""))
        .unwrap();
    assert_eq!(roles, vec!["role1".to_string(), "role2".to_string()]);
}

#[test]
fn test_role_policy_resource_scope() {
    let evaluator = evaluator(vec![Service::new("erp")
        .with_role_policy(
            RolePolicy::new("rp1", Effect::Grant, &["editor"])
                .with_principals(&["user:bill"])
                .with_resource("/docs/1"),
        )
        .with_role_policy(
            RolePolicy::new("rp2", Effect::Grant, &["viewer"])
                .with_principals(&["user:bill"])
                .with_resource_expression("^/docs/.*$"),
        )
        .with_policy(Policy::new("p1", Effect::Grant).with_principals(&["role:editor"]))
        .with_policy(
            Policy::new("p2", Effect::Grant)
                .with_principals(&["role:viewer"])
                .with_permission(Permission::new("", &["read"])),
        )]);

    let allowed = |resource: &str, action: &str| {
        evaluator
            .is_allowed(&request(bill(), "erp", resource, action))
            .unwrap()
            .allowed
    };
    assert!(allowed("/docs/1", "write"));
    assert!(!allowed("/docs/2", "write"));
    assert!(allowed("/docs/2", "read"));
    assert!(!allowed("/images/1", "read"));
}

#[test]
fn test_role_policies_from_global_service() {
    let evaluator = evaluator(vec![
        Service::new("erp").with_policy(grant("p1", "role:auditor", "/ledger", &["read"])),
        Service::new("global")
            .with_role_policy(RolePolicy::new("rp1", Effect::Grant, &["auditor"]).with_principals(&["user:bill"])),
    ]);

    assert!(evaluator.is_allowed(&request(bill(), "erp", "/ledger", "read")).unwrap().allowed);
    assert_eq!(
        evaluator.get_all_granted_roles(&request(bill(), "erp", "", "")).unwrap(),
        vec!["auditor".to_string()]
    );
}

// ============================================================================
// GRANTED PERMISSION TESTS
// ============================================================================

#[test]
fn test_permission_subtraction() {
    let evaluator = evaluator(vec![Service::new("erp")
        .with_policy(grant("p1", "user:bill", "/node1", &["get", "create", "delete"]))
        .with_policy(deny("p2", "user:bill", "/node1", &["create", "delete"]))]);

    let permissions = evaluator
        .get_all_granted_permissions(&request(bill(), "erp", "", ""))
        .unwrap();
    assert_eq!(permissions, vec![Permission::new("/node1", &["get"])]);
}

#[test]
fn test_fully_denied_resource_is_dropped() {
    let evaluator = evaluator(vec![Service::new("erp")
        .with_policy(grant("p1", "user:bill", "/node1", &["get"]))
        .with_policy(grant("p2", "user:bill", "/node2", &["get", "put"]))
        .with_policy(deny("p3", "user:bill", "/node1", &["get"]))]);

    let permissions = evaluator
        .get_all_granted_permissions(&request(bill(), "erp", "", ""))
        .unwrap();
    assert_eq!(permissions, vec![Permission::new("/node2", &["get", "put"])]);
}

#[test]
fn test_granted_permissions_skip_expressions_and_blanket_denies() {
    let evaluator = evaluator(vec![Service::new("erp")
        .with_policy(grant("p1", "user:bill", "/node1", &["get"]))
        .with_policy(
            Policy::new("p2", Effect::Grant)
                .with_principals(&["user:bill"])
                .with_permission(Permission::with_expression("^/books/.*$", &["read"])),
        )]);
    assert_eq!(
        evaluator
            .get_all_granted_permissions(&request(bill(), "erp", "", ""))
            .unwrap(),
        vec![Permission::new("/node1", &["get"])]
    );

    let blanket = self::evaluator(vec![Service::new("erp")
        .with_policy(grant("p1", "user:bill", "/node1", &["get"]))
        .with_policy(Policy::new("p2", Effect::Deny).with_principals(&["user:bill"]))]);
    assert!(blanket
        .get_all_granted_permissions(&request(bill(), "erp", "", ""))
        .unwrap()
        .is_empty());
}

#[test]
fn test_granted_permissions_through_roles() {
    let evaluator = evaluator(vec![Service::new("erp")
        .with_role_policy(RolePolicy::new("rp1", Effect::Grant, &["clerk"]).with_principals(&["user:bill"]))
        .with_policy(grant("p1", "role:clerk", "/invoices", &["read", "approve"]))
        .with_policy(deny("p2", "user:bill", "/invoices", &["approve"]))]);

    assert_eq!(
        evaluator
            .get_all_granted_permissions(&request(bill(), "erp", "", ""))
            .unwrap(),
        vec![Permission::new("/invoices", &["read"])]
    );
}

// ============================================================================
// CONDITION TESTS
// ============================================================================

#[test]
fn test_conditions_on_subject_and_attributes() {
    let evaluator = evaluator(vec![Service::new("erp")
        .with_policy(
            grant("p1", "role:everyone_role", "/orders", &["approve"])
                .with_condition("request_user == 'bill' && amount < 1000"),
        )]);

    let small = request(bill(), "erp", "/orders", "approve").with_attribute("amount", json!(250));
    assert!(evaluator.is_allowed(&small).unwrap().allowed);

    let large = request(bill(), "erp", "/orders", "approve").with_attribute("amount", json!(5000));
    assert!(!evaluator.is_allowed(&large).unwrap().allowed);

    // Missing attributes fail the condition instead of the request
    let decision = evaluator
        .is_allowed(&request(bill(), "erp", "/orders", "approve"))
        .unwrap();
    assert_eq!(decision.reason, Reason::NoApplicablePolicies);
}

#[test]
fn test_broken_condition_does_not_block_other_policies() {
    let evaluator = evaluator(vec![Service::new("erp")
        .with_policy(deny("p1", "user:bill", "/node1", &["get"]).with_condition("request_user =="))
        .with_policy(grant("p2", "user:bill", "/node1", &["get"]))]);

    let decision = evaluator.is_allowed(&request(bill(), "erp", "/node1", "get")).unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.reason, Reason::GrantPolicyFound);
}

#[test]
fn test_builtin_functions_in_conditions() {
    let evaluator = evaluator(vec![Service::new("erp")
        .with_policy(grant("p1", "user:bill", "/node1", &["get"]).with_condition("Sum(1, 2) == 3.0"))
        .with_policy(
            grant("p2", "user:bill", "/node2", &["get"]).with_condition("Max(1.0, 2.0) > 5.0"),
        )]);

    assert!(evaluator.is_allowed(&request(bill(), "erp", "/node1", "get")).unwrap().allowed);
    assert!(!evaluator.is_allowed(&request(bill(), "erp", "/node2", "get")).unwrap().allowed);
}

#[test]
fn test_role_policy_condition() {
    let evaluator = evaluator(vec![Service::new("erp").with_role_policy(
        RolePolicy::new("rp1", Effect::Grant, &["night_shift"])
            .with_principals(&["user:bill"])
            .with_condition("shift == 'night'"),
    )]);

    let night = request(bill(), "erp", "", "").with_attribute("shift", json!("night"));
    assert_eq!(
        evaluator.get_all_granted_roles(&night).unwrap(),
        vec!["night_shift".to_string()]
    );

    let day = request(bill(), "erp", "", "").with_attribute("shift", json!("day"));
    assert!(evaluator.get_all_granted_roles(&day).unwrap().is_empty());
}

struct ManagerDirectory {
    calls: AtomicUsize,
}

impl FunctionResolver for ManagerDirectory {
    fn call(&self, function: &FunctionDef, params: &[Value]) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(function.name, "IsManager");
        Ok(json!(params.first() == Some(&json!("bill"))))
    }
}

#[test]
fn test_custom_function_in_condition() {
    let directory = Arc::new(ManagerDirectory {
        calls: AtomicUsize::new(0),
    });
    let snapshot = PolicyStoreSnapshot {
        functions: vec![FunctionDef {
            name: "IsManager".to_string(),
            func_url: "http://directory.local/is-manager".to_string(),
            result_cachable: true,
            result_ttl: 0,
            ..Default::default()
        }],
        services: vec![Service::new("erp")
            .with_policy(grant("p1", "role:everyone_role", "/reports", &["read"]).with_condition("IsManager(request_user)"))],
    };
    let evaluator = Evaluator::new(runtime_with(snapshot, directory.clone()));

    assert!(evaluator.is_allowed(&request(bill(), "erp", "/reports", "read")).unwrap().allowed);
    assert!(evaluator.is_allowed(&request(bill(), "erp", "/reports", "read")).unwrap().allowed);
    // Cached after the first call
    assert_eq!(directory.calls.load(Ordering::SeqCst), 1);

    let alice = Subject::new().with_principal(Principal::user("alice"));
    assert!(!evaluator.is_allowed(&request(alice, "erp", "/reports", "read")).unwrap().allowed);
    assert_eq!(directory.calls.load(Ordering::SeqCst), 2);
}

// ============================================================================
// TOKEN ASSERTION TESTS
// ============================================================================

#[test]
fn test_token_asserter() {
    let asserter = |subject: &mut Subject| -> Result<()> {
        match subject.token.as_str() {
            "bill-token" => {
                subject.principals.push(Principal::user("bill"));
                Ok(())
            }
            _ => Err(AuthzError::TokenAssertion("unknown token".to_string())),
        }
    };
    let evaluator = evaluator(vec![Service::new("erp")
        .with_policy(grant("p1", "user:bill", "/node1", &["get"]))])
    .with_asserter(Arc::new(asserter));

    let good = request(Subject::new().with_token("jwt", "bill-token"), "erp", "/node1", "get");
    assert!(evaluator.is_allowed(&good).unwrap().allowed);

    let bad = request(Subject::new().with_token("jwt", "forged"), "erp", "/node1", "get");
    let err = evaluator.is_allowed(&bad).unwrap_err();
    assert!(matches!(err, AuthzError::TokenAssertion(_)));
    assert_eq!(err.reason(), Reason::ErrorInEvaluation);
}

// ============================================================================
// DIAGNOSE TESTS
// ============================================================================

#[test]
fn test_diagnose_reports_every_policy() {
    let evaluator = evaluator(vec![Service::new("erp")
        .with_role_policy(RolePolicy::new("rp1", Effect::Grant, &["staff"]).with_principals(&["user:bill"]))
        .with_role_policy(
            RolePolicy::new("rp2", Effect::Grant, &["admin"])
                .with_principals(&["user:bill"])
                .with_condition("request_user == 'alice'"),
        )
        .with_policy(grant("p1", "role:staff", "/node1", &["get"]))
        .with_policy(deny("p2", "user:bill", "/node1", &["get"]).with_condition("request_user == 'alice'"))
        .with_policy(grant("p3", "user:bill", "/node1", &["get"]))]);

    let result = evaluator
        .diagnose(&request(bill(), "erp", "/node1", "get").with_attribute("ticket", json!("T-1")))
        .unwrap();

    assert!(result.allowed);
    assert_eq!(result.reason, Reason::GrantPolicyFound);
    assert_eq!(result.granted_roles, vec!["staff".to_string()]);
    assert_eq!(result.attributes.get("request_user"), Some(&json!("bill")));
    assert_eq!(result.attributes.get("ticket"), Some(&json!("T-1")));

    let role_status: Vec<(&str, EvaluationStatus)> = result
        .role_policies
        .iter()
        .map(|p| (p.id.as_str(), p.status))
        .collect();
    assert!(role_status.contains(&("rp1", EvaluationStatus::TakeEffect)));
    assert!(role_status.contains(&("rp2", EvaluationStatus::ConditionFailed)));

    let status = |id: &str| {
        result
            .policies
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.status)
            .unwrap()
    };
    assert_eq!(status("p1"), EvaluationStatus::TakeEffect);
    assert_eq!(status("p2"), EvaluationStatus::ConditionFailed);
    assert_eq!(status("p3"), EvaluationStatus::Ignored);
}

#[test]
fn test_diagnose_missing_service() {
    let evaluator = evaluator(vec![]);
    let err = evaluator
        .diagnose(&request(bill(), "erp", "/node1", "get"))
        .unwrap_err();
    assert_eq!(err.reason(), Reason::ServiceNotFound);
}

//! Policy evaluator lifecycle tests
//!
//! Start-up from a store, live sync through change events, refresh, discover
//! mode and the background condition publisher.

use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing_subscriber::EnvFilter;
use warden_authz::store::SyncDataSet;
use warden_authz::{
    AuthzError, Decision, Effect, EvaluatorConfig, FunctionDef, InMemoryPolicyStore, Permission,
    Policy, PolicyEvaluator, PolicyStore, PolicyStoreSnapshot, Principal, Reason, RequestContext,
    Result, RolePolicy, Service, StoreChangeEvent, Subject,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

fn snapshot() -> PolicyStoreSnapshot {
    PolicyStoreSnapshot {
        functions: vec![],
        services: vec![Service::new("erp").with_policy(
            Policy::new("p1", Effect::Grant)
                .with_principals(&["user:bill"])
                .with_permission(Permission::new("/node1", &["get"])),
        )],
    }
}

fn bill_request(service: &str, resource: &str, action: &str) -> RequestContext {
    RequestContext::new(service, resource, action)
        .with_subject(Subject::new().with_principal(Principal::user("bill")))
}

async fn start(store: Arc<InMemoryPolicyStore>) -> PolicyEvaluator {
    init_tracing();
    PolicyEvaluator::builder(store).build().await.unwrap()
}

/// Poll `check` until it holds or a second has passed
async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn allowed(evaluator: &PolicyEvaluator, request: &RequestContext) -> bool {
    evaluator.is_allowed(request).map(|d| d.allowed).unwrap_or(false)
}

// ============================================================================
// START-UP TESTS
// ============================================================================

#[tokio::test]
async fn test_build_loads_store() {
    let store = Arc::new(InMemoryPolicyStore::with_snapshot(snapshot()));
    let evaluator = start(store.clone()).await;

    assert!(evaluator.is_watching());
    assert!(store.is_watched());
    assert_eq!(
        evaluator.is_allowed(&bill_request("erp", "/node1", "get")).unwrap(),
        Decision::allow(Reason::GrantPolicyFound)
    );
}

#[tokio::test]
async fn test_build_rejects_invalid_config() {
    let store = Arc::new(InMemoryPolicyStore::new());
    let config = EvaluatorConfig {
        result_sweep_interval_secs: 0,
        ..Default::default()
    };

    let err = PolicyEvaluator::builder(store).config(config).build().await.unwrap_err();
    assert!(matches!(err, AuthzError::Config(_)));
}

#[tokio::test]
async fn test_config_file_disables_watch() -> anyhow::Result<()> {
    init_tracing();
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(file, "enable_watch = false\nresult_sweep_interval_secs = 60\nevent_buffer = 16")?;
    let config = EvaluatorConfig::from_toml_file(file.path())?;

    let store = Arc::new(InMemoryPolicyStore::with_snapshot(snapshot()).with_event_buffer(config.event_buffer));
    let evaluator = PolicyEvaluator::builder(store.clone()).config(config).build().await?;
    assert!(!store.is_watched());

    store.delete_policy("erp", "p1").await?;
    sleep(Duration::from_millis(50)).await;
    assert!(allowed(&evaluator, &bill_request("erp", "/node1", "get")));

    evaluator.refresh().await?;
    assert!(!allowed(&evaluator, &bill_request("erp", "/node1", "get")));
    Ok(())
}

// ============================================================================
// LIVE SYNC TESTS
// ============================================================================

#[tokio::test]
async fn test_policy_changes_are_applied() {
    let store = Arc::new(InMemoryPolicyStore::with_snapshot(snapshot()));
    let evaluator = start(store.clone()).await;
    let request = bill_request("erp", "/node1", "get");

    store
        .create_policy(
            "erp",
            Policy::new("p2", Effect::Deny)
                .with_principals(&["user:bill"])
                .with_permission(Permission::new("/node1", &["get"])),
        )
        .await
        .unwrap();
    assert!(eventually(|| !allowed(&evaluator, &request)).await);
    assert_eq!(
        evaluator.is_allowed(&request).unwrap().reason,
        Reason::DenyPolicyFound
    );

    store.delete_policy("erp", "p2").await.unwrap();
    assert!(eventually(|| allowed(&evaluator, &request)).await);
}

#[tokio::test]
async fn test_service_and_role_policy_changes_are_applied() {
    let store = Arc::new(InMemoryPolicyStore::with_snapshot(snapshot()));
    let evaluator = start(store.clone()).await;
    let request = bill_request("crm", "/leads", "read");

    assert_eq!(
        evaluator.is_allowed(&request).unwrap_err().reason(),
        Reason::ServiceNotFound
    );

    store
        .create_service(Service::new("crm").with_policy(
            Policy::new("p10", Effect::Grant)
                .with_principals(&["role:sales"])
                .with_permission(Permission::new("/leads", &["read"])),
        ))
        .await
        .unwrap();
    assert!(eventually(|| evaluator.is_allowed(&request).is_ok()).await);
    assert!(!allowed(&evaluator, &request));

    store
        .create_role_policy(
            "crm",
            RolePolicy::new("rp10", Effect::Grant, &["sales"]).with_principals(&["user:bill"]),
        )
        .await
        .unwrap();
    assert!(eventually(|| allowed(&evaluator, &request)).await);

    store.delete_role_policy("crm", "rp10").await.unwrap();
    assert!(eventually(|| !allowed(&evaluator, &request)).await);

    store.delete_service("crm").await.unwrap();
    assert!(eventually(|| evaluator.is_allowed(&request).is_err()).await);
}

#[tokio::test]
async fn test_function_changes_are_applied() {
    let store = Arc::new(InMemoryPolicyStore::with_snapshot(snapshot()));
    let evaluator = start(store.clone()).await;
    let runtime = evaluator.runtime().clone();

    store
        .create_function(FunctionDef {
            name: "IsHoliday".to_string(),
            func_url: "http://calendar.local/holiday".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(eventually(|| runtime.custom_function_names() == vec!["IsHoliday".to_string()]).await);

    store.delete_function("IsHoliday").await.unwrap();
    assert!(eventually(|| runtime.custom_function_names().is_empty()).await);
}

#[tokio::test]
async fn test_full_and_sync_reload() {
    let store = Arc::new(InMemoryPolicyStore::with_snapshot(snapshot()));
    let evaluator = start(store.clone()).await;
    let runtime = evaluator.runtime().clone();

    let replacement = PolicyStoreSnapshot {
        functions: vec![],
        services: vec![Service::new("hr").with_policy(
            Policy::new("p7", Effect::Grant).with_permission(Permission::new("/payroll", &["read"])),
        )],
    };
    store.replace_all(replacement).await;
    assert!(eventually(|| runtime.service_names() == vec!["hr".to_string()]).await);
    assert!(allowed(&evaluator, &bill_request("hr", "/payroll", "read")));

    store.sync_all(snapshot()).await;
    assert!(eventually(|| runtime.service_names() == vec!["erp".to_string()]).await);
    assert_eq!(
        runtime.policy_locations(),
        vec![("erp".to_string(), "p1".to_string())]
    );
    assert!(allowed(&evaluator, &bill_request("erp", "/node1", "get")));
}

#[tokio::test]
async fn test_stop_watch_freezes_cache() {
    let store = Arc::new(InMemoryPolicyStore::with_snapshot(snapshot()));
    let evaluator = start(store.clone()).await;
    let request = bill_request("erp", "/node1", "get");

    evaluator.stop_watch();
    assert!(!evaluator.is_watching());
    assert!(!store.is_watched());

    store.delete_policy("erp", "p1").await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert!(allowed(&evaluator, &request));

    evaluator.refresh().await.unwrap();
    assert!(!allowed(&evaluator, &request));
}

// ============================================================================
// RUNTIME CACHE HOOK TESTS
// ============================================================================

#[tokio::test]
async fn test_runtime_cache_hooks() {
    let store = Arc::new(InMemoryPolicyStore::new());
    let evaluator = start(store).await;
    let request = bill_request("ops", "/deploy", "run");

    evaluator.add_service_in_runtime_cache(Service::new("ops"));
    evaluator
        .add_role_policy_in_runtime_cache(
            "ops",
            RolePolicy::new("rp1", Effect::Grant, &["deployer"]).with_principals(&["user:bill"]),
        )
        .unwrap();
    evaluator
        .add_policy_in_runtime_cache(
            "ops",
            Policy::new("p1", Effect::Grant)
                .with_principals(&["role:deployer"])
                .with_permission(Permission::new("/deploy", &["run"])),
        )
        .unwrap();
    assert!(allowed(&evaluator, &request));

    evaluator.delete_role_policy_in_runtime_cache("ops", "rp1").unwrap();
    assert!(!allowed(&evaluator, &request));

    evaluator.delete_policy_in_runtime_cache("ops", "p1").unwrap();
    assert_eq!(
        evaluator.is_allowed(&request).unwrap().reason,
        Reason::NoApplicablePolicies
    );

    let err = evaluator
        .add_policy_in_runtime_cache("missing", Policy::new("p2", Effect::Grant))
        .unwrap_err();
    assert!(matches!(err, AuthzError::ServiceNotFound(_)));

    evaluator.add_function_in_runtime_cache(FunctionDef {
        name: "InWindow".to_string(),
        func_url: "http://change.local/window".to_string(),
        result_cachable: true,
        result_ttl: 1,
        ..Default::default()
    });
    assert_eq!(evaluator.runtime().custom_function_names(), vec!["InWindow".to_string()]);
    evaluator.delete_function_in_runtime_cache("InWindow");
    assert!(evaluator.runtime().custom_function_names().is_empty());

    evaluator.delete_service_in_runtime_cache("ops");
    assert!(evaluator.is_allowed(&request).is_err());
}

#[tokio::test]
async fn test_expired_function_results_are_cleaned() {
    let store = Arc::new(InMemoryPolicyStore::new());
    let evaluator = start(store).await;

    let results = evaluator.runtime().read().results().clone();
    results.insert_entry(
        "IsHoliday(\"2024-01-01\")".to_string(),
        warden_authz::function::FunctionResult {
            result: serde_json::json!(true),
            expires_at: 1,
        },
    );
    results.insert("IsHoliday(\"2099-01-01\")".to_string(), serde_json::json!(false), 0);

    assert_eq!(evaluator.clean_expired_function_results(), 1);
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn test_lazily_compiled_condition_is_cached() {
    let store = Arc::new(InMemoryPolicyStore::with_snapshot(PolicyStoreSnapshot {
        functions: vec![],
        services: vec![Service::new("erp").with_policy(
            Policy::new("p1", Effect::Grant)
                .with_permission(Permission::new("/node1", &["get"]))
                .with_condition("request_user == 'bill'"),
        )],
    }));
    let evaluator = start(store).await;
    let runtime = evaluator.runtime().clone();
    let cached = || {
        let state = runtime.read();
        let caches = state.service("erp").map(|service| service.read().policies.condition("p1").is_some());
        caches.unwrap_or(false)
    };
    assert!(cached());

    // A function table change drops every compiled condition
    evaluator.add_function_in_runtime_cache(FunctionDef {
        name: "IsHoliday".to_string(),
        func_url: "http://calendar.local/holiday".to_string(),
        ..Default::default()
    });
    assert!(!cached());

    assert!(allowed(&evaluator, &bill_request("erp", "/node1", "get")));
    assert!(eventually(cached).await);
}

// ============================================================================
// DISCOVER MODE TESTS
// ============================================================================

#[tokio::test]
async fn test_discover_records_request() {
    let store = Arc::new(InMemoryPolicyStore::new());
    let evaluator = start(store.clone()).await;

    let request = bill_request("erp", "/node1", "get");
    let decision = evaluator.discover(&request).await.unwrap();
    assert_eq!(decision, Decision::allow(Reason::DiscoverMode));
    assert_eq!(store.discover_requests(), vec![request]);
}

/// Store serving a fixed snapshot without watch or discover support
struct FixedStore(PolicyStoreSnapshot);

#[async_trait]
impl PolicyStore for FixedStore {
    fn kind(&self) -> &str {
        "fixed"
    }

    async fn read_policy_store(&self) -> Result<PolicyStoreSnapshot> {
        Ok(self.0.clone())
    }

    async fn get_service(&self, name: &str) -> Result<Service> {
        Err(AuthzError::Store(format!("no service {}", name)))
    }

    async fn get_policy(&self, _service_name: &str, id: &str) -> Result<Policy> {
        Err(AuthzError::Store(format!("no policy {}", id)))
    }

    async fn get_role_policy(&self, _service_name: &str, id: &str) -> Result<RolePolicy> {
        Err(AuthzError::Store(format!("no role policy {}", id)))
    }

    async fn get_function(&self, name: &str) -> Result<FunctionDef> {
        Err(AuthzError::Store(format!("no function {}", name)))
    }

    async fn watch(&self) -> Result<mpsc::Receiver<StoreChangeEvent>> {
        let (_sender, receiver) = mpsc::channel(1);
        Ok(receiver)
    }

    fn stop_watch(&self) {}
}

#[tokio::test]
async fn test_discover_unsupported_store() {
    init_tracing();
    let evaluator = PolicyEvaluator::builder(Arc::new(FixedStore(snapshot())))
        .build()
        .await
        .unwrap();

    assert!(allowed(&evaluator, &bill_request("erp", "/node1", "get")));

    let err = evaluator
        .discover(&bill_request("erp", "/node1", "get"))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthzError::Discover(_)));
    assert_eq!(err.code(), Some("SPDL-2005"));
}

#[tokio::test]
async fn test_sync_data_set_lists_snapshot() {
    let data = SyncDataSet::from_snapshot(&snapshot());
    assert_eq!(data.services, vec!["erp".to_string()]);
    assert_eq!(data.policies.len(), 1);
    assert!(data.role_policies.is_empty());
}

//! # Warden Authorization Runtime
//!
//! Policy-based authorization evaluation. Policies grant or deny permissions
//! to principals; role policies grant or deny roles, including roles granted
//! to other roles. Requests are answered from an in-memory, indexed copy of
//! a policy store that follows the store's change events.
//!
//! ## Features
//!
//! - **Indexed policy caches** by principal and resource, with prefix and
//!   suffix trees for resource expressions
//! - **Transitive role resolution** with deny precedence
//! - **CEL conditions** over request attributes, with builtin and remote
//!   custom functions
//! - **Live sync** with the policy store through typed change events
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use warden_authz::{
//!     EvaluatorConfig, InMemoryPolicyStore, PolicyEvaluator, PolicyStoreSnapshot, Principal,
//!     Reason, RequestContext, Subject,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let snapshot = PolicyStoreSnapshot::from_json(
//!         r#"{"services":[{"name":"erp","policies":[
//!             {"id":"p1","effect":"grant","principals":[["user:bill"]],
//!              "permissions":[{"resource":"/node1","actions":["get"]}]}]}]}"#,
//!     )?;
//!     let store = Arc::new(InMemoryPolicyStore::with_snapshot(snapshot));
//!
//!     let evaluator = PolicyEvaluator::builder(store)
//!         .config(EvaluatorConfig::default())
//!         .build()
//!         .await?;
//!
//!     let request = RequestContext::new("erp", "/node1", "get")
//!         .with_subject(Subject::new().with_principal(Principal::user("bill")));
//!     let decision = evaluator.is_allowed(&request)?;
//!
//!     assert!(decision.allowed);
//!     assert_eq!(decision.reason, Reason::GrantPolicyFound);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cel;
pub mod config;
pub mod engine;
pub mod error;
pub mod function;
pub mod principal;
pub mod roles;
pub mod runtime;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use config::EvaluatorConfig;
pub use engine::{
    Decision, EvaluationResult, EvaluationStatus, Evaluator, PolicyEvaluator,
    PolicyEvaluatorBuilder, Reason, RequestContext, Subject, TokenAsserter,
};
pub use error::{AuthzError, Result};
pub use principal::Principal;
pub use runtime::RuntimePolicyStore;
pub use store::{InMemoryPolicyStore, PolicyStore, StoreChange, StoreChangeEvent};
pub use types::{
    Effect, FunctionDef, Permission, Policy, PolicyStoreSnapshot, RolePolicy, Service,
    GLOBAL_SERVICE,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

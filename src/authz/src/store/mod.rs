//! Policy store collaborator
//!
//! The evaluator reads a full snapshot from a [`PolicyStore`] at start-up and
//! then follows its change events. Events carry typed payloads; a
//! [`StoreChange::SyncReload`] lists everything the store holds so the runtime
//! cache can be diffed against it.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

use crate::engine::RequestContext;
use crate::error::{AuthzError, Result};
use crate::types::{FunctionDef, Policy, PolicyStoreSnapshot, RolePolicy, Service};

pub use memory::InMemoryPolicyStore;

/// A policy and the service it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePolicy {
    pub service_name: String,
    pub policy: Policy,
}

/// A role policy and the service it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRolePolicy {
    pub service_name: String,
    pub role_policy: RolePolicy,
}

/// Reference to a policy or role policy of a service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRef {
    pub service_name: String,
    pub id: String,
}

impl ItemRef {
    pub fn new(service_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            id: id.into(),
        }
    }
}

/// Everything a store holds, by name and ID
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDataSet {
    /// Service names
    pub services: Vec<String>,
    /// Policy ID → service name
    pub policies: BTreeMap<String, String>,
    /// Role policy ID → service name
    pub role_policies: BTreeMap<String, String>,
    /// Custom function names
    pub functions: Vec<String>,
}

impl SyncDataSet {
    /// List the contents of `snapshot`
    pub fn from_snapshot(snapshot: &PolicyStoreSnapshot) -> Self {
        let mut data = Self {
            functions: snapshot.functions.iter().map(|f| f.name.clone()).collect(),
            ..Default::default()
        };
        for service in &snapshot.services {
            data.services.push(service.name.clone());
            for policy in &service.policies {
                data.policies.insert(policy.id.clone(), service.name.clone());
            }
            for role_policy in &service.role_policies {
                data.role_policies
                    .insert(role_policy.id.clone(), service.name.clone());
            }
        }
        data
    }
}

/// A change in the policy store
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    ServiceAdded(Service),
    ServicesDeleted(Vec<String>),
    PoliciesAdded(Vec<ServicePolicy>),
    PoliciesDeleted(Vec<ItemRef>),
    RolePoliciesAdded(Vec<ServiceRolePolicy>),
    RolePoliciesDeleted(Vec<ItemRef>),
    FunctionAdded(FunctionDef),
    FunctionsDeleted(Vec<String>),
    /// Diff the runtime cache against the listed contents
    SyncReload(SyncDataSet),
    /// Reread the whole store
    FullReload,
}

impl StoreChange {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ServiceAdded(_) => "service_add",
            Self::ServicesDeleted(_) => "service_delete",
            Self::PoliciesAdded(_) => "policy_add",
            Self::PoliciesDeleted(_) => "policy_delete",
            Self::RolePoliciesAdded(_) => "role_policy_add",
            Self::RolePoliciesDeleted(_) => "role_policy_delete",
            Self::FunctionAdded(_) => "function_add",
            Self::FunctionsDeleted(_) => "function_delete",
            Self::SyncReload(_) => "sync_reload",
            Self::FullReload => "full_reload",
        }
    }
}

/// Change event delivered to a watcher
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChangeEvent {
    /// Monotonic event number, per store
    pub id: u64,
    pub change: StoreChange,
}

/// Source of policies for the evaluator
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Store type, e.g. "memory"
    fn kind(&self) -> &str;

    /// Full snapshot of services and functions
    async fn read_policy_store(&self) -> Result<PolicyStoreSnapshot>;

    /// Service with all its policies and role policies
    async fn get_service(&self, name: &str) -> Result<Service>;

    /// Policy by service and ID
    async fn get_policy(&self, service_name: &str, id: &str) -> Result<Policy>;

    /// Role policy by service and ID
    async fn get_role_policy(&self, service_name: &str, id: &str) -> Result<RolePolicy>;

    /// Custom function by name
    async fn get_function(&self, name: &str) -> Result<FunctionDef>;

    /// Subscribe to change events
    ///
    /// The channel closes when [`stop_watch`](Self::stop_watch) is called.
    async fn watch(&self) -> Result<mpsc::Receiver<StoreChangeEvent>>;

    /// Close the change event channel
    fn stop_watch(&self);

    /// Record a request evaluated in discover mode
    async fn save_discover_request(&self, _request: &RequestContext) -> Result<()> {
        Err(AuthzError::Discover(format!(
            "unsupported store type of discovery function: {}",
            self.kind()
        )))
    }
}

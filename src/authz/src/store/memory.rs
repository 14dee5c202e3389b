//! In-memory policy store

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use super::{
    ItemRef, PolicyStore, ServicePolicy, ServiceRolePolicy, StoreChange, StoreChangeEvent,
    SyncDataSet,
};
use crate::engine::RequestContext;
use crate::error::{AuthzError, Result};
use crate::types::{FunctionDef, Policy, PolicyStoreSnapshot, RolePolicy, Service};

const DEFAULT_EVENT_BUFFER: usize = 256;

/// Policy store kept in memory
///
/// Every mutation is sent to the active watcher, if any. Discover requests
/// are recorded and can be read back.
pub struct InMemoryPolicyStore {
    snapshot: RwLock<PolicyStoreSnapshot>,
    watcher: Mutex<Option<mpsc::Sender<StoreChangeEvent>>>,
    next_event: AtomicU64,
    event_buffer: usize,
    discovered: Mutex<Vec<RequestContext>>,
}

impl InMemoryPolicyStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::with_snapshot(PolicyStoreSnapshot::default())
    }

    /// Create a store holding `snapshot`
    pub fn with_snapshot(snapshot: PolicyStoreSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
            watcher: Mutex::new(None),
            next_event: AtomicU64::new(1),
            event_buffer: DEFAULT_EVENT_BUFFER,
            discovered: Mutex::new(Vec::new()),
        }
    }

    /// Load a JSON snapshot file
    pub async fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path.as_ref()).await?;
        let snapshot = PolicyStoreSnapshot::from_json(&contents)
            .map_err(|e| AuthzError::Store(format!("invalid policy store file: {}", e)))?;
        Ok(Self::with_snapshot(snapshot))
    }

    /// Capacity of the change event channel
    pub fn with_event_buffer(mut self, event_buffer: usize) -> Self {
        self.event_buffer = event_buffer.max(1);
        self
    }

    /// Add a service
    ///
    /// # Errors
    /// Returns `Store` if a service with the same name exists
    pub async fn create_service(&self, service: Service) -> Result<()> {
        {
            let mut snapshot = self.snapshot.write().await;
            if snapshot.services.iter().any(|s| s.name == service.name) {
                return Err(AuthzError::Store(format!("service {} already exists", service.name)));
            }
            snapshot.services.push(service.clone());
        }
        self.emit(StoreChange::ServiceAdded(service)).await;
        Ok(())
    }

    /// Delete a service with its policies and role policies
    pub async fn delete_service(&self, name: &str) -> Result<()> {
        {
            let mut snapshot = self.snapshot.write().await;
            let before = snapshot.services.len();
            snapshot.services.retain(|s| s.name != name);
            if snapshot.services.len() == before {
                return Err(service_not_found(name));
            }
        }
        self.emit(StoreChange::ServicesDeleted(vec![name.to_string()])).await;
        Ok(())
    }

    /// Add or replace a policy
    pub async fn create_policy(&self, service_name: &str, policy: Policy) -> Result<()> {
        {
            let mut snapshot = self.snapshot.write().await;
            let service = find_service_mut(&mut snapshot, service_name)?;
            service.policies.retain(|p| p.id != policy.id);
            service.policies.push(policy.clone());
        }
        self.emit(StoreChange::PoliciesAdded(vec![ServicePolicy {
            service_name: service_name.to_string(),
            policy,
        }]))
        .await;
        Ok(())
    }

    /// Delete a policy
    pub async fn delete_policy(&self, service_name: &str, id: &str) -> Result<()> {
        {
            let mut snapshot = self.snapshot.write().await;
            let service = find_service_mut(&mut snapshot, service_name)?;
            let before = service.policies.len();
            service.policies.retain(|p| p.id != id);
            if service.policies.len() == before {
                return Err(AuthzError::Store(format!("policy {} not found in {}", id, service_name)));
            }
        }
        self.emit(StoreChange::PoliciesDeleted(vec![ItemRef::new(service_name, id)]))
            .await;
        Ok(())
    }

    /// Add or replace a role policy
    pub async fn create_role_policy(&self, service_name: &str, role_policy: RolePolicy) -> Result<()> {
        {
            let mut snapshot = self.snapshot.write().await;
            let service = find_service_mut(&mut snapshot, service_name)?;
            service.role_policies.retain(|p| p.id != role_policy.id);
            service.role_policies.push(role_policy.clone());
        }
        self.emit(StoreChange::RolePoliciesAdded(vec![ServiceRolePolicy {
            service_name: service_name.to_string(),
            role_policy,
        }]))
        .await;
        Ok(())
    }

    /// Delete a role policy
    pub async fn delete_role_policy(&self, service_name: &str, id: &str) -> Result<()> {
        {
            let mut snapshot = self.snapshot.write().await;
            let service = find_service_mut(&mut snapshot, service_name)?;
            let before = service.role_policies.len();
            service.role_policies.retain(|p| p.id != id);
            if service.role_policies.len() == before {
                return Err(AuthzError::Store(format!(
                    "role policy {} not found in {}",
                    id, service_name
                )));
            }
        }
        self.emit(StoreChange::RolePoliciesDeleted(vec![ItemRef::new(service_name, id)]))
            .await;
        Ok(())
    }

    /// Add or replace a custom function
    pub async fn create_function(&self, function: FunctionDef) -> Result<()> {
        {
            let mut snapshot = self.snapshot.write().await;
            snapshot.functions.retain(|f| f.name != function.name);
            snapshot.functions.push(function.clone());
        }
        self.emit(StoreChange::FunctionAdded(function)).await;
        Ok(())
    }

    /// Delete a custom function
    pub async fn delete_function(&self, name: &str) -> Result<()> {
        {
            let mut snapshot = self.snapshot.write().await;
            let before = snapshot.functions.len();
            snapshot.functions.retain(|f| f.name != name);
            if snapshot.functions.len() == before {
                return Err(AuthzError::Store(format!("function {} not found", name)));
            }
        }
        self.emit(StoreChange::FunctionsDeleted(vec![name.to_string()]))
            .await;
        Ok(())
    }

    /// Replace the whole store; watchers do a full reload
    pub async fn replace_all(&self, snapshot: PolicyStoreSnapshot) {
        *self.snapshot.write().await = snapshot;
        self.emit(StoreChange::FullReload).await;
    }

    /// Replace the whole store; watchers diff their cache against it
    pub async fn sync_all(&self, snapshot: PolicyStoreSnapshot) {
        let data = SyncDataSet::from_snapshot(&snapshot);
        *self.snapshot.write().await = snapshot;
        self.emit(StoreChange::SyncReload(data)).await;
    }

    /// Requests recorded in discover mode
    pub fn discover_requests(&self) -> Vec<RequestContext> {
        self.discovered.lock().clone()
    }

    /// True while a watcher is subscribed
    pub fn is_watched(&self) -> bool {
        self.watcher.lock().is_some()
    }

    async fn emit(&self, change: StoreChange) {
        let Some(sender) = self.watcher.lock().clone() else {
            return;
        };

        let id = self.next_event.fetch_add(1, Ordering::Relaxed);
        let kind = change.kind();
        if sender.send(StoreChangeEvent { id, change }).await.is_err() {
            debug!(event = id, "Watcher is gone; dropping it");
            self.watcher.lock().take();
            return;
        }
        debug!(event = id, kind = kind, "Sent store change event");
    }
}

impl Default for InMemoryPolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    fn kind(&self) -> &str {
        "memory"
    }

    async fn read_policy_store(&self) -> Result<PolicyStoreSnapshot> {
        Ok(self.snapshot.read().await.clone())
    }

    async fn get_service(&self, name: &str) -> Result<Service> {
        self.snapshot
            .read()
            .await
            .services
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| service_not_found(name))
    }

    async fn get_policy(&self, service_name: &str, id: &str) -> Result<Policy> {
        let snapshot = self.snapshot.read().await;
        find_service(&snapshot, service_name)?
            .policies
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| AuthzError::Store(format!("policy {} not found in {}", id, service_name)))
    }

    async fn get_role_policy(&self, service_name: &str, id: &str) -> Result<RolePolicy> {
        let snapshot = self.snapshot.read().await;
        find_service(&snapshot, service_name)?
            .role_policies
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| {
                AuthzError::Store(format!("role policy {} not found in {}", id, service_name))
            })
    }

    async fn get_function(&self, name: &str) -> Result<FunctionDef> {
        self.snapshot
            .read()
            .await
            .functions
            .iter()
            .find(|f| f.name == name)
            .cloned()
            .ok_or_else(|| AuthzError::Store(format!("function {} not found", name)))
    }

    async fn watch(&self) -> Result<mpsc::Receiver<StoreChangeEvent>> {
        let (sender, receiver) = mpsc::channel(self.event_buffer);
        if self.watcher.lock().replace(sender).is_some() {
            info!("Replaced previous store watcher");
        }
        Ok(receiver)
    }

    fn stop_watch(&self) {
        if self.watcher.lock().take().is_some() {
            info!("Stopped watching in-memory policy store");
        }
    }

    async fn save_discover_request(&self, request: &RequestContext) -> Result<()> {
        self.discovered.lock().push(request.clone());
        debug!(service = %request.service_name, resource = %request.resource, "Recorded discover request");
        Ok(())
    }
}

fn service_not_found(name: &str) -> AuthzError {
    AuthzError::Store(format!("service {} not found", name))
}

fn find_service<'a>(snapshot: &'a PolicyStoreSnapshot, name: &str) -> Result<&'a Service> {
    snapshot
        .services
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| service_not_found(name))
}

fn find_service_mut<'a>(snapshot: &'a mut PolicyStoreSnapshot, name: &str) -> Result<&'a mut Service> {
    snapshot
        .services
        .iter_mut()
        .find(|s| s.name == name)
        .ok_or_else(|| service_not_found(name))
}

//! Runtime policy store
//!
//! The concurrent registry of compiled services, the function table and the
//! function result cache.
//!
//! Locking:
//! - evaluations hold the store read lock and, nested inside it, the read lock
//!   of each service they touch
//! - incremental mutations hold the store read lock plus the affected
//!   service's write lock
//! - full reloads build the replacement state without any lock and then swap
//!   it in under the store write lock
//! - added services are built without any lock and inserted only if the
//!   function table generation did not move meanwhile

pub mod service;

use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::cache::Indexable;
use crate::cel::{CompiledCondition, ConditionEngine};
use crate::error::{AuthzError, Result};
use crate::function::{CustomFunction, FunctionResolver, FunctionResultCache, FunctionTable};
use crate::types::{FunctionDef, Policy, PolicyStoreSnapshot, RolePolicy, Service, GLOBAL_SERVICE};

pub use service::{ConditionTarget, ConditionUpdate, RuntimeService, ServiceCaches};

/// Everything swapped atomically by a reload
pub struct StoreState {
    services: HashMap<String, Arc<RuntimeService>>,
    functions: FunctionTable,
    results: Arc<FunctionResultCache>,
    /// Bumped whenever `functions` is replaced
    generation: u64,
}

impl StoreState {
    /// Service by name
    pub fn service(&self, name: &str) -> Option<&Arc<RuntimeService>> {
        self.services.get(name)
    }

    /// The global service, if loaded
    pub fn global(&self) -> Option<&Arc<RuntimeService>> {
        self.services.get(GLOBAL_SERVICE)
    }

    /// Current function table
    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    /// Function result cache
    pub fn results(&self) -> &Arc<FunctionResultCache> {
        &self.results
    }

    /// Function table generation
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Concurrent registry of runtime services
pub struct RuntimePolicyStore {
    state: RwLock<StoreState>,
    engine: Arc<dyn ConditionEngine>,
    resolver: Arc<dyn FunctionResolver>,
    publisher: Option<mpsc::UnboundedSender<ConditionUpdate>>,
}

impl RuntimePolicyStore {
    /// Create an empty store holding only the builtin functions
    pub fn new(engine: Arc<dyn ConditionEngine>, resolver: Arc<dyn FunctionResolver>) -> Self {
        Self {
            state: RwLock::new(StoreState {
                services: HashMap::new(),
                functions: FunctionTable::with_builtins(),
                results: Arc::new(FunctionResultCache::new()),
                generation: 0,
            }),
            engine,
            resolver,
            publisher: None,
        }
    }

    /// Send lazily compiled conditions to a background publisher
    pub fn with_publisher(mut self, publisher: mpsc::UnboundedSender<ConditionUpdate>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Shared access to the current state
    pub fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read()
    }

    /// Replace the whole store with `snapshot`
    ///
    /// The new state is built without holding any lock; only the swap takes
    /// the write lock.
    pub fn reload(&self, snapshot: PolicyStoreSnapshot) {
        let results = Arc::new(FunctionResultCache::new());
        let mut functions = FunctionTable::with_builtins();
        for definition in snapshot.functions {
            functions = functions.with_function(
                definition.name.clone(),
                Arc::new(CustomFunction::new(definition, self.resolver.clone(), results.clone())),
            );
        }

        let services: HashMap<String, Arc<RuntimeService>> = snapshot
            .services
            .into_iter()
            .map(|service| (service.name.clone(), Arc::new(self.build_service(service, &functions))))
            .collect();

        let service_count = services.len();
        let mut state = self.state.write();
        let generation = state.generation + 1;
        *state = StoreState {
            services,
            functions,
            results,
            generation,
        };
        info!(services = service_count, "Reloaded runtime policy store");
    }

    /// Add or replace a service
    ///
    /// Conditions are compiled without holding a lock. When the function
    /// table changes before the insert, the service is built again against
    /// the new table.
    pub fn add_service(&self, service: Service) {
        let name = service.name.clone();
        loop {
            let (functions, generation) = {
                let state = self.state.read();
                (state.functions.clone(), state.generation)
            };
            let runtime = Arc::new(self.build_service(service.clone(), &functions));

            let mut state = self.state.write();
            if state.generation == generation {
                state.services.insert(name.clone(), runtime);
                break;
            }
            debug!(service = %name, "Function table changed while building service; rebuilding");
        }
        debug!(service = %name, "Added service to runtime cache");
    }

    /// Remove a service; no-op if absent
    pub fn delete_service(&self, name: &str) {
        if self.state.write().services.remove(name).is_some() {
            debug!(service = %name, "Deleted service from runtime cache");
        }
    }

    /// Add or replace a policy in a service
    ///
    /// # Errors
    /// Returns `ServiceNotFound` if the service is not loaded
    pub fn add_policy(&self, service_name: &str, policy: Policy) -> Result<()> {
        let state = self.state.read();
        let service = lookup(&state, service_name)?;
        let condition = self.compile(&policy, &state.functions);
        let id = policy.id.clone();
        service.write().policies.add(policy, condition);
        debug!(service = %service_name, policy = %id, "Added policy to runtime cache");
        Ok(())
    }

    /// Remove a policy from a service
    ///
    /// # Errors
    /// Returns `ServiceNotFound` if the service is not loaded
    pub fn delete_policy(&self, service_name: &str, id: &str) -> Result<()> {
        let state = self.state.read();
        let service = lookup(&state, service_name)?;
        service.write().policies.remove(id);
        debug!(service = %service_name, policy = %id, "Deleted policy from runtime cache");
        Ok(())
    }

    /// Add or replace a role policy in a service
    ///
    /// # Errors
    /// Returns `ServiceNotFound` if the service is not loaded
    pub fn add_role_policy(&self, service_name: &str, role_policy: RolePolicy) -> Result<()> {
        let state = self.state.read();
        let service = lookup(&state, service_name)?;
        let condition = self.compile(&role_policy, &state.functions);
        let id = role_policy.id.clone();
        service.write().role_policies.add(role_policy, condition);
        debug!(service = %service_name, role_policy = %id, "Added role policy to runtime cache");
        Ok(())
    }

    /// Remove a role policy from a service
    ///
    /// # Errors
    /// Returns `ServiceNotFound` if the service is not loaded
    pub fn delete_role_policy(&self, service_name: &str, id: &str) -> Result<()> {
        let state = self.state.read();
        let service = lookup(&state, service_name)?;
        service.write().role_policies.remove(id);
        debug!(service = %service_name, role_policy = %id, "Deleted role policy from runtime cache");
        Ok(())
    }

    /// Register or replace a custom function
    ///
    /// Compiled conditions of every service are dropped and recompile lazily
    /// against the new function table.
    pub fn add_function(&self, definition: FunctionDef) {
        let mut state = self.state.write();
        let name = definition.name.clone();
        let function = CustomFunction::new(definition, self.resolver.clone(), state.results.clone());
        state.functions = state.functions.with_function(name.clone(), Arc::new(function));
        state.generation += 1;
        // A replaced definition may answer differently.
        state.results.purge_function(&name);
        clear_conditions(&state);
        debug!(function = %name, "Added function to runtime cache");
    }

    /// Remove a custom function and every cached result of it
    pub fn delete_function(&self, name: &str) {
        let mut state = self.state.write();
        state.functions = state.functions.without_function(name);
        state.generation += 1;
        state.results.purge_function(name);
        clear_conditions(&state);
        debug!(function = %name, "Deleted function from runtime cache");
    }

    /// Drop expired function results
    pub fn clean_expired_function_results(&self) -> usize {
        let results = self.state.read().results.clone();
        results.clean_expired()
    }

    /// Names of every loaded service
    pub fn service_names(&self) -> Vec<String> {
        self.state.read().services.keys().cloned().collect()
    }

    /// `(service, policy id)` of every loaded policy
    pub fn policy_locations(&self) -> Vec<(String, String)> {
        let state = self.state.read();
        state
            .services
            .values()
            .flat_map(|service| {
                let caches = service.read();
                caches
                    .policies
                    .ids()
                    .map(|id| (service.name().to_string(), id.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// `(service, role policy id)` of every loaded role policy
    pub fn role_policy_locations(&self) -> Vec<(String, String)> {
        let state = self.state.read();
        state
            .services
            .values()
            .flat_map(|service| {
                let caches = service.read();
                caches
                    .role_policies
                    .ids()
                    .map(|id| (service.name().to_string(), id.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Names of the custom functions
    pub fn custom_function_names(&self) -> Vec<String> {
        self.state.read().functions.custom_names()
    }

    /// Compile a condition against `functions`, logging failures
    pub fn compile_condition(
        &self,
        id: &str,
        expression: &str,
        functions: &FunctionTable,
    ) -> Result<Arc<dyn CompiledCondition>> {
        self.engine
            .compile(expression, functions)
            .map_err(|e| {
                error!(id = %id, expression = %expression, error = %e, "Failed to compile condition");
                AuthzError::from(e)
            })
    }

    /// Hand a lazily compiled condition to the background publisher
    ///
    /// Without a publisher the condition is only used by the current request.
    pub fn publish_condition(&self, update: ConditionUpdate) {
        match &self.publisher {
            Some(publisher) => {
                if publisher.send(update).is_err() {
                    debug!("Condition publisher stopped; dropping compiled condition");
                }
            }
            None => debug!(id = %update.id, "No condition publisher; compiled condition not cached"),
        }
    }

    fn compile<T: Indexable>(&self, entry: &T, functions: &FunctionTable) -> Option<Arc<dyn CompiledCondition>> {
        let expression = entry.condition()?;
        self.compile_condition(entry.id(), expression, functions).ok()
    }

    fn build_service(&self, service: Service, functions: &FunctionTable) -> RuntimeService {
        let mut caches = ServiceCaches::default();
        for policy in service.policies {
            let condition = self.compile(&policy, functions);
            caches.policies.add(policy, condition);
        }
        for role_policy in service.role_policies {
            let condition = self.compile(&role_policy, functions);
            caches.role_policies.add(role_policy, condition);
        }
        RuntimeService::new(service.name, service.kind, caches)
    }
}

fn lookup<'a>(state: &'a StoreState, name: &str) -> Result<&'a Arc<RuntimeService>> {
    state.services.get(name).ok_or_else(|| {
        error!(service = %name, "Service is not in the runtime cache");
        AuthzError::ServiceNotFound(name.to_string())
    })
}

fn clear_conditions(state: &StoreState) {
    for service in state.services.values() {
        service.write().clear_conditions();
    }
}

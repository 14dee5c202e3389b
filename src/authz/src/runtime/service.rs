//! Per-service runtime container

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

use crate::cache::{PolicyCache, RolePolicyCache};
use crate::cel::CompiledCondition;

/// Compiled caches of one service
#[derive(Default)]
pub struct ServiceCaches {
    /// Policies
    pub policies: PolicyCache,
    /// Role policies
    pub role_policies: RolePolicyCache,
}

impl ServiceCaches {
    /// Drop every compiled condition so they recompile against a new function table
    pub fn clear_conditions(&mut self) {
        self.policies.clear_conditions();
        self.role_policies.clear_conditions();
    }
}

/// A service (tenant) and its caches
///
/// Evaluations hold the read lock for the duration of a request; mutations
/// take the write lock. Locks of different services are independent.
pub struct RuntimeService {
    name: String,
    kind: Option<String>,
    caches: RwLock<ServiceCaches>,
}

impl RuntimeService {
    /// Wrap already built caches
    pub fn new(name: impl Into<String>, kind: Option<String>, caches: ServiceCaches) -> Self {
        Self {
            name: name.into(),
            kind,
            caches: RwLock::new(caches),
        }
    }

    /// Service name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Service type
    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    /// Shared access for evaluation
    pub fn read(&self) -> RwLockReadGuard<'_, ServiceCaches> {
        self.caches.read()
    }

    /// Exclusive access for mutation
    pub fn write(&self) -> RwLockWriteGuard<'_, ServiceCaches> {
        self.caches.write()
    }
}

impl std::fmt::Debug for RuntimeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeService")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Which cache a lazily compiled condition belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionTarget {
    /// Policy condition
    Policy,
    /// Role policy condition
    RolePolicy,
}

/// A condition compiled during evaluation, to be stored back into its cache
pub struct ConditionUpdate {
    /// Owning service
    pub service: Arc<RuntimeService>,
    /// Cache the condition belongs to
    pub target: ConditionTarget,
    /// Policy or role policy ID
    pub id: String,
    /// Compiled condition
    pub condition: Arc<dyn CompiledCondition>,
}

impl ConditionUpdate {
    /// Store the condition; takes the service write lock
    pub fn apply(self) {
        let mut caches = self.service.write();
        match self.target {
            ConditionTarget::Policy => caches.policies.set_condition(&self.id, self.condition),
            ConditionTarget::RolePolicy => {
                caches.role_policies.set_condition(&self.id, self.condition)
            }
        }
    }
}

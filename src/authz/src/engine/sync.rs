//! Applying store change events to the runtime cache

use std::collections::{BTreeSet, HashSet};
use tracing::{debug, error, info, warn};

use crate::error::{AuthzError, Result};
use crate::runtime::RuntimePolicyStore;
use crate::store::{PolicyStore, StoreChange, StoreChangeEvent, SyncDataSet};

/// Apply one change event
///
/// Failures of single items in a batch are logged and skipped. Only reloads
/// fail as a whole.
pub(crate) async fn apply_event(
    runtime: &RuntimePolicyStore,
    store: &dyn PolicyStore,
    event: StoreChangeEvent,
) -> Result<()> {
    debug!(event = event.id, kind = event.change.kind(), "Applying store change");

    match event.change {
        StoreChange::ServiceAdded(service) => runtime.add_service(service),
        StoreChange::ServicesDeleted(names) => {
            for name in names {
                runtime.delete_service(&name);
            }
        }
        StoreChange::PoliciesAdded(added) => {
            for item in added {
                let id = item.policy.id.clone();
                if let Err(e) = runtime.add_policy(&item.service_name, item.policy) {
                    warn!(service = %item.service_name, policy = %id, error = %e, "Failed to add policy");
                }
            }
        }
        StoreChange::PoliciesDeleted(deleted) => {
            for item in deleted {
                if let Err(e) = runtime.delete_policy(&item.service_name, &item.id) {
                    warn!(service = %item.service_name, policy = %item.id, error = %e, "Failed to delete policy");
                }
            }
        }
        StoreChange::RolePoliciesAdded(added) => {
            for item in added {
                let id = item.role_policy.id.clone();
                if let Err(e) = runtime.add_role_policy(&item.service_name, item.role_policy) {
                    warn!(service = %item.service_name, role_policy = %id, error = %e, "Failed to add role policy");
                }
            }
        }
        StoreChange::RolePoliciesDeleted(deleted) => {
            for item in deleted {
                if let Err(e) = runtime.delete_role_policy(&item.service_name, &item.id) {
                    warn!(service = %item.service_name, role_policy = %item.id, error = %e, "Failed to delete role policy");
                }
            }
        }
        StoreChange::FunctionAdded(function) => runtime.add_function(function),
        StoreChange::FunctionsDeleted(names) => {
            for name in names {
                runtime.delete_function(&name);
            }
        }
        StoreChange::SyncReload(data) => sync_runtime_cache(runtime, store, &data).await?,
        StoreChange::FullReload => full_reload(runtime, store).await?,
    }
    Ok(())
}

/// Replace the runtime cache with a fresh snapshot of `store`
pub(crate) async fn full_reload(runtime: &RuntimePolicyStore, store: &dyn PolicyStore) -> Result<()> {
    let snapshot = store.read_policy_store().await.map_err(|e| {
        error!(error = %e, "Failed to read policy store for full reload");
        e
    })?;
    runtime.reload(snapshot);
    Ok(())
}

/// Diff the runtime cache against what the store lists
///
/// Services first, then policies, role policies and custom functions.
/// Missing items are fetched from the store; items the store no longer
/// lists are deleted.
pub(crate) async fn sync_runtime_cache(
    runtime: &RuntimePolicyStore,
    store: &dyn PolicyStore,
    data: &SyncDataSet,
) -> Result<()> {
    info!("Syncing runtime cache with policy store");

    let cached: HashSet<String> = runtime.service_names().into_iter().collect();
    for name in &data.services {
        if !cached.contains(name) {
            runtime.add_service(store.get_service(name).await?);
        }
    }
    let listed: HashSet<&str> = data.services.iter().map(String::as_str).collect();
    for name in &cached {
        if !listed.contains(name.as_str()) {
            runtime.delete_service(name);
        }
    }
    let services: HashSet<String> = runtime.service_names().into_iter().collect();

    let cached: BTreeSet<(String, String)> = runtime.policy_locations().into_iter().collect();
    let listed = locations(&data.policies);
    for (service, id) in listed.difference(&cached) {
        ensure_service(&services, service, id)?;
        let policy = store.get_policy(service, id).await?;
        runtime.add_policy(service, policy)?;
    }
    for (service, id) in cached.difference(&listed) {
        runtime.delete_policy(service, id)?;
    }

    let cached: BTreeSet<(String, String)> = runtime.role_policy_locations().into_iter().collect();
    let listed = locations(&data.role_policies);
    for (service, id) in listed.difference(&cached) {
        ensure_service(&services, service, id)?;
        let role_policy = store.get_role_policy(service, id).await?;
        runtime.add_role_policy(service, role_policy)?;
    }
    for (service, id) in cached.difference(&listed) {
        runtime.delete_role_policy(service, id)?;
    }

    let cached: BTreeSet<String> = runtime.custom_function_names().into_iter().collect();
    let listed: BTreeSet<String> = data.functions.iter().cloned().collect();
    for name in listed.difference(&cached) {
        runtime.add_function(store.get_function(name).await?);
    }
    for name in cached.difference(&listed) {
        runtime.delete_function(name);
    }

    info!("Finished syncing runtime cache");
    Ok(())
}

fn locations(items: &std::collections::BTreeMap<String, String>) -> BTreeSet<(String, String)> {
    items
        .iter()
        .map(|(id, service)| (service.clone(), id.clone()))
        .collect()
}

fn ensure_service(services: &HashSet<String>, service: &str, id: &str) -> Result<()> {
    if services.contains(service) {
        Ok(())
    } else {
        Err(AuthzError::EvalCache(format!(
            "item {} references unknown service {}",
            id, service
        )))
    }
}

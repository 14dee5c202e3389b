//! Policy evaluation engine
//!
//! [`Evaluator`] is the synchronous request pipeline. [`PolicyEvaluator`]
//! wires it to a [`PolicyStore`]: it loads the store at start-up, follows
//! its change events and runs the background maintenance tasks.
//!
//! ```text
//! PolicyStore ──events──▶ consumer ──▶ RuntimePolicyStore ◀── Evaluator ◀── requests
//!                                           ▲        │
//!                          publisher ───────┘        └── result cache ◀── sweep
//! ```

pub mod context;
pub mod decision;
pub mod evaluator;
pub mod matching;
mod sync;

pub use context::TokenAsserter;
pub use decision::{
    Decision, EvaluatedCondition, EvaluatedPolicy, EvaluatedRolePolicy, EvaluationResult,
    EvaluationStatus, Reason, RequestContext, Subject,
};
pub use evaluator::Evaluator;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cel::{CelConditionEngine, ConditionEngine};
use crate::config::EvaluatorConfig;
use crate::error::Result;
use crate::function::{FunctionResolver, HttpFunctionResolver};
use crate::runtime::{ConditionUpdate, RuntimePolicyStore};
use crate::store::{PolicyStore, StoreChangeEvent};
use crate::types::{FunctionDef, Permission, Policy, RolePolicy, Service};

/// Builder for [`PolicyEvaluator`]
pub struct PolicyEvaluatorBuilder {
    store: Arc<dyn PolicyStore>,
    config: EvaluatorConfig,
    asserter: Option<Arc<dyn TokenAsserter>>,
    resolver: Option<Arc<dyn FunctionResolver>>,
    engine: Option<Arc<dyn ConditionEngine>>,
}

impl PolicyEvaluatorBuilder {
    /// Evaluator configuration
    pub fn config(mut self, config: EvaluatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Token asserter for subjects carrying a token
    pub fn asserter(mut self, asserter: Arc<dyn TokenAsserter>) -> Self {
        self.asserter = Some(asserter);
        self
    }

    /// Resolver for custom functions; defaults to HTTP
    pub fn function_resolver(mut self, resolver: Arc<dyn FunctionResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Condition engine; defaults to CEL
    pub fn condition_engine(mut self, engine: Arc<dyn ConditionEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Load the store and start the background tasks
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    /// Fails if the configuration is invalid, the store cannot be read, or
    /// watching is enabled and the store refuses a watcher.
    pub async fn build(self) -> Result<PolicyEvaluator> {
        let Self {
            store,
            config,
            asserter,
            resolver,
            engine,
        } = self;
        config.validate()?;

        let resolver = resolver.unwrap_or_else(|| default_resolver(&config));
        let engine = engine.unwrap_or_else(|| Arc::new(CelConditionEngine::new()));

        let (publisher, updates) = mpsc::unbounded_channel();
        let runtime = Arc::new(RuntimePolicyStore::new(engine, resolver).with_publisher(publisher));
        sync::full_reload(&runtime, store.as_ref()).await?;

        let shutdown = CancellationToken::new();
        spawn_condition_publisher(updates, shutdown.clone());
        spawn_result_sweep(runtime.clone(), config.result_sweep_interval(), shutdown.clone());
        if config.enable_watch {
            let events = store.watch().await?;
            spawn_change_consumer(runtime.clone(), store.clone(), events, shutdown.clone());
        }

        let mut evaluator = Evaluator::new(runtime.clone());
        if let Some(asserter) = asserter {
            evaluator = evaluator.with_asserter(asserter);
        }

        info!(
            store = store.kind(),
            watch = config.enable_watch,
            services = runtime.service_names().len(),
            "Policy evaluator started"
        );

        Ok(PolicyEvaluator {
            evaluator,
            runtime,
            store,
            shutdown,
        })
    }
}

fn default_resolver(config: &EvaluatorConfig) -> Arc<dyn FunctionResolver> {
    let timeout = config.function_call_timeout();
    match &config.function_service_endpoint {
        Some(endpoint) => Arc::new(HttpFunctionResolver::with_delegator(endpoint.clone(), timeout)),
        None => Arc::new(HttpFunctionResolver::new(timeout)),
    }
}

/// Policy evaluator bound to a policy store
///
/// Background tasks stop when [`stop_watch`](Self::stop_watch) is called or
/// the evaluator is dropped.
pub struct PolicyEvaluator {
    evaluator: Evaluator,
    runtime: Arc<RuntimePolicyStore>,
    store: Arc<dyn PolicyStore>,
    shutdown: CancellationToken,
}

impl PolicyEvaluator {
    /// Start building an evaluator over `store`
    pub fn builder(store: Arc<dyn PolicyStore>) -> PolicyEvaluatorBuilder {
        PolicyEvaluatorBuilder {
            store,
            config: EvaluatorConfig::default(),
            asserter: None,
            resolver: None,
            engine: None,
        }
    }

    /// The synchronous pipeline, cheap to clone into other threads
    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// The runtime cache
    pub fn runtime(&self) -> &Arc<RuntimePolicyStore> {
        &self.runtime
    }

    /// See [`Evaluator::is_allowed`]
    pub fn is_allowed(&self, request: &RequestContext) -> Result<Decision> {
        self.evaluator.is_allowed(request)
    }

    /// See [`Evaluator::get_all_granted_roles`]
    pub fn get_all_granted_roles(&self, request: &RequestContext) -> Result<Vec<String>> {
        self.evaluator.get_all_granted_roles(request)
    }

    /// See [`Evaluator::get_all_granted_permissions`]
    pub fn get_all_granted_permissions(&self, request: &RequestContext) -> Result<Vec<Permission>> {
        self.evaluator.get_all_granted_permissions(request)
    }

    /// See [`Evaluator::diagnose`]
    pub fn diagnose(&self, request: &RequestContext) -> Result<EvaluationResult> {
        self.evaluator.diagnose(request)
    }

    /// Record the request with the store and allow it
    ///
    /// # Errors
    /// `Discover` if the store cannot record requests. The decision would
    /// still be an allow in discover mode.
    pub async fn discover(&self, request: &RequestContext) -> Result<Decision> {
        if let Err(e) = self.store.save_discover_request(request).await {
            warn!(service = %request.service_name, error = %e, "Failed to save discover request");
            return Err(e);
        }
        Ok(Decision::allow(Reason::DiscoverMode))
    }

    /// Reload the runtime cache from the store
    pub async fn refresh(&self) -> Result<()> {
        sync::full_reload(&self.runtime, self.store.as_ref()).await
    }

    /// Stop following the store and stop the background tasks
    pub fn stop_watch(&self) {
        self.store.stop_watch();
        self.shutdown.cancel();
        info!("Stopped watching policy store");
    }

    /// True until [`stop_watch`](Self::stop_watch) is called
    pub fn is_watching(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Add or replace a service in the runtime cache only
    ///
    /// The backing store is not touched; a later reload overwrites the change.
    pub fn add_service_in_runtime_cache(&self, service: Service) {
        self.runtime.add_service(service);
    }

    /// Remove a service from the runtime cache only
    pub fn delete_service_in_runtime_cache(&self, name: &str) {
        self.runtime.delete_service(name);
    }

    /// Add a policy to a cached service
    ///
    /// # Errors
    /// `ServiceNotFound` if the service is not cached
    pub fn add_policy_in_runtime_cache(&self, service_name: &str, policy: Policy) -> Result<()> {
        self.runtime.add_policy(service_name, policy)
    }

    /// Remove a policy from a cached service
    pub fn delete_policy_in_runtime_cache(&self, service_name: &str, id: &str) -> Result<()> {
        self.runtime.delete_policy(service_name, id)
    }

    /// Add a role policy to a cached service
    pub fn add_role_policy_in_runtime_cache(&self, service_name: &str, role_policy: RolePolicy) -> Result<()> {
        self.runtime.add_role_policy(service_name, role_policy)
    }

    /// Remove a role policy from a cached service
    pub fn delete_role_policy_in_runtime_cache(&self, service_name: &str, id: &str) -> Result<()> {
        self.runtime.delete_role_policy(service_name, id)
    }

    /// Add or replace a custom function
    ///
    /// Its cached results are dropped and every compiled condition is
    /// recompiled on next use.
    pub fn add_function_in_runtime_cache(&self, function: FunctionDef) {
        self.runtime.add_function(function);
    }

    /// Remove a custom function and its cached results
    pub fn delete_function_in_runtime_cache(&self, name: &str) {
        self.runtime.delete_function(name);
    }

    /// Drop expired custom function results; returns how many were dropped
    pub fn clean_expired_function_results(&self) -> usize {
        self.runtime.clean_expired_function_results()
    }
}

impl Drop for PolicyEvaluator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for PolicyEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEvaluator")
            .field("store", &self.store.kind())
            .field("watching", &self.is_watching())
            .finish()
    }
}

fn spawn_condition_publisher(
    mut updates: mpsc::UnboundedReceiver<ConditionUpdate>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                update = updates.recv() => match update {
                    Some(update) => {
                        debug!(service = %update.service.name(), id = %update.id, "Caching compiled condition");
                        update.apply();
                    }
                    None => break,
                },
            }
        }
        debug!("Condition publisher stopped");
    });
}

fn spawn_result_sweep(runtime: Arc<RuntimePolicyStore>, period: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = runtime.clean_expired_function_results();
                    if removed > 0 {
                        debug!(removed = removed, "Swept expired function results");
                    }
                }
            }
        }
        debug!("Function result sweep stopped");
    });
}

fn spawn_change_consumer(
    runtime: Arc<RuntimePolicyStore>,
    store: Arc<dyn PolicyStore>,
    mut events: mpsc::Receiver<StoreChangeEvent>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        info!(store = store.kind(), "Watching policy store for changes");
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let id = event.id;
            let kind = event.change.kind();
            if let Err(e) = sync::apply_event(&runtime, store.as_ref(), event).await {
                error!(event = id, kind = kind, error = %e, "Failed to apply store change");
            }
        }
        info!("Store change consumer stopped");
    });
}

//! Custom functions resolved over HTTP
//!
//! A custom function is called with `POST {"params": [...]}` and answers with
//! `{"result": <value>, "error": "<message>"}`. When a delegator endpoint is
//! configured every call goes through it instead, carrying the function
//! definition next to the request.

use dashmap::DashMap;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task;
use tracing::{debug, warn};

use super::result_cache::FunctionResultCache;
use super::ExpressionFunction;
use crate::error::{AuthzError, Result};
use crate::types::FunctionDef;

/// Resolves a custom function call to a value
pub trait FunctionResolver: Send + Sync {
    /// Call `function` with evaluated arguments
    fn call(&self, function: &FunctionDef, params: &[Value]) -> Result<Value>;
}

#[derive(Debug, Serialize)]
struct FunctionRequest<'a> {
    params: &'a [Value],
}

#[derive(Debug, Serialize)]
struct DelegatedRequest<'a> {
    function: &'a FunctionDef,
    request: FunctionRequest<'a>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: String,
}

/// HTTP resolver
///
/// Evaluation is synchronous, so each call blocks the evaluating thread for
/// at most the configured timeout:
/// - on a multi-threaded tokio runtime the async client is driven through
///   [`tokio::task::block_in_place`]
/// - on a current-thread runtime the call runs on a scoped helper thread
///   with the blocking client
/// - outside any runtime the blocking client is used directly
///
/// Async clients are reused per trusted CA. They keep no idle connections,
/// since a pooled connection belongs to the runtime that opened it.
pub struct HttpFunctionResolver {
    delegator: Option<String>,
    timeout: Duration,
    clients: DashMap<String, reqwest::Client>,
}

impl HttpFunctionResolver {
    /// Resolver calling each function's own URL
    pub fn new(timeout: Duration) -> Self {
        Self {
            delegator: None,
            timeout,
            clients: DashMap::new(),
        }
    }

    /// Resolver sending every call through a delegator endpoint
    pub fn with_delegator(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            delegator: Some(endpoint.into()),
            ..Self::new(timeout)
        }
    }

    fn client(&self, ca: &str) -> Result<reqwest::Client> {
        if let Some(client) = self.clients.get(ca) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .pool_max_idle_per_host(0);
        if let Some(cert) = certificate(ca)? {
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| AuthzError::CustomerFunction(format!("failed to build client: {}", e)))?;

        self.clients.insert(ca.to_string(), client.clone());
        Ok(client)
    }

    fn post(&self, url: &str, ca: &str, body: &Value) -> Result<Value> {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                let client = self.client(ca)?;
                task::block_in_place(|| handle.block_on(post_async(&client, url, body)))
            }
            // block_in_place panics on a current-thread runtime
            Ok(_) => std::thread::scope(|scope| {
                scope
                    .spawn(|| self.post_blocking(url, ca, body))
                    .join()
                    .unwrap_or_else(|_| {
                        Err(AuthzError::CustomerFunction(format!("call to {} panicked", url)))
                    })
            }),
            Err(_) => self.post_blocking(url, ca, body),
        }
    }

    /// Must not run on a runtime thread; the blocking client owns a runtime
    /// and is dropped before returning.
    fn post_blocking(&self, url: &str, ca: &str, body: &Value) -> Result<Value> {
        let mut builder = reqwest::blocking::Client::builder().timeout(self.timeout);
        if let Some(cert) = certificate(ca)? {
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| AuthzError::CustomerFunction(format!("failed to build client: {}", e)))?;

        let response = client
            .post(url)
            .json(body)
            .send()
            .map_err(|e| call_failed(url, e))?;
        let status = response.status();
        let text = response.text().map_err(|e| call_failed(url, e))?;
        parse_response(url, status, &text)
    }
}

async fn post_async(client: &reqwest::Client, url: &str, body: &Value) -> Result<Value> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| call_failed(url, e))?;
    let status = response.status();
    let text = response.text().await.map_err(|e| call_failed(url, e))?;
    parse_response(url, status, &text)
}

fn certificate(ca: &str) -> Result<Option<reqwest::Certificate>> {
    if ca.is_empty() {
        return Ok(None);
    }
    reqwest::Certificate::from_pem(ca.as_bytes())
        .map(Some)
        .map_err(|e| AuthzError::CustomerFunction(format!("invalid CA certificate: {}", e)))
}

fn call_failed(url: &str, e: reqwest::Error) -> AuthzError {
    AuthzError::CustomerFunction(format!("call to {} failed: {}", url, e))
}

fn parse_response(url: &str, status: StatusCode, body: &str) -> Result<Value> {
    if status != StatusCode::OK {
        return Err(AuthzError::CustomerFunction(format!(
            "call to {} returned status {}",
            url, status
        )));
    }

    let response: FunctionResponse = serde_json::from_str(body)
        .map_err(|e| AuthzError::CustomerFunction(format!("invalid response from {}: {}", url, e)))?;
    if !response.error.is_empty() {
        return Err(AuthzError::CustomerFunction(response.error));
    }
    Ok(response.result)
}

impl FunctionResolver for HttpFunctionResolver {
    fn call(&self, function: &FunctionDef, params: &[Value]) -> Result<Value> {
        if let Some(endpoint) = &self.delegator {
            let body = to_body(&DelegatedRequest {
                function,
                request: FunctionRequest { params },
            })?;
            return self.post(endpoint, "", &body);
        }

        let ca = match url_scheme(&function.func_url) {
            Some("https") => function.ca.as_str(),
            Some("http") => "",
            _ => {
                return Err(AuthzError::CustomerFunction(format!(
                    "unsupported function URL {}",
                    function.func_url
                )))
            }
        };
        self.post(&function.func_url, ca, &to_body(&FunctionRequest { params })?)
    }
}

fn to_body<B: Serialize>(body: &B) -> Result<Value> {
    serde_json::to_value(body)
        .map_err(|e| AuthzError::CustomerFunction(format!("cannot encode request: {}", e)))
}

fn url_scheme(url: &str) -> Option<&str> {
    url.split_once("://").map(|(scheme, _)| scheme)
}

/// A custom function bound to its resolver and the shared result cache
pub struct CustomFunction {
    definition: FunctionDef,
    resolver: Arc<dyn FunctionResolver>,
    results: Arc<FunctionResultCache>,
}

impl CustomFunction {
    /// Bind a definition to a resolver and result cache
    pub fn new(
        definition: FunctionDef,
        resolver: Arc<dyn FunctionResolver>,
        results: Arc<FunctionResultCache>,
    ) -> Self {
        Self {
            definition,
            resolver,
            results,
        }
    }

    /// Function definition
    pub fn definition(&self) -> &FunctionDef {
        &self.definition
    }
}

impl ExpressionFunction for CustomFunction {
    fn call(&self, args: &[Value]) -> Result<Value> {
        let key = FunctionResultCache::key(&self.definition.name, args);
        if let Some(result) = self.results.get(&key) {
            debug!(key = %key, "Function result cache hit");
            return Ok(result);
        }

        let result = self
            .resolver
            .call(&self.definition, args)
            .inspect_err(|e| warn!(function = %self.definition.name, error = %e, "Custom function failed"))?;

        if self.definition.result_cachable {
            self.results
                .insert(key, result.clone(), self.definition.result_ttl);
        }
        Ok(result)
    }
}

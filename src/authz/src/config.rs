//! Evaluator configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{AuthzError, Result};

/// Evaluator configuration
///
/// ```toml
/// enable_watch = true
/// function_service_endpoint = "http://funcsvc:6734/function"
/// function_call_timeout_secs = 5
/// result_sweep_interval_secs = 1800
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EvaluatorConfig {
    /// Subscribe to store change events at construction
    #[serde(default = "default_true")]
    pub enable_watch: bool,

    /// Delegator endpoint for custom function calls
    #[serde(default)]
    pub function_service_endpoint: Option<String>,

    /// Timeout for custom function calls
    #[serde(default = "default_function_call_timeout")]
    pub function_call_timeout_secs: u64,

    /// Period of the function result cache sweep
    #[serde(default = "default_result_sweep_interval")]
    pub result_sweep_interval_secs: u64,

    /// Change event channel capacity for stores that buffer events
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_true() -> bool { true }
fn default_function_call_timeout() -> u64 { 5 }
fn default_result_sweep_interval() -> u64 { 1800 }
fn default_event_buffer() -> usize { 256 }

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            enable_watch: default_true(),
            function_service_endpoint: None,
            function_call_timeout_secs: default_function_call_timeout(),
            result_sweep_interval_secs: default_result_sweep_interval(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl EvaluatorConfig {
    /// Parse configuration from TOML
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: EvaluatorConfig = toml::from_str(contents)
            .map_err(|e| AuthzError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.function_call_timeout_secs == 0 {
            return Err(AuthzError::Config(
                "function_call_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.result_sweep_interval_secs == 0 {
            return Err(AuthzError::Config(
                "result_sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(AuthzError::Config("event_buffer must be greater than 0".to_string()));
        }
        Ok(())
    }

    /// Custom function call timeout
    pub fn function_call_timeout(&self) -> Duration {
        Duration::from_secs(self.function_call_timeout_secs)
    }

    /// Function result sweep period
    pub fn result_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.result_sweep_interval_secs)
    }
}

//! Functions callable from conditions
//!
//! The [`FunctionTable`] is an immutable, cheaply cloned name → function map.
//! Adding or removing a function produces a new table; conditions compiled
//! against the old table keep using it until they are recompiled.

pub mod remote;
pub mod result_cache;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::cel::functions;
use crate::error::Result;

pub use remote::{CustomFunction, FunctionResolver, HttpFunctionResolver};
pub use result_cache::{FunctionResultCache, FunctionResult};

/// A function callable from a condition
pub trait ExpressionFunction: Send + Sync {
    /// Call the function with already evaluated arguments
    fn call(&self, args: &[Value]) -> Result<Value>;
}

impl<F> ExpressionFunction for F
where
    F: Fn(&[Value]) -> Result<Value> + Send + Sync,
{
    fn call(&self, args: &[Value]) -> Result<Value> {
        self(args)
    }
}

#[derive(Clone)]
struct FunctionEntry {
    function: Arc<dyn ExpressionFunction>,
    builtin: bool,
}

/// Name → function map shared by compiled conditions
#[derive(Clone, Default)]
pub struct FunctionTable {
    entries: Arc<HashMap<String, FunctionEntry>>,
}

impl FunctionTable {
    /// Table holding only the builtin functions
    pub fn with_builtins() -> Self {
        let builtins: [(&str, fn(&[Value]) -> Result<Value>); 6] = [
            ("Sqrt", functions::sqrt),
            ("Max", functions::max),
            ("Min", functions::min),
            ("Sum", functions::sum),
            ("Avg", functions::avg),
            ("IsSubSet", functions::is_subset),
        ];

        let entries = builtins
            .into_iter()
            .map(|(name, function)| {
                (
                    name.to_string(),
                    FunctionEntry {
                        function: Arc::new(function),
                        builtin: true,
                    },
                )
            })
            .collect();

        Self {
            entries: Arc::new(entries),
        }
    }

    /// New table with `function` registered as a custom function
    pub fn with_function(&self, name: impl Into<String>, function: Arc<dyn ExpressionFunction>) -> Self {
        let mut entries = (*self.entries).clone();
        entries.insert(
            name.into(),
            FunctionEntry {
                function,
                builtin: false,
            },
        );
        Self {
            entries: Arc::new(entries),
        }
    }

    /// New table without the custom function `name`; builtins are kept
    pub fn without_function(&self, name: &str) -> Self {
        let mut entries = (*self.entries).clone();
        if entries.get(name).is_some_and(|entry| !entry.builtin) {
            entries.remove(name);
        }
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Function by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn ExpressionFunction>> {
        self.entries.get(name).map(|entry| entry.function.clone())
    }

    /// True if `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Every registered function
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn ExpressionFunction>)> {
        self.entries
            .iter()
            .map(|(name, entry)| (name.as_str(), &entry.function))
    }

    /// Names of the custom (non-builtin) functions
    pub fn custom_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.builtin)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Number of registered functions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no function is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("FunctionTable").field("functions", &names).finish()
    }
}

//! CEL condition engine with compiled program caching

use cel_interpreter::extractors::Arguments;
use cel_interpreter::objects::Value as CelValue;
use cel_interpreter::{Context, ExecutionError, Program};
use dashmap::DashMap;
use std::sync::Arc;

use crate::cel::{
    context::EvalContext,
    convert::{cel_to_json, json_to_cel},
    error::{CelError, Result},
};
use crate::function::{ExpressionFunction, FunctionTable};

/// Compiles condition strings into evaluable predicates
pub trait ConditionEngine: Send + Sync {
    /// Compile `expression` against the functions in `functions`
    ///
    /// # Errors
    /// Returns error if the expression cannot be parsed
    fn compile(&self, expression: &str, functions: &FunctionTable) -> Result<Arc<dyn CompiledCondition>>;
}

/// A compiled boolean predicate over request attributes
pub trait CompiledCondition: Send + Sync {
    /// Source expression
    fn expression(&self) -> &str;

    /// Evaluate against the request attributes
    ///
    /// # Errors
    /// Returns error if evaluation fails or the result is not boolean
    fn evaluate(&self, ctx: &EvalContext) -> Result<bool>;
}

/// CEL engine
///
/// Parsed programs are cached by expression text, so recompiling a condition
/// after a function table change does not parse it again.
pub struct CelConditionEngine {
    /// Compiled program cache (thread-safe)
    program_cache: DashMap<String, Arc<Program>>,
}

impl CelConditionEngine {
    /// Create a new CEL engine
    pub fn new() -> Self {
        Self {
            program_cache: DashMap::new(),
        }
    }

    /// Parse an expression, reusing a cached program if available
    ///
    /// # Errors
    /// Returns error if expression cannot be compiled
    pub fn program(&self, expr: &str) -> Result<Arc<Program>> {
        if let Some(prog) = self.program_cache.get(expr) {
            return Ok(prog.clone());
        }

        let program = Program::compile(expr)
            .map_err(|e| CelError::Parse {
                expression: expr.to_string(),
                message: format!("{:?}", e),
            })?;

        let arc_program = Arc::new(program);
        self.program_cache.insert(expr.to_string(), arc_program.clone());

        Ok(arc_program)
    }

    /// Number of cached programs
    pub fn cached_programs(&self) -> usize {
        self.program_cache.len()
    }
}

impl Default for CelConditionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionEngine for CelConditionEngine {
    fn compile(&self, expression: &str, functions: &FunctionTable) -> Result<Arc<dyn CompiledCondition>> {
        let program = self.program(expression)?;
        Ok(Arc::new(CelCondition {
            expression: expression.to_string(),
            program,
            functions: functions.clone(),
        }))
    }
}

/// A parsed CEL program bound to a function table
pub struct CelCondition {
    expression: String,
    program: Arc<Program>,
    functions: FunctionTable,
}

impl CompiledCondition for CelCondition {
    fn expression(&self) -> &str {
        &self.expression
    }

    fn evaluate(&self, ctx: &EvalContext) -> Result<bool> {
        let mut cel_context = Context::default();

        for (key, value) in ctx.attributes() {
            let _ = cel_context.add_variable(key.clone(), json_to_cel(value));
        }

        for (name, function) in self.functions.iter() {
            register_function(&mut cel_context, name, function.clone());
        }

        let result = self
            .program
            .execute(&cel_context)
            .map_err(|e| CelError::Evaluation {
                expression: self.expression.clone(),
                message: format!("{:?}", e),
            })?;

        to_bool(&self.expression, &result)
    }
}

impl std::fmt::Debug for CelCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CelCondition")
            .field("expression", &self.expression)
            .finish()
    }
}

fn register_function(context: &mut Context, name: &str, function: Arc<dyn ExpressionFunction>) {
    let function_name = name.to_string();
    context.add_function(
        name,
        move |Arguments(args): Arguments| -> std::result::Result<CelValue, ExecutionError> {
            let args: Vec<serde_json::Value> = args.iter().map(cel_to_json).collect();
            function
                .call(&args)
                .map(|value| json_to_cel(&value))
                .map_err(|e| ExecutionError::function_error(&function_name, e.to_string()))
        },
    );
}

fn to_bool(expression: &str, value: &CelValue) -> Result<bool> {
    match value {
        CelValue::Bool(b) => Ok(*b),
        other => Err(CelError::NonBoolean {
            expression: expression.to_string(),
            kind: other.type_of().to_string(),
        }),
    }
}

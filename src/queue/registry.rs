//! Registry mapping function names to compiled handlers.
//!
//! Built once at startup and shared read-only; an unregistered name is
//! rejected at enqueue time rather than discovered by a dispatcher.

use std::collections::HashMap;
use std::sync::Arc;

use super::function::TaskFunction;
use super::handler::TaskHandler;
use crate::error::ValidationError;

/// Immutable function → handler map.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    handlers: HashMap<TaskFunction, Arc<dyn TaskHandler>>,
}

impl FunctionRegistry {
    pub fn builder() -> FunctionRegistryBuilder {
        FunctionRegistryBuilder::default()
    }

    /// Get the handler for a function.
    pub fn get(&self, function: TaskFunction) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&function).cloned()
    }

    pub fn contains(&self, function: TaskFunction) -> bool {
        self.handlers.contains_key(&function)
    }

    /// Resolve an external function name to a registered function.
    pub fn resolve(&self, name: &str) -> Result<TaskFunction, ValidationError> {
        let function: TaskFunction = name.parse()?;
        if self.contains(function) {
            Ok(function)
        } else {
            Err(ValidationError::UnknownFunction {
                name: name.to_string(),
            })
        }
    }

    /// Registered functions, in declaration order.
    pub fn functions(&self) -> Vec<TaskFunction> {
        TaskFunction::ALL
            .into_iter()
            .filter(|f| self.contains(*f))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.functions())
            .finish()
    }
}

#[derive(Default)]
pub struct FunctionRegistryBuilder {
    handlers: HashMap<TaskFunction, Arc<dyn TaskHandler>>,
}

impl FunctionRegistryBuilder {
    /// Register a handler. A later registration for the same function wins.
    pub fn register(mut self, function: TaskFunction, handler: Arc<dyn TaskHandler>) -> Self {
        if self.handlers.insert(function, handler).is_some() {
            tracing::warn!(function = %function, "Replaced previously registered handler");
        } else {
            tracing::debug!("Registered handler: {}", function);
        }
        self
    }

    /// Register one handler for several functions.
    pub fn register_all(
        mut self,
        functions: impl IntoIterator<Item = TaskFunction>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        for function in functions {
            self = self.register(function, Arc::clone(&handler));
        }
        self
    }

    pub fn build(self) -> FunctionRegistry {
        FunctionRegistry {
            handlers: self.handlers,
        }
    }
}

use crate::error::ExecutionError;
use crate::protocol::ToolSchemaRecord;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Host-side implementation of one tool.
///
/// Handlers run on the executor thread inside the host process. They must
/// report failures through `Err`; a panic is caught by the executor and
/// turned into an error envelope as well.
pub trait Handler: Send + Sync {
    fn call(&self, params: Value) -> Result<Value, ExecutionError>;
}

impl<F> Handler for F
where
    F: Fn(Value) -> Result<Value, ExecutionError> + Send + Sync,
{
    fn call(&self, params: Value) -> Result<Value, ExecutionError> {
        self(params)
    }
}

/// A named operation the host understands
#[derive(Clone)]
pub struct ToolDefinition {
    /// Globally unique name (e.g. "create_object")
    pub name: String,
    pub description: String,
    /// Tool family used for grouping ("object", "material", ...)
    pub category: String,
    /// JSON schema for the parameter object
    pub parameters: Value,
    pub enabled: bool,
    pub handler: Option<Arc<dyn Handler>>,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        category: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            category: category.into(),
            parameters,
            enabled: true,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Discovery record, with `enabled` already resolved against the overlay
    pub fn record(&self, enabled: bool) -> ToolSchemaRecord {
        ToolSchemaRecord {
            name: self.name.clone(),
            description: self.description.clone(),
            category: self.category.clone(),
            parameters: self.parameters.clone(),
            enabled,
        }
    }

    /// Same name, description, category, schema and flag. Handlers are
    /// compared by identity.
    pub fn same_content(&self, other: &ToolDefinition) -> bool {
        let same_handler = match (&self.handler, &other.handler) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        self.name == other.name
            && self.description == other.description
            && self.category == other.category
            && self.parameters == other.parameters
            && self.enabled == other.enabled
            && same_handler
    }
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("enabled", &self.enabled)
            .field("has_handler", &self.handler.is_some())
            .finish_non_exhaustive()
    }
}

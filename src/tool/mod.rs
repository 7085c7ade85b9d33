pub mod base;
pub mod catalog;

use crate::config::ToolSettings;
use crate::error::{lock, ExecutionError, ValidationError};
use crate::protocol::ToolSchemaRecord;
use base::ToolDefinition;
use jsonschema::JSONSchema;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A definition together with its compiled parameter schema
#[derive(Clone)]
struct RegisteredTool {
    definition: Arc<ToolDefinition>,
    schema: Arc<JSONSchema>,
}

/// Tool registry - maps operation names to definitions and handlers.
///
/// Populated once at start-up and read concurrently afterwards. Readers take
/// a shared lock; `list` iterates a snapshot so it never holds the lock while
/// the caller consumes it.
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, RegisteredTool>>,
    overlay: HashMap<String, ToolSettings>,
    // Serializes registration passes against each other
    registration: Mutex<()>,
}

impl ToolRegistry {
    /// Create an empty registry with no deployment overlay
    pub fn new() -> Self {
        Self::with_overlay(HashMap::new())
    }

    /// Create an empty registry with a per-tool overlay from configuration
    pub fn with_overlay(overlay: impl IntoIterator<Item = (String, ToolSettings)>) -> Self {
        Self {
            tools: RwLock::new(BTreeMap::new()),
            overlay: overlay.into_iter().collect(),
            registration: Mutex::new(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, RegisteredTool>> {
        self.tools.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, RegisteredTool>> {
        self.tools.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Add or replace a tool. The parameter schema is compiled here, so an
    /// invalid schema never reaches the map.
    pub fn register(&self, definition: ToolDefinition) -> Result<(), ValidationError> {
        let schema = JSONSchema::compile(&definition.parameters).map_err(|e| {
            ValidationError::new(&definition.name, format!("invalid parameter schema: {}", e))
        })?;

        let name = definition.name.clone();
        let definition = Arc::new(definition);
        let registered = RegisteredTool {
            definition: definition.clone(),
            schema: Arc::new(schema),
        };

        let replaced = self.write().insert(name.clone(), registered);
        match replaced {
            Some(previous) if previous.definition.same_content(&definition) => {
                tracing::debug!(tool = %name, "tool re-registered with identical definition");
            }
            Some(_) => tracing::info!(tool = %name, "tool definition replaced"),
            None => tracing::debug!(tool = %name, "tool registered"),
        }
        Ok(())
    }

    /// Register several tools as one pass. Concurrent passes are serialized.
    pub fn register_all(
        &self,
        definitions: impl IntoIterator<Item = ToolDefinition>,
    ) -> Result<usize, ValidationError> {
        let _pass = lock(&self.registration);
        let mut count = 0;
        for definition in definitions {
            self.register(definition)?;
            count += 1;
        }
        tracing::info!(count, total = self.len(), "registered tools");
        Ok(count)
    }

    /// Remove a tool by name
    pub fn unregister(&self, name: &str) -> Option<Arc<ToolDefinition>> {
        let removed = self.write().remove(name).map(|t| t.definition);
        if removed.is_some() {
            tracing::info!(tool = %name, "tool unregistered");
        }
        removed
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<ToolDefinition>> {
        self.read().get(name).map(|t| t.definition.clone())
    }

    /// Tools in name order, optionally restricted to one category. Each call
    /// starts a fresh pass over a snapshot.
    pub fn list(&self, category: Option<&str>) -> impl Iterator<Item = Arc<ToolDefinition>> {
        let snapshot: Vec<Arc<ToolDefinition>> =
            self.read().values().map(|t| t.definition.clone()).collect();
        let category = category.map(str::to_owned);
        snapshot
            .into_iter()
            .filter(move |tool| category.as_deref().map_or(true, |c| tool.category == c))
    }

    /// Distinct categories in sorted order
    pub fn categories(&self) -> Vec<String> {
        let categories: BTreeSet<String> =
            self.read().values().map(|t| t.definition.category.clone()).collect();
        categories.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// A tool is enabled when it exists, its own flag is set and the
    /// deployment overlay does not switch it off.
    pub fn is_enabled(&self, name: &str) -> bool {
        let Some(tool) = self.get(name) else {
            return false;
        };
        tool.enabled && self.overlay.get(name).map_or(true, |s| s.enabled)
    }

    /// Deployment parameter defaults for a tool
    pub fn tool_parameters(&self, name: &str) -> HashMap<String, Value> {
        self.overlay
            .get(name)
            .map(|s| s.parameters.clone())
            .unwrap_or_default()
    }

    /// Fill keys the caller omitted from the overlay defaults. Non-object
    /// params are returned untouched and left for `validate` to reject.
    pub fn apply_defaults(&self, name: &str, params: Value) -> Value {
        let Some(settings) = self.overlay.get(name) else {
            return params;
        };
        match params {
            Value::Object(mut map) => {
                for (key, value) in &settings.parameters {
                    map.entry(key.clone()).or_insert_with(|| value.clone());
                }
                Value::Object(map)
            }
            Value::Null if !settings.parameters.is_empty() => Value::Object(
                settings
                    .parameters
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Check params against the tool's schema, reporting the first violation
    pub fn validate(&self, name: &str, params: &Value) -> Result<(), ValidationError> {
        let tool = self
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ValidationError::new(name, "unknown tool"))?;

        let message = match tool.schema.validate(params) {
            Ok(()) => None,
            Err(mut errors) => errors.next().map(|first| {
                let path = first.instance_path.to_string();
                let location = if path.is_empty() {
                    "params".to_string()
                } else {
                    format!("params{}", path)
                };
                format!("{}: {}", location, first)
            }),
        };

        match message {
            Some(message) => Err(ValidationError::new(name, message)),
            None => Ok(()),
        }
    }

    /// Validation plus the enabled check: everything needed before dispatch
    pub fn check(&self, name: &str, params: &Value) -> Result<(), ValidationError> {
        self.validate(name, params)?;
        if !self.is_enabled(name) {
            return Err(ValidationError::new(name, "tool is disabled"));
        }
        Ok(())
    }

    /// Single dispatch point for local handlers
    pub fn invoke(&self, name: &str, params: Value) -> Result<Value, ExecutionError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ExecutionError::new(format!("unknown tool: {}", name)))?;
        let handler = tool
            .handler
            .clone()
            .ok_or_else(|| ExecutionError::new(format!("tool {} has no handler", name)))?;
        handler.call(params)
    }

    /// Discovery records for every tool, in name order
    pub fn schema_records(&self) -> Vec<ToolSchemaRecord> {
        self.list(None)
            .map(|tool| tool.record(self.is_enabled(&tool.name)))
            .collect()
    }

    /// Get all tool names
    pub fn list_names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

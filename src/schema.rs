//! Event schema registry: validate and version event payloads
//!
//! A `SchemaRegistry` holds the minimum field set of every typed event.
//! `EventBus` consults it before publishing, so a stage can never put an
//! incomplete payload on the bus.

use crate::error::{RelayError, Result};
use crate::types::Event;
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

/// Schema definition for an event type at a specific version
#[derive(Debug, Clone)]
pub struct EventSchema {
    /// Event type identifier (e.g., "message.created")
    pub event_type: String,

    /// Schema version
    pub version: u32,

    /// Required top-level fields in the payload
    pub required_fields: Vec<String>,

    /// Optional description of this schema version
    pub description: String,
}

impl EventSchema {
    /// Build a schema from static field names
    pub fn new(event_type: &str, version: u32, required_fields: &[&str], description: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            version,
            required_fields: required_fields.iter().map(|f| f.to_string()).collect(),
            description: description.to_string(),
        }
    }
}

/// Trait for event schema registries
pub trait SchemaRegistry: Send + Sync {
    /// Register a schema for an event type at a specific version
    fn register(&self, schema: EventSchema) -> Result<()>;

    /// Get the schema for an event type at a specific version
    fn get(&self, event_type: &str, version: u32) -> Result<Option<EventSchema>>;

    /// Get the latest schema version for an event type
    fn latest_version(&self, event_type: &str) -> Result<Option<u32>>;

    /// List all registered event types
    fn list_types(&self) -> Result<Vec<String>>;

    /// Validate an event's payload against its registered schema
    ///
    /// Returns Ok(()) if valid or if no schema is registered (untyped events pass).
    fn validate(&self, event: &Event) -> Result<()>;
}

/// In-memory schema registry
///
/// Stores schemas in a `HashMap` protected by `RwLock`.
pub struct MemorySchemaRegistry {
    /// (event_type, version) → schema
    schemas: RwLock<HashMap<(String, u32), EventSchema>>,
}

impl MemorySchemaRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry pre-populated with schemas
    pub fn with_schemas(schemas: impl IntoIterator<Item = EventSchema>) -> Result<Self> {
        let registry = Self::new();
        for schema in schemas {
            registry.register(schema)?;
        }
        Ok(registry)
    }
}

impl Default for MemorySchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> RelayError {
    RelayError::Backend(format!("Schema registry lock poisoned: {}", e))
}

impl SchemaRegistry for MemorySchemaRegistry {
    fn register(&self, schema: EventSchema) -> Result<()> {
        if schema.event_type.is_empty() {
            return Err(RelayError::Config("Event type cannot be empty".to_string()));
        }
        if schema.version == 0 {
            return Err(RelayError::Config("Schema version must be >= 1".to_string()));
        }

        let key = (schema.event_type.clone(), schema.version);
        self.schemas.write().map_err(poisoned)?.insert(key, schema);
        Ok(())
    }

    fn get(&self, event_type: &str, version: u32) -> Result<Option<EventSchema>> {
        let schemas = self.schemas.read().map_err(poisoned)?;
        Ok(schemas.get(&(event_type.to_string(), version)).cloned())
    }

    fn latest_version(&self, event_type: &str) -> Result<Option<u32>> {
        let schemas = self.schemas.read().map_err(poisoned)?;
        Ok(schemas
            .keys()
            .filter(|(t, _)| t == event_type)
            .map(|(_, v)| *v)
            .max())
    }

    fn list_types(&self) -> Result<Vec<String>> {
        let schemas = self.schemas.read().map_err(poisoned)?;
        let types: BTreeSet<String> = schemas.keys().map(|(t, _)| t.clone()).collect();
        Ok(types.into_iter().collect())
    }

    fn validate(&self, event: &Event) -> Result<()> {
        if event.event_type.is_empty() {
            return Ok(());
        }

        let schemas = self.schemas.read().map_err(poisoned)?;
        let Some(schema) = schemas.get(&(event.event_type.clone(), event.version)) else {
            return Ok(());
        };

        let invalid = |reason: String| RelayError::SchemaValidation {
            event_type: event.event_type.clone(),
            version: event.version,
            reason,
        };

        match event.payload {
            serde_json::Value::Object(ref map) => {
                for field in &schema.required_fields {
                    if !map.contains_key(field) {
                        return Err(invalid(format!("Missing required field '{}'", field)));
                    }
                }
            }
            _ if !schema.required_fields.is_empty() => {
                return Err(invalid(
                    "Payload must be a JSON object when schema has required fields".to_string(),
                ));
            }
            _ => {}
        }

        Ok(())
    }
}

//! Listener contract and the static event-type registry.
//!
//! The registry is built once at startup from the configured
//! `event_type -> listener identifier` bindings; unknown identifiers are
//! rejected there rather than discovered at dispatch time.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::classify::ListenerError;

/// A listener handles the decoded payload map of one event type.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn handle(&self, payload: Value) -> Result<(), ListenerError>;
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no listener implementation registered for identifier '{identifier}' (event type '{event_type}')")]
    UnknownIdentifier {
        event_type: String,
        identifier: String,
    },
}

/// Static `event_type -> listener` map
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: HashMap<String, Arc<dyn EventListener>>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.listeners.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            listeners: HashMap::new(),
        }
    }

    pub fn register(&mut self, event_type: impl Into<String>, listener: Arc<dyn EventListener>) {
        self.listeners.insert(event_type.into(), listener);
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn EventListener>> {
        self.listeners.get(event_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn event_types(&self) -> Vec<&str> {
        self.listeners.keys().map(String::as_str).collect()
    }

    /// Build the registry from configured bindings and the application's
    /// listener implementations keyed by identifier. Every binding must
    /// resolve; a dangling identifier is a configuration bug.
    pub fn from_bindings(
        bindings: &BTreeMap<String, String>,
        implementations: &HashMap<String, Arc<dyn EventListener>>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for (event_type, identifier) in bindings {
            let listener = implementations.get(identifier).ok_or_else(|| {
                RegistryError::UnknownIdentifier {
                    event_type: event_type.clone(),
                    identifier: identifier.clone(),
                }
            })?;
            registry.register(event_type.clone(), listener.clone());
        }
        info!(listeners = registry.len(), "Listener registry built");
        Ok(registry)
    }
}

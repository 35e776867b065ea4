//! Type registry boundary: which message types an endpoint knows about.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Role of a registered message type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    Event,
    Command,
    Query,
}

/// A message type known to the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub name: String,
    pub kind: TypeKind,
}

impl TypeDescriptor {
    pub fn event(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TypeKind::Event,
        }
    }

    pub fn is_event(&self) -> bool {
        self.kind == TypeKind::Event
    }
}

/// Supplies the message types an endpoint routes and subscribes to.
pub trait TypeRegistry: Send + Sync {
    fn descriptors(&self) -> Vec<TypeDescriptor>;

    /// Names of the types tagged as events (sorted, de-duplicated).
    fn event_types(&self) -> BTreeSet<String> {
        self.descriptors()
            .into_iter()
            .filter(TypeDescriptor::is_event)
            .map(|d| d.name)
            .collect()
    }
}

/// In-memory registry for tests/dev and simple hosts.
#[derive(Debug, Default)]
pub struct InMemoryTypeRegistry {
    types: RwLock<BTreeMap<String, TypeKind>>,
}

impl InMemoryTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-tag) a type.
    pub fn register(&self, name: impl Into<String>, kind: TypeKind) {
        let mut types = self.types.write().unwrap_or_else(|e| e.into_inner());
        types.insert(name.into(), kind);
    }

    pub fn register_event(&self, name: impl Into<String>) {
        self.register(name, TypeKind::Event);
    }

    pub fn register_command(&self, name: impl Into<String>) {
        self.register(name, TypeKind::Command);
    }

    pub fn with_events<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let registry = Self::new();
        for name in names {
            registry.register_event(name);
        }
        registry
    }
}

impl TypeRegistry for InMemoryTypeRegistry {
    fn descriptors(&self) -> Vec<TypeDescriptor> {
        let types = self.types.read().unwrap_or_else(|e| e.into_inner());
        types
            .iter()
            .map(|(name, kind)| TypeDescriptor {
                name: name.clone(),
                kind: *kind,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_event_types_are_routed() {
        let registry = InMemoryTypeRegistry::with_events(["OrderPlaced", "OrderShipped"]);
        registry.register_command("PlaceOrder");

        let events: Vec<_> = registry.event_types().into_iter().collect();
        assert_eq!(events, vec!["OrderPlaced", "OrderShipped"]);
        assert_eq!(registry.descriptors().len(), 3);
    }

    #[test]
    fn re_registering_changes_kind() {
        let registry = InMemoryTypeRegistry::with_events(["Ping"]);
        registry.register("Ping", TypeKind::Query);
        assert!(registry.event_types().is_empty());
    }
}

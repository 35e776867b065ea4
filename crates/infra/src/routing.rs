//! Routing provisioning.
//!
//! Each endpoint version owns one routing target on the log, named
//! `endpoint.version`, which links exactly the event types the endpoint
//! subscribes to, in global log order. The definition is declarative (target
//! plus an ordered list of exact type filters) and rendered to a canonical
//! text form so two processes provisioning the same endpoint version produce
//! byte-identical definitions.
//!
//! A definition that already exists with different text is **never**
//! reconciled: adopting it would silently change which events the endpoint
//! observes, so provisioning fails with [`EngineError::VersionConflict`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::EngineError;
use crate::log::{LogError, RoutingAdmin};

/// Ordering of linked entries in the routing target.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkOrder {
    /// Entries appear in the order they were written to the log.
    Global,
}

/// Exact match on an event's type tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeFilter {
    pub event_type: String,
}

/// Declarative routing specification as submitted to the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingSpec {
    pub target: String,
    pub order: LinkOrder,
    pub filters: Vec<TypeFilter>,
}

impl RoutingSpec {
    pub fn parse(text: &str) -> Result<Self, LogError> {
        serde_json::from_str(text).map_err(|e| LogError::InvalidDefinition(e.to_string()))
    }

    pub fn matches(&self, event_type: &str) -> bool {
        self.filters.iter().any(|f| f.event_type == event_type)
    }
}

/// A routing target for one endpoint version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDefinition {
    stream_name: String,
    event_types: BTreeSet<String>,
    text: String,
}

impl RoutingDefinition {
    /// Build the canonical definition. Type order and duplicates in the
    /// input do not affect the rendered text.
    pub fn new<I, S>(endpoint: &str, version: &str, event_types: I) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let stream_name = eventline_core::config::stream_name(endpoint, version);
        let event_types: BTreeSet<String> = event_types.into_iter().map(Into::into).collect();

        let spec = RoutingSpec {
            target: stream_name.clone(),
            order: LinkOrder::Global,
            filters: event_types
                .iter()
                .map(|t| TypeFilter {
                    event_type: t.clone(),
                })
                .collect(),
        };
        let text = serde_json::to_string_pretty(&spec)
            .map_err(|e| EngineError::Definition(e.to_string()))?;

        Ok(Self {
            stream_name,
            event_types,
            text,
        })
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn event_types(&self) -> &BTreeSet<String> {
        &self.event_types
    }

    /// Canonical text submitted to the log.
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Ensures the routing target for an endpoint version exists and matches.
pub struct RoutingProvisioner<A> {
    admin: A,
}

impl<A> RoutingProvisioner<A>
where
    A: RoutingAdmin,
{
    pub fn new(admin: A) -> Self {
        Self { admin }
    }

    /// Create or verify the routing target for `endpoint.version`.
    ///
    /// - absent: created (a concurrent creation by another process is ignored)
    /// - present and identical: no-op
    /// - present and different: [`EngineError::VersionConflict`]
    #[instrument(skip(self, event_types), fields(types = event_types.len()), err)]
    pub fn provision(
        &self,
        endpoint: &str,
        version: &str,
        event_types: &BTreeSet<String>,
    ) -> Result<RoutingDefinition, EngineError> {
        let definition = RoutingDefinition::new(endpoint, version, event_types.iter().cloned())?;
        let name = definition.stream_name();

        if definition.event_types().is_empty() {
            warn!(stream = %name, "routing target has no event types; nothing will be delivered");
        }

        match self.admin.get_definition(name)? {
            Some(existing) if existing == definition.text() => {
                debug!(stream = %name, "routing target already provisioned");
                Ok(definition)
            }
            Some(existing) => Err(EngineError::VersionConflict {
                stream: name.to_string(),
                existing,
                desired: definition.text().to_string(),
            }),
            None => match self.admin.create_definition(name, definition.text()) {
                Ok(()) => {
                    info!(stream = %name, "routing target created");
                    Ok(definition)
                }
                Err(LogError::AlreadyExists(_)) => {
                    debug!(stream = %name, "routing target created concurrently; ignoring");
                    Ok(definition)
                }
                Err(e) => Err(e.into()),
            },
        }
    }
}

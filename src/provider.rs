//! Event sources and their filter bindings
//!
//! An `EventSource` names a provider, carries its enablement masks, and owns
//! the handlers that receive its events: direct handlers fire for every event,
//! filter handlers only when their predicate admits the event.
//!
//! Provider-specific handlers are enrichers: they run first on every event
//! and do not count as a delivery path when the default handler is assigned.

use crate::error::{Result, TraceError};
use crate::filter::{EventFilter, EventHandler};
use crate::providers;
use crate::record::EventRecord;
use crate::registry::ProviderRegistry;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};
use uuid::Uuid;

/// Supplies an extra direct handler for a provider when a source for it is
/// created (e.g. feeding DNS answers into the reverse lookup cache)
pub trait ProviderHandler: Send + Sync {
    fn handler(&self) -> EventHandler;
}

/// What the trace backend needs to enable a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub name: Option<String>,
    pub id: Option<Uuid>,
    pub any_flags: u64,
    pub all_flags: u64,
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, &self.id) {
            (Some(name), _) => f.write_str(name),
            (None, Some(id)) => write!(f, "{{{}}}", id),
            (None, None) => f.write_str("<unnamed>"),
        }
    }
}

#[derive(Clone)]
pub struct EventSource {
    descriptor: SourceDescriptor,
    filters: Vec<EventFilter>,
    handlers: Vec<EventHandler>,
    enrichers: Vec<EventHandler>,
}

impl EventSource {
    /// Source identified by friendly name; a well-known name also gets its GUID
    pub fn by_name(name: &str) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TraceError::MissingIdentifier(
                "provider name is empty".to_string(),
            ));
        }
        Ok(Self::from_identity(Some(name.to_string()), providers::id_for_name(name)))
    }

    /// Source identified by GUID; a well-known GUID also gets its name
    pub fn by_id(id: Uuid) -> Self {
        Self::from_identity(providers::name_for_id(&id).map(str::to_string), Some(id))
    }

    /// Source from optional identifiers, at least one of which must be set
    pub fn new(name: Option<&str>, id: Option<Uuid>) -> Result<Self> {
        match (name, id) {
            (Some(name), Some(id)) => Ok(Self::from_identity(Some(name.to_string()), Some(id))),
            (Some(name), None) => Self::by_name(name),
            (None, Some(id)) => Ok(Self::by_id(id)),
            (None, None) => Err(TraceError::MissingIdentifier(
                "a provider name or GUID is required".to_string(),
            )),
        }
    }

    fn from_identity(name: Option<String>, id: Option<Uuid>) -> Self {
        Self {
            descriptor: SourceDescriptor {
                name,
                id,
                any_flags: 0,
                all_flags: 0,
            },
            filters: Vec::new(),
            handlers: Vec::new(),
            enrichers: Vec::new(),
        }
    }

    pub fn with_flags(mut self, any_flags: u64, all_flags: u64) -> Self {
        self.descriptor.any_flags = any_flags;
        self.descriptor.all_flags = all_flags;
        self
    }

    /// Attach the provider-specific handler registered for this source, if any
    pub fn with_provider_handlers(mut self, registry: &ProviderRegistry<dyn ProviderHandler>) -> Self {
        let specific = match (&self.descriptor.id, &self.descriptor.name) {
            (Some(id), _) if registry.contains_id(id) => registry.resolve_by_id(id).ok(),
            (_, Some(name)) if registry.contains_name(name) => registry.resolve_by_name(name).ok(),
            _ => None,
        };
        if let Some(specific) = specific {
            debug!(source = %self.descriptor, "attaching provider-specific handler");
            self.enrichers.push(specific.handler());
        }
        self
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> Option<&str> {
        self.descriptor.name.as_deref()
    }

    pub fn id(&self) -> Option<Uuid> {
        self.descriptor.id
    }

    pub fn add_handler(&mut self, handler: EventHandler) {
        self.handlers.push(handler);
    }

    pub fn add_filter(&mut self, filter: EventFilter) {
        self.filters.push(filter);
    }

    pub fn filters(&self) -> &[EventFilter] {
        &self.filters
    }

    pub fn handlers(&self) -> &[EventHandler] {
        &self.handlers
    }

    pub fn enrichers(&self) -> &[EventHandler] {
        &self.enrichers
    }

    /// Guarantee at least one delivery path: filters without handlers get the
    /// default; a source with neither filters nor handlers gets it directly
    pub fn ensure_default_handler_setup(&mut self, default: &EventHandler) {
        if self.filters.is_empty() {
            if self.handlers.is_empty() {
                self.handlers.push(default.clone());
            }
            return;
        }

        for filter in self.filters.iter_mut().filter(|f| !f.has_handlers()) {
            filter.add_handler(default.clone());
        }
    }

    /// Whether a record was produced by this source's provider
    pub fn matches(&self, record: &EventRecord) -> bool {
        match (&self.descriptor.id, &self.descriptor.name) {
            (Some(id), _) => record.provider_id == *id,
            (None, Some(name)) => record.provider_name.eq_ignore_ascii_case(name),
            (None, None) => false,
        }
    }

    /// Deliver one record: enrichers, direct handlers, then each admitting
    /// filter in order. Returns the number of handler invocations.
    pub fn dispatch(&self, record: &EventRecord) -> usize {
        let mut delivered = 0;
        for handler in self.enrichers.iter().chain(&self.handlers) {
            self.invoke(handler, record);
            delivered += 1;
        }
        for filter in self.filters.iter().filter(|f| f.admits(record)) {
            for handler in filter.handlers() {
                self.invoke(handler, record);
                delivered += 1;
            }
        }
        delivered
    }

    fn invoke(&self, handler: &EventHandler, record: &EventRecord) {
        if panic::catch_unwind(AssertUnwindSafe(|| handler(record))).is_err() {
            warn!(
                source = %self.descriptor,
                event_id = record.id,
                "event handler panicked; event dropped"
            );
        }
    }
}

impl fmt::Debug for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSource")
            .field("descriptor", &self.descriptor)
            .field("filters", &self.filters)
            .field("handlers", &self.handlers.len())
            .field("enrichers", &self.enrichers.len())
            .finish()
    }
}

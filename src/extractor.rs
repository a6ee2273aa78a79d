//! Record → structured record extraction
//!
//! Emits the common header fields, then each property in record order:
//! through the provider's semantic parser when it yields anything, otherwise
//! through the plain decoder.

use crate::decoder::{self, PropertyValue};
use crate::parser::PropertyParser;
use crate::record::{EventRecord, StructuredRecord};
use crate::registry::ProviderRegistry;
use std::sync::Arc;

pub struct PropertyExtractor {
    include_verbose: bool,
    parsers: Arc<ProviderRegistry<dyn PropertyParser>>,
}

impl PropertyExtractor {
    pub fn new(include_verbose: bool, parsers: Arc<ProviderRegistry<dyn PropertyParser>>) -> Self {
        Self {
            include_verbose,
            parsers,
        }
    }

    pub fn extract(&self, record: &EventRecord) -> StructuredRecord {
        let mut out = StructuredRecord::new();

        out.push("EtwEventId", PropertyValue::U16(record.id));
        out.push("EtwTimestamp", PropertyValue::DateTime(record.timestamp));
        out.push("EtwProcessId", PropertyValue::U32(record.process_id));
        out.push("EtwThreadId", PropertyValue::U32(record.thread_id));
        out.push(
            "EtwProviderName",
            PropertyValue::String(record.provider_name.clone()),
        );

        if self.include_verbose {
            out.push("EtwEventName", PropertyValue::String(record.name.clone()));
            out.push("EtwProviderId", PropertyValue::Guid(record.provider_id));
            out.push("EtwVersion", PropertyValue::U8(record.version));
            out.push("EtwLevel", PropertyValue::U8(record.level));
        }

        // Parsers for unregistered providers are simply absent
        let parser = self.parsers.resolve_by_id(&record.provider_id).ok();

        for property in &record.properties {
            let parsed = parser
                .as_ref()
                .map(|p| p.parse(&property.name, record))
                .unwrap_or_default();

            if parsed.is_empty() {
                out.push(property.name.clone(), decoder::decode(property));
            } else {
                for (key, value) in parsed {
                    out.push(key, value);
                }
            }
        }

        out
    }
}

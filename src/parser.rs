//! Provider-specific semantic parsers
//!
//! A parser reinterprets one raw field into zero or more named values. An
//! empty result tells the extractor to fall back to plain property decoding.
//! Parsers never fail: missing sub-fields become empty strings.

use crate::decoder::PropertyValue;
use crate::dns::ReverseLookupCache;
use crate::providers;
use crate::record::EventRecord;
use crate::registry::ProviderRegistry;
use std::sync::Arc;

pub trait PropertyParser: Send + Sync {
    fn parse(&self, field: &str, record: &EventRecord) -> Vec<(String, PropertyValue)>;
}

/// Kernel-Network: `daddr`/`saddr` carry raw addresses
pub struct KernelNetworkParser {
    cache: Option<Arc<ReverseLookupCache>>,
}

impl KernelNetworkParser {
    pub fn new() -> Self {
        Self { cache: None }
    }

    /// Also emit `daddr_names` from the reverse lookup cache
    pub fn with_reverse_lookup(cache: Arc<ReverseLookupCache>) -> Self {
        Self { cache: Some(cache) }
    }
}

impl Default for KernelNetworkParser {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyParser for KernelNetworkParser {
    fn parse(&self, field: &str, record: &EventRecord) -> Vec<(String, PropertyValue)> {
        match field {
            "daddr" | "saddr" => {
                let Some(address) = record.get_ip_addr(field) else {
                    return Vec::new();
                };
                let mut out = vec![(field.to_string(), PropertyValue::Address(address))];
                if field == "daddr" {
                    let names = self
                        .cache
                        .as_ref()
                        .map(|cache| cache.names_for_address(&address))
                        .unwrap_or_default();
                    if !names.is_empty() {
                        let joined = names.into_iter().collect::<Vec<_>>().join(",");
                        out.push(("daddr_names".to_string(), PropertyValue::String(joined)));
                    }
                }
                out
            }
            _ => Vec::new(),
        }
    }
}

/// PowerShell: `ContextInfo` is a multi-line `Key = Value` block
#[derive(Debug, Default)]
pub struct PowerShellParser;

impl PowerShellParser {
    const KEYS: [(&'static str, &'static str); 4] = [
        ("Host Application = ", "HostProcess"),
        ("Command Name = ", "CommandName"),
        ("Command Type = ", "CommandType"),
        ("User = ", "UserName"),
    ];

    /// Split the context block into the four semantic fields, searching each
    /// key after the previous one
    pub fn parse_context_info(data: &str) -> Vec<(String, PropertyValue)> {
        let mut cursor = 0;
        Self::KEYS
            .iter()
            .map(|&(marker, output)| {
                let value = match data[cursor..].find(marker) {
                    Some(offset) => {
                        let start = cursor + offset + marker.len();
                        let (value, end) = read_to_newline(data, start);
                        cursor = end;
                        value.to_string()
                    }
                    None => String::new(),
                };
                (output.to_string(), PropertyValue::String(value))
            })
            .collect()
    }
}

impl PropertyParser for PowerShellParser {
    fn parse(&self, field: &str, record: &EventRecord) -> Vec<(String, PropertyValue)> {
        if field != "ContextInfo" {
            return Vec::new();
        }
        match record.get_string(field) {
            Some(data) => Self::parse_context_info(&data),
            None => Vec::new(),
        }
    }
}

/// Text from `start` up to the next line break, and the index of that break
fn read_to_newline(data: &str, start: usize) -> (&str, usize) {
    if start >= data.len() {
        return ("", start);
    }
    let rest = &data[start..];
    let end = rest.find(|c: char| c == '\r' || c == '\n').map_or(data.len(), |i| start + i);
    (&data[start..end], end)
}

/// Registry preloaded with the built-in parsers
pub fn default_parsers(cache: Option<Arc<ReverseLookupCache>>) -> ProviderRegistry<dyn PropertyParser> {
    let registry: ProviderRegistry<dyn PropertyParser> = ProviderRegistry::new();
    registry.register(
        providers::POWERSHELL,
        providers::POWERSHELL_ID,
        Arc::new(PowerShellParser),
    );
    let network = match cache {
        Some(cache) => KernelNetworkParser::with_reverse_lookup(cache),
        None => KernelNetworkParser::new(),
    };
    registry.register(
        providers::KERNEL_NETWORK,
        providers::KERNEL_NETWORK_ID,
        Arc::new(network),
    );
    registry
}

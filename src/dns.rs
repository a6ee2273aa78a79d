//! Reverse name-resolution cache
//!
//! Maps addresses to the names observed resolving to them. Seeded once from a
//! system snapshot, then updated live from DNS-Client lookup events. There is
//! no eviction and no claim of completeness.

use crate::error::{Result, TraceError};
use crate::filter::EventHandler;
use crate::provider::ProviderHandler;
use crate::providers;
use crate::record::EventRecord;
use crate::registry::ProviderRegistry;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, trace};

/// DNS-Client event: lookup answered from cache
pub const DNS_CACHED_LOOKUP: u16 = 3018;
/// DNS-Client event: lookup answered by a server
pub const DNS_LIVE_LOOKUP: u16 = 3020;
/// DNS-Client event: name does not exist
pub const DNS_NXDOMAIN: u16 = 1016;

/// One (name, address) pair from a resolution snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionEntry {
    pub name: String,
    pub address: IpAddr,
}

/// Source of the boot-time resolution snapshot
pub trait ResolutionSnapshot {
    fn entries(&self) -> Result<Vec<ResolutionEntry>>;
}

/// Snapshot read from an `/etc/hosts`-style file
#[derive(Debug, Clone)]
pub struct HostsFileSnapshot {
    path: PathBuf,
}

impl HostsFileSnapshot {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn system() -> Self {
        Self::new("/etc/hosts")
    }

    /// Parse hosts-file text; unparseable lines are skipped
    pub fn parse(content: &str) -> Vec<ResolutionEntry> {
        let mut entries = Vec::new();
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or_default();
            let mut fields = line.split_whitespace();
            let Some(address) = fields.next().and_then(|a| a.parse::<IpAddr>().ok()) else {
                continue;
            };
            entries.extend(fields.map(|name| ResolutionEntry {
                name: name.to_string(),
                address,
            }));
        }
        entries
    }
}

impl ResolutionSnapshot for HostsFileSnapshot {
    fn entries(&self) -> Result<Vec<ResolutionEntry>> {
        let content = fs::read_to_string(&self.path)?;
        Ok(Self::parse(&content))
    }
}

/// Address ↔ name correlation store
#[derive(Debug, Default)]
pub struct ReverseLookupCache {
    entries: RwLock<HashMap<IpAddr, BTreeSet<String>>>,
}

impl ReverseLookupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cache seeded from a snapshot
    pub fn seeded(snapshot: &dyn ResolutionSnapshot) -> Result<Self> {
        let cache = Self::new();
        let count = cache.seed(snapshot)?;
        debug!(entries = count, "reverse lookup cache seeded");
        Ok(cache)
    }

    /// Add every snapshot entry; returns how many entries were read
    pub fn seed(&self, snapshot: &dyn ResolutionSnapshot) -> Result<usize> {
        let entries = snapshot.entries()?;
        for entry in &entries {
            self.record_resolution(entry.address, &entry.name);
        }
        Ok(entries.len())
    }

    /// Idempotent; names are case-folded so "A" and "a" are one entry
    pub fn record_resolution(&self, address: IpAddr, name: &str) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        let folded = name.to_lowercase();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.entry(address).or_default().insert(folded) {
            trace!(%address, name, "new resolution recorded");
        }
    }

    pub fn names_for_address(&self, address: &IpAddr) -> BTreeSet<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    /// Linear scan over all entries, case-insensitive
    pub fn addresses_for_name(&self, name: &str) -> BTreeSet<IpAddr> {
        let folded = name.trim().to_lowercase();
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, names)| names.contains(&folded))
            .map(|(address, _)| *address)
            .collect()
    }

    /// Number of distinct addresses
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Extract the address answers from a DNS-Client `QueryResults` payload
///
/// The payload is `;`-separated; entries that are not plain addresses (CNAME
/// or `type:` markers) are ignored.
pub fn parse_query_results(results: &str) -> Vec<IpAddr> {
    let mut seen = BTreeSet::new();
    results
        .trim()
        .split(';')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter(|token| seen.insert(*token))
        .filter_map(|token| token.parse::<IpAddr>().ok())
        .collect()
}

/// Feeds DNS-Client lookup results into the reverse lookup cache
pub struct DnsClientHandler {
    cache: Arc<ReverseLookupCache>,
}

impl DnsClientHandler {
    pub fn new(cache: Arc<ReverseLookupCache>) -> Self {
        Self { cache }
    }

    pub fn handle(&self, record: &EventRecord) {
        if record.id != DNS_CACHED_LOOKUP && record.id != DNS_LIVE_LOOKUP {
            return;
        }
        let Some(domain) = record.get_string("QueryName") else {
            return;
        };
        let Some(results) = record.get_string("QueryResults") else {
            return;
        };
        for address in parse_query_results(&results) {
            self.cache.record_resolution(address, &domain);
        }
    }
}

impl ProviderHandler for DnsClientHandler {
    fn handler(&self) -> EventHandler {
        let handler = DnsClientHandler::new(self.cache.clone());
        Arc::new(move |record: &EventRecord| handler.handle(record))
    }
}

/// Registry of the built-in provider-specific handlers
pub fn default_handlers(cache: Arc<ReverseLookupCache>) -> ProviderRegistry<dyn ProviderHandler> {
    let registry: ProviderRegistry<dyn ProviderHandler> = ProviderRegistry::new();
    registry.register(
        providers::DNS_CLIENT,
        providers::DNS_CLIENT_ID,
        Arc::new(DnsClientHandler::new(cache)),
    );
    registry
}

/// Parse a user-supplied address for a reverse query
pub fn parse_address(text: &str) -> Result<IpAddr> {
    text.trim().parse::<IpAddr>().map_err(|_| {
        TraceError::InvalidArgument(format!("{} does not appear to be a valid IP", text))
    })
}

//! Trace configuration loaded from TOML
//!
//! Tunables for sessions, correlation and draining, plus the `[[source]]`
//! tables turned into event sources by `build_sources`.

use crate::correlator::CorrelatorConfig;
use crate::error::{Result, TraceError};
use crate::filter::{EventFilter, Predicate};
use crate::provider::{EventSource, ProviderHandler};
use crate::providers;
use crate::registry::ProviderRegistry;
use crate::session::default_session_name;
use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Trace settings loaded from TOML
///
/// # Example TOML
/// ```toml
/// session_name = "nightly"
/// grace_period_ms = 5000
///
/// [[source]]
/// name = "Microsoft-Windows-Kernel-Network"
/// filters = ["pid=4242,event=10|42"]
///
/// [[source]]
/// guid = "1c95126e-7eea-49a9-a3fe-a378b03ddb4d"
/// any_flags = 0x10
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TraceConfig {
    pub session_name: String,
    pub include_verbose_properties: bool,
    pub stop_timeout_ms: u64,
    pub grace_period_ms: u64,
    pub drain_interval_ms: u64,
    pub injection_threshold_ms: u64,
    pub trace_time_limit_ms: Option<u64>,
    #[serde(rename = "source")]
    pub sources: Vec<SourceConfig>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            session_name: default_session_name(),
            include_verbose_properties: false,
            stop_timeout_ms: 2_000,
            grace_period_ms: 10_000,
            drain_interval_ms: 2_000,
            injection_threshold_ms: 10,
            trace_time_limit_ms: None,
            sources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub name: Option<String>,
    pub guid: Option<Uuid>,
    pub any_flags: u64,
    pub all_flags: u64,
    pub filters: Vec<String>,
}

impl TraceConfig {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).with_context(|| "Failed to parse TOML trace configuration")
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read trace configuration: {}", path.as_ref().display())
        })?;
        Self::from_toml_str(&content)
            .with_context(|| format!("In {}", path.as_ref().display()))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms.max(1))
    }

    pub fn trace_time_limit(&self) -> Option<Duration> {
        self.trace_time_limit_ms.map(Duration::from_millis)
    }

    pub fn correlator(&self) -> CorrelatorConfig {
        CorrelatorConfig {
            grace_period: Duration::from_millis(self.grace_period_ms),
            injection_threshold: Duration::from_millis(self.injection_threshold_ms),
        }
    }

    /// Turn `[[source]]` tables into event sources, with provider-specific
    /// handlers attached. No tables means every well-known provider,
    /// unfiltered.
    pub fn build_sources(
        &self,
        specific: &ProviderRegistry<dyn ProviderHandler>,
    ) -> Result<Vec<EventSource>> {
        if self.sources.is_empty() {
            return Ok(providers::all()
                .map(|(_, id)| EventSource::by_id(id).with_provider_handlers(specific))
                .collect());
        }

        self.sources
            .iter()
            .enumerate()
            .map(|(index, table)| {
                let mut source = EventSource::new(table.name.as_deref(), table.guid)
                    .map_err(|e| TraceError::Config(format!("source #{}: {}", index + 1, e)))?
                    .with_flags(table.any_flags, table.all_flags)
                    .with_provider_handlers(specific);
                for expr in &table.filters {
                    let predicate = Predicate::from_expr(expr).map_err(|e| {
                        TraceError::Config(format!("source #{} filter '{}': {}", index + 1, expr, e))
                    })?;
                    source.add_filter(EventFilter::new(predicate));
                }
                Ok(source)
            })
            .collect()
    }
}

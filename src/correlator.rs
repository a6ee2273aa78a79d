//! Process-scoped correlation across providers
//!
//! `ProcessCorrelator` builds the source set that follows one monitored
//! process: its child process starts, its own exit, image loads, threads
//! created into it from elsewhere, PowerShell pipeline starts, network sends,
//! DNS lookups, suspicious WMI operations, registry and file activity.
//! Relevant events are extracted and buffered; a drain loop moves them to
//! the sink.
//!
//! Observing the target's exit schedules cancellation after a grace period
//! so trailing events still make it into the stream. Per-event failures
//! (missing fields, unknown processes) drop that event and bump a counter.

use crate::buffer::{BufferStats, RecordBuffer};
use crate::decoder::PropertyValue;
use crate::error::{Result, TraceError};
use crate::extractor::PropertyExtractor;
use crate::filter::{EventFilter, EventHandler, Predicate};
use crate::provider::{EventSource, ProviderHandler};
use crate::providers;
use crate::record::{EventRecord, StructuredRecord};
use crate::registry::ProviderRegistry;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const PROCESS_START: u16 = 1;
pub const PROCESS_STOP: u16 = 2;
pub const THREAD_START: u16 = 3;
pub const IMAGE_LOAD: u16 = 5;
pub const POWERSHELL_PIPELINE: u16 = 7937;
pub const WMI_OPERATION: u16 = 11;
/// TCP/UDP send over IPv4 and IPv6
pub const NETWORK_SEND: [u16; 4] = [10, 26, 42, 58];
pub const DNS_EVENTS: [u16; 3] = [
    crate::dns::DNS_NXDOMAIN,
    crate::dns::DNS_CACHED_LOOKUP,
    crate::dns::DNS_LIVE_LOOKUP,
];
pub const FILE_EVENTS: [u16; 2] = [12, 30];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelatorConfig {
    pub grace_period: Duration,
    /// Threads created into the target later than this after its start
    /// are flagged
    pub injection_threshold: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            injection_threshold: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub started_at: DateTime<Utc>,
    pub image: Option<String>,
}

pub struct ProcessCorrelator {
    target: u32,
    config: CorrelatorConfig,
    extractor: Arc<PropertyExtractor>,
    processes: RwLock<HashMap<u32, ProcessInfo>>,
    buffer: RecordBuffer,
    events_seen: AtomicU64,
    dropped: AtomicU64,
    cancel_at: Mutex<Option<Instant>>,
}

impl ProcessCorrelator {
    /// `target_info` seeds the target's start time when it is already known
    /// (e.g. the process was launched suspended by us)
    pub fn new(
        target: u32,
        target_info: Option<ProcessInfo>,
        extractor: Arc<PropertyExtractor>,
        config: CorrelatorConfig,
    ) -> Self {
        let mut processes = HashMap::new();
        if let Some(info) = target_info {
            processes.insert(target, info);
        }
        Self {
            target,
            config,
            extractor,
            processes: RwLock::new(processes),
            buffer: RecordBuffer::default(),
            events_seen: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            cancel_at: Mutex::new(None),
        }
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    pub fn process_info(&self, pid: u32) -> Option<ProcessInfo> {
        self.processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .cloned()
    }

    /// Events delivered to the correlator's handlers so far
    pub fn events_seen(&self) -> u64 {
        self.events_seen.load(Ordering::Relaxed)
    }

    /// Events dropped because they could not be decoded or correlated
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    pub fn drain(&self) -> Vec<StructuredRecord> {
        self.buffer.drain()
    }

    /// Cancellation has been scheduled (the target exited)
    pub fn cancel_pending(&self) -> bool {
        self.cancel_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// The grace period after the target's exit has elapsed
    pub fn is_cancelled(&self) -> bool {
        self.cancel_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn schedule_cancel(&self) {
        let mut cancel_at = self.cancel_at.lock().unwrap_or_else(PoisonError::into_inner);
        if cancel_at.is_none() {
            info!(
                pid = self.target,
                grace_ms = self.config.grace_period.as_millis() as u64,
                "monitored process exited; draining trailing events"
            );
            *cancel_at = Some(Instant::now() + self.config.grace_period);
        }
    }

    /// The correlated source set, filtered on the target pid. Provider
    /// handlers registered in `specific` (e.g. DNS cache feeding) are
    /// attached as well.
    pub fn sources(
        self: &Arc<Self>,
        specific: &ProviderRegistry<dyn ProviderHandler>,
    ) -> Vec<EventSource> {
        let pid = Predicate::process_id_equals(self.target);
        let ids = |ids: &[u16]| Predicate::event_id_in(ids).unwrap_or_else(Predicate::any);

        let mut process = EventSource::by_id(providers::KERNEL_PROCESS_ID);
        process.add_filter(
            EventFilter::new(ids(&[PROCESS_START, PROCESS_STOP]))
                .with_handler(self.handler(Self::on_process_lifecycle)),
        );
        process.add_filter(
            EventFilter::new(pid.clone().and(Predicate::event_id_equals(IMAGE_LOAD)))
                .with_handler(self.handler(Self::on_generic)),
        );
        process.add_filter(
            EventFilter::new(Predicate::event_id_equals(THREAD_START))
                .with_handler(self.handler(Self::on_thread_start)),
        );

        let mut powershell = EventSource::by_id(providers::POWERSHELL_ID);
        powershell.add_filter(
            EventFilter::new(
                pid.clone()
                    .and(Predicate::event_id_equals(POWERSHELL_PIPELINE))
                    .and(Predicate::string_contains("Payload", "Started.", true)),
            )
            .with_handler(self.handler(Self::on_generic)),
        );

        let mut network = EventSource::by_id(providers::KERNEL_NETWORK_ID);
        network.add_filter(
            EventFilter::new(pid.clone().and(ids(&NETWORK_SEND)))
                .with_handler(self.handler(Self::on_generic)),
        );

        let mut dns = EventSource::by_id(providers::DNS_CLIENT_ID);
        dns.add_filter(
            EventFilter::new(pid.clone().and(ids(&DNS_EVENTS)))
                .with_handler(self.handler(Self::on_generic)),
        );

        let mut wmi = EventSource::by_id(providers::WMI_ACTIVITY_ID);
        wmi.add_filter(
            EventFilter::new(
                Predicate::event_id_equals(WMI_OPERATION).and(suspicious_wmi_operation()),
            )
            .with_handler(self.handler(Self::on_wmi_operation)),
        );

        let mut registry = EventSource::by_id(providers::KERNEL_REGISTRY_ID);
        registry.add_filter(EventFilter::new(pid.clone()).with_handler(self.handler(Self::on_generic)));

        let mut file = EventSource::by_id(providers::KERNEL_FILE_ID);
        file.add_filter(
            EventFilter::new(pid.and(ids(&FILE_EVENTS))).with_handler(self.handler(Self::on_generic)),
        );

        [process, powershell, network, dns, wmi, registry, file]
            .into_iter()
            .map(|source| source.with_provider_handlers(specific))
            .collect()
    }

    /// Wrap a correlation step: count, buffer what it keeps, drop on error
    fn handler(
        self: &Arc<Self>,
        step: fn(&Self, &EventRecord) -> Result<Option<StructuredRecord>>,
    ) -> EventHandler {
        let this = self.clone();
        Arc::new(move |record: &EventRecord| this.observe(record, step))
    }

    fn observe(
        &self,
        record: &EventRecord,
        step: fn(&Self, &EventRecord) -> Result<Option<StructuredRecord>>,
    ) {
        self.events_seen.fetch_add(1, Ordering::Relaxed);
        match step(self, record) {
            Ok(Some(structured)) => {
                self.buffer.push(structured);
            }
            Ok(None) => {}
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    provider = %record.provider_name,
                    event_id = record.id,
                    error = %e,
                    "dropping uncorrelatable event"
                );
            }
        }
    }

    fn on_generic(&self, record: &EventRecord) -> Result<Option<StructuredRecord>> {
        Ok(Some(self.extractor.extract(record)))
    }

    /// Child starts (parent is the target) and the target's own exit
    fn on_process_lifecycle(&self, record: &EventRecord) -> Result<Option<StructuredRecord>> {
        match record.id {
            PROCESS_START => {
                let parent = required_u32(record, "ParentProcessID")?;
                let pid = required_u32(record, "ProcessID")?;
                if pid == self.target || parent == self.target {
                    let info = ProcessInfo {
                        started_at: record.timestamp,
                        image: record.get_string("ImageName"),
                    };
                    self.processes
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(pid, info);
                }
                if parent == self.target {
                    Ok(Some(self.extractor.extract(record)))
                } else {
                    Ok(None)
                }
            }
            PROCESS_STOP if record.process_id == self.target => {
                let structured = self.extractor.extract(record);
                self.schedule_cancel();
                Ok(Some(structured))
            }
            _ => Ok(None),
        }
    }

    /// A thread created into another process long after that process began
    /// is likely injection; one created right at start is its initial thread
    fn on_thread_start(&self, record: &EventRecord) -> Result<Option<StructuredRecord>> {
        let target_pid = required_u32(record, "ProcessID")?;
        let creator = record.process_id;
        if creator != self.target && target_pid != self.target {
            return Ok(None);
        }
        if creator == target_pid {
            return Ok(None);
        }

        let info = self
            .process_info(target_pid)
            .ok_or_else(|| TraceError::NotFound(format!("start time for pid {}", target_pid)))?;
        let elapsed = record
            .timestamp
            .signed_duration_since(info.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if elapsed <= self.config.injection_threshold {
            return Ok(None);
        }

        let mut structured = self.extractor.extract(record);
        structured.push(
            "TargetProcessName",
            PropertyValue::String(info.image.unwrap_or_default()),
        );
        Ok(Some(structured))
    }

    fn on_wmi_operation(&self, record: &EventRecord) -> Result<Option<StructuredRecord>> {
        let client = record
            .get_i32("ClientProcessId")
            .ok_or_else(|| TraceError::NotFound("ClientProcessId".to_string()))?;
        if i64::from(client) == i64::from(self.target) {
            Ok(Some(self.extractor.extract(record)))
        } else {
            Ok(None)
        }
    }
}

/// WMI operations worth following: instance writes that set up persistence,
/// class writes outside hardware inventory, and method calls that spawn
/// processes, write the registry, snapshot volumes or copy files
pub fn suspicious_wmi_operation() -> Predicate {
    let instance_write = operation_contains("::PutInstance").and(
        Predicate::string_contains("NamespaceName", "root\\subscription", false).or(
            operation_contains_any(&[
                "__Provider",
                "Win32_Service",
                "Win32_StartupCommand",
                "__NAMESPACE",
                "__EventFilter",
                "__FilterToConsumerBinding",
                "ActiveScriptEventConsumer",
                "CommandLineEventConsumer",
                "LogFileEventConsumer",
                "NTEventLogEventConsumer",
                "SMTPEventConsumer",
            ]),
        ),
    );

    let class_write = operation_contains("::PutClass").and(!operation_contains("HWINV"));

    let method_call = operation_contains("::ExecMethod").and(
        operation_contains_any(&[
            "Win32_Process::Create",
            "StdRegProv::Create",
            "Win32_ShadowCopy::Create",
            "CIM_datafile::Copy",
        ])
        .or(operation_contains("StdRegProv::Set").and(!operation_contains("SetBinaryValue"))),
    );

    instance_write.or(class_write).or(method_call)
}

fn operation_contains(needle: &str) -> Predicate {
    Predicate::string_contains("Operation", needle, false)
}

fn operation_contains_any(needles: &[&str]) -> Predicate {
    needles
        .iter()
        .map(|needle| operation_contains(needle))
        .reduce(Predicate::or)
        .unwrap_or_else(Predicate::any)
}

fn required_u32(record: &EventRecord, field: &str) -> Result<u32> {
    record
        .get_u32(field)
        .ok_or_else(|| TraceError::NotFound(field.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::default_parsers;
    use crate::record::Property;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn correlator(target_info: Option<ProcessInfo>) -> Arc<ProcessCorrelator> {
        let extractor = Arc::new(PropertyExtractor::new(false, Arc::new(default_parsers(None))));
        Arc::new(ProcessCorrelator::new(
            100,
            target_info,
            extractor,
            CorrelatorConfig {
                grace_period: Duration::from_millis(50),
                injection_threshold: Duration::from_millis(10),
            },
        ))
    }

    fn feed(sources: &[EventSource], record: &EventRecord) {
        for source in sources.iter().filter(|s| s.matches(record)) {
            source.dispatch(record);
        }
    }

    fn process_event(id: u16, pid: u32, at_ms: i64) -> EventRecord {
        EventRecord::builder(providers::KERNEL_PROCESS, providers::KERNEL_PROCESS_ID, id)
            .process(pid)
            .at(base() + chrono::Duration::milliseconds(at_ms))
            .build()
    }

    fn start(pid: u32, parent: u32, at_ms: i64) -> EventRecord {
        let mut r = process_event(PROCESS_START, parent, at_ms);
        r.properties = vec![
            Property::u32("ProcessID", pid),
            Property::u32("ParentProcessID", parent),
            Property::unicode("ImageName", &format!("\\Device\\p{}.exe", pid)),
        ];
        r
    }

    fn thread(creator: u32, target: u32, at_ms: i64) -> EventRecord {
        let mut r = process_event(THREAD_START, creator, at_ms);
        r.properties = vec![Property::u32("ProcessID", target), Property::u32("TThreadID", 9)];
        r
    }

    fn pid_of(record: &StructuredRecord) -> Option<PropertyValue> {
        record.get("ProcessID").cloned()
    }

    #[test]
    fn test_correlation_scenario() {
        let c = correlator(None);
        let sources = c.sources(&ProviderRegistry::new());

        feed(&sources, &start(100, 50, 0));
        feed(&sources, &start(200, 100, 1));
        feed(&sources, &thread(200, 100, 2));
        feed(&sources, &thread(300, 100, 50));
        assert!(!c.cancel_pending());
        feed(&sources, &process_event(PROCESS_STOP, 100, 60));

        let out = c.drain();
        assert_eq!(out.len(), 3);
        assert_eq!(pid_of(&out[0]), Some(PropertyValue::U32(200)));
        assert_eq!(out[1].get("EtwProcessId"), Some(&PropertyValue::U32(300)));
        assert_eq!(
            out[1].get("TargetProcessName"),
            Some(&PropertyValue::String("\\Device\\p100.exe".into()))
        );
        assert_eq!(out[2].get("EtwEventId"), Some(&PropertyValue::U16(PROCESS_STOP)));

        assert!(c.cancel_pending());
        assert!(!c.is_cancelled());
        std::thread::sleep(Duration::from_millis(80));
        assert!(c.is_cancelled());
        assert_eq!(c.dropped(), 0);
    }

    #[test]
    fn test_seeded_target_start_time() {
        let c = correlator(Some(ProcessInfo {
            started_at: base(),
            image: Some("/usr/bin/target".into()),
        }));
        let sources = c.sources(&ProviderRegistry::new());
        feed(&sources, &thread(300, 100, 500));

        let out = c.drain();
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].get("TargetProcessName"),
            Some(&PropertyValue::String("/usr/bin/target".into()))
        );
    }

    #[test]
    fn test_unknown_thread_target_dropped_and_counted() {
        let c = correlator(None);
        let sources = c.sources(&ProviderRegistry::new());
        feed(&sources, &thread(300, 100, 50));
        assert!(c.drain().is_empty());
        assert_eq!(c.dropped(), 1);

        // Thread events involving neither side are ignored, not dropped
        feed(&sources, &thread(300, 400, 50));
        assert_eq!(c.dropped(), 1);
    }

    #[test]
    fn test_malformed_start_dropped_stream_continues() {
        let c = correlator(None);
        let sources = c.sources(&ProviderRegistry::new());
        feed(&sources, &process_event(PROCESS_START, 1, 0));
        feed(&sources, &start(201, 100, 5));
        assert_eq!(c.dropped(), 1);
        assert_eq!(c.drain().len(), 1);
    }

    #[test]
    fn test_stop_of_other_process_ignored() {
        let c = correlator(None);
        let sources = c.sources(&ProviderRegistry::new());
        feed(&sources, &process_event(PROCESS_STOP, 101, 0));
        assert!(c.drain().is_empty());
        assert!(!c.cancel_pending());
    }

    #[test]
    fn test_pid_gated_sources() {
        let c = correlator(None);
        let sources = c.sources(&ProviderRegistry::new());
        assert_eq!(sources.len(), 7);

        let net = |pid: u32, id: u16| {
            EventRecord::builder(providers::KERNEL_NETWORK, providers::KERNEL_NETWORK_ID, id)
                .process(pid)
                .build()
        };
        feed(&sources, &net(100, 10));
        feed(&sources, &net(100, 11));
        feed(&sources, &net(101, 42));

        let ps = |payload: &str| {
            EventRecord::builder(providers::POWERSHELL, providers::POWERSHELL_ID, POWERSHELL_PIPELINE)
                .process(100)
                .property(Property::unicode("Payload", payload))
                .build()
        };
        feed(&sources, &ps("Pipeline execution Started."));
        feed(&sources, &ps("Pipeline execution Stopped."));

        let file = EventRecord::builder(providers::KERNEL_FILE, providers::KERNEL_FILE_ID, 30)
            .process(100)
            .build();
        feed(&sources, &file);

        assert_eq!(c.drain().len(), 3);
    }

    #[test]
    fn test_wmi_client_process_gate() {
        let c = correlator(None);
        let sources = c.sources(&ProviderRegistry::new());
        let wmi = |client: i32| {
            EventRecord::builder(providers::WMI_ACTIVITY, providers::WMI_ACTIVITY_ID, WMI_OPERATION)
                .process(4)
                .property(Property::i32("ClientProcessId", client))
                .property(Property::unicode(
                    "Operation",
                    "Start IWbemServices::ExecMethod - root\\cimv2 : Win32_Process::Create",
                ))
                .build()
        };
        feed(&sources, &wmi(100));
        feed(&sources, &wmi(7));
        assert_eq!(c.drain().len(), 1);
    }

    #[test]
    fn test_wmi_only_suspicious_operations_kept() {
        let c = correlator(None);
        let sources = c.sources(&ProviderRegistry::new());
        let wmi = |namespace: &str, operation: &str| {
            EventRecord::builder(providers::WMI_ACTIVITY, providers::WMI_ACTIVITY_ID, WMI_OPERATION)
                .process(4)
                .property(Property::i32("ClientProcessId", 100))
                .property(Property::unicode("NamespaceName", namespace))
                .property(Property::unicode("Operation", operation))
                .build()
        };

        let kept = [
            ("\\\\.\\root\\subscription", "Start IWbemServices::PutInstance - root\\subscription : X"),
            ("root\\cimv2", "Start IWbemServices::PutInstance - __EventFilter.Name=\"evil\""),
            ("root\\cimv2", "Start IWbemServices::PutClass - root\\cimv2 : Backdoor"),
            ("root\\default", "Start IWbemServices::ExecMethod - root\\default : StdRegProv::SetStringValue"),
            ("root\\cimv2", "Start IWbemServices::ExecMethod - root\\cimv2 : win32_shadowcopy::Create"),
        ];
        let dropped = [
            ("root\\cimv2", "Start IWbemServices::ExecQuery - root\\cimv2 : select * from Win32_Process"),
            ("root\\cimv2", "Start IWbemServices::PutClass - root\\cimv2 : HWINV_Inventory"),
            ("root\\default", "Start IWbemServices::ExecMethod - root\\default : StdRegProv::SetBinaryValue"),
            ("root\\cimv2", "Start IWbemServices::PutInstance - root\\cimv2 : Win32_Printer"),
            ("root\\cimv2", "Start IWbemServices::ExecMethod - root\\cimv2 : Win32_Printer::Pause"),
        ];

        for (namespace, operation) in kept.iter().chain(dropped.iter()) {
            feed(&sources, &wmi(namespace, operation));
        }
        assert_eq!(c.drain().len(), kept.len());
        assert_eq!(c.events_seen(), kept.len() as u64);
    }

    #[test]
    fn test_image_load_only_for_target() {
        let c = correlator(None);
        let sources = c.sources(&ProviderRegistry::new());
        feed(&sources, &process_event(IMAGE_LOAD, 100, 0));
        feed(&sources, &process_event(IMAGE_LOAD, 5, 0));
        assert_eq!(c.drain().len(), 1);
        assert_eq!(c.events_seen(), 1);
    }
}

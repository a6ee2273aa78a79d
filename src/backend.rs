//! Trace backends: the boundary to whatever actually produces event records
//!
//! A backend is told which sources to enable and is then pumped from the
//! session's worker thread. `process` must return promptly once `stop` is
//! set; backends poll the flag between deliveries.

use crate::error::{Result, TraceError};
use crate::provider::SourceDescriptor;
use crate::record::EventRecord;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

pub trait TraceBackend: Send + Sync + 'static {
    /// Enable one provider with its any/all keyword masks
    fn enable(&self, source: &SourceDescriptor) -> Result<()>;

    /// Deliver records until `stop` is set or the backend runs dry
    fn process(&self, stop: &AtomicBool, deliver: &mut dyn FnMut(&EventRecord)) -> Result<()>;

    /// Ask the underlying trace to halt; a blocked `process` should wake up
    fn halt(&self) -> Result<()> {
        Ok(())
    }
}

/// Live backend fed through a channel
///
/// Producers hold the `Sender` half; the pump ends once every sender is
/// dropped or the session stops.
pub struct ChannelBackend {
    receiver: Receiver<EventRecord>,
    poll_interval: Duration,
    enabled: Mutex<Vec<SourceDescriptor>>,
}

impl ChannelBackend {
    pub fn new() -> (Self, Sender<EventRecord>) {
        let (sender, receiver) = channel::unbounded();
        let backend = Self {
            receiver,
            poll_interval: Duration::from_millis(20),
            enabled: Mutex::new(Vec::new()),
        };
        (backend, sender)
    }

    pub fn enabled(&self) -> Vec<SourceDescriptor> {
        self.enabled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TraceBackend for ChannelBackend {
    fn enable(&self, source: &SourceDescriptor) -> Result<()> {
        debug!(source = %source, "channel backend: provider enabled");
        self.enabled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(source.clone());
        Ok(())
    }

    fn process(&self, stop: &AtomicBool, deliver: &mut dyn FnMut(&EventRecord)) -> Result<()> {
        while !stop.load(Ordering::Acquire) {
            match self.receiver.recv_timeout(self.poll_interval) {
                Ok(record) => deliver(&record),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("channel backend: all producers gone");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Replays a captured trace (one JSON-encoded `EventRecord` per line)
pub struct ReplayBackend {
    records: Vec<EventRecord>,
    pace: Option<Duration>,
    enabled: Mutex<Vec<SourceDescriptor>>,
}

impl ReplayBackend {
    pub fn new(records: Vec<EventRecord>) -> Self {
        Self {
            records,
            pace: None,
            enabled: Mutex::new(Vec::new()),
        }
    }

    /// Parse a JSON-lines capture; blank lines are skipped
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut records = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: EventRecord = serde_json::from_str(line).map_err(|e| {
                TraceError::InvalidArgument(format!("capture line {}: {}", index + 1, e))
            })?;
            records.push(record);
        }
        info!(records = records.len(), "loaded trace capture");
        Ok(Self::new(records))
    }

    /// Sleep between deliveries, to approximate a live trace
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn enabled(&self) -> Vec<SourceDescriptor> {
        self.enabled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TraceBackend for ReplayBackend {
    fn enable(&self, source: &SourceDescriptor) -> Result<()> {
        self.enabled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(source.clone());
        Ok(())
    }

    fn process(&self, stop: &AtomicBool, deliver: &mut dyn FnMut(&EventRecord)) -> Result<()> {
        for record in &self.records {
            if stop.load(Ordering::Acquire) {
                debug!("replay interrupted by stop");
                break;
            }
            deliver(record);
            if let Some(pace) = self.pace {
                std::thread::sleep(pace);
            }
        }
        Ok(())
    }
}

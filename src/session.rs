//! Trace session lifecycle
//!
//! A session owns one trace backend and the sources enabled on it. It moves
//! Created → Running → Stopped, and a stopped session may be started again.
//! Every transition happens under one session-wide lock; the pump runs on a
//! dedicated worker thread so `stop()` never blocks on event delivery for
//! longer than the configured timeout.

use crate::backend::TraceBackend;
use crate::buffer::RecordBuffer;
use crate::error::{Result, TraceError};
use crate::extractor::PropertyExtractor;
use crate::filter::EventHandler;
use crate::provider::EventSource;
use crate::record::{EventRecord, StructuredRecord};
use crate::sink::RecordSink;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Receives every record delivered through the default handler
pub type RecordCallback = Arc<dyn Fn(StructuredRecord) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

pub fn default_session_name() -> String {
    format!("krabtrace {}", Uuid::new_v4())
}

struct Pump {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct Inner {
    state: SessionState,
    sources: Vec<EventSource>,
    pump: Option<Pump>,
    /// Worker detached by a timed-out stop, possibly still in the backend
    stale_pump: Option<JoinHandle<()>>,
}

pub struct TraceSession {
    name: String,
    backend: Arc<dyn TraceBackend>,
    stop_timeout: Duration,
    inner: Mutex<Inner>,
    callback: Arc<RwLock<Option<RecordCallback>>>,
    default_handler: EventHandler,
    events_handled: Arc<AtomicU64>,
}

impl TraceSession {
    pub fn new(backend: Arc<dyn TraceBackend>, extractor: Arc<PropertyExtractor>) -> Self {
        let callback: Arc<RwLock<Option<RecordCallback>>> = Arc::new(RwLock::new(None));

        let slot = callback.clone();
        let default_handler: EventHandler = Arc::new(move |record: &EventRecord| {
            // Clone out of the slot so the lock is not held across user code
            let callback = slot
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(callback) = callback {
                callback(extractor.extract(record));
            }
        });

        Self {
            name: default_session_name(),
            backend,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            inner: Mutex::new(Inner {
                state: SessionState::Created,
                sources: Vec::new(),
                pump: None,
                stale_pump: None,
            }),
            callback,
            default_handler,
            events_handled: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// True while the worker thread is still pumping the backend
    pub fn is_pumping(&self) -> bool {
        self.lock()
            .pump
            .as_ref()
            .is_some_and(|pump| !pump.handle.is_finished())
    }

    pub fn source_count(&self) -> usize {
        self.lock().sources.len()
    }

    /// Total events pulled from the backend since the session was created
    pub fn events_handled(&self) -> u64 {
        self.events_handled.load(Ordering::Relaxed)
    }

    pub fn has_pumped_events(&self) -> bool {
        self.events_handled() > 0
    }

    /// Enable a source; only allowed before the session is running
    pub fn enable_source(&self, source: EventSource) -> Result<()> {
        let mut inner = self.lock();
        if inner.state == SessionState::Running {
            return Err(TraceError::AlreadyRunning {
                session: self.name.clone(),
            });
        }
        self.backend.enable(source.descriptor())?;
        debug!(session = %self.name, source = %source.descriptor(), "source enabled");
        inner.sources.push(source);
        Ok(())
    }

    /// Start pumping on a worker thread. A second call while running is a
    /// no-op. Fails if a worker detached by an earlier stop is still inside
    /// the backend after another stop timeout.
    pub fn start(&self, callback: RecordCallback) -> Result<()> {
        let mut inner = self.lock();
        if inner.state == SessionState::Running {
            debug!(session = %self.name, "start ignored: already running");
            return Ok(());
        }

        if let Some(stale) = inner.stale_pump.take() {
            if let Some(stale) = join_bounded(stale, self.stop_timeout) {
                inner.stale_pump = Some(stale);
                return Err(TraceError::backend(
                    "start",
                    "previous pump is still running",
                ));
            }
        }

        *self
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);

        for source in inner.sources.iter_mut() {
            source.ensure_default_handler_setup(&self.default_handler);
        }
        let sources: Arc<[EventSource]> = inner.sources.clone().into();

        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            let backend = self.backend.clone();
            let events = self.events_handled.clone();
            let session = self.name.clone();
            thread::Builder::new()
                .name("krabtrace-pump".to_string())
                .spawn(move || {
                    let result = backend.process(&stop, &mut |record: &EventRecord| {
                        events.fetch_add(1, Ordering::Relaxed);
                        for source in sources.iter().filter(|s| s.matches(record)) {
                            source.dispatch(record);
                        }
                    });
                    match result {
                        Ok(()) => debug!(session = %session, "pump finished"),
                        Err(e) => warn!(session = %session, error = %e, "pump failed"),
                    }
                })?
        };

        inner.pump = Some(Pump { stop, handle });
        inner.state = SessionState::Running;
        info!(session = %self.name, sources = inner.sources.len(), "trace session started");
        Ok(())
    }

    /// Halt the backend and wait (bounded) for the worker to quiesce.
    /// Safe to call repeatedly; always ends in `Stopped` when it was running.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != SessionState::Running {
            return Ok(());
        }

        let halted = self.backend.halt();
        if let Some(pump) = inner.pump.take() {
            pump.stop.store(true, Ordering::Release);
            if let Some(detached) = join_bounded(pump.handle, self.stop_timeout) {
                warn!(
                    session = %self.name,
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    "pump did not quiesce in time; detaching"
                );
                inner.stale_pump = Some(detached);
            }
        }
        inner.state = SessionState::Stopped;
        info!(session = %self.name, events = self.events_handled(), "trace session stopped");

        halted.map_err(|e| TraceError::backend("stop", e))
    }

    /// Start with a buffering callback and copy records into `sink` every
    /// 100ms until `limit` elapses, `interrupt` is set, or the backend runs
    /// dry. The session is stopped on return.
    pub fn run_for(
        &self,
        limit: Option<Duration>,
        interrupt: &AtomicBool,
        sink: &mut dyn RecordSink,
    ) -> Result<u64> {
        let buffer = Arc::new(RecordBuffer::default());
        let producer = buffer.clone();
        self.start(Arc::new(move |record| {
            producer.push(record);
        }))?;

        let drained = self.drain_while_pumping(&buffer, limit, interrupt, sink);
        let stopped = self.stop();
        let mut written = drained?;
        stopped?;

        for record in buffer.drain() {
            sink.emit(&record)?;
            written += 1;
        }
        sink.flush()?;

        let stats = buffer.stats();
        if stats.total_dropped > 0 {
            warn!(dropped = stats.total_dropped, "records dropped under backpressure");
        }
        Ok(written)
    }

    fn drain_while_pumping(
        &self,
        buffer: &RecordBuffer,
        limit: Option<Duration>,
        interrupt: &AtomicBool,
        sink: &mut dyn RecordSink,
    ) -> Result<u64> {
        let started = Instant::now();
        let mut written = 0u64;
        loop {
            for record in buffer.drain() {
                sink.emit(&record)?;
                written += 1;
            }

            let expired = limit.is_some_and(|limit| started.elapsed() >= limit);
            if expired || interrupt.load(Ordering::Acquire) || !self.is_pumping() {
                return Ok(written);
            }
            thread::sleep(Duration::from_millis(100));
        }
    }
}

/// Join `handle` if it finishes within `timeout`; hands it back if not
fn join_bounded(handle: JoinHandle<()>, timeout: Duration) -> Option<JoinHandle<()>> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Some(handle);
        }
        thread::sleep(Duration::from_millis(5));
    }
    if handle.join().is_err() {
        warn!("pump thread panicked");
    }
    None
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(session = %self.name, error = %e, "stop during drop failed");
        }
    }
}

impl fmt::Debug for TraceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceSession")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("events_handled", &self.events_handled())
            .finish()
    }
}

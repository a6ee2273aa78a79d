//! Follow one process from launch to exit
//!
//! Launch suspended, set up the correlated trace, resume, then drain the
//! correlator into the sink at a fixed cadence until the target's grace
//! period runs out, the caller interrupts, or the backend runs dry.

use crate::backend::TraceBackend;
use crate::config::TraceConfig;
use crate::correlator::{ProcessCorrelator, ProcessInfo};
use crate::error::Result;
use crate::extractor::PropertyExtractor;
use crate::launch::{ProcessLauncher, SuspendedProcess};
use crate::provider::ProviderHandler;
use crate::registry::ProviderRegistry;
use crate::session::TraceSession;
use crate::sink::RecordSink;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Everything a correlated trace needs besides the target
pub struct Monitor {
    pub config: TraceConfig,
    pub extractor: Arc<PropertyExtractor>,
    pub handlers: Arc<ProviderRegistry<dyn ProviderHandler>>,
}

impl Monitor {
    /// Build the session for `correlator` on `backend`, with every correlated
    /// source enabled
    pub fn session(
        &self,
        backend: Arc<dyn TraceBackend>,
        correlator: &Arc<ProcessCorrelator>,
    ) -> Result<TraceSession> {
        let session = TraceSession::new(backend, self.extractor.clone())
            .with_name(self.config.session_name.clone())
            .with_stop_timeout(self.config.stop_timeout());
        for source in correlator.sources(&self.handlers) {
            session.enable_source(source)?;
        }
        Ok(session)
    }

    pub fn correlator(&self, pid: u32, info: Option<ProcessInfo>) -> Arc<ProcessCorrelator> {
        Arc::new(ProcessCorrelator::new(
            pid,
            info,
            self.extractor.clone(),
            self.config.correlator(),
        ))
    }

    /// Launch `program` suspended, trace it, and write the correlated stream
    /// to `sink`. Returns the number of records written.
    pub fn trace_process(
        &self,
        launcher: &dyn ProcessLauncher,
        program: &str,
        args: &[String],
        backend: Arc<dyn TraceBackend>,
        sink: &mut dyn RecordSink,
        interrupt: &AtomicBool,
    ) -> Result<u64> {
        let process = launcher.launch_suspended(program, args)?;
        info!(pid = process.pid, "{} started suspended", program);

        let correlator = self.correlator(
            process.pid,
            Some(ProcessInfo {
                started_at: process.started_at,
                image: Some(process.program_path.display().to_string()),
            }),
        );
        let session = match self.traced_session(backend, &correlator) {
            Ok(session) => session,
            Err(e) => {
                abandon(launcher, &process);
                return Err(e);
            }
        };
        info!(pid = process.pid, "trace set up, resuming {}", program);

        if let Err(e) = launcher.resume(&process) {
            let _ = session.stop();
            abandon(launcher, &process);
            return Err(e);
        }

        let written = self.drain(&session, &correlator, sink, interrupt);
        match launcher.try_wait(&process) {
            Ok(Some(code)) => info!(pid = process.pid, code, "{} exited", program),
            Ok(None) => debug!(pid = process.pid, "{} still running after trace", program),
            Err(e) => warn!(pid = process.pid, error = %e, "failed to reap {}", program),
        }
        written
    }

    fn traced_session(
        &self,
        backend: Arc<dyn TraceBackend>,
        correlator: &Arc<ProcessCorrelator>,
    ) -> Result<TraceSession> {
        let session = self.session(backend, correlator)?;
        session.start(Arc::new(|_| {}))?;
        Ok(session)
    }

    /// Run an already-configured session to completion, then stop it
    pub fn drain(
        &self,
        session: &TraceSession,
        correlator: &ProcessCorrelator,
        sink: &mut dyn RecordSink,
        interrupt: &AtomicBool,
    ) -> Result<u64> {
        let drained = drain_until_cancelled(
            session,
            correlator,
            sink,
            self.config.drain_interval(),
            interrupt,
        );
        let stopped = session.stop();
        let mut written = drained?;
        stopped?;

        for record in correlator.drain() {
            sink.emit(&record)?;
            written += 1;
        }
        sink.flush()?;

        if correlator.dropped() > 0 {
            warn!(dropped = correlator.dropped(), "events dropped during correlation");
        }
        Ok(written)
    }
}

/// Kill a launched process whose trace could not be set up
fn abandon(launcher: &dyn ProcessLauncher, process: &SuspendedProcess) {
    match launcher.terminate(process) {
        Ok(()) => info!(pid = process.pid, "suspended process terminated"),
        Err(e) => warn!(pid = process.pid, error = %e, "failed to terminate suspended process"),
    }
}

/// Move correlated records into `sink` every `interval`, logging progress,
/// until cancellation, interrupt, or the pump finishing
pub fn drain_until_cancelled(
    session: &TraceSession,
    correlator: &ProcessCorrelator,
    sink: &mut dyn RecordSink,
    interval: Duration,
    interrupt: &AtomicBool,
) -> Result<u64> {
    let poll = interval.min(Duration::from_millis(50));
    let mut written = 0u64;
    let mut last_seen = correlator.events_seen();
    let mut last_report = Instant::now();

    loop {
        let done = correlator.is_cancelled()
            || interrupt.load(Ordering::Acquire)
            || !session.is_pumping();

        if done || last_report.elapsed() >= interval {
            for record in correlator.drain() {
                sink.emit(&record)?;
                written += 1;
            }
            let seen = correlator.events_seen();
            info!(
                "Processed {} events in last {}s",
                seen - last_seen,
                last_report.elapsed().as_secs()
            );
            last_seen = seen;
            last_report = Instant::now();
        }

        if done {
            return Ok(written);
        }
        thread::sleep(poll);
    }
}

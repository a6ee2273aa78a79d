use anyhow::{Context, Result};
use clap::Parser;
use krabtrace::backend::ReplayBackend;
use krabtrace::cli::{self, Cli, Command, CorrelateArgs, DnsCacheArgs, DnsQuery, ReplayArgs};
use krabtrace::config::TraceConfig;
use krabtrace::dns::{self, HostsFileSnapshot, ReverseLookupCache};
use krabtrace::extractor::PropertyExtractor;
use krabtrace::filter::Predicate;
use krabtrace::monitor::Monitor;
use krabtrace::parser::default_parsers;
use krabtrace::session::TraceSession;
use krabtrace::sink::JsonLinesSink;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(path: Option<&Path>) -> Result<TraceConfig> {
    match path {
        Some(path) => TraceConfig::from_file(path),
        None => Ok(TraceConfig::default()),
    }
}

fn load_capture(path: &Path) -> Result<ReplayBackend> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open capture: {}", path.display()))?;
    ReplayBackend::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to load capture: {}", path.display()))
}

fn run_replay(args: ReplayArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if args.verbose_properties {
        config.include_verbose_properties = true;
    }
    if args.time_limit_ms.is_some() {
        config.trace_time_limit_ms = args.time_limit_ms;
    }

    let cache = Arc::new(ReverseLookupCache::new());
    let parsers = Arc::new(default_parsers(Some(cache.clone())));
    let extractor = Arc::new(PropertyExtractor::new(config.include_verbose_properties, parsers));
    let handlers = dns::default_handlers(cache);

    let backend = load_capture(&args.input)?;
    let session = TraceSession::new(Arc::new(backend), extractor)
        .with_name(config.session_name.clone())
        .with_stop_timeout(config.stop_timeout());
    for source in config
        .build_sources(&handlers)
        .context("Failed to build sources from configuration")?
    {
        session.enable_source(source)?;
    }

    let stdout = io::stdout();
    let mut sink = JsonLinesSink::new(stdout.lock());
    let interrupt = AtomicBool::new(false);
    let written = session
        .run_for(config.trace_time_limit(), &interrupt, &mut sink)
        .context("Replay failed")?;
    info!(written, events = session.events_handled(), "replay finished");
    Ok(())
}

fn run_correlate(args: CorrelateArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(grace) = args.grace_ms {
        config.grace_period_ms = grace;
    }

    let cache = Arc::new(ReverseLookupCache::new());
    let parsers = Arc::new(default_parsers(Some(cache.clone())));
    let monitor = Monitor {
        extractor: Arc::new(PropertyExtractor::new(config.include_verbose_properties, parsers)),
        handlers: Arc::new(dns::default_handlers(cache)),
        config,
    };

    let backend = load_capture(&args.input)?;
    let correlator = monitor.correlator(args.pid, None);
    let session = monitor.session(Arc::new(backend), &correlator)?;
    session.start(Arc::new(|_| {}))?;

    let stdout = io::stdout();
    let mut sink = JsonLinesSink::new(stdout.lock());
    let written = monitor
        .drain(&session, &correlator, &mut sink, &AtomicBool::new(false))
        .context("Correlation failed")?;
    info!(
        written,
        dropped = correlator.dropped(),
        pid = args.pid,
        "correlation finished"
    );
    Ok(())
}

fn run_dns_cache(args: DnsCacheArgs) -> Result<()> {
    let snapshot = match &args.hosts {
        Some(path) => HostsFileSnapshot::new(path),
        None => HostsFileSnapshot::system(),
    };
    let cache = ReverseLookupCache::seeded(&snapshot).context("Failed to seed lookup cache")?;

    match args.query() {
        Some(DnsQuery::Address(text)) => {
            let address = dns::parse_address(text)?;
            for name in cache.names_for_address(&address) {
                println!("{}", name);
            }
        }
        Some(DnsQuery::Name(name)) => {
            let addresses = cache.addresses_for_name(name);
            if !addresses.is_empty() {
                println!("{}", cli::format_addresses(&addresses));
            }
        }
        None => anyhow::bail!("Either --ip or --domain is required"),
    }
    Ok(())
}

#[cfg(unix)]
fn run_launch(command: &[String]) -> Result<()> {
    use krabtrace::launch::{ProcessLauncher, UnixLauncher};

    let (program, args) = command
        .split_first()
        .context("Command array is empty")?;
    let launcher = UnixLauncher::new();
    let process = launcher.launch_suspended(program, args)?;
    println!("{} started suspended with PID {}", program, process.pid);

    launcher.resume(&process)?;
    let code = launcher.wait(&process)?;
    println!("{} (PID {}) exited with code {}", program, process.pid, code);
    std::process::exit(code);
}

#[cfg(not(unix))]
fn run_launch(_command: &[String]) -> Result<()> {
    anyhow::bail!("launch is only supported on Unix")
}

fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.debug);

    match args.command {
        Command::Replay(replay) => run_replay(replay),
        Command::Correlate(correlate) => run_correlate(correlate),
        Command::DnsCache(query) => run_dns_cache(query),
        Command::FilterCheck { expr } => {
            let predicate = Predicate::from_expr(&expr)?;
            println!("{}", predicate);
            Ok(())
        }
        Command::Launch { command } => run_launch(&command),
    }
}

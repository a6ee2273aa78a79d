//! CLI argument parsing for krabtrace

use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "krabtrace")]
#[command(version)]
#[command(about = "Event trace capture, decoding and process correlation", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output (to stderr)
    #[arg(long = "debug", global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pump a captured trace through a session and print structured records
    Replay(ReplayArgs),

    /// Print the events correlated with one process from a captured trace
    Correlate(CorrelateArgs),

    /// Query the reverse lookup cache seeded from a hosts file
    DnsCache(DnsCacheArgs),

    /// Parse a filter expression and print its canonical form
    FilterCheck {
        /// Filter expression (e.g. "pid=42,event=10|42,!daddr~10.")
        #[arg(value_name = "EXPR")]
        expr: String,
    },

    /// Launch a program suspended, then resume it and wait for it to exit
    Launch {
        /// Program and arguments
        #[arg(last = true, required = true, value_name = "PROGRAM")]
        command: Vec<String>,
    },
}

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Captured trace: one JSON event record per line
    #[arg(short, long, value_name = "FILE")]
    pub input: PathBuf,

    /// TOML trace configuration (sources, filters, tunables)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Stop after this many milliseconds even if the capture is not done
    #[arg(long = "time-limit-ms", value_name = "MS")]
    pub time_limit_ms: Option<u64>,

    /// Include event name, provider id, version and level in every record
    #[arg(long)]
    pub verbose_properties: bool,
}

#[derive(Args, Debug)]
pub struct CorrelateArgs {
    /// Process id to follow
    #[arg(short, long, value_name = "PID")]
    pub pid: u32,

    /// Captured trace: one JSON event record per line
    #[arg(short, long, value_name = "FILE")]
    pub input: PathBuf,

    /// TOML trace configuration (tunables only; sources are fixed)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Grace period after the process exits, in milliseconds
    #[arg(long = "grace-ms", value_name = "MS")]
    pub grace_ms: Option<u64>,
}

#[derive(Args, Debug)]
#[group(skip)]
#[command(group(clap::ArgGroup::new("DnsCacheArgs").required(true).multiple(false).args(["ip", "domain"])))]
pub struct DnsCacheArgs {
    /// Hosts file to seed from (default: the system hosts file)
    #[arg(long, value_name = "FILE")]
    pub hosts: Option<PathBuf>,

    /// Names known for this address
    #[arg(long, value_name = "ADDR")]
    pub ip: Option<String>,

    /// Addresses known for this name
    #[arg(long, value_name = "NAME")]
    pub domain: Option<String>,
}

impl DnsCacheArgs {
    pub fn query(&self) -> Option<DnsQuery<'_>> {
        match (&self.ip, &self.domain) {
            (Some(ip), _) => Some(DnsQuery::Address(ip)),
            (None, Some(domain)) => Some(DnsQuery::Name(domain)),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsQuery<'a> {
    Address(&'a str),
    Name(&'a str),
}

/// Render a set of addresses one per line
pub fn format_addresses<'a>(addresses: impl IntoIterator<Item = &'a IpAddr>) -> String {
    addresses
        .into_iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_replay() {
        let cli = Cli::parse_from(["krabtrace", "replay", "--input", "trace.jsonl"]);
        match cli.command {
            Command::Replay(args) => {
                assert_eq!(args.input, PathBuf::from("trace.jsonl"));
                assert!(args.config.is_none());
                assert!(args.time_limit_ms.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(!cli.debug);
    }

    #[test]
    fn test_cli_global_debug() {
        let cli = Cli::parse_from(["krabtrace", "filter-check", "pid=1", "--debug"]);
        assert!(cli.debug);
    }

    #[test]
    fn test_cli_correlate() {
        let cli = Cli::parse_from([
            "krabtrace", "correlate", "--pid", "4242", "-i", "t.jsonl", "--grace-ms", "0",
        ]);
        match cli.command {
            Command::Correlate(args) => {
                assert_eq!(args.pid, 4242);
                assert_eq!(args.grace_ms, Some(0));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_dns_cache_requires_one_query() {
        assert!(Cli::try_parse_from(["krabtrace", "dns-cache"]).is_err());
        assert!(
            Cli::try_parse_from(["krabtrace", "dns-cache", "--ip", "1.1.1.1", "--domain", "x"]).is_err()
        );

        let cli = Cli::parse_from(["krabtrace", "dns-cache", "--domain", "example.com"]);
        match cli.command {
            Command::DnsCache(args) => assert_eq!(args.query(), Some(DnsQuery::Name("example.com"))),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_launch_trailing_args() {
        let cli = Cli::parse_from(["krabtrace", "launch", "--", "ls", "-la", "/tmp"]);
        match cli.command {
            Command::Launch { command } => assert_eq!(command, vec!["ls", "-la", "/tmp"]),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_format_addresses() {
        let a: IpAddr = "1.1.1.1".parse().unwrap();
        let b: IpAddr = "::1".parse().unwrap();
        assert_eq!(format_addresses([&a, &b]), "1.1.1.1\n::1");
    }
}

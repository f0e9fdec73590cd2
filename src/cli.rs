use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const USAGE_EXAMPLES: &str = "\
Examples:
  Intraprocess latency:       pubsub-bench -l
  Interprocess latency:       terminal 1: pubsub-bench -l -r
                              terminal 2: pubsub-bench -l -p
  Intraprocess throughput:    pubsub-bench -t
  Interprocess throughput:    terminal 1: pubsub-bench -t -r
                              terminal 2: pubsub-bench -t -p";

/// Pub/Sub Benchmark - request/reply latency and throughput of a message bus
#[derive(Parser, Debug, Clone, Default)]
#[clap(version, about, long_about = None, after_help = USAGE_EXAMPLES)]
pub struct Args {
    /// Latency test (default when neither -l nor -t is given)
    #[clap(short = 'l', long, conflicts_with = "throughput", help_heading = "Core Options")]
    pub latency: bool,

    /// Throughput test
    #[clap(short = 't', long, help_heading = "Core Options")]
    pub throughput: bool,

    /// Run only the publishing (measuring) role
    #[clap(short = 'p', long, conflicts_with = "relay", help_heading = "Core Options")]
    pub publisher: bool,

    /// Run only the relay (echoing) role
    #[clap(short = 'r', long, help_heading = "Core Options")]
    pub relay: bool,

    /// Number of iterations per payload size
    #[clap(short = 'i', long, default_value_t = crate::defaults::ITERATIONS, value_parser = clap::value_parser!(u64).range(1..))]
    pub iterations: u64,

    /// Output file for the report (console when omitted)
    #[clap(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Messaging transport (inproc when co-located, tcp otherwise)
    #[clap(long, value_enum)]
    pub transport: Option<TransportKind>,

    /// Host address for the TCP transport
    #[clap(long, default_value = crate::defaults::HOST, help_heading = "TCP Transport")]
    pub host: String,

    /// Port for the TCP transport
    #[clap(long, default_value_t = crate::defaults::PORT, help_heading = "TCP Transport")]
    pub port: u16,

    /// Skip payload sizes larger than this many bytes
    #[clap(long)]
    pub max_size: Option<u32>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Also write logs to this file
    #[clap(long)]
    pub log_file: Option<PathBuf>,
}

impl Args {
    /// Metric selected by the -l/-t flags
    pub fn mode(&self) -> BenchmarkMode {
        if self.throughput {
            BenchmarkMode::Throughput
        } else {
            BenchmarkMode::Latency
        }
    }

    /// Role selected by the -p/-r flags
    pub fn role(&self) -> Role {
        match (self.publisher, self.relay) {
            (true, _) => Role::DriverOnly,
            (_, true) => Role::RelayOnly,
            _ => Role::CoLocated,
        }
    }

    /// Transport selected explicitly or derived from the role
    pub fn transport_kind(&self) -> TransportKind {
        self.transport.unwrap_or(match self.role() {
            Role::CoLocated => TransportKind::InProcess,
            Role::DriverOnly | Role::RelayOnly => TransportKind::Tcp,
        })
    }
}

/// Metric measured by a run
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum, Serialize, Deserialize,
)]
pub enum BenchmarkMode {
    Latency,
    Throughput,
}

impl BenchmarkMode {
    /// Path segment used in channel names
    pub fn topic_segment(&self) -> &'static str {
        match self {
            BenchmarkMode::Latency => "latency",
            BenchmarkMode::Throughput => "throughput",
        }
    }
}

impl std::fmt::Display for BenchmarkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BenchmarkMode::Latency => write!(f, "Latency"),
            BenchmarkMode::Throughput => write!(f, "Throughput"),
        }
    }
}

/// Which roles run in this process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    DriverOnly,
    RelayOnly,
    CoLocated,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::DriverOnly => write!(f, "Publisher"),
            Role::RelayOnly => write!(f, "Relay"),
            Role::CoLocated => write!(f, "Publisher + Relay"),
        }
    }
}

/// Available messaging transports
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum TransportKind {
    /// In-process bus (co-located roles only)
    #[clap(name = "inproc")]
    InProcess,

    /// TCP peer link between two processes
    #[clap(name = "tcp")]
    Tcp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::InProcess => write!(f, "In-Process Bus"),
            TransportKind::Tcp => write!(f, "TCP"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["pubsub-bench"]);
        assert_eq!(args.mode(), BenchmarkMode::Latency);
        assert_eq!(args.role(), Role::CoLocated);
        assert_eq!(args.transport_kind(), TransportKind::InProcess);
        assert_eq!(args.iterations, 1000);
        assert_eq!(args.port, crate::defaults::PORT);
        assert!(args.output.is_none());
    }

    #[test]
    fn test_interprocess_flags() {
        let args = Args::parse_from(["pubsub-bench", "-t", "-r", "-i", "50"]);
        assert_eq!(args.mode(), BenchmarkMode::Throughput);
        assert_eq!(args.role(), Role::RelayOnly);
        assert_eq!(args.transport_kind(), TransportKind::Tcp);
        assert_eq!(args.iterations, 50);

        let args = Args::parse_from(["pubsub-bench", "-p", "--transport", "inproc"]);
        assert_eq!(args.role(), Role::DriverOnly);
        assert_eq!(args.transport_kind(), TransportKind::InProcess);
    }

    #[test]
    fn test_conflicting_flags_rejected() {
        assert!(Args::try_parse_from(["pubsub-bench", "-l", "-t"]).is_err());
        assert!(Args::try_parse_from(["pubsub-bench", "-p", "-r"]).is_err());
        assert!(Args::try_parse_from(["pubsub-bench", "-i", "0"]).is_err());
    }

    #[test]
    fn test_verbosity_counts() {
        let args = Args::parse_from(["pubsub-bench", "-vv"]);
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_display() {
        assert_eq!(BenchmarkMode::Throughput.to_string(), "Throughput");
        assert_eq!(Role::CoLocated.to_string(), "Publisher + Relay");
        assert_eq!(TransportKind::Tcp.to_string(), "TCP");
    }
}

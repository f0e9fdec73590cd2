//! # Pub/Sub Benchmark Library
//!
//! A request/reply benchmark harness for publish/subscribe messaging transports.
//! This library measures round-trip latency and sustained throughput of a
//! message bus as a function of payload size.
//!
//! ## Roles
//!
//! A benchmark run involves two cooperating roles:
//!
//! - **Relay**: a passive responder that echoes every request it receives onto
//!   the matching reply channel of the same payload size
//! - **Driver**: the active side that publishes requests, waits for replies
//!   and records timing and counters
//!
//! Both roles may live in the same process (co-located) or in two processes
//! linked by the TCP transport. Timing always uses round-trip measurements on
//! the driver's monotonic clock, so the two processes never need synchronized
//! clocks.
//!
//! ## Architecture Overview
//!
//! - `payload`: fixed-content payload generation and the payload size sweep
//! - `topology`: the typed table of request/reply channel names per size class
//! - `transport`: the messaging substrate abstraction and its implementations
//! - `roles`: the relay and driver roles
//! - `stats`: duration accumulation and rate computation
//! - `report`: tab-separated report output
//! - `controller`: role selection and the size sweep
//! - `cancel`: cooperative stop token observed by every blocking wait
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use pubsub_bench::{
//!     cancel::StopToken,
//!     controller::{RunConfig, RunController},
//!     payload::SizeSweep,
//! };
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = RunConfig::co_located_latency(100, SizeSweep::standard()?);
//!     let rows = RunController::new(config, StopToken::new()).run()?;
//!     println!("measured {} size classes", rows.len());
//!     Ok(())
//! }
//! ```

/// Cooperative cancellation shared by the run controller and both roles
pub mod cancel;

/// Command-line interface and configuration
///
/// Provides argument parsing using clap. The parsed arguments are converted
/// into an immutable `RunConfig` by the controller module.
pub mod cli;

/// Run orchestration
///
/// Selects which roles run in this process, drives the size sweep for the
/// chosen metric and hands finished rows to the report sink.
pub mod controller;

/// Library error types
pub mod error;

pub mod logging;

/// Payload construction and the size sweep
pub mod payload;

/// Report header and row formatting
pub mod report;

/// Relay and driver roles
pub mod roles;

/// Timing and statistics accumulation
///
/// Pure computation with no transport dependency: accumulates round-trip
/// durations or byte/message counters per size class and converts them into
/// the numbers printed in the report.
pub mod stats;

/// Channel naming per payload size
pub mod topology;

/// Messaging substrate abstraction
///
/// Contains the `Transport` and `Publisher` traits plus the in-process bus and
/// the TCP peer link.
pub mod transport;

pub use cancel::StopToken;
pub use cli::{Args, BenchmarkMode, Role, TransportKind};
pub use controller::{RunConfig, RunController};
pub use error::{BenchError, TransportError};
pub use payload::{PayloadSpec, SizeSweep};
pub use report::{ReportRow, ReportSink};
pub use stats::{LatencyStats, ThroughputStats};

/// The current version of the pub/sub benchmark
///
/// Printed in the report header for reproducibility.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default number of iterations per size class
    pub const ITERATIONS: u64 = 1000;

    /// Backoff between checks for a connected peer
    pub const CONNECTION_POLL_INTERVAL: Duration = Duration::from_millis(500);

    /// Byte used to fill every payload
    pub const FILL_BYTE: u8 = b'0';

    /// Default host for the TCP transport
    pub const HOST: &str = "127.0.0.1";

    /// Default port for the TCP transport
    pub const PORT: u16 = 11345;

    /// Largest frame accepted by the TCP transport
    ///
    /// Comfortably above the largest payload in the standard sweep plus its
    /// envelope and topic header.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

    /// Socket send/receive buffer size requested for the TCP transport
    pub const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;
}

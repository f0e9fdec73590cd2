use anyhow::{Context, Result};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::cancel::StopToken;
use crate::cli::{Args, BenchmarkMode, Role, TransportKind};
use crate::error::BenchError;
use crate::payload::SizeSweep;
use crate::report::{ReportHeader, ReportRow, ReportSink};
use crate::roles::{MeasurementRole, RelayRole};
use crate::topology::ChannelTopology;
use crate::transport::{Transport, TransportFactory};

/// Frozen configuration for one run
///
/// Built once from the command line (or directly by library users) and never
/// modified afterwards.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Requests per size class
    pub iterations: u64,

    /// Report file; the console when `None`
    pub output: Option<PathBuf>,

    pub mode: BenchmarkMode,
    pub role: Role,
    pub transport: TransportKind,

    /// Address the TCP transport listens on or connects to
    pub address: SocketAddr,

    pub sweep: SizeSweep,
}

impl RunConfig {
    /// Create run configuration from CLI arguments
    ///
    /// Resolves the TCP address, applies `--max-size` to the standard sweep and
    /// rejects combinations that cannot run.
    pub fn from_args(args: &Args) -> Result<Self, BenchError> {
        if args.iterations == 0 {
            return Err(BenchError::InvalidConfig(
                "iterations must be at least 1".to_string(),
            ));
        }

        let role = args.role();
        let transport = args.transport_kind();
        if transport == TransportKind::InProcess && role != Role::CoLocated {
            return Err(BenchError::InvalidConfig(format!(
                "the {} role needs a transport that reaches another process",
                role
            )));
        }

        let address = (args.host.as_str(), args.port)
            .to_socket_addrs()
            .map_err(|e| BenchError::InvalidConfig(format!("host {}: {}", args.host, e)))?
            .next()
            .ok_or_else(|| {
                BenchError::InvalidConfig(format!("host {} has no address", args.host))
            })?;

        let mut sweep = SizeSweep::standard()?;
        if let Some(max_size) = args.max_size {
            sweep = sweep.truncated(max_size);
        }
        if sweep.is_empty() {
            return Err(BenchError::InvalidConfig(
                "no payload size fits within --max-size".to_string(),
            ));
        }

        Ok(Self {
            iterations: args.iterations,
            output: args
                .output
                .clone()
                .filter(|path| !path.as_os_str().is_empty()),
            mode: args.mode(),
            role,
            transport,
            address,
            sweep,
        })
    }

    /// Latency sweep with both roles on the in-process bus, reporting to the
    /// console
    pub fn co_located_latency(iterations: u64, sweep: SizeSweep) -> Self {
        Self::co_located(BenchmarkMode::Latency, iterations, sweep)
    }

    /// Throughput sweep with both roles on the in-process bus, reporting to
    /// the console
    pub fn co_located_throughput(iterations: u64, sweep: SizeSweep) -> Self {
        Self::co_located(BenchmarkMode::Throughput, iterations, sweep)
    }

    fn co_located(mode: BenchmarkMode, iterations: u64, sweep: SizeSweep) -> Self {
        Self {
            iterations,
            output: None,
            mode,
            role: Role::CoLocated,
            transport: TransportKind::InProcess,
            address: SocketAddr::from(([127, 0, 0, 1], crate::defaults::PORT)),
            sweep,
        }
    }

    /// Report to `path` instead of the console
    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }
}

/// Runs the roles selected by a [`RunConfig`]
pub struct RunController {
    config: RunConfig,
    stop: StopToken,
}

impl RunController {
    pub fn new(config: RunConfig, stop: StopToken) -> Self {
        Self { config, stop }
    }

    /// Create the configured transport and run.
    ///
    /// Returns the rows that were reported. A relay-only run blocks until the
    /// stop token fires and reports nothing.
    pub fn run(&self) -> Result<Vec<ReportRow>> {
        let transport =
            TransportFactory::create(self.config.transport, self.config.role, self.config.address)
                .with_context(|| format!("failed to create {} transport", self.config.transport))?;
        self.run_with_transport(transport.as_ref())
    }

    /// Run on a transport supplied by the caller
    pub fn run_with_transport(&self, transport: &dyn Transport) -> Result<Vec<ReportRow>> {
        let config = &self.config;
        let topology = ChannelTopology::new(&config.sweep);
        info!(
            "Starting {} benchmark: {} over {}, {} iterations, {} size classes",
            config.mode,
            config.role,
            transport.name(),
            config.iterations,
            config.sweep.len()
        );

        match config.role {
            Role::RelayOnly => {
                let relay = RelayRole::start(transport, &topology, &config.sweep)
                    .map_err(log_setup_failure)
                    .context("relay startup failed")?;
                self.stop.wait();
                info!("Relay stopped after {} messages", relay.relayed());
                Ok(Vec::new())
            }
            Role::CoLocated => {
                let _relay = RelayRole::start(transport, &topology, &config.sweep)
                    .map_err(log_setup_failure)
                    .context("relay startup failed")?;
                self.sweep(transport, &topology)
            }
            Role::DriverOnly => self.sweep(transport, &topology),
        }
    }

    fn sweep(&self, transport: &dyn Transport, topology: &ChannelTopology) -> Result<Vec<ReportRow>> {
        let config = &self.config;
        let driver = MeasurementRole::init(
            transport,
            topology,
            &config.sweep,
            config.iterations,
            self.stop.clone(),
        )
        .map_err(log_setup_failure)
        .context("driver initialisation failed")?;

        let header = ReportHeader::capture(transport.name());
        let mut sink = ReportSink::open(config.output.as_deref(), header)
            .with_context(|| format!("failed to open report output {:?}", config.output))?;

        let mut rows = Vec::with_capacity(config.sweep.len());
        for (idx, spec) in config.sweep.iter().enumerate() {
            if self.stop.is_stopped() {
                break;
            }
            let test_num = idx + 1;
            let size = spec.requested_size;
            let row = match config.mode {
                BenchmarkMode::Throughput => driver
                    .throughput(spec)?
                    .map(|stats| ReportRow::Throughput {
                        test_num,
                        size,
                        stats,
                    }),
                BenchmarkMode::Latency => driver.latency(spec)?.map(|stats| ReportRow::Latency {
                    test_num,
                    size,
                    stats,
                }),
            };
            // No row means the stop fired before a relay showed up
            let Some(row) = row else {
                break;
            };
            sink.write_row(&row).context("failed to write report row")?;
            rows.push(row);
        }

        let interrupted = self.stop.is_stopped();
        if interrupted {
            warn!(
                "Run interrupted after {} of {} size classes",
                rows.len(),
                config.sweep.len()
            );
        } else {
            info!("Completed {} size classes", rows.len());
        }
        Ok(rows)
    }
}

fn log_setup_failure(err: BenchError) -> BenchError {
    if let BenchError::Setup { topic, source } = &err {
        error!("Error setting up topic [{}]: {}", topic, source);
    }
    err
}

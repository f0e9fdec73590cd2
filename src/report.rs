//! Tab-separated report output.
//!
//! A report is a block of `#` comment lines describing the environment, one
//! column header comment, and one row per size class:
//!
//! ```text
//! # 2024-05-01T12:00:00+02:00
//! # pubsub-bench 0.2.0 (inproc)
//! # Linux 6.5.0 #1 SMP x86_64
//! # Test	Size(B)	Avg_(us)	Min_(us)	Max_(us)
//! 1	256	12.500000	10.000000	31.000000
//! ```
//!
//! The destination is chosen once when the sink is created. The header is
//! only written together with the first row, so a run that never measures
//! anything leaves the destination untouched.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::cli::BenchmarkMode;
use crate::error::BenchError;
use crate::stats::{LatencyStats, ThroughputStats};

const THROUGHPUT_COLUMNS: &str = "# Test\tSize(B)\t\tMB/s\t\tKmsg/s";
const LATENCY_COLUMNS: &str = "# Test\tSize(B)\tAvg_(us)\tMin_(us)\tMax_(us)";

/// Environment metadata printed above the rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportHeader {
    pub timestamp: String,
    pub version: String,
    pub os: Option<String>,
}

impl ReportHeader {
    /// Capture the current time, crate version and OS identification
    pub fn capture(transport_name: &str) -> Self {
        Self {
            timestamp: chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%:z").to_string(),
            version: format!("pubsub-bench {} ({})", crate::VERSION, transport_name),
            os: os_identification(),
        }
    }

    fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        writeln!(writer, "# {}", self.timestamp)?;
        writeln!(writer, "# {}", self.version)?;
        if let Some(os) = &self.os {
            writeln!(writer, "# {}", os)?;
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn os_identification() -> Option<String> {
    let uts = nix::sys::utsname::uname().ok()?;
    Some(format!(
        "{} {} {} {}",
        uts.sysname().to_string_lossy(),
        uts.release().to_string_lossy(),
        uts.version().to_string_lossy(),
        uts.machine().to_string_lossy()
    ))
}

#[cfg(not(target_os = "linux"))]
fn os_identification() -> Option<String> {
    None
}

/// One finished size class
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReportRow {
    Throughput {
        test_num: usize,
        size: u32,
        stats: ThroughputStats,
    },
    Latency {
        test_num: usize,
        size: u32,
        stats: LatencyStats,
    },
}

impl ReportRow {
    pub fn mode(&self) -> BenchmarkMode {
        match self {
            ReportRow::Throughput { .. } => BenchmarkMode::Throughput,
            ReportRow::Latency { .. } => BenchmarkMode::Latency,
        }
    }

    pub fn size(&self) -> u32 {
        match self {
            ReportRow::Throughput { size, .. } | ReportRow::Latency { size, .. } => *size,
        }
    }

    /// Column header comment for rows of `mode`
    pub fn column_header(mode: BenchmarkMode) -> &'static str {
        match mode {
            BenchmarkMode::Throughput => THROUGHPUT_COLUMNS,
            BenchmarkMode::Latency => LATENCY_COLUMNS,
        }
    }
}

impl fmt::Display for ReportRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportRow::Throughput {
                test_num,
                size,
                stats,
            } => write!(
                f,
                "{}\t{}\t\t{:.6}\t{:.6}\t",
                test_num, size, stats.mb_per_sec, stats.kmsg_per_sec
            ),
            ReportRow::Latency {
                test_num,
                size,
                stats,
            } => write!(
                f,
                "{}\t{}\t{:.6}\t{:.6}\t{:.6}",
                test_num, size, stats.avg_us, stats.min_us, stats.max_us
            ),
        }
    }
}

/// Line-oriented report writer for the console or a file
pub struct ReportSink {
    writer: Box<dyn Write + Send>,
    header: ReportHeader,
    columns_written: Option<BenchmarkMode>,
}

impl ReportSink {
    /// Report to stdout
    pub fn console(header: ReportHeader) -> Self {
        Self::new(Box::new(io::stdout()), header)
    }

    /// Report to a file, truncating any previous content
    pub fn file(path: &Path, header: ReportHeader) -> Result<Self, BenchError> {
        let file = File::create(path)?;
        Ok(Self::new(Box::new(BufWriter::new(file)), header))
    }

    /// Console when `output` is `None` or empty, file otherwise
    pub fn open(output: Option<&Path>, header: ReportHeader) -> Result<Self, BenchError> {
        match output {
            Some(path) if !path.as_os_str().is_empty() => Self::file(path, header),
            _ => Ok(Self::console(header)),
        }
    }

    pub fn new(writer: Box<dyn Write + Send>, header: ReportHeader) -> Self {
        Self {
            writer,
            header,
            columns_written: None,
        }
    }

    /// Write one row, preceded by the header on first use
    pub fn write_row(&mut self, row: &ReportRow) -> Result<(), BenchError> {
        let mode = row.mode();
        if self.columns_written.is_none() {
            self.header.write_to(&mut self.writer)?;
        }
        if self.columns_written != Some(mode) {
            writeln!(self.writer, "{}", ReportRow::column_header(mode))?;
            self.columns_written = Some(mode);
        }
        writeln!(self.writer, "{}", row)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Whether anything has been written yet
    pub fn has_output(&self) -> bool {
        self.columns_written.is_some()
    }
}

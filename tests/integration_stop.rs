use anyhow::Result;
use pubsub_bench::cli::{BenchmarkMode, Role, TransportKind};
use pubsub_bench::transport::InProcessBus;
use pubsub_bench::{ReportRow, RunConfig, RunController, SizeSweep, StopToken};
use std::thread;
use std::time::{Duration, Instant};

fn stop_after(stop: &StopToken, delay: Duration) -> thread::JoinHandle<()> {
    let stop = stop.clone();
    thread::spawn(move || {
        thread::sleep(delay);
        stop.stop();
    })
}

/// Stopping mid-sweep reports the exchanges completed so far.
#[test]
fn stop_during_latency_reports_partial_row() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let iterations = 50_000_000;
    let sweep = SizeSweep::from_sizes([256, 512])?;
    let config =
        RunConfig::co_located_latency(iterations, sweep).with_output(dir.path().join("partial.txt"));

    let stop = StopToken::new();
    let stopper = stop_after(&stop, Duration::from_millis(200));
    let start = Instant::now();
    let rows = RunController::new(config, stop).run()?;
    assert!(start.elapsed() < Duration::from_secs(30));
    stopper.join().expect("stopper thread panicked");

    assert_eq!(rows.len(), 1);
    let ReportRow::Latency { size, stats, .. } = rows[0] else {
        panic!("expected a latency row, got {:?}", rows[0]);
    };
    assert_eq!(size, 256);
    assert!(stats.samples < iterations);
    Ok(())
}

/// Stopping mid-batch reports the replies counted before the stop.
#[test]
fn stop_during_throughput_reports_partial_batch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let iterations = 20_000_000;
    let sweep = SizeSweep::from_sizes([256, 512])?;
    let config = RunConfig::co_located_throughput(iterations, sweep)
        .with_output(dir.path().join("partial.txt"));

    let stop = StopToken::new();
    let stopper = stop_after(&stop, Duration::from_millis(200));
    let start = Instant::now();
    let rows = RunController::new(config, stop).run()?;
    assert!(start.elapsed() < Duration::from_secs(30));
    stopper.join().expect("stopper thread panicked");

    assert_eq!(rows.len(), 1);
    let ReportRow::Throughput { size, stats, .. } = rows[0] else {
        panic!("expected a throughput row, got {:?}", rows[0]);
    };
    assert_eq!(size, 256);
    assert!(stats.message_count < iterations);
    assert!(stats.elapsed_us > 0);
    Ok(())
}

/// Without a relay the driver never gets past the connection wait.
#[test]
fn driver_without_relay_reports_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("idle.txt");
    let config = RunConfig {
        iterations: 10,
        output: Some(path.clone()),
        mode: BenchmarkMode::Throughput,
        role: Role::DriverOnly,
        transport: TransportKind::InProcess,
        address: "127.0.0.1:0".parse()?,
        sweep: SizeSweep::from_sizes([256])?,
    };

    let bus = InProcessBus::new()?;
    let stop = StopToken::new();
    let stopper = stop_after(&stop, Duration::from_millis(100));
    let rows = RunController::new(config, stop).run_with_transport(&bus)?;
    stopper.join().expect("stopper thread panicked");

    assert!(rows.is_empty());
    assert_eq!(std::fs::read_to_string(&path)?, "");
    Ok(())
}

use anyhow::Result;
use pubsub_bench::{PayloadSpec, ReportRow, RunConfig, RunController, SizeSweep, StopToken};

/// A single batch of 100 messages of 1000 bytes.
#[test]
fn colocated_throughput_rates_match_counters() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("throughput.txt");
    let sweep = SizeSweep::from_sizes([1000])?;
    let config = RunConfig::co_located_throughput(100, sweep).with_output(&path);

    let rows = RunController::new(config, StopToken::new()).run()?;
    assert_eq!(rows.len(), 1);

    let serialized = PayloadSpec::new(1000)?.serialized_size;
    assert!(serialized >= 1000);

    let ReportRow::Throughput { size, stats, .. } = rows[0] else {
        panic!("expected a throughput row, got {:?}", rows[0]);
    };
    assert_eq!(size, 1000);
    assert_eq!(stats.message_count, 100);
    assert_eq!(stats.total_bytes, 100 * serialized);
    assert!(stats.elapsed_us > 0);

    let seconds = stats.elapsed_us as f64 * 1e-6;
    let expected_mb = stats.total_bytes as f64 * 1e-6 / seconds;
    let expected_kmsg = 100.0 * 1e-3 / seconds;
    assert!((stats.mb_per_sec - expected_mb).abs() <= expected_mb * 1e-9);
    assert!((stats.kmsg_per_sec - expected_kmsg).abs() <= expected_kmsg * 1e-9);

    let report = std::fs::read_to_string(&path)?;
    assert!(report.contains("# Test\tSize(B)\t\tMB/s\t\tKmsg/s"));
    assert!(report.lines().any(|line| line.starts_with("1\t1000\t\t")));
    Ok(())
}

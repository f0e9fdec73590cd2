use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// One-way latency estimate from round-trip samples
///
/// Every value is half of the observed round trip, which assumes the
/// outbound and inbound paths cost the same.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub avg_us: f64,
    pub min_us: f64,
    pub max_us: f64,
    /// Exchanges that completed; lower than the configured count when stopped
    pub samples: u64,
}

/// Sustained rate achieved while streaming one batch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThroughputStats {
    pub mb_per_sec: f64,
    pub kmsg_per_sec: f64,
    pub total_bytes: u64,
    pub message_count: u64,
    pub elapsed_us: u64,
}

/// Microseconds between two instants of the monotonic clock
///
/// Saturates at zero if `end` precedes `start`.
pub fn elapsed_micros(start: Instant, end: Instant) -> u64 {
    end.saturating_duration_since(start).as_micros() as u64
}

/// Running sum/min/max of round-trip durations for one size class
#[derive(Debug, Clone, Default)]
pub struct LatencyAccumulator {
    count: u64,
    sum_us: u64,
    min_us: Option<u64>,
    max_us: u64,
}

impl LatencyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one round trip in microseconds
    pub fn record_micros(&mut self, round_trip_us: u64) {
        self.count += 1;
        self.sum_us = self.sum_us.saturating_add(round_trip_us);
        self.min_us = Some(self.min_us.map_or(round_trip_us, |min| min.min(round_trip_us)));
        self.max_us = self.max_us.max(round_trip_us);
    }

    /// Record one round trip
    pub fn record(&mut self, round_trip: Duration) {
        self.record_micros(round_trip.as_micros() as u64);
    }

    /// Halve the accumulated round trips into one-way latency.
    ///
    /// The average is taken over completed exchanges only; an empty
    /// accumulator reports zeros.
    pub fn finish(&self) -> LatencyStats {
        if self.count == 0 {
            return LatencyStats {
                avg_us: 0.0,
                min_us: 0.0,
                max_us: 0.0,
                samples: 0,
            };
        }
        LatencyStats {
            avg_us: (self.sum_us as f64 / self.count as f64) * 0.5,
            min_us: self.min_us.unwrap_or_default() as f64 * 0.5,
            max_us: self.max_us as f64 * 0.5,
            samples: self.count,
        }
    }
}

/// Byte and message counters for one throughput batch
#[derive(Debug, Clone, Default)]
pub struct ThroughputAccumulator {
    total_bytes: u64,
    message_count: u64,
}

impl ThroughputAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one reply of the given serialized size
    pub fn record_message(&mut self, serialized_size: u64) {
        self.total_bytes += serialized_size;
        self.message_count += 1;
    }

    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    /// Convert the counters into rates over `elapsed_us` microseconds.
    ///
    /// A zero elapsed time yields zero rates rather than infinities.
    pub fn finish(&self, elapsed_us: u64) -> ThroughputStats {
        let seconds = elapsed_us as f64 * 1e-6;
        let (mb_per_sec, kmsg_per_sec) = if seconds > 0.0 {
            (
                (self.total_bytes as f64 * 1e-6) / seconds,
                (self.message_count as f64 * 1e-3) / seconds,
            )
        } else {
            (0.0, 0.0)
        };

        ThroughputStats {
            mb_per_sec,
            kmsg_per_sec,
            total_bytes: self.total_bytes,
            message_count: self.message_count,
            elapsed_us,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_halves_round_trip() {
        let mut acc = LatencyAccumulator::new();
        acc.record(Duration::from_micros(100));
        acc.record(Duration::from_micros(200));
        acc.record(Duration::from_micros(300));

        let stats = acc.finish();
        assert_eq!(stats.samples, 3);
        assert_eq!(stats.avg_us, 100.0);
        assert_eq!(stats.min_us, 50.0);
        assert_eq!(stats.max_us, 150.0);
        assert!(stats.min_us <= stats.avg_us && stats.avg_us <= stats.max_us);
    }

    #[test]
    fn test_empty_latency_reports_zero() {
        let stats = LatencyAccumulator::new().finish();
        assert_eq!(stats.samples, 0);
        assert_eq!(stats.avg_us, 0.0);
        assert_eq!(stats.min_us, 0.0);
        assert_eq!(stats.max_us, 0.0);
    }

    #[test]
    fn test_single_sample_min_equals_max() {
        let mut acc = LatencyAccumulator::new();
        acc.record_micros(7);
        let stats = acc.finish();
        assert_eq!(stats.min_us, stats.max_us);
        assert_eq!(stats.avg_us, 3.5);
    }

    #[test]
    fn test_throughput_rates() {
        let mut acc = ThroughputAccumulator::new();
        for _ in 0..100 {
            acc.record_message(1008);
        }

        // 100 messages in 0.5s
        let stats = acc.finish(500_000);
        assert_eq!(stats.message_count, 100);
        assert_eq!(stats.total_bytes, 100_800);
        assert!((stats.mb_per_sec - 100_800.0 * 1e-6 / 0.5).abs() < 1e-9);
        assert!((stats.kmsg_per_sec - 100.0 * 1e-3 / 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_throughput_zero_elapsed() {
        let mut acc = ThroughputAccumulator::new();
        acc.record_message(10);
        let stats = acc.finish(0);
        assert_eq!(stats.mb_per_sec, 0.0);
        assert_eq!(stats.kmsg_per_sec, 0.0);
    }

    #[test]
    fn test_elapsed_micros_saturates() {
        let start = Instant::now();
        let end = start + Duration::from_micros(1500);
        assert_eq!(elapsed_micros(start, end), 1500);
        assert_eq!(elapsed_micros(end, start), 0);
    }
}

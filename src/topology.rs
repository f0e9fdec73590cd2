//! Request/reply channel names per size class.
//!
//! Every size class owns four channels and no channel is shared between
//! sizes, so a reply can never be attributed to the wrong size class and no
//! correlation id is needed:
//!
//! ```text
//! /benchmark/latency/<S>request      /benchmark/latency/<S>reply
//! /benchmark/throughput/<S>request   /benchmark/throughput/<S>reply
//! ```

use std::collections::BTreeMap;
use std::fmt;

use crate::cli::BenchmarkMode;
use crate::error::BenchError;
use crate::payload::SizeSweep;

const TOPIC_ROOT: &str = "/benchmark";

/// Which way a message travels relative to the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    Request,
    Reply,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Request => write!(f, "request"),
            Direction::Reply => write!(f, "reply"),
        }
    }
}

/// Key into the topology table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelKey {
    pub mode: BenchmarkMode,
    pub direction: Direction,
    pub size: u32,
}

/// Topic name for one (mode, direction, size) triple
pub fn topic_name(mode: BenchmarkMode, direction: Direction, size: u32) -> String {
    format!("{}/{}/{}{}", TOPIC_ROOT, mode.topic_segment(), size, direction)
}

/// Channel table built once per run from the size sweep
#[derive(Debug, Clone)]
pub struct ChannelTopology {
    topics: BTreeMap<ChannelKey, String>,
}

impl ChannelTopology {
    pub fn new(sweep: &SizeSweep) -> Self {
        let mut topics = BTreeMap::new();
        for size in sweep.sizes() {
            for mode in [BenchmarkMode::Latency, BenchmarkMode::Throughput] {
                for direction in [Direction::Request, Direction::Reply] {
                    topics.insert(
                        ChannelKey {
                            mode,
                            direction,
                            size,
                        },
                        topic_name(mode, direction, size),
                    );
                }
            }
        }
        Self { topics }
    }

    /// Topic for a channel, or `None` if the size is not part of the sweep
    pub fn topic(&self, mode: BenchmarkMode, direction: Direction, size: u32) -> Option<&str> {
        self.topics
            .get(&ChannelKey {
                mode,
                direction,
                size,
            })
            .map(String::as_str)
    }

    /// Like [`ChannelTopology::topic`] but an unknown size is a configuration error
    pub fn channel(
        &self,
        mode: BenchmarkMode,
        direction: Direction,
        size: u32,
    ) -> Result<&str, BenchError> {
        self.topic(mode, direction, size).ok_or_else(|| {
            BenchError::InvalidConfig(format!("size {} is not part of the sweep", size))
        })
    }

    /// All channels in key order
    pub fn iter(&self) -> impl Iterator<Item = (&ChannelKey, &str)> {
        self.topics.iter().map(|(key, topic)| (key, topic.as_str()))
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(
            topic_name(BenchmarkMode::Latency, Direction::Request, 256),
            "/benchmark/latency/256request"
        );
        assert_eq!(
            topic_name(BenchmarkMode::Throughput, Direction::Reply, 4_000_000),
            "/benchmark/throughput/4000000reply"
        );
    }

    #[test]
    fn test_four_unique_channels_per_size() {
        let sweep = SizeSweep::from_sizes([256, 512, 1000]).unwrap();
        let topology = ChannelTopology::new(&sweep);
        assert_eq!(topology.len(), 12);
        assert!(!topology.is_empty());
        assert!(ChannelTopology::new(&SizeSweep::from_sizes([]).unwrap()).is_empty());

        let mut names: Vec<&str> = topology.iter().map(|(_, topic)| topic).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 12);
    }

    #[test]
    fn test_unknown_size_has_no_topic() {
        let sweep = SizeSweep::from_sizes([256]).unwrap();
        let topology = ChannelTopology::new(&sweep);
        assert!(topology
            .topic(BenchmarkMode::Latency, Direction::Reply, 256)
            .is_some());
        assert!(topology
            .topic(BenchmarkMode::Latency, Direction::Reply, 512)
            .is_none());
        assert!(matches!(
            topology.channel(BenchmarkMode::Throughput, Direction::Request, 512),
            Err(BenchError::InvalidConfig(_))
        ));
    }
}

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cli::BenchmarkMode;
use crate::error::BenchError;
use crate::payload::SizeSweep;
use crate::topology::{ChannelTopology, Direction};
use crate::transport::{MessageHandler, Subscription, Transport};

/// Stateless echo of every request onto the matching reply channel
///
/// Subscriptions stay live for as long as the role is held; dropping the role
/// stops relaying.
pub struct RelayRole {
    subscriptions: Vec<Box<dyn Subscription>>,
    relayed: Arc<AtomicU64>,
}

impl RelayRole {
    /// Subscribe the request channels of both metrics for every size class.
    ///
    /// Fails on the first channel the transport rejects; that error names the
    /// channel and is not retried.
    pub fn start(
        transport: &dyn Transport,
        topology: &ChannelTopology,
        sweep: &SizeSweep,
    ) -> Result<Self, BenchError> {
        let relayed = Arc::new(AtomicU64::new(0));
        let mut subscriptions = Vec::with_capacity(sweep.len() * 2);

        for size in sweep.sizes() {
            for mode in [BenchmarkMode::Throughput, BenchmarkMode::Latency] {
                let request = topology.channel(mode, Direction::Request, size)?;
                let reply = topology.channel(mode, Direction::Reply, size)?;

                let publisher = transport
                    .advertise(reply)
                    .map_err(|e| BenchError::setup(reply, e))?;
                let counter = Arc::clone(&relayed);
                let echo: MessageHandler = Arc::new(move |payload: Bytes| {
                    counter.fetch_add(1, Ordering::Relaxed);
                    debug!(size, topic = publisher.topic(), "Relaying {} bytes", payload.len());
                    if let Err(e) = publisher.publish(payload) {
                        warn!("Relay publish failed: {}", e);
                    }
                });

                let subscription = transport
                    .subscribe(request, echo)
                    .map_err(|e| BenchError::setup(request, e))?;
                subscriptions.push(subscription);
            }
        }

        transport.kick_discovery();
        info!(
            "Relay listening on {} request channels via {}",
            subscriptions.len(),
            transport.name()
        );
        Ok(Self {
            subscriptions,
            relayed,
        })
    }

    /// Number of messages echoed so far
    pub fn relayed(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }

    /// Request channels currently subscribed
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(|sub| sub.topic())
    }
}

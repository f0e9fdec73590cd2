//! Measuring side of the benchmark.
//!
//! The control thread publishes requests and blocks on a condition variable;
//! reply handlers run on transport threads and update the shared
//! [`ExchangeState`] under the same mutex. The stop token is wired to that
//! condition variable so every wait re-checks the stop flag as soon as it is
//! raised.
//!
//! Only one size class is active at a time. Replies arriving on a channel
//! that does not belong to the active class are ignored, which covers late
//! replies from a class that was cut short.

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::cancel::{StopToken, WakeRegistration};
use crate::cli::BenchmarkMode;
use crate::defaults;
use crate::error::BenchError;
use crate::payload::{self, PayloadSpec, SizeSweep};
use crate::stats::{
    elapsed_micros, LatencyAccumulator, LatencyStats, ThroughputAccumulator, ThroughputStats,
};
use crate::topology::{ChannelTopology, Direction};
use crate::transport::{MessageHandler, Publisher, Subscription, Transport};

/// Mutable state shared between the control thread and reply handlers
#[derive(Default)]
struct ExchangeState {
    /// Size class currently measured
    active: Option<(BenchmarkMode, u32)>,
    /// Bumped on every activation so late buffer returns are discarded
    generation: u64,
    expected: u64,
    serialized_size: u64,
    throughput: ThroughputAccumulator,
    end: Option<Instant>,
    reply_received: bool,
    /// Reusable outbound buffer; empty while the transport owns it
    slot: Option<Bytes>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<ExchangeState>,
    cond: Condvar,
}

impl Shared {
    fn on_reply(&self, mode: BenchmarkMode, size: u32) {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.active != Some((mode, size)) {
            return;
        }
        match mode {
            BenchmarkMode::Throughput => {
                state.throughput.record_message(state.serialized_size);
                if state.throughput.message_count() == state.expected {
                    state.end = Some(now);
                    self.cond.notify_all();
                }
            }
            BenchmarkMode::Latency => {
                state.end = Some(now);
                state.reply_received = true;
                self.cond.notify_all();
            }
        }
    }

    fn return_buffer(&self, generation: u64, buffer: Bytes) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.slot = Some(buffer);
            self.cond.notify_all();
        }
    }

    fn activate(&self, mode: BenchmarkMode, size: u32) -> MutexGuard<'_, ExchangeState> {
        let mut state = self.state.lock();
        state.active = Some((mode, size));
        state.generation += 1;
        state.throughput = ThroughputAccumulator::new();
        state.end = None;
        state.reply_received = false;
        state.slot = None;
        state
    }

    fn deactivate(&self) {
        let mut state = self.state.lock();
        state.active = None;
        state.slot = None;
    }
}

/// Driver role: publishes requests and measures replies
pub struct MeasurementRole {
    shared: Arc<Shared>,
    requests: HashMap<(BenchmarkMode, u32), Arc<dyn Publisher>>,
    subscriptions: Vec<Box<dyn Subscription>>,
    iterations: u64,
    poll_interval: Duration,
    stop: StopToken,
    _wake: WakeRegistration,
}

impl MeasurementRole {
    /// Advertise every request channel and subscribe every reply channel.
    ///
    /// The role is unusable if this fails; the error names the channel the
    /// transport rejected.
    pub fn init(
        transport: &dyn Transport,
        topology: &ChannelTopology,
        sweep: &SizeSweep,
        iterations: u64,
        stop: StopToken,
    ) -> Result<Self, BenchError> {
        let shared = Arc::new(Shared::default());
        let mut requests = HashMap::with_capacity(sweep.len() * 2);
        let mut subscriptions = Vec::with_capacity(sweep.len() * 2);

        for size in sweep.sizes() {
            for mode in [BenchmarkMode::Throughput, BenchmarkMode::Latency] {
                let request = topology.channel(mode, Direction::Request, size)?;
                let reply = topology.channel(mode, Direction::Reply, size)?;

                let publisher = transport
                    .advertise(request)
                    .map_err(|e| BenchError::setup(request, e))?;
                requests.insert((mode, size), publisher);

                let handler_shared = Arc::clone(&shared);
                let handler: MessageHandler =
                    Arc::new(move |_reply: Bytes| handler_shared.on_reply(mode, size));
                let subscription = transport
                    .subscribe(reply, handler)
                    .map_err(|e| BenchError::setup(reply, e))?;
                subscriptions.push(subscription);
            }
        }
        transport.kick_discovery();

        let wake_shared = Arc::clone(&shared);
        let wake = stop.on_stop(move || {
            let _state = wake_shared.state.lock();
            wake_shared.cond.notify_all();
        });

        Ok(Self {
            shared,
            requests,
            subscriptions,
            iterations,
            poll_interval: defaults::CONNECTION_POLL_INTERVAL,
            stop,
            _wake: wake,
        })
    }

    /// Reply channels this role listens on
    pub fn reply_channels(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(|sub| sub.topic())
    }

    fn request_publisher(
        &self,
        mode: BenchmarkMode,
        size: u32,
    ) -> Result<Arc<dyn Publisher>, BenchError> {
        self.requests
            .get(&(mode, size))
            .cloned()
            .ok_or_else(|| BenchError::InvalidConfig(format!("size {} was not initialised", size)))
    }

    /// Poll until the relay is reachable on `publisher`.
    ///
    /// Returns `false` if the stop token fired first.
    fn wait_for_peer(&self, publisher: &dyn Publisher) -> bool {
        let mut announced = false;
        loop {
            if self.stop.is_stopped() {
                return false;
            }
            if publisher.has_connections() {
                return true;
            }
            if !announced {
                info!("Waiting for a relay on {}", publisher.topic());
                announced = true;
            }
            if self.stop.sleep(self.poll_interval) {
                return false;
            }
        }
    }

    /// Stream the configured number of requests back-to-back and time the
    /// batch until the last reply arrives.
    ///
    /// Returns `None` if stopped before a relay connected. A stop during the
    /// batch returns the counts gathered so far.
    pub fn throughput(&self, spec: &PayloadSpec) -> Result<Option<ThroughputStats>, BenchError> {
        let size = spec.requested_size;
        let publisher = self.request_publisher(BenchmarkMode::Throughput, size)?;
        if !self.wait_for_peer(publisher.as_ref()) {
            return Ok(None);
        }

        let (payload, built) = payload::build(size)?;
        {
            let mut state = self.shared.activate(BenchmarkMode::Throughput, size);
            state.expected = self.iterations;
            state.serialized_size = built.serialized_size;
        }

        let result = self.stream_batch(publisher.as_ref(), &payload);
        self.shared.deactivate();
        let stats = result?;
        debug!(
            size,
            messages = stats.message_count,
            elapsed_us = stats.elapsed_us,
            "Throughput batch finished"
        );
        Ok(Some(stats))
    }

    fn stream_batch(
        &self,
        publisher: &dyn Publisher,
        payload: &Bytes,
    ) -> Result<ThroughputStats, BenchError> {
        let start = Instant::now();
        for _ in 0..self.iterations {
            if self.stop.is_stopped() {
                break;
            }
            publisher.publish(payload.clone())?;
        }

        let mut state = self.shared.state.lock();
        while state.end.is_none() && !self.stop.is_stopped() {
            self.shared.cond.wait(&mut state);
        }
        let end = state.end.unwrap_or_else(Instant::now);
        Ok(state.throughput.finish(elapsed_micros(start, end)))
    }

    /// Time the configured number of request/reply exchanges one at a time.
    ///
    /// Returns `None` if stopped before a relay connected. A stop during the
    /// exchanges returns statistics over the completed ones.
    pub fn latency(&self, spec: &PayloadSpec) -> Result<Option<LatencyStats>, BenchError> {
        let size = spec.requested_size;
        let publisher = self.request_publisher(BenchmarkMode::Latency, size)?;
        if !self.wait_for_peer(publisher.as_ref()) {
            return Ok(None);
        }

        let (payload, _) = payload::build(size)?;
        let generation = {
            let mut state = self.shared.activate(BenchmarkMode::Latency, size);
            state.slot = Some(payload);
            state.generation
        };

        let result = self.exchange_loop(publisher.as_ref(), generation);
        self.shared.deactivate();
        let stats = result?;
        debug!(size, samples = stats.samples, "Latency exchanges finished");
        Ok(Some(stats))
    }

    fn exchange_loop(
        &self,
        publisher: &dyn Publisher,
        generation: u64,
    ) -> Result<LatencyStats, BenchError> {
        let mut acc = LatencyAccumulator::new();
        for _ in 0..self.iterations {
            let buffer = {
                let mut state = self.shared.state.lock();
                while state.slot.is_none() && !self.stop.is_stopped() {
                    self.shared.cond.wait(&mut state);
                }
                if self.stop.is_stopped() {
                    break;
                }
                state.reply_received = false;
                state.end = None;
                match state.slot.take() {
                    Some(buffer) => buffer,
                    None => break,
                }
            };

            let shared = Arc::clone(&self.shared);
            let start = Instant::now();
            publisher.publish_with_completion(
                buffer,
                Box::new(move |buffer| shared.return_buffer(generation, buffer)),
            )?;

            let mut state = self.shared.state.lock();
            while !state.reply_received && !self.stop.is_stopped() {
                self.shared.cond.wait(&mut state);
            }
            if !state.reply_received {
                break;
            }
            let end = state.end.unwrap_or_else(Instant::now);
            acc.record(end.saturating_duration_since(start));
        }
        Ok(acc.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::roles::RelayRole;
    use crate::transport::InProcessBus;
    use std::thread;

    fn setup(sizes: &[u32]) -> (InProcessBus, SizeSweep, ChannelTopology) {
        let bus = InProcessBus::new().unwrap();
        let sweep = SizeSweep::from_sizes(sizes.iter().copied()).unwrap();
        let topology = ChannelTopology::new(&sweep);
        (bus, sweep, topology)
    }

    #[test]
    fn test_latency_with_colocated_relay() {
        let (bus, sweep, topology) = setup(&[256]);
        let _relay = RelayRole::start(&bus, &topology, &sweep).unwrap();
        let driver = MeasurementRole::init(&bus, &topology, &sweep, 20, StopToken::new()).unwrap();
        assert_eq!(driver.reply_channels().count(), 2);

        let spec = sweep.get(256).unwrap();
        let stats = driver.latency(spec).unwrap().unwrap();
        assert_eq!(stats.samples, 20);
        assert!(stats.min_us >= 0.0);
        assert!(stats.min_us <= stats.avg_us && stats.avg_us <= stats.max_us);
    }

    #[test]
    fn test_throughput_counts_every_reply() {
        let (bus, sweep, topology) = setup(&[1000]);
        let _relay = RelayRole::start(&bus, &topology, &sweep).unwrap();
        let driver = MeasurementRole::init(&bus, &topology, &sweep, 50, StopToken::new()).unwrap();

        let spec = sweep.get(1000).unwrap();
        let stats = driver.throughput(spec).unwrap().unwrap();
        assert_eq!(stats.message_count, 50);
        assert_eq!(stats.total_bytes, 50 * spec.serialized_size);
    }

    #[test]
    fn test_stop_while_waiting_for_peer() {
        let (bus, sweep, topology) = setup(&[256]);
        let stop = StopToken::new();
        let driver = MeasurementRole::init(&bus, &topology, &sweep, 10, stop.clone()).unwrap();

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stop.stop();
        });
        let start = Instant::now();
        assert!(driver.latency(sweep.get(256).unwrap()).unwrap().is_none());
        assert!(start.elapsed() < defaults::CONNECTION_POLL_INTERVAL * 4);
        stopper.join().unwrap();
    }

    #[test]
    fn test_stop_while_waiting_for_reply() {
        let (bus, sweep, topology) = setup(&[256]);
        // Subscriber that never answers, so the driver sees a peer but no reply
        let _sink = bus
            .subscribe("/benchmark/latency/256request", Arc::new(|_payload: Bytes| {}))
            .unwrap();
        let stop = StopToken::new();
        let driver = MeasurementRole::init(&bus, &topology, &sweep, 10, stop.clone()).unwrap();

        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stop.stop();
        });
        let stats = driver.latency(sweep.get(256).unwrap()).unwrap().unwrap();
        assert_eq!(stats.samples, 0);
        stopper.join().unwrap();
    }

    #[test]
    fn test_unknown_size_is_rejected() {
        let (bus, sweep, topology) = setup(&[256]);
        let driver = MeasurementRole::init(&bus, &topology, &sweep, 1, StopToken::new()).unwrap();
        let other = PayloadSpec::new(512).unwrap();
        assert!(matches!(
            driver.throughput(&other),
            Err(BenchError::InvalidConfig(_))
        ));
    }

    /// Accepts subscriptions but refuses every publisher
    struct NoPublishers {
        bus: InProcessBus,
    }

    impl Transport for NoPublishers {
        fn name(&self) -> &'static str {
            "no-publishers"
        }

        fn advertise(&self, topic: &str) -> Result<Arc<dyn Publisher>, TransportError> {
            Err(TransportError::Advertise(
                topic.to_string(),
                "no addresses".to_string(),
            ))
        }

        fn subscribe(
            &self,
            topic: &str,
            handler: MessageHandler,
        ) -> Result<Box<dyn Subscription>, TransportError> {
            self.bus.subscribe(topic, handler)
        }
    }

    #[test]
    fn test_init_failure_names_channel() {
        let (bus, sweep, topology) = setup(&[256, 512]);
        let transport = NoPublishers { bus };
        match MeasurementRole::init(&transport, &topology, &sweep, 10, StopToken::new()) {
            Err(BenchError::Setup { topic, .. }) => {
                assert_eq!(topic, "/benchmark/throughput/256request")
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("driver initialised on a rejecting transport"),
        }
    }
}

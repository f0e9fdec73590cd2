//! TCP peer link between two benchmark processes.
//!
//! Each process keeps an in-process bus for local delivery and forwards
//! messages to its single peer when the peer has announced interest in the
//! topic. Peers learn about each other's subscriptions from `Subscribe`
//! frames, which is the only discovery mechanism.
//!
//! Frames are a little-endian `u32` header length, a bincode-encoded
//! [`FrameHeader`], and for `Publish` frames the raw message body.

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use socket2::SockRef;
use std::collections::{HashMap, HashSet};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::inproc::{InProcessPublisher, InProcessSubscription};
use super::{
    InProcessBus, MessageHandler, Publisher, SendCompletion, Subscription, Transport,
    TransportError,
};
use crate::defaults;

/// Granularity at which background threads notice shutdown
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Which side of the link this process takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Bind `address` and accept one peer at a time
    Listen,
    /// Connect to `address`, retrying until a peer is reachable
    Connect,
}

/// Transport configuration for the TCP link
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub address: SocketAddr,
    pub mode: LinkMode,
    pub buffer_size: usize,
    pub retry_interval: Duration,
    pub max_frame_size: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], defaults::PORT)),
            mode: LinkMode::Listen,
            buffer_size: defaults::SOCKET_BUFFER_SIZE,
            retry_interval: defaults::CONNECTION_POLL_INTERVAL,
            max_frame_size: defaults::MAX_FRAME_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum FrameHeader {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String, body_len: u64 },
}

struct Outbound {
    header: Vec<u8>,
    body: Option<Bytes>,
    on_sent: Option<SendCompletion>,
}

struct Peer {
    id: u64,
    tx: Sender<Outbound>,
    stream: TcpStream,
}

struct LinkState {
    config: TcpConfig,
    bus: InProcessBus,
    /// Local subscription reference counts per topic
    local_topics: Mutex<HashMap<String, usize>>,
    /// Topics the peer subscribed to
    remote_topics: RwLock<HashSet<String>>,
    peer: Mutex<Option<Peer>>,
    next_peer: AtomicU64,
    closed: AtomicBool,
}

impl LinkState {
    fn remote_interested(&self, topic: &str) -> bool {
        self.remote_topics.read().contains(topic)
    }

    /// Queue a frame for the current peer.
    ///
    /// Without a peer the frame is dropped and the body handed straight back.
    fn send_to_peer(
        &self,
        header: &FrameHeader,
        body: Option<Bytes>,
        on_sent: Option<SendCompletion>,
    ) -> Result<(), TransportError> {
        let header = bincode::serialize(header)?;
        let outbound = Outbound {
            header,
            body,
            on_sent,
        };
        let rejected = match self.peer.lock().as_ref() {
            Some(peer) => peer.tx.send(outbound).err().map(|e| e.into_inner()),
            None => Some(outbound),
        };
        if let Some(Outbound {
            body: Some(body),
            on_sent: Some(on_sent),
            ..
        }) = rejected
        {
            on_sent(body);
        }
        Ok(())
    }

    fn announce(&self, topic: &str) {
        let header = FrameHeader::Subscribe {
            topic: topic.to_string(),
        };
        if let Err(e) = self.send_to_peer(&header, None, None) {
            warn!(topic, "Failed to announce subscription: {}", e);
        }
    }

    fn retain_local_topic(&self, topic: &str) {
        let mut topics = self.local_topics.lock();
        let count = topics.entry(topic.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            self.announce(topic);
        }
    }

    fn release_local_topic(&self, topic: &str) {
        let mut topics = self.local_topics.lock();
        let Some(count) = topics.get_mut(topic) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            topics.remove(topic);
            let header = FrameHeader::Unsubscribe {
                topic: topic.to_string(),
            };
            if let Err(e) = self.send_to_peer(&header, None, None) {
                debug!(topic, "Failed to withdraw subscription: {}", e);
            }
        }
    }

    fn handle_frame(&self, header: FrameHeader, body: Bytes) {
        match header {
            FrameHeader::Subscribe { topic } => {
                debug!(topic = %topic, "Peer subscribed");
                self.remote_topics.write().insert(topic);
            }
            FrameHeader::Unsubscribe { topic } => {
                debug!(topic = %topic, "Peer unsubscribed");
                self.remote_topics.write().remove(&topic);
            }
            FrameHeader::Publish { topic, .. } => {
                if let Err(e) = self.bus.inject(&topic, body) {
                    warn!(topic = %topic, "Dropping inbound message: {}", e);
                }
            }
        }
    }

    /// Make `stream` the current peer, replacing any previous one
    fn install_peer(self: &Arc<Self>, stream: TcpStream) -> Result<(), TransportError> {
        let remote = stream.peer_addr()?;
        configure_socket(&stream, self.config.buffer_size);
        let read_stream = stream.try_clone()?;
        let write_stream = stream.try_clone()?;

        let local_topics = self.local_topics.lock();
        let mut peer = self.peer.lock();
        if let Some(old) = peer.take() {
            info!("Replacing peer connection {}", old.id);
            let _ = old.stream.shutdown(Shutdown::Both);
        }
        self.remote_topics.write().clear();

        let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = channel::unbounded();
        std::thread::Builder::new()
            .name(format!("tcp-write-{}", id))
            .spawn(move || write_loop(write_stream, &rx))?;
        let reader_state = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("tcp-read-{}", id))
            .spawn(move || read_loop(&reader_state, read_stream, id))?;

        for topic in local_topics.keys() {
            let header = bincode::serialize(&FrameHeader::Subscribe {
                topic: topic.clone(),
            })?;
            let _ = tx.send(Outbound {
                header,
                body: None,
                on_sent: None,
            });
        }
        *peer = Some(Peer { id, tx, stream });
        info!("Peer {} connected ({})", id, remote);
        Ok(())
    }

    fn drop_peer(&self, id: u64) {
        let mut peer = self.peer.lock();
        if peer.as_ref().map_or(false, |p| p.id == id) {
            if let Some(old) = peer.take() {
                let _ = old.stream.shutdown(Shutdown::Both);
            }
            self.remote_topics.write().clear();
            info!("Peer {} disconnected", id);
        }
    }

    fn has_peer(&self) -> bool {
        self.peer.lock().is_some()
    }
}

fn configure_socket(stream: &TcpStream, buffer_size: usize) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
    let sock = SockRef::from(stream);
    if let Err(e) = sock.set_send_buffer_size(buffer_size) {
        warn!("Failed to set send buffer size to {}: {}", buffer_size, e);
    }
    if let Err(e) = sock.set_recv_buffer_size(buffer_size) {
        warn!("Failed to set receive buffer size to {}: {}", buffer_size, e);
    }
}

fn write_frame<W: Write>(writer: &mut W, header: &[u8], body: Option<&[u8]>) -> std::io::Result<()> {
    writer.write_all(&(header.len() as u32).to_le_bytes())?;
    writer.write_all(header)?;
    if let Some(body) = body {
        writer.write_all(body)?;
    }
    writer.flush()
}

fn read_frame<R: Read>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<(FrameHeader, Bytes), TransportError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    if header_len > max_frame_size {
        return Err(TransportError::Io(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("frame header too large: {} bytes", header_len),
        )));
    }

    let mut header_bytes = vec![0u8; header_len];
    reader.read_exact(&mut header_bytes)?;
    let header: FrameHeader = bincode::deserialize(&header_bytes)?;

    let body = match &header {
        FrameHeader::Publish { body_len, .. } => {
            let body_len = *body_len as usize;
            if body_len > max_frame_size {
                return Err(TransportError::Io(std::io::Error::new(
                    ErrorKind::InvalidData,
                    format!("message too large: {} bytes", body_len),
                )));
            }
            let mut body = vec![0u8; body_len];
            reader.read_exact(&mut body)?;
            Bytes::from(body)
        }
        _ => Bytes::new(),
    };
    Ok((header, body))
}

fn write_loop(stream: TcpStream, rx: &Receiver<Outbound>) {
    let mut writer = BufWriter::new(stream);
    while let Ok(outbound) = rx.recv() {
        let result = write_frame(&mut writer, &outbound.header, outbound.body.as_deref());
        if let (Some(body), Some(on_sent)) = (outbound.body, outbound.on_sent) {
            on_sent(body);
        }
        if let Err(e) = result {
            debug!("TCP writer stopping: {}", e);
            break;
        }
    }
    // Hand back buffers still queued so no publisher waits on them
    while let Ok(outbound) = rx.try_recv() {
        if let (Some(body), Some(on_sent)) = (outbound.body, outbound.on_sent) {
            on_sent(body);
        }
    }
}

fn read_loop(state: &Arc<LinkState>, stream: TcpStream, id: u64) {
    let mut reader = BufReader::new(stream);
    loop {
        match read_frame(&mut reader, state.config.max_frame_size) {
            Ok((header, body)) => state.handle_frame(header, body),
            Err(TransportError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                debug!("Peer {} closed the connection", id);
                break;
            }
            Err(e) => {
                if !state.closed.load(Ordering::SeqCst) {
                    warn!("Peer {} read error: {}", id, e);
                }
                break;
            }
        }
    }
    state.drop_peer(id);
}

fn accept_loop(state: &Arc<LinkState>, listener: &TcpListener) {
    while !state.closed.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = stream
                    .set_nonblocking(false)
                    .map_err(TransportError::from)
                    .and_then(|()| state.install_peer(stream))
                {
                    warn!("Failed to accept peer: {}", e);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(IDLE_POLL),
            Err(e) => {
                warn!("Accept failed: {}", e);
                std::thread::sleep(IDLE_POLL);
            }
        }
    }
}

fn connect_loop(state: &Arc<LinkState>) {
    let address = state.config.address;
    while !state.closed.load(Ordering::SeqCst) {
        if state.has_peer() {
            std::thread::sleep(IDLE_POLL);
            continue;
        }
        match TcpStream::connect_timeout(&address, state.config.retry_interval) {
            Ok(stream) => {
                if let Err(e) = state.install_peer(stream) {
                    warn!("Failed to set up connection to {}: {}", address, e);
                }
            }
            Err(e) => {
                trace!("Peer at {} not reachable yet: {}", address, e);
                std::thread::sleep(state.config.retry_interval);
            }
        }
    }
}

/// Publish/subscribe over a single TCP peer link
pub struct TcpTransport {
    state: Arc<LinkState>,
    local_addr: Option<SocketAddr>,
    link_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Bind or start connecting according to `config.mode`.
    ///
    /// Binding errors are returned immediately; an unreachable peer is not an
    /// error, the link keeps retrying in the background.
    pub fn start(config: TcpConfig) -> Result<Self, TransportError> {
        let mode = config.mode;
        let address = config.address;
        let state = Arc::new(LinkState {
            config,
            bus: InProcessBus::new()?,
            local_topics: Mutex::new(HashMap::new()),
            remote_topics: RwLock::new(HashSet::new()),
            peer: Mutex::new(None),
            next_peer: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        let (local_addr, link_thread) = match mode {
            LinkMode::Listen => {
                let listener = TcpListener::bind(address)
                    .map_err(|e| TransportError::Connect(format!("bind {}: {}", address, e)))?;
                listener.set_nonblocking(true)?;
                let local_addr = listener.local_addr()?;
                info!("Listening for a peer on {}", local_addr);
                let thread_state = Arc::clone(&state);
                let handle = std::thread::Builder::new()
                    .name("tcp-accept".to_string())
                    .spawn(move || accept_loop(&thread_state, &listener))?;
                (Some(local_addr), handle)
            }
            LinkMode::Connect => {
                info!("Connecting to peer at {}", address);
                let thread_state = Arc::clone(&state);
                let handle = std::thread::Builder::new()
                    .name("tcp-connect".to_string())
                    .spawn(move || connect_loop(&thread_state))?;
                (None, handle)
            }
        };

        Ok(Self {
            state,
            local_addr,
            link_thread: Mutex::new(Some(link_thread)),
        })
    }

    /// Address the listener is bound to (listen mode only)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Whether a peer is currently connected
    pub fn is_connected(&self) -> bool {
        self.state.has_peer()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.state.closed.store(true, Ordering::SeqCst);
        if let Some(peer) = self.state.peer.lock().take() {
            let _ = peer.stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.link_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn advertise(&self, topic: &str) -> Result<Arc<dyn Publisher>, TransportError> {
        if topic.is_empty() {
            return Err(TransportError::Advertise(
                topic.to_string(),
                "empty topic".to_string(),
            ));
        }
        Ok(Arc::new(TcpPublisher {
            local: self.state.bus.local_publisher(topic),
            state: Arc::clone(&self.state),
        }))
    }

    fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        if topic.is_empty() {
            return Err(TransportError::Subscribe(
                topic.to_string(),
                "empty topic".to_string(),
            ));
        }
        let inner = self.state.bus.local_subscribe(topic, handler);
        self.state.retain_local_topic(topic);
        Ok(Box::new(TcpSubscription {
            inner,
            state: Arc::clone(&self.state),
        }))
    }

    fn kick_discovery(&self) {
        let topics: Vec<String> = self.state.local_topics.lock().keys().cloned().collect();
        for topic in topics {
            self.state.announce(&topic);
        }
    }
}

struct TcpPublisher {
    local: InProcessPublisher,
    state: Arc<LinkState>,
}

impl TcpPublisher {
    fn send(&self, payload: Bytes, on_sent: Option<SendCompletion>) -> Result<(), TransportError> {
        let topic = self.local.topic();
        if !self.state.remote_interested(topic) {
            return match on_sent {
                Some(on_sent) => self.local.publish_with_completion(payload, on_sent),
                None => self.local.publish(payload),
            };
        }

        if self.local.connection_count() > 0 {
            self.local.publish(payload.clone())?;
        }
        let header = FrameHeader::Publish {
            topic: topic.to_string(),
            body_len: payload.len() as u64,
        };
        self.state
            .send_to_peer(&header, Some(payload), on_sent)
            .map_err(|e| TransportError::Publish(topic.to_string(), e.to_string()))
    }
}

impl Publisher for TcpPublisher {
    fn topic(&self) -> &str {
        self.local.topic()
    }

    fn publish(&self, payload: Bytes) -> Result<(), TransportError> {
        self.send(payload, None)
    }

    fn publish_with_completion(
        &self,
        payload: Bytes,
        on_sent: SendCompletion,
    ) -> Result<(), TransportError> {
        self.send(payload, Some(on_sent))
    }

    fn connection_count(&self) -> usize {
        let topic = self.local.topic();
        self.state.bus.local_connections(topic) + usize::from(self.state.remote_interested(topic))
    }
}

struct TcpSubscription {
    inner: InProcessSubscription,
    state: Arc<LinkState>,
}

impl Subscription for TcpSubscription {
    fn topic(&self) -> &str {
        self.inner.topic()
    }
}

impl Drop for TcpSubscription {
    fn drop(&mut self) {
        self.state.release_local_topic(self.inner.topic());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Instant;

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn test_frame_codec() {
        let header = bincode::serialize(&FrameHeader::Publish {
            topic: "/t".to_string(),
            body_len: 3,
        })
        .unwrap();
        let mut buf = Vec::new();
        write_frame(&mut buf, &header, Some(b"abc")).unwrap();

        let (decoded, body) = read_frame(&mut Cursor::new(buf), 1024).unwrap();
        assert_eq!(
            decoded,
            FrameHeader::Publish {
                topic: "/t".to_string(),
                body_len: 3
            }
        );
        assert_eq!(&body[..], b"abc");
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let header = bincode::serialize(&FrameHeader::Publish {
            topic: "/t".to_string(),
            body_len: 4096,
        })
        .unwrap();
        let mut buf = Vec::new();
        write_frame(&mut buf, &header, None).unwrap();
        assert!(read_frame(&mut Cursor::new(buf), 1024).is_err());
    }

    #[test]
    fn test_remote_subscription_and_delivery() {
        let listener = TcpTransport::start(TcpConfig {
            address: "127.0.0.1:0".parse().unwrap(),
            mode: LinkMode::Listen,
            ..TcpConfig::default()
        })
        .unwrap();
        let address = listener.local_addr().unwrap();

        let (tx, rx) = channel::bounded(4);
        let _sub = listener
            .subscribe(
                "/echo",
                Arc::new(move |payload: Bytes| {
                    let _ = tx.send(payload);
                }),
            )
            .unwrap();

        let connector = TcpTransport::start(TcpConfig {
            address,
            mode: LinkMode::Connect,
            retry_interval: Duration::from_millis(20),
            ..TcpConfig::default()
        })
        .unwrap();
        let publisher = connector.advertise("/echo").unwrap();
        assert!(wait_until(Duration::from_secs(5), || publisher
            .has_connections()));
        assert!(connector.is_connected());
        assert!(listener.is_connected());

        publisher.publish(Bytes::from_static(b"ping")).unwrap();
        let received = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(&received[..], b"ping");
    }
}

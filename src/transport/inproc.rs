//! In-process publish/subscribe bus.
//!
//! Publishers enqueue messages on a crossbeam channel; a dedicated dispatcher
//! thread delivers each message to the topic's subscribers and then returns
//! the buffer through the completion callback, if any. Handlers therefore
//! always run asynchronously relative to the publishing thread.

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace, warn};

use super::{MessageHandler, Publisher, SendCompletion, Subscription, Transport, TransportError};

/// Subscriber table shared by the bus, its publishers and subscriptions
#[derive(Default)]
pub(crate) struct TopicRegistry {
    subs: RwLock<HashMap<String, Vec<(u64, MessageHandler)>>>,
    next_id: AtomicU64,
}

impl TopicRegistry {
    fn insert(&self, topic: &str, handler: MessageHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs
            .write()
            .entry(topic.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    fn remove(&self, topic: &str, id: u64) {
        let mut subs = self.subs.write();
        if let Some(handlers) = subs.get_mut(topic) {
            handlers.retain(|(hid, _)| *hid != id);
            if handlers.is_empty() {
                subs.remove(topic);
            }
        }
    }

    pub(crate) fn count(&self, topic: &str) -> usize {
        self.subs.read().get(topic).map_or(0, Vec::len)
    }

    /// Snapshot of the handlers so they can run without holding the lock
    fn handlers(&self, topic: &str) -> Vec<MessageHandler> {
        self.subs
            .read()
            .get(topic)
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }
}

enum Dispatch {
    Deliver {
        topic: Arc<str>,
        payload: Bytes,
        on_sent: Option<SendCompletion>,
    },
    Shutdown,
}

/// In-process message bus with a single dispatcher thread
pub struct InProcessBus {
    registry: Arc<TopicRegistry>,
    tx: Sender<Dispatch>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl InProcessBus {
    pub fn new() -> Result<Self, TransportError> {
        let registry = Arc::new(TopicRegistry::default());
        let (tx, rx) = channel::unbounded();
        let worker_registry = Arc::clone(&registry);
        let dispatcher = std::thread::Builder::new()
            .name("inproc-dispatch".to_string())
            .spawn(move || Self::dispatch_loop(&worker_registry, &rx))?;

        Ok(Self {
            registry,
            tx,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    fn dispatch_loop(registry: &TopicRegistry, rx: &Receiver<Dispatch>) {
        while let Ok(dispatch) = rx.recv() {
            match dispatch {
                Dispatch::Deliver {
                    topic,
                    payload,
                    on_sent,
                } => {
                    for handler in registry.handlers(&topic) {
                        handler(payload.clone());
                    }
                    if let Some(on_sent) = on_sent {
                        on_sent(payload);
                    }
                }
                Dispatch::Shutdown => break,
            }
        }
        debug!("In-process dispatcher stopped");
    }

    /// Deliver a message to local subscribers only.
    ///
    /// Used by transports that receive messages from a remote peer and must
    /// not echo them back out.
    pub(crate) fn inject(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        self.tx
            .send(Dispatch::Deliver {
                topic: Arc::from(topic),
                payload,
                on_sent: None,
            })
            .map_err(|_| TransportError::Closed)
    }

    pub(crate) fn local_connections(&self, topic: &str) -> usize {
        self.registry.count(topic)
    }

    /// Concrete publisher, for transports layering on top of the bus
    pub(crate) fn local_publisher(&self, topic: &str) -> InProcessPublisher {
        InProcessPublisher {
            topic: Arc::from(topic),
            registry: Arc::clone(&self.registry),
            tx: self.tx.clone(),
        }
    }

    pub(crate) fn local_subscribe(&self, topic: &str, handler: MessageHandler) -> InProcessSubscription {
        let id = self.registry.insert(topic, handler);
        trace!(topic, id, "Subscribed");
        InProcessSubscription {
            topic: topic.to_string(),
            id,
            registry: Arc::clone(&self.registry),
        }
    }
}

impl Drop for InProcessBus {
    fn drop(&mut self) {
        let _ = self.tx.send(Dispatch::Shutdown);
        if let Some(handle) = self.dispatcher.lock().take() {
            // The last handle may be released from inside a handler
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("In-process dispatcher panicked");
            }
        }
    }
}

impl Transport for InProcessBus {
    fn name(&self) -> &'static str {
        "inproc"
    }

    fn advertise(&self, topic: &str) -> Result<Arc<dyn Publisher>, TransportError> {
        if topic.is_empty() {
            return Err(TransportError::Advertise(
                topic.to_string(),
                "empty topic".to_string(),
            ));
        }
        Ok(Arc::new(self.local_publisher(topic)))
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
        Ok(Box::new(self.local_subscribe(topic, handler)))
    }
}

pub(crate) struct InProcessPublisher {
    topic: Arc<str>,
    registry: Arc<TopicRegistry>,
    tx: Sender<Dispatch>,
}

impl InProcessPublisher {
    fn send(&self, payload: Bytes, on_sent: Option<SendCompletion>) -> Result<(), TransportError> {
        self.tx
            .send(Dispatch::Deliver {
                topic: Arc::clone(&self.topic),
                payload,
                on_sent,
            })
            .map_err(|_| TransportError::Publish(self.topic.to_string(), "bus closed".to_string()))
    }
}

impl Publisher for InProcessPublisher {
    fn topic(&self) -> &str {
        &self.topic
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
        self.registry.count(&self.topic)
    }
}

pub(crate) struct InProcessSubscription {
    topic: String,
    id: u64,
    registry: Arc<TopicRegistry>,
}

impl Subscription for InProcessSubscription {
    fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for InProcessSubscription {
    fn drop(&mut self) {
        self.registry.remove(&self.topic, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;
    use std::time::Duration;

    #[test]
    fn test_pub_sub_delivery() {
        let bus = InProcessBus::new().unwrap();
        let (tx, rx) = bounded(4);
        let _sub = bus
            .subscribe(
                "k1",
                Arc::new(move |payload: Bytes| {
                    let _ = tx.send(payload);
                }),
            )
            .unwrap();

        let publisher = bus.advertise("k1").unwrap();
        assert_eq!(publisher.connection_count(), 1);
        publisher.publish(Bytes::from_static(b"hello")).unwrap();

        let received = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(&received[..], b"hello");
    }

    #[test]
    fn test_topics_are_isolated() {
        let bus = InProcessBus::new().unwrap();
        let (tx, rx) = bounded(4);
        let _sub = bus
            .subscribe(
                "a",
                Arc::new(move |payload: Bytes| {
                    let _ = tx.send(payload);
                }),
            )
            .unwrap();

        let other = bus.advertise("b").unwrap();
        assert!(!other.has_connections());
        other.publish(Bytes::from_static(b"x")).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_completion_returns_buffer_after_delivery() {
        let bus = InProcessBus::new().unwrap();
        let (done_tx, done_rx) = bounded(1);
        let publisher = bus.advertise("k").unwrap();
        publisher
            .publish_with_completion(
                Bytes::from_static(b"buf"),
                Box::new(move |payload| {
                    let _ = done_tx.send(payload);
                }),
            )
            .unwrap();
        let returned = done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(&returned[..], b"buf");
    }

    #[test]
    fn test_drop_subscription_stops_delivery() {
        let bus = InProcessBus::new().unwrap();
        let sub = bus.subscribe("k", Arc::new(|_payload: Bytes| {})).unwrap();
        let publisher = bus.advertise("k").unwrap();
        assert!(publisher.has_connections());
        drop(sub);
        assert_eq!(publisher.connection_count(), 0);
    }

    #[test]
    fn test_empty_topic_rejected() {
        let bus = InProcessBus::new().unwrap();
        assert!(bus.advertise("").is_err());
        assert!(bus.subscribe("", Arc::new(|_payload: Bytes| {})).is_err());
    }
}

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

pub mod inproc;
pub mod tcp;

pub use crate::error::TransportError;
pub use inproc::InProcessBus;
pub use tcp::{LinkMode, TcpConfig, TcpTransport};

use crate::cli::{Role, TransportKind};

/// Callback invoked by the transport for every message on a subscribed topic
///
/// Runs on a transport-owned thread, never on the publisher's thread.
pub type MessageHandler = Arc<dyn Fn(Bytes) + Send + Sync + 'static>;

/// Callback that hands a published buffer back once the transport is done
/// with it
pub type SendCompletion = Box<dyn FnOnce(Bytes) + Send + 'static>;

/// Publish/subscribe messaging substrate
pub trait Transport: Send + Sync {
    /// Get transport name for identification
    fn name(&self) -> &'static str;

    /// Declare a publisher for a topic
    fn advertise(&self, topic: &str) -> Result<Arc<dyn Publisher>, TransportError>;

    /// Register a handler for a topic.
    ///
    /// Delivery stops when the returned subscription is dropped.
    fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscription>, TransportError>;

    /// Nudge peer discovery so remote endpoints learn about local
    /// subscriptions promptly
    fn kick_discovery(&self) {}
}

/// Publishing endpoint for one topic
pub trait Publisher: Send + Sync {
    fn topic(&self) -> &str;

    /// Publish without waiting for delivery
    fn publish(&self, payload: Bytes) -> Result<(), TransportError>;

    /// Publish and hand the buffer back through `on_sent` once the transport
    /// no longer needs it.
    ///
    /// `on_sent` is not called if this returns an error.
    fn publish_with_completion(
        &self,
        payload: Bytes,
        on_sent: SendCompletion,
    ) -> Result<(), TransportError>;

    /// Number of subscribers currently reachable from this publisher
    fn connection_count(&self) -> usize;

    fn has_connections(&self) -> bool {
        self.connection_count() > 0
    }
}

/// Live subscription; dropping it unsubscribes
pub trait Subscription: Send + Sync {
    fn topic(&self) -> &str;
}

/// Transport factory for creating transport instances
pub struct TransportFactory;

impl TransportFactory {
    /// Create a transport for the given kind and role.
    ///
    /// For TCP the relay side listens and the publishing side connects; a
    /// co-located run listens so that an external relay or driver may still
    /// attach.
    pub fn create(
        kind: TransportKind,
        role: Role,
        address: SocketAddr,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        match kind {
            TransportKind::InProcess => {
                if role != Role::CoLocated {
                    return Err(TransportError::Connect(format!(
                        "the in-process bus cannot reach a peer process ({} role)",
                        role
                    )));
                }
                Ok(Arc::new(InProcessBus::new()?))
            }
            TransportKind::Tcp => {
                let mode = match role {
                    Role::DriverOnly => LinkMode::Connect,
                    Role::RelayOnly | Role::CoLocated => LinkMode::Listen,
                };
                let config = TcpConfig {
                    address,
                    mode,
                    ..TcpConfig::default()
                };
                Ok(Arc::new(TcpTransport::start(config)?))
            }
        }
    }
}

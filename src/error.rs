use thiserror::Error;

/// Errors raised by a messaging substrate
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("advertise [{0}]: {1}")]
    Advertise(String, String),
    #[error("subscribe [{0}]: {1}")]
    Subscribe(String, String),
    #[error("publish [{0}]: {1}")]
    Publish(String, String),
    #[error("connect: {0}")]
    Connect(String),
    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport closed")]
    Closed,
}

/// Errors surfaced by the benchmark roles and the run controller
#[derive(Error, Debug)]
pub enum BenchError {
    /// Advertising or subscribing a channel was rejected by the transport.
    ///
    /// Never retried: it indicates a transport-level misconfiguration.
    #[error("error setting up topic [{topic}]")]
    Setup {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("payload serialization: {0}")]
    Payload(#[from] bincode::Error),

    #[error("report output: {0}")]
    Report(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BenchError {
    pub(crate) fn setup(topic: &str, source: TransportError) -> Self {
        Self::Setup {
            topic: topic.to_string(),
            source,
        }
    }
}

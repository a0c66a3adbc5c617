use thiserror::Error;

use crate::ClientId;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// A delivery or acknowledgment targeted a client with no registered connection.
    #[error("no connection registered for client {0:?}")]
    MissingConnection(ClientId),

    /// The subscription registry referenced clients that are neither connected
    /// nor owners of a persistent session.
    #[error("subscription registry out of sync, no connection or session for {0:?}")]
    Desynchronized(Vec<ClientId>),

    #[error("invalid QoS level {0}")]
    InvalidQoS(u8),

    #[error("invalid topic {0:?}")]
    InvalidTopic(String),

    #[error("publish on {0:?} with QoS > 0 carries no packet identifier")]
    MissingPacketId(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Metrics(#[from] prometheus::Error),
}

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;

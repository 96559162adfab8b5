//! Error types of the hub
//!
//! Transport failures stay contained per broker, management failures are
//! returned to the caller, message failures are isolated per message.

use crate::mqtt::topic::{BrokerId, DeviceId, TopicKind};
use thiserror::Error;

/// Failure reported by the underlying MQTT transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// The client refused to queue a request (request channel full or closed)
    #[error("request rejected: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// The network session failed or was refused by the broker
    #[error("connection failed: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    /// Broker answered the handshake with a non-success code
    #[error("connection refused by broker: {0}")]
    Refused(String),

    #[error("transport failure: {0}")]
    Failure(String),
}

/// Failure inside a message handler
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("payload could not be decoded: {0}")]
    Decode(String),

    #[error("event sink closed")]
    SinkClosed,

    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Invalid hub configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("broker id {0} configured twice")]
    DuplicateBroker(BrokerId),

    #[error("broker {0}: host must not be empty")]
    EmptyHost(BrokerId),

    #[error("broker {0}: port must not be zero")]
    ZeroPort(BrokerId),

    #[error("broker {0}: username and password must be given together")]
    PartialCredentials(BrokerId),

    #[error("invalid reconnect settings: {0}")]
    Reconnect(String),

    #[error("no config directory available on this platform")]
    NoConfigDir,
}

/// Errors surfaced by the hub to its callers
#[derive(Debug, Error)]
pub enum HubError {
    /// A connect attempt failed; retried with backoff
    #[error("broker {broker} unreachable: {source}")]
    BrokerUnreachable {
        broker: BrokerId,
        #[source]
        source: TransportError,
    },

    /// Publish attempted while the broker connection is down
    #[error("broker {0} is not connected")]
    NotConnected(BrokerId),

    #[error("unknown broker {0}")]
    UnknownBroker(BrokerId),

    #[error("device {device} is not tracked on broker {broker}")]
    UnknownDevice { broker: BrokerId, device: DeviceId },

    #[error("no route for topic '{0}'")]
    UnroutableTopic(String),

    #[error("{kind} handler failed for device {device}: {source}")]
    HandlerFailure {
        kind: TopicKind,
        device: DeviceId,
        #[source]
        source: HandlerError,
    },

    /// A per-device topic was requested without a device
    #[error("{0} topics need a device id")]
    MissingDevice(TopicKind),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// The broker worker stopped before answering
    #[error("worker for broker {0} is gone")]
    WorkerGone(BrokerId),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

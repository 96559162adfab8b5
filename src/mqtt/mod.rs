//! # MQTT connection layer
//!
//! ```text
//! mqtt/
//! ├── topic.rs       - Topic layout and parsing
//! ├── config.rs      - Per-broker and reconnect settings
//! ├── transport.rs   - Transport seam and the rumqttc implementation
//! ├── memory.rs      - Scripted in-memory transport for tests
//! ├── connection.rs  - One broker session and its device set
//! ├── router.rs      - Inbound topic to handler dispatch
//! └── backoff.rs     - Reconnect delay schedule
//! ```
//!
//! A [`connection::BrokerConnection`] never touches the network on its own:
//! it is driven by a worker which polls it and feeds inbound messages to the
//! [`router::MessageRouter`].

pub mod backoff;
pub mod config;
pub mod connection;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod router;
pub mod topic;
pub mod transport;

pub use config::{BrokerConfig, ReconnectConfig};
pub use connection::{BrokerConnection, BrokerStatus, ConnectionState};
pub use topic::{BrokerId, DeviceId, TopicKind};

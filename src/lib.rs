//! Connection manager linking a server to IoT device communities over
//! several MQTT brokers.

pub mod config;
pub mod console;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod mqtt;

pub use config::HubConfig;
pub use error::HubError;
pub use hub::ConnectionManager;

//! # Multi-broker hub
//!
//! Every configured broker gets its own worker task. The
//! [`ConnectionManager`] keeps the handles and turns application calls into
//! commands for the right worker.
//!
//! ```text
//!                      ┌──► BrokerWorker(1) ──► BrokerConnection ──► broker 1
//! ConnectionManager ───┼──► BrokerWorker(2) ──► BrokerConnection ──► broker 2
//!   listen / mute      └──► ...
//!   send_action                    │
//!   send_setting                   ▼
//!   status / stop        MessageRouter ──► MessageHandler ──► EventSink
//! ```
//!
//! Workers share nothing but the router, the sink and the cancellation token.

pub mod manager;
pub mod worker;

pub use manager::{ConnectionManager, HubSettings};
pub use worker::{BrokerCommand, BrokerHandle};

//! Connection to one community broker
//!
//! A [`BrokerConnection`] owns the MQTT session of one broker, its
//! [`ConnectionState`] and the set of devices it listens to. The device set
//! survives disconnects: every connect acknowledgement replays it in full, so
//! devices listened while the broker was down are subscribed on the next
//! successful connect.
//!
//! Subscribe, unsubscribe and greet requests go through an ordered outbox.
//! The transport may refuse a request when its queue is full; the outbox then
//! keeps the rest and hands them over on the next network step, so the live
//! subscriptions always converge on the device set.
//!
//! # State Machine
//!
//! ```text
//!               connect()              ConnAck
//! Disconnected ──────────► Connecting ─────────► Connected
//!      ▲                        │                    │
//!      └────────────────────────┴────────────────────┘
//!              poll error / broker DISCONNECT
//! ```

use super::config::BrokerConfig;
use super::topic::{topic_for, BrokerId, DeviceId, TopicKind, DISCOVERY_TOPIC, GREET_TOPIC};
use super::transport::{NetworkEvent, Transport};
use crate::error::HubError;
use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Snapshot of a broker connection, including its reconnect backoff
#[derive(Clone, Debug, Serialize)]
pub struct BrokerStatus {
    pub broker: BrokerId,
    pub name: String,
    pub connection_state: ConnectionState,
    /// A connect was attempted at least once
    pub initialized: bool,
    /// Consecutive failed attempts since the last successful connect
    pub reconnect_attempts: u32,
    /// Remaining wait before the next attempt, while backing off
    pub next_retry_in: Option<Duration>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub devices: Vec<DeviceId>,
    /// Subscription changes not yet accepted by the transport
    pub pending_requests: usize,
    pub last_activity: Option<DateTime<Local>>,
    pub last_error: Option<String>,
}

/// Inbound publish handed to the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Outcome of one step of network progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Handshake completed and the device set was replayed
    Connected,
    /// Broker closed the session
    Disconnected,
    Message(InboundMessage),
    Idle,
}

/// Request waiting for room in the transport queue
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outgoing {
    Subscribe(String),
    Unsubscribe(String),
    Greet,
}

pub struct BrokerConnection<T: Transport> {
    config: BrokerConfig,
    state: ConnectionState,
    devices: BTreeSet<DeviceId>,
    outbox: VecDeque<Outgoing>,
    transport: T,
    discover: bool,
    initialized: bool,
    messages_received: usize,
    messages_sent: usize,
    last_activity: Option<DateTime<Local>>,
    last_error: Option<String>,
}

impl<T: Transport> BrokerConnection<T> {
    /// Creates the connection in `Disconnected`, seeded with the configured devices
    pub fn new(config: BrokerConfig, transport: T, discover: bool) -> Self {
        let devices = config.devices.iter().copied().collect();
        Self {
            config,
            state: ConnectionState::Disconnected,
            devices,
            outbox: VecDeque::new(),
            transport,
            discover,
            initialized: false,
            messages_received: 0,
            messages_sent: 0,
            last_activity: None,
            last_error: None,
        }
    }

    pub fn id(&self) -> BrokerId {
        self.config.id
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_tracked(&self, device: DeviceId) -> bool {
        self.devices.contains(&device)
    }

    pub fn devices(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.devices.iter().copied()
    }

    /// Topics subscribed for one device.
    ///
    /// With discovery on, `+/grt` already covers every greeting, so the
    /// device's own greet topic is left out to avoid duplicate deliveries.
    fn device_topics(&self, device: DeviceId) -> Vec<String> {
        TopicKind::SUBSCRIBED
            .into_iter()
            .filter(|kind| !(self.discover && *kind == TopicKind::SysGreet))
            .map(|kind| topic_for(kind, device))
            .collect()
    }

    /// Starts a handshake. Completion is observed through [`Self::drive_network`].
    pub fn connect(&mut self) {
        info!(broker = %self.config.id, "Connecting to {}", self.config);
        self.initialized = true;
        self.state = ConnectionState::Connecting;
    }

    /// Hands deferred requests to the transport, then polls it once and
    /// applies the resulting transition.
    ///
    /// A poll error moves the connection to `Disconnected` and is returned as
    /// [`HubError::BrokerUnreachable`].
    pub async fn drive_network(&mut self) -> Result<Progress, HubError> {
        if self.state == ConnectionState::Connected {
            self.flush();
        }

        match self.transport.poll().await {
            Ok(NetworkEvent::ConnAck) => {
                self.on_connack();
                Ok(Progress::Connected)
            }
            Ok(NetworkEvent::Message { topic, payload }) => {
                self.messages_received += 1;
                self.last_activity = Some(Local::now());
                Ok(Progress::Message(InboundMessage { topic, payload }))
            }
            Ok(NetworkEvent::Disconnected) => {
                self.on_disconnect();
                Ok(Progress::Disconnected)
            }
            Ok(NetworkEvent::Idle) => Ok(Progress::Idle),
            Err(source) => {
                self.on_disconnect();
                self.last_error = Some(source.to_string());
                Err(HubError::BrokerUnreachable {
                    broker: self.config.id,
                    source,
                })
            }
        }
    }

    /// Handshake acknowledged: subscribe the greeting path, replay every
    /// tracked device and greet all devices so they re-announce themselves.
    ///
    /// Whatever the transport cannot take right now stays queued for the
    /// following network steps.
    pub fn on_connack(&mut self) {
        self.state = ConnectionState::Connected;
        self.last_activity = Some(Local::now());
        info!(
            broker = %self.config.id,
            devices = self.devices.len(),
            "Connected, replaying device subscriptions"
        );

        self.outbox.clear();
        if self.discover {
            self.outbox
                .push_back(Outgoing::Subscribe(DISCOVERY_TOPIC.to_string()));
        }
        let topics: Vec<String> = self
            .devices
            .iter()
            .flat_map(|device| self.device_topics(*device))
            .collect();
        self.outbox
            .extend(topics.into_iter().map(Outgoing::Subscribe));
        self.outbox.push_back(Outgoing::Greet);
        self.flush();
    }

    /// Any loss of the session. The device set is kept for the next replay,
    /// which rebuilds every subscription, so queued requests are dropped.
    pub fn on_disconnect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            warn!(broker = %self.config.id, "Connection lost");
        }
        self.state = ConnectionState::Disconnected;
        self.outbox.clear();
    }

    /// Passes queued requests to the transport in order and stops at the
    /// first one it refuses
    fn flush(&mut self) {
        while let Some(request) = self.outbox.front() {
            let sent = match request {
                Outgoing::Subscribe(topic) => self.transport.subscribe(topic),
                Outgoing::Unsubscribe(topic) => self.transport.unsubscribe(topic),
                Outgoing::Greet => self.transport.publish(GREET_TOPIC, Bytes::new()),
            };
            if let Err(e) = sent {
                debug!(
                    broker = %self.config.id,
                    pending = self.outbox.len(),
                    "Transport busy, deferring requests: {}",
                    e
                );
                return;
            }
            self.outbox.pop_front();
        }
    }

    /// Queues `request` unless it undoes a request still waiting in the outbox
    fn enqueue(&mut self, request: Outgoing, undoes: Outgoing) {
        match self.outbox.iter().position(|queued| *queued == undoes) {
            Some(index) => {
                self.outbox.remove(index);
            }
            None => self.outbox.push_back(request),
        }
    }

    /// Starts listening to a device.
    ///
    /// Returns `false` when the device was already tracked. While not
    /// connected the device is only recorded; the next connect replays it.
    /// Subscriptions the transport cannot take yet are retried on the
    /// following network steps, so the device is tracked either way.
    pub fn listen_device(&mut self, device: DeviceId) -> Result<bool, HubError> {
        if !self.devices.insert(device) {
            debug!(broker = %self.config.id, device = %device, "Already listening");
            return Ok(false);
        }

        if self.state == ConnectionState::Connected {
            for topic in self.device_topics(device) {
                self.enqueue(
                    Outgoing::Subscribe(topic.clone()),
                    Outgoing::Unsubscribe(topic),
                );
            }
            self.flush();
        } else {
            debug!(
                broker = %self.config.id,
                device = %device,
                "Not connected, subscription deferred to next connect"
            );
        }

        info!(broker = %self.config.id, device = %device, "Listening to device");
        Ok(true)
    }

    /// Stops listening to a device. Returns `false` when it was not tracked.
    pub fn mute_device(&mut self, device: DeviceId) -> Result<bool, HubError> {
        if !self.devices.remove(&device) {
            debug!(broker = %self.config.id, device = %device, "Mute of untracked device ignored");
            return Ok(false);
        }

        if self.state == ConnectionState::Connected {
            for topic in self.device_topics(device) {
                self.enqueue(
                    Outgoing::Unsubscribe(topic.clone()),
                    Outgoing::Subscribe(topic),
                );
            }
            self.flush();
        }

        info!(broker = %self.config.id, device = %device, "Muted device");
        Ok(true)
    }

    /// Publishes to the topic of `kind`. Fails with `NotConnected` unless connected.
    pub fn publish(
        &mut self,
        kind: TopicKind,
        device: Option<DeviceId>,
        payload: Bytes,
    ) -> Result<(), HubError> {
        if self.state != ConnectionState::Connected {
            return Err(HubError::NotConnected(self.config.id));
        }

        let topic = match (kind.is_per_device(), device) {
            (false, _) => GREET_TOPIC.to_string(),
            (true, Some(device)) => topic_for(kind, device),
            (true, None) => return Err(HubError::MissingDevice(kind)),
        };

        self.transport.publish(&topic, payload)?;
        self.messages_sent += 1;
        self.last_activity = Some(Local::now());
        debug!(broker = %self.config.id, topic = %topic, "Published");
        Ok(())
    }

    /// Sends a graceful disconnect and drops to `Disconnected`
    pub fn close(&mut self) {
        if self.state == ConnectionState::Connected {
            if let Err(e) = self.transport.disconnect() {
                warn!(broker = %self.config.id, "Disconnect request failed: {}", e);
            }
        }
        self.state = ConnectionState::Disconnected;
        self.outbox.clear();
        info!(broker = %self.config.id, "Connection closed");
    }

    /// Status without the backoff fields, which the driving worker owns
    pub fn status(&self) -> BrokerStatus {
        BrokerStatus {
            broker: self.config.id,
            name: self.config.name.clone(),
            connection_state: self.state,
            initialized: self.initialized,
            reconnect_attempts: 0,
            next_retry_in: None,
            messages_received: self.messages_received,
            messages_sent: self.messages_sent,
            devices: self.devices().collect(),
            pending_requests: self.outbox.len(),
            last_activity: self.last_activity,
            last_error: self.last_error.clone(),
        }
    }
}

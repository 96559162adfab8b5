//! Transport seam between a broker connection and the MQTT client library
//!
//! The connection only sees [`Transport`]: queue subscribe / unsubscribe /
//! publish requests without blocking, and poll the network for the next
//! [`NetworkEvent`]. [`MqttTransport`] backs it with `rumqttc`.

use crate::error::TransportError;
use crate::mqtt::config::BrokerConfig;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, Request,
};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// What a single poll of the network produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// Broker accepted the handshake
    ConnAck,
    /// Inbound publish
    Message { topic: String, payload: Bytes },
    /// Broker closed the session
    Disconnected,
    /// Any other protocol traffic (acks, pings, outgoing notifications)
    Idle,
}

/// Operations a broker connection needs from its MQTT session
pub trait Transport: Send + 'static {
    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Sends a graceful DISCONNECT
    fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Advances network I/O until the next event.
    ///
    /// After an error the next call starts a fresh connection attempt.
    fn poll(&mut self) -> impl Future<Output = Result<NetworkEvent, TransportError>> + Send;
}

/// Settings shared by every broker session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client_id: String,
    pub keep_alive: Duration,
    pub request_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            client_id: "SERVER".to_string(),
            keep_alive: Duration::from_secs(30),
            request_capacity: 100,
        }
    }
}

pub struct MqttTransport {
    client: AsyncClient,
    eventloop: EventLoop,
    qos: QoS,
}

impl MqttTransport {
    /// Builds the session. No network traffic happens until the first poll.
    pub fn new(broker: &BrokerConfig, options: &SessionOptions) -> Self {
        let mut mqtt_options =
            MqttOptions::new(options.client_id.clone(), broker.host.clone(), broker.port);
        mqtt_options.set_keep_alive(options.keep_alive);

        match broker.credentials() {
            Some((user, pw)) => {
                mqtt_options.set_credentials(user, pw);
            }
            None => debug!("Broker {} connects without authentication", broker.id),
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, options.request_capacity);

        Self {
            client,
            eventloop,
            qos: QoS::AtLeastOnce,
        }
    }
}

impl Transport for MqttTransport {
    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client.try_subscribe(topic, self.qos)?;
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client.try_unsubscribe(topic)?;
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, self.qos, false, payload.to_vec())?;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.client.try_disconnect()?;
        Ok(())
    }

    fn poll(&mut self) -> impl Future<Output = Result<NetworkEvent, TransportError>> + Send {
        async move {
            match self.eventloop.poll().await? {
                Event::Incoming(Packet::ConnAck(ack)) => match ack.code {
                    ConnectReturnCode::Success => {
                        drop_stale_subscriptions(&mut self.eventloop.pending);
                        Ok(NetworkEvent::ConnAck)
                    }
                    code => Err(TransportError::Refused(format!("{:?}", code))),
                },
                Event::Incoming(Packet::Publish(publish)) => Ok(NetworkEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload,
                }),
                Event::Incoming(Packet::Disconnect) => Ok(NetworkEvent::Disconnected),
                _ => Ok(NetworkEvent::Idle),
            }
        }
    }
}

/// Removes subscription changes carried over from the previous session.
///
/// The connection replays its whole device set after every connect, so
/// resending old (un)subscribes would undo mutes made while the broker was
/// down. Publishes are kept.
fn drop_stale_subscriptions(pending: &mut VecDeque<Request>) {
    let before = pending.len();
    pending.retain(|request| !matches!(request, Request::Subscribe(_) | Request::Unsubscribe(_)));
    if pending.len() != before {
        debug!(
            dropped = before - pending.len(),
            "Dropped subscription requests from the previous session"
        );
    }
}

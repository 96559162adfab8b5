use super::worker::BrokerHandle;
use crate::config::HubConfig;
use crate::error::HubError;
use crate::handlers::{
    ActionCommand, EventSink, MessageHandler, RouterStats, RouterStatsSnapshot, SettingChange,
    SinkHandler,
};
use crate::mqtt::config::{BrokerConfig, ReconnectConfig};
use crate::mqtt::connection::{BrokerConnection, BrokerStatus};
use crate::mqtt::router::MessageRouter;
use crate::mqtt::topic::{BrokerId, DeviceId, TopicKind};
use crate::mqtt::transport::{MqttTransport, SessionOptions, Transport};
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runtime settings applied to every broker worker
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub session: SessionOptions,
    pub reconnect: ReconnectConfig,
    pub command_capacity: usize,
    pub discover_devices: bool,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from(&HubConfig::default())
    }
}

impl From<&HubConfig> for HubSettings {
    fn from(config: &HubConfig) -> Self {
        Self {
            session: SessionOptions {
                client_id: config.client_id.clone(),
                keep_alive: Duration::from_secs(config.keep_alive_secs),
                request_capacity: config.request_capacity,
            },
            reconnect: config.reconnect.clone(),
            command_capacity: config.command_capacity,
            discover_devices: config.discover_devices,
        }
    }
}

/// Owns one worker per configured broker and fronts them to the application.
///
/// A failing broker never affects the others: each worker retries on its own
/// schedule while the rest keep serving.
pub struct ConnectionManager {
    brokers: BTreeMap<BrokerId, BrokerHandle>,
    cancel: CancellationToken,
    stats: Arc<RouterStats>,
}

impl ConnectionManager {
    /// Connects to every broker of `config` over MQTT, forwarding device
    /// messages to `sink`
    pub fn start(config: &HubConfig, sink: EventSink) -> Self {
        let settings = HubSettings::from(config);
        let handler = Arc::new(SinkHandler::new(sink.clone()));
        Self::start_with(&config.brokers, &settings, handler, sink, |broker| {
            MqttTransport::new(broker, &settings.session)
        })
    }

    /// Starts a worker per broker on the transport built by `make_transport`.
    ///
    /// Must be called from within a tokio runtime. Brokers that cannot be
    /// reached are recorded as initialized but not connected and retried in
    /// the background.
    pub fn start_with<T, F>(
        brokers: &[BrokerConfig],
        settings: &HubSettings,
        handler: Arc<dyn MessageHandler>,
        sink: EventSink,
        mut make_transport: F,
    ) -> Self
    where
        T: Transport,
        F: FnMut(&BrokerConfig) -> T,
    {
        let cancel = CancellationToken::new();
        let stats = sink.stats().clone();
        let router = MessageRouter::new(handler, stats.clone());
        let mut handles = BTreeMap::new();

        for broker in brokers {
            if handles.contains_key(&broker.id) {
                warn!("Skipping duplicate {}", broker);
                continue;
            }
            info!("Starting {}", broker);
            let transport = make_transport(broker);
            let connection =
                BrokerConnection::new(broker.clone(), transport, settings.discover_devices);
            let handle = BrokerHandle::spawn(
                connection,
                router.clone(),
                sink.clone(),
                settings.reconnect.clone(),
                settings.command_capacity,
                cancel.child_token(),
            );
            handles.insert(broker.id, handle);
        }

        info!("Connection manager started with {} brokers", handles.len());
        Self {
            brokers: handles,
            cancel,
            stats,
        }
    }

    fn broker(&self, broker: BrokerId) -> Result<&BrokerHandle, HubError> {
        self.brokers
            .get(&broker)
            .ok_or(HubError::UnknownBroker(broker))
    }

    pub fn broker_ids(&self) -> Vec<BrokerId> {
        self.brokers.keys().copied().collect()
    }

    /// Tracks `device` on `broker`. Returns `false` if it already was.
    ///
    /// While disconnected only the device set changes; the subscription is
    /// made on the next connect.
    pub async fn listen(&self, broker: BrokerId, device: DeviceId) -> Result<bool, HubError> {
        self.broker(broker)?.listen(device).await
    }

    /// Stops tracking `device` on `broker`. Returns `false` if it was not tracked.
    pub async fn mute(&self, broker: BrokerId, device: DeviceId) -> Result<bool, HubError> {
        self.broker(broker)?.mute(device).await
    }

    /// Sends an actuator instruction to a tracked device
    pub async fn send_action(
        &self,
        broker: BrokerId,
        device: DeviceId,
        action: &ActionCommand,
    ) -> Result<(), HubError> {
        self.send_json(broker, TopicKind::Action, device, action)
            .await
    }

    /// Changes a setting on a tracked device
    pub async fn send_setting(
        &self,
        broker: BrokerId,
        device: DeviceId,
        change: &SettingChange,
    ) -> Result<(), HubError> {
        self.send_json(broker, TopicKind::Setting, device, change)
            .await
    }

    async fn send_json<P: Serialize>(
        &self,
        broker: BrokerId,
        kind: TopicKind,
        device: DeviceId,
        payload: &P,
    ) -> Result<(), HubError> {
        let handle = self.broker(broker)?;
        let payload = Bytes::from(serde_json::to_vec(payload)?);
        handle.publish(kind, Some(device), payload, true).await
    }

    /// Publishes a raw payload on the topic of `kind`.
    ///
    /// `device` is ignored for the broadcast greeting and required otherwise.
    pub async fn publish(
        &self,
        broker: BrokerId,
        kind: TopicKind,
        device: Option<DeviceId>,
        payload: Bytes,
    ) -> Result<(), HubError> {
        self.broker(broker)?
            .publish(kind, device, payload, false)
            .await
    }

    /// Asks every device on `broker` to greet again
    pub async fn greet(&self, broker: BrokerId) -> Result<(), HubError> {
        self.publish(broker, TopicKind::Greet, None, Bytes::new())
            .await
    }

    pub fn status(&self, broker: BrokerId) -> Result<BrokerStatus, HubError> {
        Ok(self.broker(broker)?.status())
    }

    /// Status of every broker, ordered by broker id
    pub fn statuses(&self) -> Vec<BrokerStatus> {
        self.brokers.values().map(BrokerHandle::status).collect()
    }

    pub fn watch_status(&self, broker: BrokerId) -> Result<watch::Receiver<BrokerStatus>, HubError> {
        Ok(self.broker(broker)?.watch_status())
    }

    pub fn router_stats(&self) -> RouterStatsSnapshot {
        self.stats.snapshot()
    }

    /// Disconnects every broker and waits for all workers to finish
    pub async fn stop(mut self) {
        info!("Stopping connection manager");
        self.cancel.cancel();
        for handle in self.brokers.values_mut() {
            handle.join().await;
        }
        info!("Connection manager stopped");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::memory::{memory_transport, MemoryTransport};

    #[test]
    fn settings_follow_config() {
        let config = HubConfig {
            client_id: "hub-7".to_string(),
            keep_alive_secs: 12,
            discover_devices: false,
            ..HubConfig::default()
        };
        let settings = HubSettings::from(&config);
        assert_eq!(settings.session.client_id, "hub-7");
        assert_eq!(settings.session.keep_alive, Duration::from_secs(12));
        assert!(!settings.discover_devices);
        assert_eq!(settings.command_capacity, config.command_capacity);
    }

    #[tokio::test]
    async fn empty_hub_starts_and_stops() {
        let (sink, _events) = EventSink::channel(8, Arc::new(RouterStats::default()));
        let manager = ConnectionManager::start(&HubConfig::default(), sink);

        assert!(manager.broker_ids().is_empty());
        assert!(manager.statuses().is_empty());
        manager.stop().await;
    }

    #[tokio::test]
    async fn duplicate_and_unknown_brokers() {
        let (sink, _events) = EventSink::channel(8, Arc::new(RouterStats::default()));
        let handler = Arc::new(SinkHandler::new(sink.clone()));
        let brokers = vec![
            BrokerConfig::new(1, "north", "localhost", 1883),
            BrokerConfig::new(1, "north again", "localhost", 1884),
        ];
        let manager = ConnectionManager::start_with(
            &brokers,
            &HubSettings::default(),
            handler,
            sink,
            |_| -> MemoryTransport { memory_transport().0 },
        );

        assert_eq!(manager.broker_ids(), vec![BrokerId(1)]);
        assert_eq!(manager.status(BrokerId(1)).unwrap().name, "north");
        let device = DeviceId::new(1).unwrap();
        assert!(matches!(
            manager.mute(BrokerId(2), device).await,
            Err(HubError::UnknownBroker(BrokerId(2)))
        ));
        manager.stop().await;
    }
}

//! End-to-end behavior of the connection manager over in-memory transports

use aquahub::handlers::{
    ActionCommand, DeviceEvent, EventSink, HubEvent, RouterStats, SettingChange, SinkHandler,
};
use aquahub::hub::{ConnectionManager, HubSettings};
use aquahub::mqtt::memory::{memory_transport, MemoryRemote, MemoryTransport, Request};
use aquahub::mqtt::transport::NetworkEvent;
use aquahub::mqtt::{
    BrokerConfig, BrokerId, BrokerStatus, ConnectionState, DeviceId, ReconnectConfig, TopicKind,
};
use aquahub::HubError;
use bytes::Bytes;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const B1: BrokerId = BrokerId(1);
const B2: BrokerId = BrokerId(2);

fn dev(id: u32) -> DeviceId {
    DeviceId::new(id).unwrap()
}

fn settings() -> HubSettings {
    HubSettings {
        reconnect: ReconnectConfig {
            jitter: 0.0,
            ..ReconnectConfig::default()
        },
        ..HubSettings::default()
    }
}

struct Hub {
    manager: ConnectionManager,
    remotes: HashMap<BrokerId, MemoryRemote>,
    events: mpsc::Receiver<HubEvent>,
}

impl Hub {
    /// Starts the manager; `script` runs before the workers poll for the first time
    fn start(brokers: Vec<BrokerConfig>, script: impl FnOnce(&HashMap<BrokerId, MemoryRemote>)) -> Self {
        let mut transports: HashMap<BrokerId, MemoryTransport> = HashMap::new();
        let mut remotes = HashMap::new();
        for broker in &brokers {
            let (transport, remote) = memory_transport();
            transports.insert(broker.id, transport);
            remotes.insert(broker.id, remote);
        }
        script(&remotes);

        let (sink, events) = EventSink::channel(256, Arc::new(RouterStats::default()));
        let handler = Arc::new(SinkHandler::new(sink.clone()));
        let manager = ConnectionManager::start_with(&brokers, &settings(), handler, sink, |broker| {
            transports.remove(&broker.id).unwrap()
        });

        Self {
            manager,
            remotes,
            events,
        }
    }

    fn remote(&self, broker: BrokerId) -> &MemoryRemote {
        &self.remotes[&broker]
    }

    async fn wait_for(&self, broker: BrokerId, check: impl Fn(&BrokerStatus) -> bool) -> BrokerStatus {
        let mut rx = self.manager.watch_status(broker).unwrap();
        timeout(Duration::from_secs(120), async {
            loop {
                {
                    let status = rx.borrow_and_update();
                    if check(&status) {
                        return status.clone();
                    }
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("status condition never reached")
    }

    async fn wait_connected(&self, broker: BrokerId) -> BrokerStatus {
        self.wait_for(broker, |s| s.connection_state == ConnectionState::Connected)
            .await
    }

    /// Device events received so far, connectivity events skipped
    async fn device_events(&mut self) -> Vec<DeviceEvent> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let HubEvent::Device(event) = event {
                out.push(event);
            }
        }
        out
    }
}

fn community(id: u32) -> BrokerConfig {
    BrokerConfig::new(id, format!("community-{id}"), "localhost", 1883)
}

fn subscriptions(requests: &[Request]) -> Vec<String> {
    requests
        .iter()
        .filter_map(|r| match r {
            Request::Subscribe(topic) => Some(topic.clone()),
            _ => None,
        })
        .collect()
}

fn publishes(requests: &[Request]) -> Vec<(String, Bytes)> {
    requests
        .iter()
        .filter_map(|r| match r {
            Request::Publish { topic, payload } => Some((topic.clone(), payload.clone())),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn unreachable_broker_does_not_block_the_others() {
    let hub = Hub::start(vec![community(1), community(2)], |remotes| {
        remotes[&B1].push_failure("connection refused");
        remotes[&B2].push(NetworkEvent::ConnAck);
    });

    hub.wait_connected(B2).await;
    let b1 = hub.wait_for(B1, |s| s.reconnect_attempts >= 1).await;
    assert!(b1.initialized);
    assert_ne!(b1.connection_state, ConnectionState::Connected);
    assert!(b1.last_error.is_some());

    assert!(hub.manager.listen(B2, dev(3)).await.unwrap());
    let subs = subscriptions(&hub.remote(B2).requests());
    for topic in ["3/bio", "3/act/aut"] {
        assert!(subs.contains(&topic.to_string()), "missing {topic} in {subs:?}");
    }
    // Greetings arrive through the discovery wildcard
    assert!(!subs.contains(&"3/grt".to_string()));
    assert!(subscriptions(&hub.remote(B1).requests()).is_empty());

    hub.manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn failed_connects_back_off_exponentially() {
    let hub = Hub::start(vec![community(1)], |remotes| {
        for _ in 0..4 {
            remotes[&B1].push_failure("connection refused");
        }
    });

    let status = hub.wait_for(B1, |s| s.reconnect_attempts == 4).await;
    assert_eq!(status.next_retry_in, Some(Duration::from_secs(8)));

    let times = hub.remote(B1).failure_times();
    assert_eq!(times.len(), 4);
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    let expected = [1, 2, 4].map(Duration::from_secs);
    for (gap, want) in gaps.iter().zip(expected) {
        let diff = if *gap > want { *gap - want } else { want - *gap };
        assert!(diff < Duration::from_millis(50), "gap {gap:?}, expected {want:?}");
    }

    hub.manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn backoff_resets_after_successful_connect() {
    let hub = Hub::start(vec![community(1)], |remotes| {
        remotes[&B1].push_failure("timeout");
        remotes[&B1].push_failure("timeout");
        remotes[&B1].push(NetworkEvent::ConnAck);
    });

    let status = hub.wait_connected(B1).await;
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(status.next_retry_in, None);

    hub.manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn delivers_device_messages_and_greetings() {
    let mut hub = Hub::start(vec![community(1), community(2)], |remotes| {
        remotes[&B1].push_failure("connection refused");
        remotes[&B2].push(NetworkEvent::ConnAck);
    });
    hub.wait_connected(B2).await;
    hub.manager.listen(B2, dev(3)).await.unwrap();

    hub.remote(B2).push_message("3/bio", br#"{"temp": 24.5, "ph": 6.8}"#);
    hub.remote(B2).push_message("5/grt", b"hello");

    let events = hub.device_events().await;
    assert_eq!(events.len(), 2, "{events:?}");
    assert_eq!(events[0].broker, B2);
    assert_eq!(events[0].device, dev(3));
    assert_eq!(events[0].kind, TopicKind::BioInfo);
    assert_eq!(events[0].payload.as_json(), Some(&json!({"temp": 24.5, "ph": 6.8})));

    assert_eq!(events[1].device, dev(5));
    assert_eq!(events[1].kind, TopicKind::SysGreet);

    let status = hub.manager.status(B2).unwrap();
    assert_eq!(status.messages_received, 2);
    assert_eq!(hub.manager.router_stats().routed, 2);

    hub.manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn bad_messages_are_dropped_without_stopping_the_loop() {
    let mut hub = Hub::start(vec![community(2).with_devices([dev(4)])], |remotes| {
        remotes[&B2].push(NetworkEvent::ConnAck);
    });
    hub.wait_connected(B2).await;

    hub.remote(B2).push_message("4/bio", b"not json");
    hub.remote(B2).push_message("garbage/topic", b"{}");
    hub.remote(B2).push_message("4/bio", br#"{"temp": 20}"#);

    let events = hub.device_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload.as_json(), Some(&json!({"temp": 20})));

    let stats = hub.manager.router_stats();
    assert_eq!(stats.handler_failures, 1);
    assert_eq!(stats.unroutable, 1);
    assert_eq!(stats.routed, 1);
    assert_eq!(
        hub.manager.status(B2).unwrap().connection_state,
        ConnectionState::Connected
    );

    hub.manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn connect_replays_configured_devices_and_greets() {
    let hub = Hub::start(vec![community(2).with_devices([dev(7), dev(8)])], |remotes| {
        remotes[&B2].push(NetworkEvent::ConnAck);
    });
    let status = hub.wait_connected(B2).await;
    assert_eq!(status.devices, vec![dev(7), dev(8)]);

    let requests = hub.remote(B2).requests();
    let subs = subscriptions(&requests);
    assert!(subs.contains(&"+/grt".to_string()));
    for topic in ["7/bio", "7/act/aut", "8/bio", "8/act/aut"] {
        assert!(subs.contains(&topic.to_string()), "missing {topic}");
    }
    assert_eq!(subs.iter().filter(|s| s.ends_with("/grt")).count(), 1);
    assert_eq!(publishes(&requests), vec![("init".to_string(), Bytes::new())]);

    hub.manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_replays_devices_added_while_down() {
    let hub = Hub::start(vec![community(2)], |remotes| {
        remotes[&B2].push(NetworkEvent::ConnAck);
    });
    hub.wait_connected(B2).await;

    hub.remote(B2).push(NetworkEvent::Disconnected);
    hub.wait_for(B2, |s| s.connection_state != ConnectionState::Connected)
        .await;
    hub.remote(B2).take_requests();

    // Recorded only; nothing goes out while disconnected
    assert!(hub.manager.listen(B2, dev(11)).await.unwrap());
    assert!(hub.remote(B2).requests().is_empty());

    hub.remote(B2).push(NetworkEvent::ConnAck);
    let status = hub.wait_connected(B2).await;
    assert_eq!(status.reconnect_attempts, 0);

    let subs = subscriptions(&hub.remote(B2).requests());
    for topic in ["11/bio", "11/act/aut"] {
        assert_eq!(subs.iter().filter(|s| s.as_str() == topic).count(), 1, "{topic}");
    }

    hub.manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn replay_beyond_transport_queue_is_completed() {
    let devices: Vec<DeviceId> = (1..=40).map(dev).collect();
    let hub = Hub::start(vec![community(2).with_devices(devices.clone())], |remotes| {
        remotes[&B2].accept_only(33);
        remotes[&B2].push(NetworkEvent::ConnAck);
    });
    let status = hub.wait_connected(B2).await;
    assert!(status.pending_requests > 0);

    hub.remote(B2).accept_all();
    hub.remote(B2).push(NetworkEvent::Idle);
    hub.wait_for(B2, |s| s.pending_requests == 0).await;

    let requests = hub.remote(B2).requests();
    let subs = subscriptions(&requests);
    assert_eq!(subs.len(), 1 + devices.len() * 2);
    for device in &devices {
        assert!(subs.contains(&format!("{device}/act/aut")), "missing {device}");
    }
    assert_eq!(publishes(&requests), vec![("init".to_string(), Bytes::new())]);

    hub.manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn listen_and_mute_are_idempotent() {
    let hub = Hub::start(vec![community(2)], |remotes| {
        remotes[&B2].push(NetworkEvent::ConnAck);
    });
    hub.wait_connected(B2).await;
    hub.remote(B2).take_requests();

    assert!(hub.manager.listen(B2, dev(3)).await.unwrap());
    assert!(!hub.manager.listen(B2, dev(3)).await.unwrap());
    assert_eq!(subscriptions(&hub.remote(B2).requests()).len(), 2);

    assert!(hub.manager.mute(B2, dev(3)).await.unwrap());
    assert!(!hub.manager.mute(B2, dev(3)).await.unwrap());
    let unsubscribed = hub
        .remote(B2)
        .requests()
        .iter()
        .filter(|r| matches!(r, Request::Unsubscribe(_)))
        .count();
    assert_eq!(unsubscribed, 2);
    assert!(hub.manager.status(B2).unwrap().devices.is_empty());

    hub.manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn sends_instructions_to_tracked_devices() {
    let hub = Hub::start(vec![community(2).with_devices([dev(3)])], |remotes| {
        remotes[&B2].push(NetworkEvent::ConnAck);
    });
    hub.wait_connected(B2).await;
    hub.remote(B2).take_requests();

    let action = ActionCommand::new("pump", json!({"duty": 40}));
    hub.manager.send_action(B2, dev(3), &action).await.unwrap();
    let change = SettingChange::new("interval", json!(60));
    hub.manager.send_setting(B2, dev(3), &change).await.unwrap();

    let sent = publishes(&hub.remote(B2).requests());
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].0, "3/act");
    let decoded: ActionCommand = serde_json::from_slice(&sent[0].1).unwrap();
    assert_eq!(decoded, action);
    assert_eq!(sent[1].0, "3/set");
    let decoded: SettingChange = serde_json::from_slice(&sent[1].1).unwrap();
    assert_eq!(decoded, change);

    assert_eq!(hub.manager.status(B2).unwrap().messages_sent, 2);

    hub.manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn management_errors_are_reported() {
    let hub = Hub::start(
        vec![community(1).with_devices([dev(7)]), community(2)],
        |remotes| {
            remotes[&B1].push_failure("connection refused");
            remotes[&B2].push(NetworkEvent::ConnAck);
        },
    );
    hub.wait_connected(B2).await;
    hub.wait_for(B1, |s| s.reconnect_attempts >= 1).await;

    assert!(matches!(
        hub.manager.listen(BrokerId(9), dev(1)).await,
        Err(HubError::UnknownBroker(BrokerId(9)))
    ));
    assert!(matches!(
        hub.manager.status(BrokerId(9)),
        Err(HubError::UnknownBroker(_))
    ));

    let action = ActionCommand::new("light", json!(null));
    assert!(matches!(
        hub.manager.send_action(B2, dev(99), &action).await,
        Err(HubError::UnknownDevice { broker: B2, .. })
    ));

    assert!(matches!(
        hub.manager.send_action(B1, dev(7), &action).await,
        Err(HubError::NotConnected(B1))
    ));
    assert!(publishes(&hub.remote(B1).requests()).is_empty());

    hub.manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_disconnects_and_closes_the_event_stream() {
    let mut hub = Hub::start(vec![community(1), community(2)], |remotes| {
        remotes[&B1].push_failure("connection refused");
        remotes[&B2].push(NetworkEvent::ConnAck);
    });
    hub.wait_connected(B2).await;
    let b2 = hub.remote(B2).clone();
    let mut status_rx = hub.manager.watch_status(B2).unwrap();

    hub.manager.stop().await;

    assert_eq!(b2.requests().last(), Some(&Request::Disconnect));
    assert_eq!(
        status_rx.borrow_and_update().connection_state,
        ConnectionState::Disconnected
    );

    let mut last_b2_state = None;
    while let Some(event) = timeout(Duration::from_secs(5), hub.events.recv())
        .await
        .expect("event stream never closed")
    {
        if let HubEvent::Connectivity { broker: B2, state, .. } = event {
            last_b2_state = Some(state);
        }
    }
    assert_eq!(last_b2_state, Some(ConnectionState::Disconnected));
}

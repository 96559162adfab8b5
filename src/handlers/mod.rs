//! # Device message handlers
//!
//! The router resolves an inbound topic to its kind and calls the matching
//! [`MessageHandler`] method with the device id and raw payload. Handlers run
//! inside the broker worker, so they must not block: [`SinkHandler`] decodes
//! the payload and hands the result to the [`EventSink`] without waiting.
//!
//! ```text
//! <id>/bio      ──► on_bio_info      ──► DeviceEvent(BioInfo)
//! <id>/act/aut  ──► on_auto_action   ──► DeviceEvent(AutoAction)
//! <id>/grt      ──► on_sys_greeting  ──► DeviceEvent(BioInfo, replayed)*
//!                                        DeviceEvent(SysGreet)
//! ```
//!
//! Outbound instructions ([`ActionCommand`], [`SettingChange`]) go the other
//! way through the connection manager.

pub mod events;
pub mod sink;

pub use events::{ActionCommand, DeviceEvent, DevicePayload, HubEvent, SettingChange};
pub use sink::{EventSink, RouterStats, RouterStatsSnapshot};

use crate::error::HandlerError;
use crate::mqtt::topic::{BrokerId, DeviceId, TopicKind};
use bytes::Bytes;
use tracing::debug;

/// Receiver of device-originated messages
pub trait MessageHandler: Send + Sync + 'static {
    /// Sensor and environment readings
    fn on_bio_info(&self, broker: BrokerId, device: DeviceId, payload: &Bytes)
        -> Result<(), HandlerError>;

    /// Log of an action the device took without instruction
    fn on_auto_action(
        &self,
        broker: BrokerId,
        device: DeviceId,
        payload: &Bytes,
    ) -> Result<(), HandlerError>;

    /// Device (re)announced itself
    fn on_sys_greeting(
        &self,
        broker: BrokerId,
        device: DeviceId,
        payload: &Bytes,
    ) -> Result<(), HandlerError>;
}

/// Forwards decoded device messages to the application event sink
#[derive(Clone)]
pub struct SinkHandler {
    sink: EventSink,
}

impl SinkHandler {
    pub fn new(sink: EventSink) -> Self {
        Self { sink }
    }
}

impl MessageHandler for SinkHandler {
    fn on_bio_info(
        &self,
        broker: BrokerId,
        device: DeviceId,
        payload: &Bytes,
    ) -> Result<(), HandlerError> {
        let reading = DevicePayload::decode(payload);
        if !reading.as_json().is_some_and(|v| v.is_object()) {
            return Err(HandlerError::Decode(
                "readings must be a JSON object".to_string(),
            ));
        }
        self.sink.emit(HubEvent::Device(DeviceEvent::new(
            broker,
            device,
            TopicKind::BioInfo,
            reading,
        )))
    }

    fn on_auto_action(
        &self,
        broker: BrokerId,
        device: DeviceId,
        payload: &Bytes,
    ) -> Result<(), HandlerError> {
        self.sink.emit(HubEvent::Device(DeviceEvent::new(
            broker,
            device,
            TopicKind::AutoAction,
            DevicePayload::decode(payload),
        )))
    }

    /// Replays the greeting's `backlog` readings, then reports the device online
    fn on_sys_greeting(
        &self,
        broker: BrokerId,
        device: DeviceId,
        payload: &Bytes,
    ) -> Result<(), HandlerError> {
        let greeting = DevicePayload::decode(payload);

        if let Some(backlog) = greeting
            .as_json()
            .and_then(|v| v.get("backlog"))
            .and_then(|v| v.as_array())
        {
            debug!(broker = %broker, device = %device, "Replaying {} missed readings", backlog.len());
            for reading in backlog {
                self.sink.emit(HubEvent::Device(
                    DeviceEvent::new(
                        broker,
                        device,
                        TopicKind::BioInfo,
                        DevicePayload::Json(reading.clone()),
                    )
                    .replayed(),
                ))?;
            }
        }

        self.sink.emit(HubEvent::Device(DeviceEvent::new(
            broker,
            device,
            TopicKind::SysGreet,
            greeting,
        )))
    }
}

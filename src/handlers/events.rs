use crate::mqtt::connection::ConnectionState;
use crate::mqtt::topic::{BrokerId, DeviceId, TopicKind};
use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Decoded device payload. JSON when it parses, raw bytes otherwise.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DevicePayload {
    Json(serde_json::Value),
    Raw(Vec<u8>),
}

impl DevicePayload {
    pub fn decode(payload: &Bytes) -> Self {
        match serde_json::from_slice(payload) {
            Ok(value) => DevicePayload::Json(value),
            Err(_) => DevicePayload::Raw(payload.to_vec()),
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            DevicePayload::Json(value) => Some(value),
            DevicePayload::Raw(_) => None,
        }
    }
}

/// Something a device reported
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceEvent {
    pub broker: BrokerId,
    pub device: DeviceId,
    pub kind: TopicKind,
    pub payload: DevicePayload,
    /// Reading recovered from a greeting backlog rather than received live
    pub replayed: bool,
    pub timestamp: DateTime<Local>,
}

impl DeviceEvent {
    pub fn new(broker: BrokerId, device: DeviceId, kind: TopicKind, payload: DevicePayload) -> Self {
        Self {
            broker,
            device,
            kind,
            payload,
            replayed: false,
            timestamp: Local::now(),
        }
    }

    pub fn replayed(mut self) -> Self {
        self.replayed = true;
        self
    }
}

/// Everything the hub forwards to the application layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum HubEvent {
    Device(DeviceEvent),
    Connectivity {
        broker: BrokerId,
        state: ConnectionState,
        cause: Option<String>,
        timestamp: DateTime<Local>,
    },
}

impl HubEvent {
    pub fn connectivity(broker: BrokerId, state: ConnectionState, cause: Option<String>) -> Self {
        HubEvent::Connectivity {
            broker,
            state,
            cause,
            timestamp: Local::now(),
        }
    }

    pub fn broker(&self) -> BrokerId {
        match self {
            HubEvent::Device(event) => event.broker,
            HubEvent::Connectivity { broker, .. } => *broker,
        }
    }
}

impl fmt::Display for HubEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HubEvent::Device(event) => {
                let payload = match &event.payload {
                    DevicePayload::Json(value) => value.to_string(),
                    DevicePayload::Raw(raw) => String::from_utf8_lossy(raw).into_owned(),
                };
                write!(
                    f,
                    "{} broker {} device {} {}{}: {}",
                    event.timestamp.format("%H:%M:%S%.3f"),
                    event.broker,
                    event.device,
                    event.kind,
                    if event.replayed { " (replayed)" } else { "" },
                    payload
                )
            }
            HubEvent::Connectivity {
                broker,
                state,
                cause,
                timestamp,
            } => {
                write!(f, "{} broker {} {}", timestamp.format("%H:%M:%S%.3f"), broker, state)?;
                if let Some(cause) = cause {
                    write!(f, " ({})", cause)?;
                }
                Ok(())
            }
        }
    }
}

/// Instruction for one actor of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCommand {
    pub actor: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ActionCommand {
    pub fn new(actor: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            actor: actor.into(),
            params,
        }
    }
}

/// New value for one internal setting of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingChange {
    pub setting: String,
    pub value: serde_json::Value,
}

impl SettingChange {
    pub fn new(setting: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            setting: setting.into(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_json_or_keeps_raw() {
        let json = DevicePayload::decode(&Bytes::from_static(br#"{"ph": 7.1}"#));
        assert_eq!(json.as_json(), Some(&json!({"ph": 7.1})));

        let raw = DevicePayload::decode(&Bytes::from_static(b"pump on"));
        assert_eq!(raw, DevicePayload::Raw(b"pump on".to_vec()));
    }

    #[test]
    fn commands_serialize_to_wire_shape() {
        let action = ActionCommand::new("pump", json!({"on": true}));
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            json!({"actor": "pump", "params": {"on": true}})
        );

        let setting = SettingChange::new("interval", json!(30));
        assert_eq!(
            serde_json::to_value(&setting).unwrap(),
            json!({"setting": "interval", "value": 30})
        );
    }
}

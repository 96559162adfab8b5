//! Topic scheme for community brokers
//!
//! Every device owns a small namespace rooted at its numeric id. The server
//! greets all devices of a broker at once through the fixed `init` topic.
//!
//! ```text
//! init          server ──► all devices
//! <id>/grt      device ──► server   (greeting / re-announce)
//! <id>/bio      device ──► server   (sensor readings)
//! <id>/act      server ──► device   (action instruction)
//! <id>/act/aut  device ──► server   (autonomous action log)
//! <id>/set      server ──► device   (setting change)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed broker-wide greet topic
pub const GREET_TOPIC: &str = "init";

/// Wildcard that catches greetings of devices not yet tracked
pub const DISCOVERY_TOPIC: &str = "+/grt";

/// Identifier of a community broker, as assigned by the broker registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrokerId(pub u32);

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a device (system) inside one community.
///
/// Always positive. Ids carry no meaning across brokers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct DeviceId(u32);

impl DeviceId {
    pub fn new(id: u32) -> Option<Self> {
        (id > 0).then_some(Self(id))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Parses a topic segment. Only plain ascii digits are accepted.
    pub fn parse_segment(segment: &str) -> Option<Self> {
        if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        segment.parse::<u32>().ok().and_then(Self::new)
    }
}

impl TryFrom<u32> for DeviceId {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| "device id must be positive".to_string())
    }
}

impl From<DeviceId> for u32 {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical message category of a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopicKind {
    Greet,
    SysGreet,
    BioInfo,
    Action,
    AutoAction,
    Setting,
}

impl TopicKind {
    /// Kinds a listened device is subscribed to
    pub const SUBSCRIBED: [TopicKind; 3] =
        [TopicKind::SysGreet, TopicKind::BioInfo, TopicKind::AutoAction];

    /// Path below the device id, `None` for the broker-wide greet
    pub fn suffix(self) -> Option<&'static str> {
        match self {
            TopicKind::Greet => None,
            TopicKind::SysGreet => Some("grt"),
            TopicKind::BioInfo => Some("bio"),
            TopicKind::Action => Some("act"),
            TopicKind::AutoAction => Some("act/aut"),
            TopicKind::Setting => Some("set"),
        }
    }

    pub fn is_per_device(self) -> bool {
        self.suffix().is_some()
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TopicKind::Greet => "greet",
            TopicKind::SysGreet => "sys-greet",
            TopicKind::BioInfo => "bio-info",
            TopicKind::Action => "action",
            TopicKind::AutoAction => "auto-action",
            TopicKind::Setting => "setting",
        };
        f.write_str(name)
    }
}

/// Result of matching an incoming topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicMatch {
    /// The broker-wide greet topic
    Broadcast,
    Device(TopicKind, DeviceId),
}

/// Renders the topic for `kind`. The device id is ignored for [`TopicKind::Greet`].
pub fn topic_for(kind: TopicKind, device: DeviceId) -> String {
    match kind.suffix() {
        Some(suffix) => format!("{}/{}", device, suffix),
        None => GREET_TOPIC.to_string(),
    }
}

/// Matches an incoming topic back to its kind and device.
///
/// Returns `None` for anything that is not exactly one of the templates,
/// including malformed ids.
pub fn match_topic(topic: &str) -> Option<TopicMatch> {
    if topic == GREET_TOPIC {
        return Some(TopicMatch::Broadcast);
    }

    let (head, rest) = topic.split_once('/')?;
    let device = DeviceId::parse_segment(head)?;
    let kind = match rest {
        "grt" => TopicKind::SysGreet,
        "bio" => TopicKind::BioInfo,
        "act" => TopicKind::Action,
        "act/aut" => TopicKind::AutoAction,
        "set" => TopicKind::Setting,
        _ => return None,
    };
    Some(TopicMatch::Device(kind, device))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(id: u32) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    #[test]
    fn renders_every_template() {
        assert_eq!(topic_for(TopicKind::Greet, dev(9)), "init");
        assert_eq!(topic_for(TopicKind::SysGreet, dev(9)), "9/grt");
        assert_eq!(topic_for(TopicKind::BioInfo, dev(9)), "9/bio");
        assert_eq!(topic_for(TopicKind::Action, dev(9)), "9/act");
        assert_eq!(topic_for(TopicKind::AutoAction, dev(9)), "9/act/aut");
        assert_eq!(topic_for(TopicKind::Setting, dev(9)), "9/set");
    }

    #[test]
    fn matches_device_topics() {
        assert_eq!(
            match_topic("42/bio"),
            Some(TopicMatch::Device(TopicKind::BioInfo, dev(42)))
        );
        assert_eq!(
            match_topic("42/act/aut"),
            Some(TopicMatch::Device(TopicKind::AutoAction, dev(42)))
        );
        assert_eq!(
            match_topic("42/act"),
            Some(TopicMatch::Device(TopicKind::Action, dev(42)))
        );
        assert_eq!(match_topic("init"), Some(TopicMatch::Broadcast));
    }

    #[test]
    fn rejects_malformed_topics() {
        for topic in [
            "abc/bio",
            "42/unknown",
            "-1/bio",
            "+5/bio",
            "0/bio",
            " 4/bio",
            "/bio",
            "42",
            "42/bio/extra",
            "42/act/aut/x",
            "99999999999/bio",
            "init/42",
            "",
        ] {
            assert_eq!(match_topic(topic), None, "{topic} should not match");
        }
    }

    #[test]
    fn rendered_topics_match_back() {
        for kind in [
            TopicKind::SysGreet,
            TopicKind::BioInfo,
            TopicKind::Action,
            TopicKind::AutoAction,
            TopicKind::Setting,
        ] {
            let topic = topic_for(kind, dev(7));
            assert_eq!(match_topic(&topic), Some(TopicMatch::Device(kind, dev(7))));
        }
    }

    #[test]
    fn device_id_rejects_zero_in_config() {
        let parsed: Result<Vec<DeviceId>, _> = serde_json::from_str("[1, 0]");
        assert!(parsed.is_err());
        let parsed: Vec<DeviceId> = serde_json::from_str("[1, 2]").unwrap();
        assert_eq!(parsed, vec![dev(1), dev(2)]);
    }
}

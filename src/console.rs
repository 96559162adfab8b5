//! Line based operator commands read from stdin by the binary

use crate::handlers::{ActionCommand, SettingChange};
use crate::mqtt::topic::{BrokerId, DeviceId};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Listen(BrokerId, DeviceId),
    Mute(BrokerId, DeviceId),
    Action(BrokerId, DeviceId, ActionCommand),
    Set(BrokerId, DeviceId, SettingChange),
    Greet(BrokerId),
    Status,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("empty line")]
    Empty,

    #[error("unknown command '{0}', try 'help'")]
    UnknownCommand(String),

    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid broker id '{0}'")]
    InvalidBroker(String),

    #[error("invalid device id '{0}'")]
    InvalidDevice(String),

    #[error("invalid json: {0}")]
    InvalidJson(String),
}

pub const USAGE: &str = "\
commands:
  listen <broker> <device>
  mute <broker> <device>
  action <broker> <device> <actor> [json-params]
  set <broker> <device> <setting> <json-value>
  greet <broker>
  status
  quit";

impl ConsoleCommand {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        let (word, rest) = split_word(line);

        match word {
            "" => Err(ParseError::Empty),
            "listen" => {
                let (broker, device, _) = target(rest)?;
                Ok(Self::Listen(broker, device))
            }
            "mute" => {
                let (broker, device, _) = target(rest)?;
                Ok(Self::Mute(broker, device))
            }
            "action" => {
                let (broker, device, rest) = target(rest)?;
                let (actor, params) = split_word(rest);
                if actor.is_empty() {
                    return Err(ParseError::Missing("actor"));
                }
                let params = if params.is_empty() {
                    Value::Null
                } else {
                    json(params)?
                };
                Ok(Self::Action(broker, device, ActionCommand::new(actor, params)))
            }
            "set" => {
                let (broker, device, rest) = target(rest)?;
                let (setting, value) = split_word(rest);
                if setting.is_empty() {
                    return Err(ParseError::Missing("setting"));
                }
                if value.is_empty() {
                    return Err(ParseError::Missing("value"));
                }
                Ok(Self::Set(broker, device, SettingChange::new(setting, json(value)?)))
            }
            "greet" => {
                let (broker, _) = split_word(rest);
                Ok(Self::Greet(broker_id(broker)?))
            }
            "status" => Ok(Self::Status),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(ParseError::UnknownCommand(other.to_string())),
        }
    }
}

fn split_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (input, ""),
    }
}

fn broker_id(word: &str) -> Result<BrokerId, ParseError> {
    if word.is_empty() {
        return Err(ParseError::Missing("broker id"));
    }
    word.parse()
        .map(BrokerId)
        .map_err(|_| ParseError::InvalidBroker(word.to_string()))
}

fn target(input: &str) -> Result<(BrokerId, DeviceId, &str), ParseError> {
    let (broker, rest) = split_word(input);
    let broker = broker_id(broker)?;
    let (device, rest) = split_word(rest);
    if device.is_empty() {
        return Err(ParseError::Missing("device id"));
    }
    let device =
        DeviceId::parse_segment(device).ok_or_else(|| ParseError::InvalidDevice(device.to_string()))?;
    Ok((broker, device, rest))
}

fn json(input: &str) -> Result<Value, ParseError> {
    serde_json::from_str(input).map_err(|e| ParseError::InvalidJson(e.to_string()))
}

//! Relay wire protocol types.
//!
//! ## Schema summary
//! - Every WebSocket text frame is one JSON array whose first element names
//!   the frame type.
//! - Outbound (bridge → relay): `["REQ", <subscription id>, <filter>]` opens
//!   or replaces the subscription with that id; `["CLOSE", <subscription id>]`
//!   cancels it.
//! - Inbound (relay → bridge): `["EVENT", <subscription id>, <event>]`
//!   delivers an event, `["EOSE", <subscription id>]` marks the end of stored
//!   events, and `["NOTICE", <text>]` is informational.
//!
//! The frame layout, event field names, and tag letters are relay-protocol
//! constants; the bridge treats them as a fixed external schema and never
//! interprets event contents beyond equality on the fields it extracts.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event kind carrying an encrypted group message.
pub const GROUP_MESSAGE_KIND: u32 = 445;

/// Event kind carrying a direct-to-user welcome (group invite).
pub const WELCOME_KIND: u32 = 444;

/// Single-letter tag holding the channel (conversation/group) identifier.
pub const CHANNEL_TAG: &str = "h";

/// Single-letter tag holding a recipient's public key.
pub const RECIPIENT_TAG: &str = "p";

/// One event as delivered by a relay.
///
/// The bridge treats events as opaque, already-validated structures: the
/// fields below are extracted for matching and dedup only, never verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
}

impl Event {
    /// The channel identifier carried in the event's `h` tag, if any.
    pub fn channel_id(&self) -> Option<&str> {
        self.tag_value(CHANNEL_TAG)
    }

    /// Public keys this event is addressed to via `p` tags.
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.tags
            .iter()
            .filter(|tag| tag.len() >= 2 && tag[0] == RECIPIENT_TAG)
            .map(|tag| tag[1].as_str())
    }

    fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.len() >= 2 && tag[0] == name)
            .map(|tag| tag[1].as_str())
    }
}

/// A relay subscription filter: which events a connection wants to receive.
///
/// An event matches when its kind is listed, its `created_at` is at or after
/// `since`, and it carries either a listed channel tag or a listed recipient
/// tag.  Both sets empty therefore matches nothing: a valid no-op
/// subscription, kept in place so an empty interest set never needs a
/// separate "no filter active" path.
///
/// Channel and recipient sets are ordered, so recomputing an unchanged
/// registry serializes to a byte-identical frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub kinds: Vec<u32>,
    #[serde(rename = "#h")]
    pub channels: BTreeSet<String>,
    #[serde(rename = "#p")]
    pub recipients: BTreeSet<String>,
    pub since: u64,
}

impl Filter {
    pub fn is_empty_interest(&self) -> bool {
        self.channels.is_empty() && self.recipients.is_empty()
    }
}

/// Build a `REQ` frame opening (or replacing) a subscription.
pub fn subscribe_frame(subscription_id: &str, filter: &Filter) -> String {
    serde_json::json!(["REQ", subscription_id, filter]).to_string()
}

/// Build a `CLOSE` frame cancelling a subscription.
pub fn close_frame(subscription_id: &str) -> String {
    serde_json::json!(["CLOSE", subscription_id]).to_string()
}

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Event {
        subscription_id: String,
        event: Event,
    },
    EndOfStored {
        subscription_id: String,
    },
    Notice {
        message: String,
    },
}

/// Why an inbound frame could not be parsed.
///
/// Malformed frames are dropped and logged; they never terminate the
/// connection that delivered them.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameError {
    NotJson(String),
    NotArray,
    MissingFrameType,
    UnknownFrameType(String),
    MissingElement(&'static str),
    BadEvent(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::NotJson(detail) => write!(f, "frame is not JSON: {detail}"),
            FrameError::NotArray => write!(f, "frame is not a JSON array"),
            FrameError::MissingFrameType => write!(f, "frame type is missing or not a string"),
            FrameError::UnknownFrameType(kind) => write!(f, "unknown frame type: {kind}"),
            FrameError::MissingElement(name) => write!(f, "frame is missing {name}"),
            FrameError::BadEvent(detail) => write!(f, "malformed event: {detail}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl RelayFrame {
    /// Parse one inbound text frame.
    pub fn parse(text: &str) -> Result<RelayFrame, FrameError> {
        let value: Value =
            serde_json::from_str(text).map_err(|error| FrameError::NotJson(error.to_string()))?;
        let elements = value.as_array().ok_or(FrameError::NotArray)?;
        let frame_type = elements
            .first()
            .and_then(Value::as_str)
            .ok_or(FrameError::MissingFrameType)?;

        match frame_type {
            "EVENT" => {
                let subscription_id = str_element(elements, 1, "subscription id")?;
                let raw = elements
                    .get(2)
                    .ok_or(FrameError::MissingElement("event body"))?;
                let event: Event = serde_json::from_value(raw.clone())
                    .map_err(|error| FrameError::BadEvent(error.to_string()))?;
                Ok(RelayFrame::Event {
                    subscription_id,
                    event,
                })
            }
            "EOSE" => {
                let subscription_id = str_element(elements, 1, "subscription id")?;
                Ok(RelayFrame::EndOfStored { subscription_id })
            }
            "NOTICE" => {
                let message = str_element(elements, 1, "notice text")?;
                Ok(RelayFrame::Notice { message })
            }
            other => Err(FrameError::UnknownFrameType(other.to_string())),
        }
    }
}

fn str_element(
    elements: &[Value],
    index: usize,
    name: &'static str,
) -> Result<String, FrameError> {
    elements
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(FrameError::MissingElement(name))
}

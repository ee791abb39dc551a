// ================
// common/src/lib.rs
// ================
//! Common types and structures
//! used for communication between browser clients and the live relay server.
//! This module defines the WebSocket protocol frames and supporting types.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest channel handle accepted from a client.
pub const MAX_CHANNEL_LEN: usize = 64;

/// Identifier of an external live-event source (a streamer's handle).
///
/// Handles are compared case-insensitively, so the stored form is always
/// lowercase with any leading `@` removed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct Channel(String);

/// Reasons a channel handle is refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel handle is empty")]
    Empty,

    #[error("channel handle exceeds {MAX_CHANNEL_LEN} characters")]
    TooLong,

    #[error("channel handle contains invalid character {0:?}")]
    InvalidChar(char),
}

impl Channel {
    /// Parse a user-supplied handle such as `"@Alice"` into its canonical form.
    pub fn parse(raw: &str) -> Result<Self, ChannelError> {
        let trimmed = raw.trim();
        let handle = trimmed.strip_prefix('@').unwrap_or(trimmed);

        if handle.is_empty() {
            return Err(ChannelError::Empty);
        }
        if handle.chars().count() > MAX_CHANNEL_LEN {
            return Err(ChannelError::TooLong);
        }
        if let Some(bad) = handle
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
        {
            return Err(ChannelError::InvalidChar(bad));
        }

        Ok(Self(handle.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Channel {
    type Error = ChannelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// Messages sent from client to server
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ControlFrame {
    /// Subscribe this connection to a channel's live feed
    /// # Fields
    /// * `channel` - Raw handle as typed by the user; validated server-side
    Connect { channel: String },
    /// Drop the current subscription, keeping the socket open
    Disconnect,
}

/// Lifecycle of one upstream connection.
///
/// `Ended` and `Error` are terminal.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Connecting,
    Connected,
    Ended,
    Error,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Error)
    }
}

/// Events sent from server to client, written as `{ "type": ..., "data": ... }`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum RelayEvent {
    Status(StatusData),
    Connected(ConnectedData),
    Disconnected(DisconnectedData),
    Error(ErrorData),
    Chat(ChatData),
    Gift(GiftData),
    Stats(StatsData),
    Social(SocialData),
}

impl RelayEvent {
    /// Wire name of the event type
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Connected(_) => "connected",
            Self::Disconnected(_) => "disconnected",
            Self::Error(_) => "error",
            Self::Chat(_) => "chat",
            Self::Gift(_) => "gift",
            Self::Stats(_) => "stats",
            Self::Social(_) => "social",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusData {
    pub state: LifecycleState,
    pub channel: Channel,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConnectedData {
    pub channel: Channel,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DisconnectedData {
    pub channel: Channel,
    pub reason: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorData {
    pub channel: Channel,
    pub message: String,
}

/// Viewer who produced a chat line or gift
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub unique_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatData {
    pub user: UserRef,
    pub comment: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GiftData {
    pub user: UserRef,
    pub gift_name: String,
    pub repeat_count: u32,
}

/// Counter snapshot; absent counters are left off the wire
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatsData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewer_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub like_count: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SocialData {
    pub label: String,
}

/// A normalized event together with the channel it came from.
///
/// Only the event half is written to the socket; the channel is routing
/// information for the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub channel: Channel,
    pub event: RelayEvent,
}

impl Envelope {
    pub fn new(channel: Channel, event: RelayEvent) -> Self {
        Self { channel, event }
    }

    pub fn status(channel: Channel, state: LifecycleState) -> Self {
        let event = RelayEvent::Status(StatusData {
            state,
            channel: channel.clone(),
        });
        Self::new(channel, event)
    }

    pub fn connected(channel: Channel) -> Self {
        let event = RelayEvent::Connected(ConnectedData {
            channel: channel.clone(),
        });
        Self::new(channel, event)
    }

    pub fn disconnected(channel: Channel, reason: impl Into<String>) -> Self {
        let event = RelayEvent::Disconnected(DisconnectedData {
            channel: channel.clone(),
            reason: reason.into(),
        });
        Self::new(channel, event)
    }

    pub fn error(channel: Channel, message: impl Into<String>) -> Self {
        let event = RelayEvent::Error(ErrorData {
            channel: channel.clone(),
            message: message.into(),
        });
        Self::new(channel, event)
    }

    /// Serialize the outbound text frame
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.event)
    }
}

//! Raw event shapes emitted by the live-event source and their mapping onto
//! the relay's canonical events.
use live_relay_common::{ChatData, GiftData, RelayEvent, SocialData, StatsData, UserRef};
use serde::Deserialize;

/// One event as it arrives from the upstream feed.
///
/// Tagged on `event`; field names are camelCase on the wire.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WireEvent {
    Chat {
        unique_id: String,
        comment: String,
    },
    Gift {
        unique_id: String,
        gift_name: String,
        #[serde(default = "single_repeat")]
        repeat_count: u32,
    },
    RoomUser {
        viewer_count: u64,
    },
    Like {
        #[serde(default)]
        like_count: Option<u64>,
        #[serde(default)]
        total_like_count: Option<u64>,
    },
    Social {
        label: String,
    },
    Follow {
        unique_id: String,
    },
    Share {
        unique_id: String,
    },
    StreamEnd,
    #[serde(other)]
    Unknown,
}

fn single_repeat() -> u32 {
    1
}

/// Result of mapping a wire event
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    /// Forward to subscribers
    Event(RelayEvent),
    /// The broadcast is over
    StreamEnd,
    /// Not part of the downstream contract
    Dropped,
}

impl WireEvent {
    /// Decode a text frame; anything that is not a JSON object with an
    /// `event` tag yields `None`.
    pub fn decode(frame: &str) -> Option<Self> {
        serde_json::from_str(frame).ok()
    }

    pub fn normalize(self) -> Normalized {
        let event = match self {
            WireEvent::Chat { unique_id, comment } => RelayEvent::Chat(ChatData {
                user: UserRef { unique_id },
                comment,
            }),
            WireEvent::Gift {
                unique_id,
                gift_name,
                repeat_count,
            } => RelayEvent::Gift(GiftData {
                user: UserRef { unique_id },
                gift_name,
                repeat_count,
            }),
            WireEvent::RoomUser { viewer_count } => RelayEvent::Stats(StatsData {
                viewer_count: Some(viewer_count),
                like_count: None,
            }),
            WireEvent::Like {
                like_count,
                total_like_count,
            } => match total_like_count.or(like_count) {
                Some(count) => RelayEvent::Stats(StatsData {
                    viewer_count: None,
                    like_count: Some(count),
                }),
                None => return Normalized::Dropped,
            },
            WireEvent::Social { label } => RelayEvent::Social(SocialData { label }),
            WireEvent::Follow { unique_id } => RelayEvent::Social(SocialData {
                label: format!("{unique_id} followed the host"),
            }),
            WireEvent::Share { unique_id } => RelayEvent::Social(SocialData {
                label: format!("{unique_id} shared the stream"),
            }),
            WireEvent::StreamEnd => return Normalized::StreamEnd,
            WireEvent::Unknown => return Normalized::Dropped,
        };
        Normalized::Event(event)
    }
}

//! Seam between the relay and the concrete live-event source.
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use live_relay_common::Channel;
use thiserror::Error;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

use super::wire::WireEvent;
use crate::config::{UpstreamSettings, CHANNEL_PLACEHOLDER};

/// Stream of raw events for one channel; ends when the broadcast does.
pub type UpstreamFeed = BoxStream<'static, Result<WireEvent, UpstreamError>>;

/// Failures talking to the live-event source
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("upstream rejected channel: {0}")]
    Rejected(String),

    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("upstream protocol error: {0}")]
    Protocol(String),
}

impl From<tungstenite::Error> for UpstreamError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => {
                UpstreamError::Rejected(format!("handshake refused with {}", response.status()))
            },
            tungstenite::Error::Url(e) => UpstreamError::Protocol(e.to_string()),
            tungstenite::Error::Protocol(e) => UpstreamError::Protocol(e.to_string()),
            other => UpstreamError::Transport(other.to_string()),
        }
    }
}

/// Opens a feed for a channel. One call per upstream connection attempt.
#[async_trait]
pub trait UpstreamConnector: Send + Sync + 'static {
    async fn connect(&self, channel: &Channel) -> Result<UpstreamFeed, UpstreamError>;
}

/// Connector for a bridge that exposes each live channel as a WebSocket
/// emitting one JSON [`WireEvent`] per text frame.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url_template: String,
}

impl WebSocketConnector {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
        }
    }

    pub fn from_settings(settings: &UpstreamSettings) -> Self {
        Self::new(settings.url.clone())
    }

    /// Channel handles only contain URL-safe characters, so no escaping is needed.
    pub fn url_for(&self, channel: &Channel) -> String {
        self.url_template
            .replace(CHANNEL_PLACEHOLDER, channel.as_str())
    }
}

#[async_trait]
impl UpstreamConnector for WebSocketConnector {
    async fn connect(&self, channel: &Channel) -> Result<UpstreamFeed, UpstreamError> {
        let url = self.url_for(channel);
        let (socket, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;

        let feed = socket.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => {
                    let decoded = WireEvent::decode(text.as_str());
                    if decoded.is_none() {
                        debug!(frame = %text.as_str(), "dropping undecodable upstream frame");
                    }
                    decoded.map(Ok)
                },
                Ok(_) => None,
                Err(err) => Some(Err(UpstreamError::from(err))),
            }
        });

        Ok(feed.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_for_substitutes_channel() {
        let connector = WebSocketConnector::new("ws://bridge.internal:9000/live/{channel}/events");
        let channel = Channel::parse("@Carol").unwrap();
        assert_eq!(
            connector.url_for(&channel),
            "ws://bridge.internal:9000/live/carol/events"
        );
    }

    #[tokio::test]
    async fn test_unreachable_bridge_is_transport_error() {
        // Port 9 (discard) is essentially never listening on loopback
        let connector = WebSocketConnector::new("ws://127.0.0.1:9/live/{channel}");
        let channel = Channel::parse("dave").unwrap();
        let err = match connector.connect(&channel).await {
            Ok(_) => panic!("connect should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, UpstreamError::Transport(_)), "got {err:?}");
    }
}

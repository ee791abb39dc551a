// ============================
// live-relay-lib/src/lib.rs
// ============================
//! Core functionality for the live event relay server.
//!
//! Browser clients connect over a WebSocket, ask to follow a streamer's
//! channel, and receive that channel's chat, gift, stats and social events.
//! One upstream connection per channel is shared by every client following it.

pub mod config;
pub mod error;
pub mod metrics;
pub mod relay_actor;
pub mod session;
pub mod upstream;
pub mod ws_router;

use std::sync::Arc;

use crate::config::Settings;
use crate::relay_actor::{RelayConfig, RelayHandle};
use crate::upstream::UpstreamConnector;

pub use live_relay_common as protocol;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Relay coordinator
    pub relay: RelayHandle,
    /// Settings the server was started with
    pub settings: Arc<Settings>,
}

impl AppState {
    /// Create a new application state, spawning the relay coordinator
    pub fn new(settings: Settings, connector: Arc<dyn UpstreamConnector>) -> Self {
        let relay = RelayHandle::spawn(RelayConfig::from(&settings), connector);
        Self {
            relay,
            settings: Arc::new(settings),
        }
    }
}

// ============================
// live-relay-lib/src/upstream/mod.rs
// ============================
//! One connection to one channel's live-event feed.
//!
//! An [`UpstreamClient`] connects in the background, normalizes every raw
//! event into an [`Envelope`] and hands it to the handler it was opened with.
//! Lifecycle: `connecting -> connected -> (ended | error)`. Once a terminal
//! state is reached the client emits nothing further.

pub mod connector;
pub mod wire;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use live_relay_common::{Channel, Envelope, LifecycleState, RelayEvent};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

pub use connector::{UpstreamConnector, UpstreamError, UpstreamFeed, WebSocketConnector};
pub use wire::{Normalized, WireEvent};

use crate::metrics::{UPSTREAM_CLOSED, UPSTREAM_FAILED, UPSTREAM_OPENED};

/// Identifies one upstream connection attempt for the lifetime of the process
pub type UpstreamId = u64;

/// Receives every envelope a client produces, in order.
pub type EventHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// State shared between the client handle and its background task
struct Shared {
    channel: Channel,
    state: Mutex<LifecycleState>,
    handler: EventHandler,
}

impl Shared {
    fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    /// Deliver a data event unless the client is already terminal.
    ///
    /// The lock is held across the handler call so nothing can be emitted
    /// after the terminal envelope.
    fn emit(&self, event: RelayEvent) -> bool {
        let state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        (self.handler)(Envelope::new(self.channel.clone(), event));
        true
    }

    fn mark_connected(&self) -> bool {
        let mut state = self.state.lock();
        if *state != LifecycleState::Connecting {
            return false;
        }
        *state = LifecycleState::Connected;
        (self.handler)(Envelope::connected(self.channel.clone()));
        true
    }

    /// Move to a terminal state and emit its envelope exactly once
    fn finish(&self, terminal: LifecycleState, envelope: Envelope) -> bool {
        debug_assert!(terminal.is_terminal());
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = terminal;
        (self.handler)(envelope);
        true
    }

    fn fail(&self, err: &UpstreamError) {
        if self.finish(
            LifecycleState::Error,
            Envelope::error(self.channel.clone(), err.to_string()),
        ) {
            warn!(channel = %self.channel, error = %err, "upstream failed");
            counter!(UPSTREAM_FAILED).increment(1);
        }
    }

    fn end(&self, reason: &str) {
        if self.finish(
            LifecycleState::Ended,
            Envelope::disconnected(self.channel.clone(), reason),
        ) {
            info!(channel = %self.channel, reason, "upstream ended");
        }
    }
}

/// Handle to one upstream connection. Dropping it closes the connection.
pub struct UpstreamClient {
    id: UpstreamId,
    shared: Arc<Shared>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl UpstreamClient {
    /// Start connecting to `channel` without waiting for the handshake.
    ///
    /// Failures never surface here; they show up as the `error` state plus one
    /// `error` envelope passed to `handler`.
    pub fn open(
        id: UpstreamId,
        channel: Channel,
        connector: Arc<dyn UpstreamConnector>,
        connect_timeout: Duration,
        handler: EventHandler,
    ) -> Self {
        let shared = Arc::new(Shared {
            channel,
            state: Mutex::new(LifecycleState::Connecting),
            handler,
        });
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        debug!(upstream = id, channel = %shared.channel, "opening upstream");
        counter!(UPSTREAM_OPENED).increment(1);
        tokio::spawn(run(
            Arc::clone(&shared),
            connector,
            connect_timeout,
            shutdown_rx,
        ));

        Self {
            id,
            shared,
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn id(&self) -> UpstreamId {
        self.id
    }

    pub fn channel(&self) -> &Channel {
        &self.shared.channel
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// End the connection and emit a final `disconnected` envelope.
    ///
    /// A no-op from `ended` or `error`; safe to call any number of times.
    pub fn close(&mut self) {
        self.shared.end("closed by relay");

        // The task observes the dropped sender and exits on its own
        if self.shutdown.take().is_some() {
            counter!(UPSTREAM_CLOSED).increment(1);
            debug!(upstream = self.id, channel = %self.shared.channel, "upstream closed");
        }
    }
}

impl Drop for UpstreamClient {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run(
    shared: Arc<Shared>,
    connector: Arc<dyn UpstreamConnector>,
    connect_timeout: Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let attempt = tokio::time::timeout(connect_timeout, connector.connect(&shared.channel));
    let mut feed = tokio::select! {
        _ = &mut shutdown => return,
        outcome = attempt => match outcome {
            Ok(Ok(feed)) => feed,
            Ok(Err(err)) => {
                shared.fail(&err);
                return;
            },
            Err(_) => {
                shared.fail(&UpstreamError::Timeout(connect_timeout));
                return;
            },
        },
    };

    if !shared.mark_connected() {
        return;
    }
    info!(channel = %shared.channel, "upstream connected");

    loop {
        tokio::select! {
            _ = &mut shutdown => return,
            next = feed.next() => match next {
                Some(Ok(wire)) => match wire.normalize() {
                    Normalized::Event(event) => {
                        if !shared.emit(event) {
                            return;
                        }
                    },
                    Normalized::StreamEnd => {
                        shared.end("stream ended");
                        return;
                    },
                    Normalized::Dropped => trace!(channel = %shared.channel, "dropped unknown upstream event"),
                },
                Some(Err(err)) => {
                    shared.fail(&err);
                    return;
                },
                None => {
                    shared.end("stream ended");
                    return;
                },
            },
        }
    }
}

// ============================
// live-relay-lib/src/session.rs
// ============================
//! Relay-facing state of one browser connection.
use std::fmt;

use live_relay_common::{Channel, Envelope};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Unique per downstream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What `bind` changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// Already bound to this channel, or the session is closed
    Unchanged,
    /// Now bound; `previous` is the channel that was left, if any
    Bound { previous: Option<Channel> },
}

/// Fate of an enqueued envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Outbound queue full; the envelope is gone
    Dropped,
    /// The socket writer is gone; the session should be cleaned up
    Closed,
}

pub struct ClientSession {
    id: SessionId,
    channel: Option<Channel>,
    outbound: mpsc::Sender<Envelope>,
    closed: bool,
}

impl ClientSession {
    pub fn new(id: SessionId, outbound: mpsc::Sender<Envelope>) -> Self {
        Self {
            id,
            channel: None,
            outbound,
            closed: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bind to `channel`, leaving any other channel first.
    pub fn bind(&mut self, channel: Channel) -> Binding {
        if self.closed || self.channel.as_ref() == Some(&channel) {
            return Binding::Unchanged;
        }
        let previous = self.channel.replace(channel);
        Binding::Bound { previous }
    }

    /// Clear the binding, returning the channel that was bound.
    pub fn unbind(&mut self) -> Option<Channel> {
        self.channel.take()
    }

    /// Queue an envelope for the socket writer. Never waits.
    pub fn enqueue(&self, envelope: Envelope) -> Delivery {
        if self.closed {
            return Delivery::Closed;
        }
        match self.outbound.try_send(envelope) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Mark the session terminal and unbind it. Pending envelopes are not
    /// flushed. Only the first call returns the channel.
    pub fn close(&mut self) -> Option<Channel> {
        if self.closed {
            return None;
        }
        self.closed = true;
        self.unbind()
    }
}

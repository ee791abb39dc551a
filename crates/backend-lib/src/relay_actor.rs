// ============================
// live-relay-lib/src/relay_actor.rs
// ============================
//! Relay coordinator.
//!
//! A single actor task owns the channel table and the session table. Control
//! requests from sockets and events from upstream clients all arrive on the
//! same command queue, so every mutation for a channel is applied in order and
//! an event emitted after a session unbinds is never delivered to it.
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use live_relay_common::{Channel, Envelope, LifecycleState, RelayEvent};
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

use crate::config::Settings;
use crate::error::AppError;
use crate::metrics::{ENVELOPE_DROPPED, ENVELOPE_RELAYED, UPSTREAM_ACTIVE};
use crate::session::{Binding, ClientSession, Delivery, SessionId};
use crate::upstream::{EventHandler, UpstreamClient, UpstreamConnector, UpstreamId};

/// Message sent *into* the actor
enum RelayCmd {
    Open {
        outbound: mpsc::Sender<Envelope>,
        resp_tx: oneshot::Sender<SessionId>,
    },
    Connect {
        session: SessionId,
        channel: Channel,
    },
    Disconnect {
        session: SessionId,
    },
    Closed {
        session: SessionId,
    },
    Upstream {
        upstream: UpstreamId,
        envelope: Envelope,
    },
    Snapshot {
        resp_tx: oneshot::Sender<RelaySnapshot>,
    },
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bound on each upstream handshake
    pub connect_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
        }
    }
}

impl From<&Settings> for RelayConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            connect_timeout: settings.upstream.connect_timeout(),
        }
    }
}

/// Point-in-time view of the relay tables
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RelaySnapshot {
    pub sessions: usize,
    pub channels: Vec<ChannelSnapshot>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub channel: Channel,
    pub upstream: UpstreamId,
    pub state: LifecycleState,
    pub subscribers: Vec<SessionId>,
}

impl RelaySnapshot {
    pub fn channel(&self, channel: &Channel) -> Option<&ChannelSnapshot> {
        self.channels.iter().find(|c| &c.channel == channel)
    }
}

/// Handle that other components keep. Cloning is cheap; the actor stops
/// once every handle is gone.
#[derive(Clone)]
pub struct RelayHandle {
    cmd_tx: mpsc::UnboundedSender<RelayCmd>,
}

impl RelayHandle {
    /// Spawn the coordinator on the current runtime
    pub fn spawn(config: RelayConfig, connector: Arc<dyn UpstreamConnector>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = RelayActor::new(config, connector, cmd_tx.downgrade());
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    /// Register a new downstream connection whose envelopes go to `outbound`
    pub async fn open_session(
        &self,
        outbound: mpsc::Sender<Envelope>,
    ) -> Result<SessionId, AppError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx.send(RelayCmd::Open { outbound, resp_tx })?;
        Ok(resp_rx.await?)
    }

    pub fn connect(&self, session: SessionId, channel: Channel) -> Result<(), AppError> {
        self.cmd_tx.send(RelayCmd::Connect { session, channel })?;
        Ok(())
    }

    pub fn disconnect(&self, session: SessionId) -> Result<(), AppError> {
        self.cmd_tx.send(RelayCmd::Disconnect { session })?;
        Ok(())
    }

    /// Socket is gone. Never fails, never waits; unknown ids are ignored.
    pub fn session_closed(&self, session: SessionId) {
        let _ = self.cmd_tx.send(RelayCmd::Closed { session });
    }

    pub async fn snapshot(&self) -> Result<RelaySnapshot, AppError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx.send(RelayCmd::Snapshot { resp_tx })?;
        Ok(resp_rx.await?)
    }
}

struct ChannelEntry {
    upstream: UpstreamClient,
    subscribers: BTreeSet<SessionId>,
    /// The upstream's `connected` envelope has been fanned out
    announced: bool,
}

/// Creates upstream clients wired back into the actor's queue
struct UpstreamFactory {
    config: RelayConfig,
    connector: Arc<dyn UpstreamConnector>,
    cmd_tx: mpsc::WeakUnboundedSender<RelayCmd>,
    next_id: UpstreamId,
}

impl UpstreamFactory {
    fn open(&mut self, channel: Channel) -> UpstreamClient {
        self.next_id += 1;
        let upstream = self.next_id;
        let cmd_tx = self.cmd_tx.clone();
        let handler: EventHandler = Arc::new(move |envelope| {
            if let Some(tx) = cmd_tx.upgrade() {
                let _ = tx.send(RelayCmd::Upstream { upstream, envelope });
            }
        });

        UpstreamClient::open(
            upstream,
            channel,
            Arc::clone(&self.connector),
            self.config.connect_timeout,
            handler,
        )
    }
}

struct RelayActor {
    factory: UpstreamFactory,
    channels: HashMap<Channel, ChannelEntry>,
    sessions: HashMap<SessionId, ClientSession>,
}

impl RelayActor {
    fn new(
        config: RelayConfig,
        connector: Arc<dyn UpstreamConnector>,
        cmd_tx: mpsc::WeakUnboundedSender<RelayCmd>,
    ) -> Self {
        RelayActor {
            factory: UpstreamFactory {
                config,
                connector,
                cmd_tx,
                next_id: 0,
            },
            channels: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RelayCmd>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                RelayCmd::Open { outbound, resp_tx } => {
                    let id = SessionId::new();
                    self.sessions.insert(id, ClientSession::new(id, outbound));
                    debug!(session = %id, "session opened");
                    let _ = resp_tx.send(id);
                },
                RelayCmd::Connect { session, channel } => self.handle_connect(session, channel),
                RelayCmd::Disconnect { session } => self.handle_disconnect(session),
                RelayCmd::Closed { session } => self.handle_session_closed(session),
                RelayCmd::Upstream { upstream, envelope } => {
                    self.handle_upstream_event(upstream, envelope);
                },
                RelayCmd::Snapshot { resp_tx } => {
                    let _ = resp_tx.send(self.snapshot());
                },
            }
        }

        self.shutdown();
    }

    /// Close every upstream this actor owns
    fn shutdown(&mut self) {
        debug!(channels = self.channels.len(), "relay stopping, closing upstreams");
        gauge!(UPSTREAM_ACTIVE).decrement(self.channels.len() as f64);
        self.channels.clear();
    }

    fn handle_connect(&mut self, session_id: SessionId, channel: Channel) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            debug!(session = %session_id, "connect for unknown session");
            return;
        };

        match session.bind(channel.clone()) {
            Binding::Unchanged => {
                let live = self
                    .channels
                    .get(&channel)
                    .is_some_and(|entry| !entry.upstream.is_terminal());
                if live {
                    trace!(session = %session_id, %channel, "already bound");
                    return;
                }
            },
            Binding::Bound { previous } => {
                if let Some(previous) = previous {
                    session.enqueue(Envelope::disconnected(previous.clone(), "switched channel"));
                    self.release(&previous, session_id);
                }
            },
        }

        self.subscribe(session_id, channel);
    }

    /// Add `session_id` to the channel, opening an upstream when there is no
    /// usable one, and greet the session with the upstream's current state.
    fn subscribe(&mut self, session_id: SessionId, channel: Channel) {
        let entry = match self.channels.entry(channel.clone()) {
            Entry::Vacant(slot) => {
                let upstream = self.factory.open(channel.clone());
                gauge!(UPSTREAM_ACTIVE).increment(1.0);
                info!(%channel, upstream = upstream.id(), "opened upstream");
                slot.insert(ChannelEntry {
                    upstream,
                    subscribers: BTreeSet::new(),
                    announced: false,
                })
            },
            Entry::Occupied(slot) => {
                let entry = slot.into_mut();
                if entry.upstream.is_terminal() {
                    let fresh = self.factory.open(channel.clone());
                    info!(%channel, upstream = fresh.id(), "reopening terminal upstream");
                    // Dropping the old client closes it
                    entry.upstream = fresh;
                    entry.announced = false;
                }
                entry
            },
        };
        entry.subscribers.insert(session_id);

        let greeting = match entry.upstream.state() {
            LifecycleState::Connected if entry.announced => Envelope::connected(channel),
            // `connected` is still queued and reaches this session with the fan-out
            LifecycleState::Connected => Envelope::status(channel, LifecycleState::Connecting),
            state => Envelope::status(channel, state),
        };
        self.deliver(session_id, greeting);
    }

    fn handle_disconnect(&mut self, session_id: SessionId) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if let Some(channel) = session.unbind() {
            session.enqueue(Envelope::disconnected(channel.clone(), "client requested"));
            self.release(&channel, session_id);
        }
    }

    fn handle_session_closed(&mut self, session_id: SessionId) {
        let Some(mut session) = self.sessions.remove(&session_id) else {
            return;
        };
        if let Some(channel) = session.close() {
            self.release(&channel, session_id);
        }
        debug!(session = %session_id, "session closed");
    }

    /// Drop one subscriber; close the upstream when it was the last one
    fn release(&mut self, channel: &Channel, session_id: SessionId) {
        let Some(entry) = self.channels.get_mut(channel) else {
            return;
        };
        entry.subscribers.remove(&session_id);
        if entry.subscribers.is_empty() {
            if let Some(mut entry) = self.channels.remove(channel) {
                entry.upstream.close();
                gauge!(UPSTREAM_ACTIVE).decrement(1.0);
                info!(%channel, upstream = entry.upstream.id(), "released upstream");
            }
        }
    }

    fn handle_upstream_event(&mut self, upstream: UpstreamId, envelope: Envelope) {
        let subscribers: Vec<SessionId> = match self.channels.get_mut(&envelope.channel) {
            Some(entry) if entry.upstream.id() == upstream => {
                if matches!(envelope.event, RelayEvent::Connected(_)) {
                    entry.announced = true;
                }
                entry.subscribers.iter().copied().collect()
            },
            _ => {
                trace!(upstream, kind = envelope.event.kind(), "discarding event from stale upstream");
                return;
            },
        };

        for session_id in subscribers {
            self.deliver(session_id, envelope.clone());
        }
    }

    /// Enqueue to one session, cleaning it up if its socket writer is gone
    fn deliver(&mut self, session_id: SessionId, envelope: Envelope) {
        let delivery = match self.sessions.get(&session_id) {
            Some(session) => session.enqueue(envelope),
            None => Delivery::Closed,
        };
        match delivery {
            Delivery::Queued => counter!(ENVELOPE_RELAYED).increment(1),
            Delivery::Dropped => {
                counter!(ENVELOPE_DROPPED).increment(1);
                debug!(session = %session_id, "outbound queue full, dropped envelope");
            },
            Delivery::Closed => self.handle_session_closed(session_id),
        }
    }

    fn snapshot(&self) -> RelaySnapshot {
        let mut channels: Vec<ChannelSnapshot> = self
            .channels
            .iter()
            .map(|(channel, entry)| ChannelSnapshot {
                channel: channel.clone(),
                upstream: entry.upstream.id(),
                state: entry.upstream.state(),
                subscribers: entry.subscribers.iter().copied().collect(),
            })
            .collect();
        channels.sort_by(|a, b| a.channel.cmp(&b.channel));

        RelaySnapshot {
            sessions: self.sessions.len(),
            channels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{UpstreamError, UpstreamFeed};
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use metrics::{
        Counter, Gauge, GaugeFn, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit,
    };
    use parking_lot::Mutex;

    /// Connects at once to a feed that never yields
    struct Idle;

    #[async_trait]
    impl UpstreamConnector for Idle {
        async fn connect(&self, _channel: &Channel) -> Result<UpstreamFeed, UpstreamError> {
            Ok(futures_util::stream::pending().boxed())
        }
    }

    fn actor() -> (RelayActor, mpsc::UnboundedReceiver<RelayCmd>, mpsc::UnboundedSender<RelayCmd>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = RelayActor::new(RelayConfig::default(), Arc::new(Idle), cmd_tx.downgrade());
        (actor, cmd_rx, cmd_tx)
    }

    fn join(actor: &mut RelayActor) -> (SessionId, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(8);
        let id = SessionId::new();
        actor.sessions.insert(id, ClientSession::new(id, tx));
        (id, rx)
    }

    fn next_upstream(cmd: RelayCmd) -> (UpstreamId, Envelope) {
        match cmd {
            RelayCmd::Upstream { upstream, envelope } => (upstream, envelope),
            _ => panic!("expected an upstream event"),
        }
    }

    #[tokio::test]
    async fn test_joiner_before_connected_fanout_gets_it_once() {
        let (mut actor, mut cmd_rx, _cmd_tx) = actor();
        let channel = Channel::parse("bob").unwrap();
        let (s1, mut rx1) = join(&mut actor);
        let (s2, mut rx2) = join(&mut actor);

        actor.handle_connect(s1, channel.clone());
        assert_eq!(
            rx1.try_recv().unwrap(),
            Envelope::status(channel.clone(), LifecycleState::Connecting)
        );

        // The upstream is connected but its envelope is still in the queue
        let (upstream, connected) = next_upstream(cmd_rx.recv().await.unwrap());
        assert_eq!(actor.channels[&channel].upstream.state(), LifecycleState::Connected);

        actor.handle_connect(s2, channel.clone());
        assert_eq!(
            rx2.try_recv().unwrap(),
            Envelope::status(channel.clone(), LifecycleState::Connecting)
        );

        actor.handle_upstream_event(upstream, connected);
        assert_eq!(rx1.try_recv().unwrap(), Envelope::connected(channel.clone()));
        assert_eq!(rx2.try_recv().unwrap(), Envelope::connected(channel.clone()));
        assert!(rx2.try_recv().is_err());

        // Later joiners are greeted with `connected` directly
        let (s3, mut rx3) = join(&mut actor);
        actor.handle_connect(s3, channel.clone());
        assert_eq!(rx3.try_recv().unwrap(), Envelope::connected(channel));
        assert!(rx3.try_recv().is_err());
    }

    #[derive(Default)]
    struct Level(Mutex<f64>);

    impl GaugeFn for Level {
        fn increment(&self, value: f64) {
            *self.0.lock() += value;
        }

        fn decrement(&self, value: f64) {
            *self.0.lock() -= value;
        }

        fn set(&self, value: f64) {
            *self.0.lock() = value;
        }
    }

    /// Tracks the active-upstream gauge only
    #[derive(Default)]
    struct ActiveUpstreams(Arc<Level>);

    impl Recorder for ActiveUpstreams {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, _: &Key, _: &Metadata<'_>) -> Counter {
            Counter::noop()
        }

        fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
            if key.name() == UPSTREAM_ACTIVE {
                Gauge::from_arc(Arc::clone(&self.0))
            } else {
                Gauge::noop()
            }
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    #[tokio::test]
    async fn test_shutdown_only_subtracts_own_upstreams() {
        let recorder = ActiveUpstreams::default();
        let (mut actor, _cmd_rx, _cmd_tx) = actor();
        let mut queues = Vec::new();

        metrics::with_local_recorder(&recorder, || {
            // Upstreams held by another relay in the same process
            gauge!(UPSTREAM_ACTIVE).increment(3.0);

            for name in ["carol", "dave"] {
                let (session, rx) = join(&mut actor);
                actor.handle_connect(session, Channel::parse(name).unwrap());
                queues.push(rx);
            }
            assert_eq!(*recorder.0 .0.lock(), 5.0);

            actor.shutdown();
        });

        assert!(actor.channels.is_empty());
        assert_eq!(*recorder.0 .0.lock(), 3.0);
    }
}

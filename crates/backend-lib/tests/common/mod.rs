//! Test utilities for relay tests
//!
//! `ScriptedConnector` stands in for the live-event source: tests decide per
//! channel whether a connect is rejected, hangs, or yields a feed they can
//! push wire events into, and can observe how often feeds were opened and
//! closed.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use live_relay::protocol::{Channel, Envelope, RelayEvent};
use live_relay::relay_actor::{RelayConfig, RelayHandle};
use live_relay::session::SessionId;
use live_relay::upstream::{UpstreamConnector, UpstreamError, UpstreamFeed, WireEvent};
use parking_lot::Mutex;
use tokio::sync::mpsc;

type FeedTx = mpsc::UnboundedSender<Result<WireEvent, UpstreamError>>;

#[derive(Default)]
struct Inner {
    rejected: HashMap<Channel, String>,
    hanging: HashSet<Channel>,
    feeds: HashMap<Channel, FeedTx>,
    connects: HashMap<Channel, usize>,
    closes: HashMap<Channel, usize>,
}

#[derive(Clone, Default)]
pub struct ScriptedConnector {
    inner: Arc<Mutex<Inner>>,
}

/// Counts a feed as closed when the relay drops its stream
struct CloseGuard {
    channel: Channel,
    inner: Arc<Mutex<Inner>>,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        *self.inner.lock().closes.entry(self.channel.clone()).or_default() += 1;
    }
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(&self, channel: &str, reason: &str) {
        self.inner
            .lock()
            .rejected
            .insert(ch(channel), reason.to_string());
    }

    pub fn accept(&self, channel: &str) {
        let mut inner = self.inner.lock();
        inner.rejected.remove(&ch(channel));
        inner.hanging.remove(&ch(channel));
    }

    pub fn hang(&self, channel: &str) {
        self.inner.lock().hanging.insert(ch(channel));
    }

    pub fn connects(&self, channel: &str) -> usize {
        self.inner.lock().connects.get(&ch(channel)).copied().unwrap_or(0)
    }

    pub fn closes(&self, channel: &str) -> usize {
        self.inner.lock().closes.get(&ch(channel)).copied().unwrap_or(0)
    }

    /// Emit a wire event on the channel's most recent feed
    pub fn push(&self, channel: &str, event: WireEvent) {
        let inner = self.inner.lock();
        let feed = inner.feeds.get(&ch(channel)).expect("channel has an open feed");
        feed.send(Ok(event)).expect("feed still consumed");
    }

    pub fn fail(&self, channel: &str, err: UpstreamError) {
        let inner = self.inner.lock();
        let feed = inner.feeds.get(&ch(channel)).expect("channel has an open feed");
        feed.send(Err(err)).expect("feed still consumed");
    }

    /// Finish the channel's feed as if the broadcast stopped
    pub fn end(&self, channel: &str) {
        self.inner.lock().feeds.remove(&ch(channel));
    }
}

#[async_trait]
impl UpstreamConnector for ScriptedConnector {
    async fn connect(&self, channel: &Channel) -> Result<UpstreamFeed, UpstreamError> {
        let hang = {
            let mut inner = self.inner.lock();
            *inner.connects.entry(channel.clone()).or_default() += 1;
            if let Some(reason) = inner.rejected.get(channel) {
                return Err(UpstreamError::Rejected(reason.clone()));
            }
            inner.hanging.contains(channel)
        };
        if hang {
            return futures_util::future::pending().await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().feeds.insert(channel.clone(), tx);
        let guard = CloseGuard {
            channel: channel.clone(),
            inner: Arc::clone(&self.inner),
        };

        let feed = futures_util::stream::unfold((rx, guard), |(mut rx, guard)| async move {
            let item = rx.recv().await?;
            Some((item, (rx, guard)))
        });
        Ok(feed.boxed())
    }
}

pub fn ch(name: &str) -> Channel {
    Channel::parse(name).unwrap()
}

pub fn chat(comment: &str) -> WireEvent {
    WireEvent::Chat {
        unique_id: "viewer".to_string(),
        comment: comment.to_string(),
    }
}

pub fn relay(connector: &ScriptedConnector) -> RelayHandle {
    let config = RelayConfig {
        connect_timeout: Duration::from_millis(200),
    };
    RelayHandle::spawn(config, Arc::new(connector.clone()))
}

/// A downstream connection as the relay sees it
pub struct TestSession {
    pub id: SessionId,
    pub rx: mpsc::Receiver<Envelope>,
}

impl TestSession {
    pub async fn open(relay: &RelayHandle) -> Self {
        Self::with_capacity(relay, 32).await
    }

    /// Session whose outbound queue holds at most `capacity` envelopes
    pub async fn with_capacity(relay: &RelayHandle, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let id = relay.open_session(tx).await.expect("relay running");
        Self { id, rx }
    }

    /// Next event, failing the test after two seconds
    pub async fn next(&mut self) -> RelayEvent {
        tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("envelope arrives in time")
            .expect("session queue open")
            .event
    }

    /// Assert nothing else arrives for a short while
    pub async fn assert_quiet(&mut self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(envelope) = self.rx.try_recv() {
            panic!("unexpected envelope {envelope:?}");
        }
    }
}

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

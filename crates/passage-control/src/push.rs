//! Push bus: fan-out of tunnel events to authenticated subscribers.
//!
//! Each subscriber connection is bound to an owner at registration
//! (the embedding layer authenticates first) and gets a bounded send
//! buffer. Publishers never wait: a subscriber that cannot keep up is
//! dropped. Idle subscribers are probed with heartbeats and reaped
//! after repeated silence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use passage_proto::messages::{CHANNEL_METRICS, CHANNEL_TUNNEL_STATE};
use passage_proto::{ClientMessage, OwnerId, PushMessage};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handle identifying one subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Outbound half of a subscriber connection.
#[async_trait]
pub trait PushSink: Send + 'static {
    async fn send(&mut self, msg: &PushMessage) -> std::io::Result<()>;
    async fn close(&mut self);
}

/// Inbound half of a subscriber connection. `None` means the
/// connection is gone.
#[async_trait]
pub trait PushSource: Send + 'static {
    async fn recv(&mut self) -> Option<ClientMessage>;
}

/// A subscriber connection that can be split into independent halves.
pub trait PushSocket: Send + 'static {
    type Sink: PushSink;
    type Source: PushSource;

    fn split(self) -> (Self::Sink, Self::Source);
}

/// Bus tuning. The defaults match production behaviour; tests shrink
/// the timers.
#[derive(Debug, Clone)]
pub struct PushBusConfig {
    /// Per-subscriber send buffer. A full buffer drops the subscriber.
    pub buffer: usize,
    /// Heartbeat probe period.
    pub heartbeat: Duration,
    /// Consecutive unanswered probes tolerated.
    pub probe_miss_limit: u32,
    /// Subscribers silent for this long are reaped.
    pub stale_after: Duration,
    /// How often the reaper sweeps.
    pub sweep_interval: Duration,
}

impl Default for PushBusConfig {
    fn default() -> Self {
        Self {
            buffer: 256,
            heartbeat: Duration::from_secs(54),
            probe_miss_limit: 3,
            stale_after: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

struct Subscriber {
    owner: OwnerId,
    tx: mpsc::Sender<PushMessage>,
    last_seen: Arc<Mutex<DateTime<Utc>>>,
    missed_probes: Arc<AtomicU32>,
    channels: Arc<RwLock<HashSet<String>>>,
    cancel: CancellationToken,
}

struct BusInner {
    config: PushBusConfig,
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
}

/// Multi-subscriber, owner-affine event broadcaster.
#[derive(Clone)]
pub struct PushBus {
    inner: Arc<BusInner>,
}

impl PushBus {
    pub fn new(config: PushBusConfig) -> Self {
        let inner = Arc::new(BusInner {
            config,
            subscribers: RwLock::new(HashMap::new()),
        });
        tokio::spawn(reaper(Arc::downgrade(&inner)));
        Self { inner }
    }

    /// Register an already-authenticated subscriber connection bound to
    /// `owner`. Sends a welcome message and starts the connection's
    /// writer, reader, and heartbeat handling.
    pub fn register<S: PushSocket>(&self, owner: OwnerId, socket: S) -> SubscriptionId {
        let id = SubscriptionId::generate();
        let (sink, source) = socket.split();
        let (tx, rx) = mpsc::channel(self.inner.config.buffer);
        let last_seen = Arc::new(Mutex::new(Utc::now()));
        let missed_probes = Arc::new(AtomicU32::new(0));
        let channels: Arc<RwLock<HashSet<String>>> = Arc::new(RwLock::new(
            [CHANNEL_TUNNEL_STATE, CHANNEL_METRICS]
                .into_iter()
                .map(str::to_string)
                .collect(),
        ));
        let cancel = CancellationToken::new();

        let subscriber = Subscriber {
            owner,
            tx: tx.clone(),
            last_seen: last_seen.clone(),
            missed_probes: missed_probes.clone(),
            channels: channels.clone(),
            cancel: cancel.clone(),
        };
        self.inner
            .subscribers
            .write()
            .unwrap()
            .insert(id, subscriber);

        let _ = tx.try_send(PushMessage::welcome(&id.to_string()));

        tokio::spawn(write_pump(
            sink,
            rx,
            self.inner.config.clone(),
            missed_probes.clone(),
            cancel.clone(),
            Arc::downgrade(&self.inner),
            id,
        ));
        tokio::spawn(read_pump(
            source,
            tx,
            channels,
            last_seen,
            missed_probes,
            cancel,
            Arc::downgrade(&self.inner),
            id,
        ));

        info!(subscription = %id, %owner, "push subscriber registered");
        id
    }

    /// Validate a presented token and register the connection for the
    /// owner it authenticates. Cache lookups play no part here; the
    /// authenticator performs the real verification.
    pub async fn register_authenticated<S: PushSocket>(
        &self,
        authenticator: &dyn crate::auth::TokenAuthenticator,
        token: &str,
        socket: S,
    ) -> Result<SubscriptionId, crate::auth::AuthError> {
        let owner = authenticator.validate_token(token).await?;
        Ok(self.register(owner, socket))
    }

    pub fn unregister(&self, id: SubscriptionId) {
        remove_subscriber(&self.inner, id, "unregistered");
    }

    /// Deliver an event to every subscriber of one owner.
    pub fn to_owner(&self, owner: OwnerId, event: &PushMessage) {
        self.deliver(event, |sub| sub.owner == owner);
    }

    /// Deliver an event to every subscriber.
    pub fn to_all(&self, event: &PushMessage) {
        self.deliver(event, |_| true);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().unwrap().len()
    }

    pub fn owner_subscriber_count(&self, owner: OwnerId) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap()
            .values()
            .filter(|sub| sub.owner == owner)
            .count()
    }

    fn deliver(&self, event: &PushMessage, eligible: impl Fn(&Subscriber) -> bool) {
        let channel = channel_of(&event.kind);
        let mut dropped = Vec::new();
        {
            let subscribers = self.inner.subscribers.read().unwrap();
            for (id, sub) in subscribers.iter() {
                if !eligible(sub) {
                    continue;
                }
                if let Some(channel) = channel {
                    if !sub.channels.read().unwrap().contains(channel) {
                        continue;
                    }
                }
                match sub.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(subscription = %id, "send buffer full, dropping subscriber");
                        dropped.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(*id),
                }
            }
        }
        for id in dropped {
            remove_subscriber(&self.inner, id, "send buffer overflow");
        }
    }
}

impl std::fmt::Debug for PushBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Which subscription channel an event kind belongs to. Events outside
/// the toggleable channels are always delivered.
fn channel_of(kind: &str) -> Option<&'static str> {
    match kind {
        "tunnel-state" => Some(CHANNEL_TUNNEL_STATE),
        "metrics-update" => Some(CHANNEL_METRICS),
        _ => None,
    }
}

fn remove_subscriber(inner: &Arc<BusInner>, id: SubscriptionId, reason: &str) {
    let removed = inner.subscribers.write().unwrap().remove(&id);
    if let Some(sub) = removed {
        sub.cancel.cancel();
        debug!(subscription = %id, reason, "push subscriber removed");
    }
}

async fn write_pump<K: PushSink>(
    mut sink: K,
    mut rx: mpsc::Receiver<PushMessage>,
    config: PushBusConfig,
    missed_probes: Arc<AtomicU32>,
    cancel: CancellationToken,
    bus: Weak<BusInner>,
    id: SubscriptionId,
) {
    let mut probe = tokio::time::interval(config.heartbeat);
    probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    probe.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = rx.recv() => match maybe {
                Some(msg) => {
                    if sink.send(&msg).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = probe.tick() => {
                if missed_probes.load(Ordering::SeqCst) >= config.probe_miss_limit {
                    warn!(subscription = %id, "missed {} heartbeat probes, dropping", config.probe_miss_limit);
                    break;
                }
                missed_probes.fetch_add(1, Ordering::SeqCst);
                if sink.send(&PushMessage::ping()).await.is_err() {
                    break;
                }
            }
        }
    }

    sink.close().await;
    cancel.cancel();
    if let Some(inner) = bus.upgrade() {
        remove_subscriber(&inner, id, "writer ended");
    }
}

#[allow(clippy::too_many_arguments)]
async fn read_pump<R: PushSource>(
    mut source: R,
    tx: mpsc::Sender<PushMessage>,
    channels: Arc<RwLock<HashSet<String>>>,
    last_seen: Arc<Mutex<DateTime<Utc>>>,
    missed_probes: Arc<AtomicU32>,
    cancel: CancellationToken,
    bus: Weak<BusInner>,
    id: SubscriptionId,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = source.recv() => match maybe {
                Some(msg) => msg,
                None => break,
            },
        };

        *last_seen.lock().unwrap() = Utc::now();
        missed_probes.store(0, Ordering::SeqCst);

        match msg {
            ClientMessage::Subscribe { channel } => {
                if channel_known(&channel) {
                    channels.write().unwrap().insert(channel);
                } else {
                    debug!(subscription = %id, channel, "subscribe to unknown channel ignored");
                }
            }
            ClientMessage::Unsubscribe { channel } => {
                channels.write().unwrap().remove(&channel);
            }
            ClientMessage::Ping => {
                let _ = tx.try_send(PushMessage::pong());
            }
            ClientMessage::Pong => {}
            ClientMessage::Unknown => {
                debug!(subscription = %id, "unknown inbound message type ignored");
            }
        }
    }

    cancel.cancel();
    if let Some(inner) = bus.upgrade() {
        remove_subscriber(&inner, id, "reader ended");
    }
}

fn channel_known(channel: &str) -> bool {
    channel == CHANNEL_TUNNEL_STATE || channel == CHANNEL_METRICS
}

/// Periodically drop subscribers that went silent. Runs for the bus's
/// lifetime; stops once the bus is dropped.
async fn reaper(bus: Weak<BusInner>) {
    loop {
        let Some(inner) = bus.upgrade() else { break };
        let sweep = inner.config.sweep_interval;
        let stale_after =
            chrono::Duration::from_std(inner.config.stale_after).unwrap_or_else(|_| {
                chrono::Duration::seconds(300)
            });

        let cutoff = Utc::now() - stale_after;
        let stale: Vec<SubscriptionId> = inner
            .subscribers
            .read()
            .unwrap()
            .iter()
            .filter(|(_, sub)| *sub.last_seen.lock().unwrap() < cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            remove_subscriber(&inner, id, "stale connection");
        }

        drop(inner);
        tokio::time::sleep(sweep).await;
    }
}

/// Adapter presenting an upgraded WebSocket as a push socket. Events
/// travel as JSON text frames.
pub struct WsPushSocket<S> {
    inner: WebSocketStream<S>,
}

impl<S> WsPushSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self { inner }
    }
}

impl<S> PushSocket for WsPushSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Sink = WsPushSink<S>;
    type Source = WsPushSource<S>;

    fn split(self) -> (Self::Sink, Self::Source) {
        let (sink, stream) = self.inner.split();
        (WsPushSink { sink }, WsPushSource { stream })
    }
}

pub struct WsPushSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> PushSink for WsPushSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, msg: &PushMessage) -> std::io::Result<()> {
        let text = serde_json::to_string(msg).map_err(std::io::Error::other)?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(std::io::Error::other)
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

pub struct WsPushSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> PushSource for WsPushSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Option<ClientMessage> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(ClientMessage::parse(&text)),
                // Transport-level pongs count as liveness.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => return Some(ClientMessage::Pong),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use passage_proto::TunnelId;

    /// Channel-backed fake connection for bus tests.
    struct FakeSocket {
        out_tx: mpsc::UnboundedSender<PushMessage>,
        in_rx: mpsc::UnboundedReceiver<ClientMessage>,
    }

    struct FakeSink(mpsc::UnboundedSender<PushMessage>);
    struct FakeSource(mpsc::UnboundedReceiver<ClientMessage>);

    #[async_trait]
    impl PushSink for FakeSink {
        async fn send(&mut self, msg: &PushMessage) -> std::io::Result<()> {
            self.0
                .send(msg.clone())
                .map_err(|_| std::io::ErrorKind::BrokenPipe.into())
        }

        async fn close(&mut self) {}
    }

    #[async_trait]
    impl PushSource for FakeSource {
        async fn recv(&mut self) -> Option<ClientMessage> {
            self.0.recv().await
        }
    }

    impl PushSocket for FakeSocket {
        type Sink = FakeSink;
        type Source = FakeSource;

        fn split(self) -> (Self::Sink, Self::Source) {
            (FakeSink(self.out_tx), FakeSource(self.in_rx))
        }
    }

    fn fake_pair() -> (
        FakeSocket,
        mpsc::UnboundedReceiver<PushMessage>,
        mpsc::UnboundedSender<ClientMessage>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (FakeSocket { out_tx, in_rx }, out_rx, in_tx)
    }

    /// Source that never produces and never closes.
    struct SilentSource;

    #[async_trait]
    impl PushSource for SilentSource {
        async fn recv(&mut self) -> Option<ClientMessage> {
            futures_util::future::pending::<()>().await;
            unreachable!()
        }
    }

    fn test_config() -> PushBusConfig {
        PushBusConfig {
            buffer: 16,
            heartbeat: Duration::from_secs(60),
            probe_miss_limit: 3,
            stale_after: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }

    async fn next_kind(rx: &mut mpsc::UnboundedReceiver<PushMessage>) -> String {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("message in time")
            .expect("channel open")
            .kind
    }

    #[tokio::test]
    async fn test_welcome_then_owner_scoped_events_in_order() {
        let bus = PushBus::new(test_config());
        let owner = OwnerId::generate();
        let other = OwnerId::generate();

        let (socket, mut rx, _in_tx) = fake_pair();
        bus.register(owner, socket);
        assert_eq!(next_kind(&mut rx).await, "welcome");

        let tunnel = TunnelId::generate();
        bus.to_owner(owner, &PushMessage::tunnel_state(tunnel, "connecting"));
        bus.to_owner(other, &PushMessage::tunnel_state(tunnel, "should-not-arrive"));
        bus.to_owner(owner, &PushMessage::tunnel_state(tunnel, "active"));

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.data["state"], "connecting");
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.data["state"], "active");
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped_not_blocking() {
        let mut config = test_config();
        config.buffer = 2;
        let bus = PushBus::new(config);
        let owner = OwnerId::generate();

        // A sink that never completes simulates a stuck connection; the
        // source stays open but silent.
        struct StuckSink;
        #[async_trait]
        impl PushSink for StuckSink {
            async fn send(&mut self, _msg: &PushMessage) -> std::io::Result<()> {
                futures_util::future::pending::<()>().await;
                unreachable!()
            }
            async fn close(&mut self) {}
        }
        struct StuckSocket;
        impl PushSocket for StuckSocket {
            type Sink = StuckSink;
            type Source = SilentSource;
            fn split(self) -> (Self::Sink, Self::Source) {
                (StuckSink, SilentSource)
            }
        }

        bus.register(owner, StuckSocket);
        assert_eq!(bus.subscriber_count(), 1);

        // Fill the buffer past capacity; publishing never blocks.
        let tunnel = TunnelId::generate();
        for _ in 0..8 {
            bus.to_owner(owner, &PushMessage::tunnel_state(tunnel, "active"));
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_probes_drop_subscriber() {
        let mut config = test_config();
        config.heartbeat = Duration::from_millis(100);
        let bus = PushBus::new(config);

        // No pongs ever arrive from a silent source.
        struct SilentSocket(mpsc::UnboundedSender<PushMessage>);
        impl PushSocket for SilentSocket {
            type Sink = FakeSink;
            type Source = SilentSource;
            fn split(self) -> (Self::Sink, Self::Source) {
                (FakeSink(self.0), SilentSource)
            }
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        bus.register(OwnerId::generate(), SilentSocket(out_tx));
        assert_eq!(next_kind(&mut out_rx).await, "welcome");

        // Probes 1..=3 go out, then the fourth tick trips the limit.
        for _ in 0..3 {
            assert_eq!(next_kind(&mut out_rx).await, "ping");
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_filters_channel() {
        let bus = PushBus::new(test_config());
        let owner = OwnerId::generate();
        let (socket, mut rx, in_tx) = fake_pair();
        bus.register(owner, socket);
        assert_eq!(next_kind(&mut rx).await, "welcome");

        in_tx
            .send(ClientMessage::Unsubscribe {
                channel: CHANNEL_METRICS.to_string(),
            })
            .unwrap();
        // Give the reader a moment to apply the change.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let tunnel = TunnelId::generate();
        bus.to_owner(
            owner,
            &PushMessage::metrics_update(tunnel, serde_json::json!({})),
        );
        bus.to_owner(owner, &PushMessage::tunnel_state(tunnel, "active"));

        // Only the state event arrives.
        assert_eq!(next_kind(&mut rx).await, "tunnel-state");
    }

    #[tokio::test]
    async fn test_client_ping_gets_pong() {
        let bus = PushBus::new(test_config());
        let (socket, mut rx, in_tx) = fake_pair();
        bus.register(OwnerId::generate(), socket);
        assert_eq!(next_kind(&mut rx).await, "welcome");

        in_tx.send(ClientMessage::Ping).unwrap();
        assert_eq!(next_kind(&mut rx).await, "pong");
    }

    #[tokio::test]
    async fn test_register_authenticated_resolves_owner() {
        use crate::auth::{AuthError, StaticTokenAuthenticator};
        use passage_engine::SecretToken;

        let bus = PushBus::new(test_config());
        let owner = OwnerId::generate();
        let auth = StaticTokenAuthenticator::new()
            .with_token(SecretToken::new("0123456789abcdef"), owner);

        let (socket, mut rx, _in_tx) = fake_pair();
        bus.register_authenticated(&auth, "0123456789abcdef", socket)
            .await
            .unwrap();
        assert_eq!(next_kind(&mut rx).await, "welcome");
        assert_eq!(bus.owner_subscriber_count(owner), 1);

        let (socket, _rx, _in_tx2) = fake_pair();
        assert!(matches!(
            bus.register_authenticated(&auth, "wrong-token", socket).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_unregister_removes_subscriber() {
        let bus = PushBus::new(test_config());
        let (socket, mut rx, _in_tx) = fake_pair();
        let id = bus.register(OwnerId::generate(), socket);
        assert_eq!(next_kind(&mut rx).await, "welcome");
        assert_eq!(bus.subscriber_count(), 1);

        bus.unregister(id);
        assert_eq!(bus.subscriber_count(), 0);
    }
}

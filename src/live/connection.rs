//! Live Connection Manager
//! Mission: Never be silently un-subscribed
//!
//! Owns the persistent hub connection to the trackside provider. The state
//! machine is `Disconnected -> Connecting -> Connected <-> Reconnecting ->
//! Disconnected` and is observable through a `watch` channel, so transport
//! failures surface as state transitions rather than as errors to every
//! caller individually.
//!
//! Subscriptions are an explicit owned set. After a reconnect every entry
//! still in the set is re-issued before the manager settles back into
//! `Connected`; losing one would mean the client believes it is live while
//! receiving nothing.

use crate::errors::{PitwallError, Result};
use crate::live::envelope::{decode_envelope, dispatch, LiveEvent};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Reconnect attempts before surfacing `Disconnected` instead of retrying
/// forever silently.
const MAX_RECONNECT_ATTEMPTS: u32 = 8;

/// Explicit backoff schedule: immediate, 2s, 10s, 30s, then constant 30s.
/// Reproduced exactly in tests; do not fold into a formula with jitter.
pub fn backoff_delay(attempt: u32) -> Duration {
    match attempt {
        0 => Duration::ZERO,
        1 => Duration::from_secs(2),
        2 => Duration::from_secs(10),
        _ => Duration::from_secs(30),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// What a subscription is for. Event feed is session-wide; the other two
/// target a single car.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionKind {
    Event,
    ControlLog,
    InCar,
}

impl SubscriptionKind {
    fn hub_method(&self) -> &'static str {
        match self {
            SubscriptionKind::Event => "SubscribeToEvent",
            SubscriptionKind::ControlLog => "SubscribeToControlLog",
            SubscriptionKind::InCar => "SubscribeToInCar",
        }
    }

    fn hub_unsubscribe_method(&self) -> &'static str {
        match self {
            SubscriptionKind::Event => "UnsubscribeFromEvent",
            SubscriptionKind::ControlLog => "UnsubscribeFromControlLog",
            SubscriptionKind::InCar => "UnsubscribeFromInCar",
        }
    }
}

/// One live-channel subscription: an event id plus an optional car id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subscription {
    pub kind: SubscriptionKind,
    pub event_id: String,
    pub car_id: Option<String>,
}

impl Subscription {
    pub fn event(event_id: impl Into<String>) -> Self {
        Self {
            kind: SubscriptionKind::Event,
            event_id: event_id.into(),
            car_id: None,
        }
    }

    pub fn control_log(event_id: impl Into<String>, car_id: impl Into<String>) -> Self {
        Self {
            kind: SubscriptionKind::ControlLog,
            event_id: event_id.into(),
            car_id: Some(car_id.into()),
        }
    }

    pub fn in_car(event_id: impl Into<String>, car_id: impl Into<String>) -> Self {
        Self {
            kind: SubscriptionKind::InCar,
            event_id: event_id.into(),
            car_id: Some(car_id.into()),
        }
    }
}

/// Transport seam. Production is the WebSocket hub; tests script a fake to
/// drive disconnect/reconnect cycles deterministically.
#[async_trait]
pub trait LiveTransport: Send + Sync {
    /// Establish (or re-establish) the underlying connection.
    async fn connect(&self) -> Result<()>;
    /// Invoke the hub's subscribe procedure for one subscription.
    async fn subscribe(&self, sub: &Subscription) -> Result<()>;
    /// Invoke the hub's unsubscribe procedure for one subscription.
    async fn unsubscribe(&self, sub: &Subscription) -> Result<()>;
    /// Next raw message as (channel, payload). `Ok(None)` is a graceful
    /// close; `Err` is a transport failure triggering reconnect.
    async fn next_message(&self) -> Result<Option<(String, String)>>;
    async fn close(&self) -> Result<()>;
}

/// WebSocket hub transport. The write and read halves live under separate
/// locks: the dispatch loop parks on the read half for as long as the
/// channel is quiet, and an outbound invocation (subscribe, unsubscribe,
/// close) must never wait behind that pending read.
pub struct HubTransport {
    url: String,
    write: tokio::sync::Mutex<Option<futures_util::stream::SplitSink<WsStream, Message>>>,
    read: tokio::sync::Mutex<Option<futures_util::stream::SplitStream<WsStream>>>,
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Hub invocation frame (client -> server remote procedure call).
#[derive(Debug, Serialize)]
struct HubInvocation<'a> {
    method: &'a str,
    #[serde(rename = "eventId")]
    event_id: &'a str,
    #[serde(rename = "carId", skip_serializing_if = "Option::is_none")]
    car_id: Option<&'a str>,
}

/// Hub push frame (server -> client named event).
#[derive(Debug, Deserialize)]
struct HubPush {
    channel: String,
    payload: String,
}

impl HubTransport {
    pub fn new(url: String) -> Self {
        Self {
            url,
            write: tokio::sync::Mutex::new(None),
            read: tokio::sync::Mutex::new(None),
        }
    }

    async fn send_invocation(&self, method: &str, sub: &Subscription) -> Result<()> {
        let frame = serde_json::to_string(&HubInvocation {
            method,
            event_id: &sub.event_id,
            car_id: sub.car_id.as_deref(),
        })?;
        let mut guard = self.write.lock().await;
        let write = guard
            .as_mut()
            .ok_or_else(|| PitwallError::Transport("hub not connected".into()))?;
        write.send(Message::Text(frame)).await?;
        Ok(())
    }
}

#[async_trait]
impl LiveTransport for HubTransport {
    async fn connect(&self) -> Result<()> {
        let (stream, response) = connect_async(self.url.as_str()).await?;
        debug!("hub connected (status: {})", response.status());
        let (write, read) = stream.split();
        *self.write.lock().await = Some(write);
        *self.read.lock().await = Some(read);
        Ok(())
    }

    async fn subscribe(&self, sub: &Subscription) -> Result<()> {
        self.send_invocation(sub.kind.hub_method(), sub).await
    }

    async fn unsubscribe(&self, sub: &Subscription) -> Result<()> {
        self.send_invocation(sub.kind.hub_unsubscribe_method(), sub).await
    }

    async fn next_message(&self) -> Result<Option<(String, String)>> {
        let mut guard = self.read.lock().await;
        let read = guard
            .as_mut()
            .ok_or_else(|| PitwallError::Transport("hub not connected".into()))?;
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<HubPush>(&text) {
                        Ok(push) => return Ok(Some((push.channel, push.payload))),
                        Err(e) => {
                            // Malformed frame: drop it, keep the stream alive.
                            warn!("dropping malformed hub frame: {}", e);
                            continue;
                        }
                    }
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    info!("hub closed by server: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    debug!("ignoring non-text hub message: {:?}", other);
                    continue;
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }
    }

    /// Close the write half only; a dispatch loop parked on the read half
    /// sees the close handshake (or the stream ending) on its own.
    async fn close(&self) -> Result<()> {
        if let Some(mut write) = self.write.lock().await.take() {
            write.send(Message::Close(None)).await?;
        }
        Ok(())
    }
}

/// Owns the live channel: connection lifecycle, the subscription set, and
/// the decode/dispatch loop feeding typed events downstream.
pub struct ConnectionManager {
    transport: Arc<dyn LiveTransport>,
    subscriptions: Mutex<BTreeSet<Subscription>>,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: mpsc::UnboundedSender<LiveEvent>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn LiveTransport>,
    ) -> (Arc<Self>, watch::Receiver<ConnectionState>, mpsc::UnboundedReceiver<LiveEvent>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            transport,
            subscriptions: Mutex::new(BTreeSet::new()),
            state_tx,
            event_tx,
        });
        (manager, state_rx, event_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.state_tx.borrow() != state {
            info!("connection state -> {:?}", state);
            let _ = self.state_tx.send(state);
        }
    }

    /// Active subscriptions, in stable order.
    pub fn active_subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    /// Initial connect. Failure propagates to the caller and leaves the
    /// manager `Disconnected`.
    pub async fn connect(&self) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        match self.transport.connect().await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Subscribe and remember. The set, not the transport, is the source of
    /// truth for what must be re-issued after a reconnect.
    pub async fn subscribe(&self, sub: Subscription) -> Result<()> {
        self.transport.subscribe(&sub).await?;
        self.subscriptions.lock().insert(sub);
        Ok(())
    }

    /// Unsubscribe and forget, so a later reconnect does not resurrect it.
    pub async fn unsubscribe(&self, sub: &Subscription) -> Result<()> {
        self.subscriptions.lock().remove(sub);
        self.transport.unsubscribe(sub).await
    }

    /// Read-decode-dispatch until the transport fails or closes, then run
    /// the reconnect cycle. Returns when reconnection is exhausted or the
    /// event receiver is gone.
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.transport.next_message().await {
                Ok(Some((channel, raw))) => {
                    let payload = match decode_envelope(&raw) {
                        Ok(v) => v,
                        Err(e) => {
                            // Malformed envelope: log, drop, continue.
                            warn!("dropping malformed envelope on '{}': {}", channel, e);
                            continue;
                        }
                    };
                    let Some(event) = dispatch(&channel, payload) else {
                        debug!("no handler for channel '{}'", channel);
                        continue;
                    };
                    if self.event_tx.send(event).is_err() {
                        info!("event receiver dropped, stopping dispatch loop");
                        return Ok(());
                    }
                }
                Ok(None) => {
                    info!("live channel closed by server");
                    self.reconnect().await?;
                }
                Err(e) => {
                    error!("live channel transport error: {}", e);
                    self.reconnect().await?;
                }
            }
        }
    }

    /// Backoff-reconnect cycle. On success every subscription active at the
    /// moment of disconnect is re-issued before the state settles back to
    /// `Connected`.
    pub async fn reconnect(&self) -> Result<()> {
        self.set_state(ConnectionState::Reconnecting);

        for attempt in 0..MAX_RECONNECT_ATTEMPTS {
            let delay = backoff_delay(attempt);
            if !delay.is_zero() {
                debug!("reconnect attempt {} in {:?}", attempt + 1, delay);
                sleep(delay).await;
            }

            match self.transport.connect().await {
                Ok(()) => {
                    self.resubscribe_all().await?;
                    self.set_state(ConnectionState::Connected);
                    info!("reconnected after {} attempt(s)", attempt + 1);
                    return Ok(());
                }
                Err(e) => {
                    warn!("reconnect attempt {} failed: {}", attempt + 1, e);
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        Err(PitwallError::Transport(format!(
            "gave up after {} reconnect attempts",
            MAX_RECONNECT_ATTEMPTS
        )))
    }

    /// Re-issue every active subscription. A failure here is a correctness
    /// bug, not a missed optimization: silent un-subscription means the
    /// client believes it is live but receives nothing.
    async fn resubscribe_all(&self) -> Result<()> {
        let subs = self.active_subscriptions();
        for sub in &subs {
            self.transport.subscribe(sub).await?;
        }
        if !subs.is_empty() {
            info!("re-issued {} subscription(s) after reconnect", subs.len());
        }
        Ok(())
    }

    /// Session teardown: unsubscribe everything, then close. A server-side
    /// subscription left behind by a failed unsubscribe is logged and
    /// tolerated; the transport still closes.
    pub async fn shutdown(&self) {
        let subs: Vec<Subscription> = {
            let mut guard = self.subscriptions.lock();
            let subs = guard.iter().cloned().collect();
            guard.clear();
            subs
        };
        for sub in &subs {
            if let Err(e) = self.transport.unsubscribe(sub).await {
                warn!("unsubscribe during teardown failed (degraded, not fatal): {}", e);
            }
        }
        if let Err(e) = self.transport.close().await {
            warn!("transport close during teardown failed: {}", e);
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::VecDeque;

    /// Scripted transport: records every hub invocation and plays back a
    /// queue of message results.
    struct FakeTransport {
        subscribe_calls: SyncMutex<Vec<Subscription>>,
        unsubscribe_calls: SyncMutex<Vec<Subscription>>,
        connect_results: SyncMutex<VecDeque<Result<()>>>,
        messages: SyncMutex<VecDeque<Result<Option<(String, String)>>>>,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                subscribe_calls: SyncMutex::new(Vec::new()),
                unsubscribe_calls: SyncMutex::new(Vec::new()),
                connect_results: SyncMutex::new(VecDeque::new()),
                messages: SyncMutex::new(VecDeque::new()),
            })
        }

        fn script_connect(&self, result: Result<()>) {
            self.connect_results.lock().push_back(result);
        }

        fn script_message(&self, result: Result<Option<(String, String)>>) {
            self.messages.lock().push_back(result);
        }
    }

    #[async_trait]
    impl LiveTransport for FakeTransport {
        async fn connect(&self) -> Result<()> {
            self.connect_results.lock().pop_front().unwrap_or(Ok(()))
        }

        async fn subscribe(&self, sub: &Subscription) -> Result<()> {
            self.subscribe_calls.lock().push(sub.clone());
            Ok(())
        }

        async fn unsubscribe(&self, sub: &Subscription) -> Result<()> {
            self.unsubscribe_calls.lock().push(sub.clone());
            Ok(())
        }

        async fn next_message(&self) -> Result<Option<(String, String)>> {
            self.messages
                .lock()
                .pop_front()
                .unwrap_or(Ok(None))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_backoff_schedule_is_exact() {
        assert_eq!(backoff_delay(0), Duration::ZERO);
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(10));
        assert_eq!(backoff_delay(3), Duration::from_secs(30));
        assert_eq!(backoff_delay(4), Duration::from_secs(30));
        assert_eq!(backoff_delay(99), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_disconnected() {
        let transport = FakeTransport::new();
        transport.script_connect(Err(PitwallError::Transport("refused".into())));
        let (manager, state_rx, _events) = ConnectionManager::new(transport);

        assert!(manager.connect().await.is_err());
        assert_eq!(*state_rx.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_reissues_only_active_subscriptions() {
        let transport = FakeTransport::new();
        let (manager, _state, _events) = ConnectionManager::new(transport.clone());
        manager.connect().await.unwrap();

        let event_sub = Subscription::event("race-9");
        let log_sub = Subscription::control_log("race-9", "24");
        let incar_sub = Subscription::in_car("race-9", "24");
        manager.subscribe(event_sub.clone()).await.unwrap();
        manager.subscribe(log_sub.clone()).await.unwrap();
        manager.subscribe(incar_sub.clone()).await.unwrap();
        // explicitly dropped before the disconnect: must not come back
        manager.unsubscribe(&incar_sub).await.unwrap();

        transport.subscribe_calls.lock().clear();
        manager.reconnect().await.unwrap();

        let reissued = transport.subscribe_calls.lock().clone();
        assert_eq!(reissued.len(), 2);
        assert!(reissued.contains(&event_sub));
        assert!(reissued.contains(&log_sub));
        assert!(!reissued.contains(&incar_sub));
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_reconnect_gives_up_and_surfaces_disconnected() {
        let transport = FakeTransport::new();
        for _ in 0..MAX_RECONNECT_ATTEMPTS {
            transport.script_connect(Err(PitwallError::Transport("down".into())));
        }
        let (manager, _state, _events) = ConnectionManager::new(transport);

        // paused clock auto-advances through the backoff schedule
        tokio::time::pause();
        assert!(manager.reconnect().await.is_err());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_malformed_envelope_does_not_kill_dispatch_loop() {
        let transport = FakeTransport::new();
        transport.script_message(Ok(Some(("positions".into(), "not json at all".into()))));
        transport.script_message(Ok(Some((
            "positions".into(),
            r#"[{"N":"24","P":1}]"#.into(),
        ))));
        // graceful close, then a scripted failed reconnect run ends it
        transport.script_message(Ok(None));
        for _ in 0..MAX_RECONNECT_ATTEMPTS {
            transport.script_connect(Err(PitwallError::Transport("down".into())));
        }

        let (manager, _state, mut events) = ConnectionManager::new(transport);
        tokio::time::pause();
        assert!(manager.run().await.is_err());

        // the malformed frame was dropped, the good one dispatched
        let event = events.recv().await.unwrap();
        match event {
            LiveEvent::CarPositionBatch(cars) => assert_eq!(cars.len(), 1),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_hub_invocations_not_blocked_by_pending_read() {
        // a connected server that never sends anything, so the read half
        // stays parked for the whole test
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let transport = Arc::new(HubTransport::new(format!("ws://{}", addr)));
        transport.connect().await.unwrap();

        let reader = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.next_message().await })
        };
        // give the reader time to park on the idle stream
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sub = Subscription::event("race-9");
        tokio::time::timeout(Duration::from_secs(2), transport.subscribe(&sub))
            .await
            .expect("subscribe must not wait behind a pending read")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), transport.unsubscribe(&sub))
            .await
            .expect("unsubscribe must not wait behind a pending read")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), transport.close())
            .await
            .expect("close must not wait behind a pending read")
            .unwrap();

        reader.abort();
        server.abort();
    }

    #[tokio::test]
    async fn test_shutdown_unsubscribes_everything() {
        let transport = FakeTransport::new();
        let (manager, _state, _events) = ConnectionManager::new(transport.clone());
        manager.connect().await.unwrap();
        manager.subscribe(Subscription::event("race-9")).await.unwrap();
        manager
            .subscribe(Subscription::control_log("race-9", "7"))
            .await
            .unwrap();

        manager.shutdown().await;

        assert_eq!(transport.unsubscribe_calls.lock().len(), 2);
        assert!(manager.active_subscriptions().is_empty());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}

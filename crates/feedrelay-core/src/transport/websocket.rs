//! WebSocket streaming transport.
//!
//! The per-tick connection decisions are computed as a pure plan, then
//! executed against the socket: close on URL change or unresponsiveness,
//! connect when work appears, emit subscribe/unsubscribe frames for the
//! tick's deltas. Inbound frames are pumped by a reader task that writes
//! provider results straight into the response cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::streaming::{StreamHandler, StreamingTransport, SubscriptionDeltas, TickReport};
use super::TransportDeps;
use crate::clock::epoch_ms;
use crate::request::ProviderResult;
use crate::subscription::SubscriptionEntry;
use crate::EngineError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Endpoint-specific WebSocket behavior: where to connect, what frames to
/// send, how to turn inbound messages into provider results.
pub trait WebSocketEndpoint: Send + Sync + 'static {
    /// Connection URL for the given desired set. Some providers encode
    /// subscriptions in the URL; returning a different string forces a
    /// reconnect.
    fn url(&self, desired: &[SubscriptionEntry]) -> Result<String, EngineError>;

    fn subscribe_message(&self, _params: &Value) -> Option<Value> {
        None
    }

    fn unsubscribe_message(&self, _params: &Value) -> Option<Value> {
        None
    }

    /// Deserialize one inbound frame. JSON by default.
    fn parse_message(&self, raw: &str) -> Option<Value> {
        serde_json::from_str(raw).ok()
    }

    /// Map one inbound message to provider results, given the currently
    /// desired parameter tuples. `None` or empty means the message
    /// carried no data (keepalives, acks).
    fn handle_message(&self, message: Value, desired: &[Value]) -> Option<Vec<ProviderResult>>;
}

/// WebSocket transport over a streaming core.
pub type WebSocketTransport<E> = StreamingTransport<WsDriver<E>>;

impl<E: WebSocketEndpoint> StreamingTransport<WsDriver<E>> {
    pub fn websocket(endpoint: E) -> Self {
        StreamingTransport::new(WsDriver::new(endpoint))
    }
}

struct Liveness {
    last_message_ms: AtomicU64,
    desired_params: std::sync::RwLock<Vec<Value>>,
}

impl Liveness {
    fn new() -> Self {
        Self {
            last_message_ms: AtomicU64::new(0),
            desired_params: std::sync::RwLock::new(Vec::new()),
        }
    }

    fn touch(&self) {
        self.last_message_ms.store(epoch_ms(), Ordering::Relaxed);
    }
}

struct WsConnection {
    sink: Option<Arc<Mutex<WsSink>>>,
    reader: Option<JoinHandle<()>>,
    current_url: String,
    opened_at: u64,
    liveness: Arc<Liveness>,
}

impl WsConnection {
    fn disconnected() -> Self {
        Self {
            sink: None,
            reader: None,
            current_url: String::new(),
            opened_at: 0,
            liveness: Arc::new(Liveness::new()),
        }
    }
}

/// Observable connection state used by the pure tick plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConnSnapshot {
    pub connected: bool,
    pub current_url: String,
    pub opened_at: u64,
    pub last_message_ms: u64,
}

/// Actions one tick must perform, in order: close, connect, subscribe,
/// unsubscribe.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct TickPlan {
    pub close: bool,
    pub connect: Option<String>,
    pub subscribe: Vec<SubscriptionEntry>,
    pub unsubscribe: Vec<SubscriptionEntry>,
}

/// The per-tick decision table.
pub(crate) fn plan_tick(
    snapshot: &ConnSnapshot,
    deltas: &SubscriptionDeltas,
    url_for_desired: &str,
    now_ms: u64,
    unresponsive_ttl_ms: u64,
) -> Option<TickPlan> {
    // Nothing to do: no pending work and no connection to maintain.
    if !snapshot.connected && deltas.new.is_empty() {
        return None;
    }

    let mut plan = TickPlan::default();
    let mut pending = deltas.new.clone();

    if snapshot.connected {
        let url_changed = url_for_desired != snapshot.current_url;
        let since_message = now_ms.saturating_sub(snapshot.last_message_ms);
        let since_open = now_ms.saturating_sub(snapshot.opened_at);
        let unresponsive = since_message.min(since_open) > unresponsive_ttl_ms;

        if url_changed || unresponsive {
            plan.close = true;
            pending = deltas.desired.clone();
        }
    }

    let connected_after_close = snapshot.connected && !plan.close;
    if !connected_after_close && !deltas.desired.is_empty() {
        plan.connect = Some(url_for_desired.to_owned());
        // A fresh connection carries no subscriptions yet.
        pending = deltas.desired.clone();
    }

    plan.subscribe = pending;
    // Unsubscribes only make sense on a connection that survived.
    if !plan.close && plan.connect.is_none() {
        plan.unsubscribe = deltas.stale.clone();
    }

    Some(plan)
}

/// Stream handler owning the socket lifecycle for one endpoint.
pub struct WsDriver<E: WebSocketEndpoint> {
    endpoint: Arc<E>,
    conn: Mutex<WsConnection>,
}

impl<E: WebSocketEndpoint> WsDriver<E> {
    pub fn new(endpoint: E) -> Self {
        Self {
            endpoint: Arc::new(endpoint),
            conn: Mutex::new(WsConnection::disconnected()),
        }
    }

    async fn close_connection(&self, conn: &mut WsConnection, deps: &TransportDeps) {
        if let Some(sink) = conn.sink.take() {
            let mut sink = sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
        }
        if let Some(reader) = conn.reader.take() {
            reader.abort();
        }
        conn.current_url.clear();
        conn.opened_at = 0;
        deps.metrics.ws_connection_active.set(0);
        info!(endpoint = %deps.scope.endpoint, "closed websocket connection");
    }

    async fn open_connection(
        &self,
        conn: &mut WsConnection,
        deps: &TransportDeps,
        url: &str,
    ) -> Result<(), EngineError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|err| EngineError::ConnectFailed(err.to_string()))?;
        let (sink, source) = stream.split();

        let sink = Arc::new(Mutex::new(sink));
        let liveness = Arc::new(Liveness::new());
        let opened_at = epoch_ms();

        let reader = spawn_reader(
            source,
            Arc::clone(&sink),
            Arc::clone(&self.endpoint),
            deps.clone(),
            Arc::clone(&liveness),
            opened_at,
        );

        conn.sink = Some(sink);
        conn.reader = Some(reader);
        conn.current_url = url.to_owned();
        conn.opened_at = opened_at;
        conn.liveness = liveness;
        deps.metrics.ws_connection_active.set(1);
        info!(endpoint = %deps.scope.endpoint, url, "opened websocket connection");
        Ok(())
    }

    async fn send_frame(&self, conn: &WsConnection, deps: &TransportDeps, frame: Value) {
        let Some(sink) = &conn.sink else {
            return;
        };

        let mut sink = sink.lock().await;
        if let Err(err) = sink.send(Message::Text(frame.to_string())).await {
            // Socket errors never force a reconnect by themselves; the
            // unresponsive check repairs the connection on a later tick.
            warn!(endpoint = %deps.scope.endpoint, %err, "websocket send failed");
            deps.metrics.ws_connection_errors.inc();
        }
    }
}

#[async_trait]
impl<E: WebSocketEndpoint> StreamHandler for WsDriver<E> {
    async fn on_tick(
        &self,
        deps: &TransportDeps,
        deltas: SubscriptionDeltas,
    ) -> Result<TickReport, EngineError> {
        let mut conn = self.conn.lock().await;

        // No socket and no pending work: skip before computing a URL,
        // since URL functions may require a non-empty desired set.
        if conn.sink.is_none() && deltas.new.is_empty() {
            return Ok(TickReport::none());
        }

        let url = self.endpoint.url(&deltas.desired)?;
        let now = epoch_ms();

        let snapshot = ConnSnapshot {
            connected: conn.sink.is_some(),
            current_url: conn.current_url.clone(),
            opened_at: conn.opened_at,
            last_message_ms: conn.liveness.last_message_ms.load(Ordering::Relaxed),
        };

        let unresponsive_ttl =
            deps.config.ws_subscription_unresponsive_ttl.as_millis() as u64;
        let Some(plan) = plan_tick(&snapshot, &deltas, &url, now, unresponsive_ttl) else {
            return Ok(TickReport::none());
        };

        if plan.close {
            debug!(endpoint = %deps.scope.endpoint, "tick plan: close");
            self.close_connection(&mut conn, deps).await;
        }

        if let Some(target) = &plan.connect {
            self.open_connection(&mut conn, deps, target).await?;
        }

        if conn.sink.is_none() {
            // Closed without reconnecting: nothing is subscribed anymore.
            deps.metrics
                .ws_subscription_active
                .with_label_values(&[&deps.scope.endpoint])
                .set(0);
            return Ok(TickReport::none());
        }

        for entry in &plan.subscribe {
            if let Some(frame) = self.endpoint.subscribe_message(&entry.params) {
                self.send_frame(&conn, deps, frame).await;
                deps.metrics
                    .ws_subscription_total
                    .with_label_values(&[&deps.scope.endpoint])
                    .inc();
            }
        }

        for entry in &plan.unsubscribe {
            if let Some(frame) = self.endpoint.unsubscribe_message(&entry.params) {
                self.send_frame(&conn, deps, frame).await;
            }
        }

        // Publish the desired tuples to the reader so inbound handlers
        // see the current set.
        {
            let mut desired_params = conn
                .liveness
                .desired_params
                .write()
                .expect("websocket desired set lock should not be poisoned");
            *desired_params = deltas
                .desired
                .iter()
                .map(|entry| entry.params.clone())
                .collect();
        }

        deps.metrics
            .ws_subscription_active
            .with_label_values(&[&deps.scope.endpoint])
            .set(deltas.desired.len() as i64);

        Ok(TickReport::all_desired(&deltas))
    }

    async fn on_shutdown(&self, deps: &TransportDeps) {
        let mut conn = self.conn.lock().await;
        if conn.sink.is_some() {
            self.close_connection(&mut conn, deps).await;
        }
    }
}

fn spawn_reader<E: WebSocketEndpoint>(
    mut source: WsSource,
    sink: Arc<Mutex<WsSink>>,
    endpoint: Arc<E>,
    deps: TransportDeps,
    liveness: Arc<Liveness>,
    opened_at: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = source.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if deps.config.ws_any_message_counts_as_activity {
                        liveness.touch();
                    }
                    handle_inbound(&endpoint, &deps, &liveness, opened_at, &text).await;
                }
                Ok(Message::Ping(payload)) => {
                    let mut sink = sink.lock().await;
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Ok(Message::Close(_)) => {
                    info!(endpoint = %deps.scope.endpoint, "websocket closed by provider");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    error!(endpoint = %deps.scope.endpoint, %err, "websocket read error");
                    deps.metrics.ws_connection_errors.inc();
                    break;
                }
            }
        }
    })
}

async fn handle_inbound<E: WebSocketEndpoint>(
    endpoint: &Arc<E>,
    deps: &TransportDeps,
    liveness: &Arc<Liveness>,
    opened_at: u64,
    raw: &str,
) {
    let Some(message) = endpoint.parse_message(raw) else {
        deps.metrics
            .ws_message_total
            .with_label_values(&[&deps.scope.endpoint, "undecodable"])
            .inc();
        return;
    };

    let desired = {
        let guard = liveness
            .desired_params
            .read()
            .expect("websocket desired set lock should not be poisoned");
        guard.clone()
    };

    let results = endpoint.handle_message(message, &desired);
    let Some(results) = results.filter(|results| !results.is_empty()) else {
        deps.metrics
            .ws_message_total
            .with_label_values(&[&deps.scope.endpoint, "ignored"])
            .inc();
        return;
    };

    deps.metrics
        .ws_message_total
        .with_label_values(&[&deps.scope.endpoint, "handled"])
        .inc();

    match deps
        .response_cache
        .write(&deps.scope, &results, Some(opened_at))
        .await
    {
        Ok(()) => {
            // Only messages that produced cache writes count as liveness
            // unless configured otherwise.
            liveness.touch();
        }
        Err(err) => {
            warn!(endpoint = %deps.scope.endpoint, %err, "failed to cache websocket results");
        }
    }
}

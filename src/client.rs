//! Wirecall client implementation

use crate::config::WirecallConfig;
use crate::envelope;
use crate::error::{Result, WirecallError};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// A connection attempt is in flight
    Connecting,
    /// Connected and ready to send
    Open,
    /// Not connected; the client stays idle until the next send attempt
    Closed,
}

/// Handler for inbound messages that carry no correlation id
pub type PushHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Internal client state
struct ClientInner {
    config: WirecallConfig,
    state: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,

    // Write half of the live connection; None while not open
    sink: tokio::sync::Mutex<Option<WsSink>>,

    // In-flight correlated calls awaiting their reply
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,

    // Serialized frames awaiting the next open connection
    queue: Mutex<VecDeque<String>>,

    // Handler for unsolicited server messages
    push_handler: Mutex<Option<PushHandler>>,

    next_correlation_id: AtomicU64,

    // Bumped whenever the connection is replaced; stale connection tasks
    // compare against it before touching shared state
    generation: AtomicU64,
}

/// Correlated request/response client over a WebSocket
///
/// Each correlated send is stamped with a unique integer id and resolves with
/// the first inbound envelope echoing that id, or fails after the configured
/// timeout. Sends issued while the socket is down are queued and flushed, in
/// order, when the next connection opens. This struct is cheaply cloneable as
/// it uses an internal Arc.
#[derive(Clone)]
pub struct WirecallClient {
    inner: Arc<ClientInner>,
}

impl WirecallClient {
    /// Create a new client and immediately begin connecting to the
    /// configured URL. Must be called from within a Tokio runtime.
    pub fn new(config: WirecallConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);

        let inner = Arc::new(ClientInner {
            config,
            state: state_tx,
            state_rx,
            sink: tokio::sync::Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            push_handler: Mutex::new(None),
            next_correlation_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
        });

        let client = Self { inner };
        client.open();
        client
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Get a receiver for connection state changes
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// Open a fresh connection, replacing any existing one. A no-op while an
    /// attempt is already in flight.
    pub fn open(&self) {
        self.inner.clone().spawn_connect();
    }

    /// Tear the connection down. Pending calls are left to their timeouts and
    /// queued frames stay queued for a future reconnect.
    pub async fn close(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(mut sink) = self.inner.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        self.inner.set_state(ConnectionState::Closed);
        info!("socket closed");
    }

    /// Register a handler for inbound messages without a correlation id.
    /// Without one such messages are logged and dropped.
    pub fn on_unsolicited<F>(&self, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        *self.inner.push_handler.lock() = Some(Arc::new(handler));
    }

    /// Send a correlated request and wait for the matching reply.
    ///
    /// The payload must serialize to a JSON object; the correlation id and a
    /// `sent` timestamp are merged into it before transmission. Resolves with
    /// the full reply envelope, or fails with [`WirecallError::Timeout`] if no
    /// reply arrives within the configured deadline.
    pub async fn request<T: Serialize>(&self, details: &T) -> Result<Value> {
        let payload = serde_json::to_value(details)?;
        self.request_value(payload).await
    }

    /// Callback-style variant of [`request`](Self::request): spawns the call
    /// and hands the outcome to `handler`.
    pub fn send_request<T, F>(&self, details: &T, handler: F)
    where
        T: Serialize,
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        let payload = match serde_json::to_value(details) {
            Ok(payload) => payload,
            Err(e) => {
                handler(Err(e.into()));
                return;
            }
        };

        let client = self.clone();
        tokio::spawn(async move {
            handler(client.request_value(payload).await);
        });
    }

    /// Send a message expecting no reply.
    ///
    /// A payload that fails to serialize is transmitted as its raw `Debug`
    /// rendering instead of being rejected. Never returns an error: a send
    /// attempted while the socket is down is queued for the next open.
    pub async fn send_message<T>(&self, details: &T)
    where
        T: Serialize + fmt::Debug,
    {
        let frame = match serde_json::to_string(details) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "payload not serializable, sending raw");
                format!("{details:?}")
            }
        };

        self.inner.clone().transmit(frame).await;
    }

    async fn request_value(&self, payload: Value) -> Result<Value> {
        let correlation_id = self
            .inner
            .next_correlation_id
            .fetch_add(1, Ordering::SeqCst);
        let frame = envelope::seal(payload, correlation_id, envelope::epoch_ms())?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(correlation_id, tx);

        let started = Instant::now();
        self.inner.clone().transmit(frame).await;

        let outcome = timeout(self.inner.config.request_timeout, rx).await;

        // The resolved path already removed the entry; this covers timeout
        // and shutdown so no entry outlives its call.
        self.inner.pending.lock().remove(&correlation_id);

        match outcome {
            Ok(Ok(reply)) => {
                debug!(
                    correlation_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "reply received"
                );
                Ok(reply)
            }
            Ok(Err(_)) => Err(WirecallError::ChannelClosed),
            Err(_) => {
                warn!(correlation_id, "request timed out");
                Err(WirecallError::Timeout)
            }
        }
    }
}

impl ClientInner {
    fn set_state(&self, state: ConnectionState) {
        let _ = self.state.send(state);
    }

    fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Spawn a connection task unless one is already dialing. Claims a new
    /// generation so any previous connection is superseded.
    fn spawn_connect(self: Arc<Self>) {
        if self.state() == ConnectionState::Connecting {
            // Queued frames ride along with the attempt already in flight
            return;
        }

        self.set_state(ConnectionState::Connecting);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        tokio::spawn(async move {
            connection_task(self, generation).await;
        });
    }

    /// Send a frame over the open connection, or queue it and dial if the
    /// connection is not open (or dies under us).
    async fn transmit(self: Arc<Self>, frame: String) {
        if self.state() == ConnectionState::Open {
            let mut slot = self.sink.lock().await;
            if let Some(sink) = slot.as_mut() {
                if self.flush_queued(sink).await.is_ok() {
                    match sink.send(Message::Text(frame.clone().into())).await {
                        Ok(()) => return,
                        Err(e) => debug!(error = %e, "send failed, queueing for reconnect"),
                    }
                }
            }
        }

        self.queue.lock().push_back(frame);
        self.spawn_connect();
    }

    /// Drain the outbound queue into the sink, oldest first. On error the
    /// unsent frame goes back to the front so the remainder survives for the
    /// next open connection.
    async fn flush_queued(&self, sink: &mut WsSink) -> std::result::Result<(), tungstenite::Error> {
        loop {
            let Some(frame) = self.queue.lock().pop_front() else {
                return Ok(());
            };

            if let Err(e) = sink.send(Message::Text(frame.clone().into())).await {
                self.queue.lock().push_front(frame);
                return Err(e);
            }
        }
    }

    /// Dispatch one inbound frame to the correlation layer.
    fn handle_frame(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "dropping unparseable frame");
                return;
            }
        };

        match envelope::correlation_id(&value) {
            Some(correlation_id) => {
                let sender = self.pending.lock().remove(&correlation_id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(value);
                    }
                    None => {
                        warn!(correlation_id, "reply with no matching request, already timed out?");
                    }
                }
            }
            None => {
                let handler = self.push_handler.lock().clone();
                match handler {
                    Some(handler) => handler(value),
                    None => warn!("dropping message without correlation id"),
                }
            }
        }
    }
}

/// Dial the server, publish the open state, flush the queue, then read
/// frames until the connection ends. Bows out without touching shared state
/// if a newer connection has superseded this one.
async fn connection_task(inner: Arc<ClientInner>, generation: u64) {
    debug!(url = %inner.config.url, "connecting");

    let ws = match timeout(
        inner.config.connect_timeout,
        connect_async(inner.config.url.as_str()),
    )
    .await
    {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(e)) => {
            warn!(error = %e, "connection failed");
            if inner.current_generation() == generation {
                inner.set_state(ConnectionState::Closed);
            }
            return;
        }
        Err(_) => {
            warn!(timeout = ?inner.config.connect_timeout, "connection attempt timed out");
            if inner.current_generation() == generation {
                inner.set_state(ConnectionState::Closed);
            }
            return;
        }
    };

    if inner.current_generation() != generation {
        // Superseded while dialing; discard the handle
        return;
    }

    let (sink, stream) = ws.split();
    {
        let mut slot = inner.sink.lock().await;
        if let Some(mut old) = slot.take() {
            // A manual open() over a live connection lands here; close the
            // superseded write half so its reader sees the stream end
            let _ = old.close().await;
        }
        *slot = Some(sink);
        inner.set_state(ConnectionState::Open);
        info!(url = %inner.config.url, "connected");

        // Flush everything that queued up while the socket was down
        if let Some(sink) = slot.as_mut() {
            if let Err(e) = inner.flush_queued(sink).await {
                debug!(error = %e, "connection lost while flushing queue");
            }
        }
    }

    read_loop(&inner, generation, stream).await;

    if inner.current_generation() == generation {
        *inner.sink.lock().await = None;
        inner.set_state(ConnectionState::Closed);
        debug!("socket closed");
    }
}

async fn read_loop(inner: &Arc<ClientInner>, generation: u64, mut stream: WsStream) {
    while let Some(frame) = stream.next().await {
        if inner.current_generation() != generation {
            return;
        }

        match frame {
            Ok(Message::Text(text)) => inner.handle_frame(&text),
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => inner.handle_frame(text),
                Err(_) => debug!("dropping non-UTF-8 binary frame"),
            },
            Ok(Message::Ping(data)) => {
                let mut slot = inner.sink.lock().await;
                if let Some(sink) = slot.as_mut() {
                    let _ = sink.send(Message::Pong(data)).await;
                }
            }
            Ok(Message::Close(_)) => {
                debug!("server closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "socket error");
                break;
            }
        }
    }
}


#[cfg(test)]
mod async_tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    // Nothing listens on this port; connects fail fast with a refusal
    fn unreachable_config() -> WirecallConfig {
        WirecallConfig::new("ws://127.0.0.1:1/").request_timeout(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_new_starts_connecting() {
        let client = WirecallClient::new(unreachable_config());
        assert_eq!(client.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_request_times_out_while_disconnected() {
        let client = WirecallClient::new(unreachable_config());

        let result = client.request(&json!({"cmd": "ping"})).await;
        assert!(matches!(result, Err(WirecallError::Timeout)));
    }

    #[tokio::test]
    async fn test_pending_entry_removed_on_timeout() {
        let client = WirecallClient::new(unreachable_config());

        let _ = client.request(&json!({"cmd": "ping"})).await;
        assert!(client.inner.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_request_rejects_non_object_payload() {
        let client = WirecallClient::new(unreachable_config());

        let result = client.request(&"just a string").await;
        assert!(matches!(result, Err(WirecallError::Payload(_))));
        assert!(client.inner.pending.lock().is_empty());
        // Nothing reached the queue either: the envelope was never built
        assert!(client.inner.queue.lock().is_empty());
    }

    #[tokio::test]
    async fn test_send_while_disconnected_queues_frame() {
        let client = WirecallClient::new(unreachable_config());

        client.send_message(&json!({"cmd": "log"})).await;
        client.send_message(&json!({"cmd": "log2"})).await;

        let queue = client.inner.queue.lock();
        assert_eq!(queue.len(), 2);
        assert!(queue[0].contains("log"));
        assert!(queue[1].contains("log2"));
    }

    #[tokio::test]
    async fn test_correlation_ids_are_unique() {
        let client = WirecallClient::new(unreachable_config());

        let a = client.inner.next_correlation_id.fetch_add(1, Ordering::SeqCst);
        let b = client.inner.next_correlation_id.fetch_add(1, Ordering::SeqCst);
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_matching_reply_resolves_pending_entry() {
        let client = WirecallClient::new(unreachable_config());

        let (tx, rx) = oneshot::channel();
        client.inner.pending.lock().insert(42, tx);

        client
            .inner
            .handle_frame(r#"{"correlationId": 42, "ok": true}"#);

        let reply = rx.await.expect("pending call should resolve");
        assert_eq!(reply, json!({"correlationId": 42, "ok": true}));
        assert!(client.inner.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stale_reply_is_discarded() {
        let client = WirecallClient::new(unreachable_config());

        // No pending entry for this id; must not panic or create state
        client
            .inner
            .handle_frame(r#"{"correlationId": 7, "ok": true}"#);
        assert!(client.inner.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped() {
        let client = WirecallClient::new(unreachable_config());

        let (tx, mut rx) = oneshot::channel();
        client.inner.pending.lock().insert(1, tx);

        client.inner.handle_frame("this is not json {{{");

        // The pending call is untouched
        assert!(rx.try_recv().is_err());
        assert_eq!(client.inner.pending.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unsolicited_message_reaches_push_handler() {
        let client = WirecallClient::new(unreachable_config());

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        client.on_unsolicited(move |value| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(value);
            }
        });

        client.inner.handle_frame(r#"{"event": "server_push"}"#);

        let value = rx.await.expect("push handler should fire");
        assert_eq!(value, json!({"event": "server_push"}));
    }

    #[tokio::test]
    async fn test_unsolicited_message_without_handler_is_dropped() {
        let client = WirecallClient::new(unreachable_config());

        client.inner.handle_frame(r#"{"event": "server_push"}"#);
        assert!(client.inner.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_close_keeps_queue_and_pending() {
        let client = WirecallClient::new(unreachable_config());

        client.send_message(&json!({"cmd": "later"})).await;
        let (tx, _rx) = oneshot::channel();
        client.inner.pending.lock().insert(5, tx);

        client.close().await;

        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(client.inner.queue.lock().len(), 1);
        assert_eq!(client.inner.pending.lock().len(), 1);
    }
}

//! The transport multiplexer: one WebSocket, many outstanding requests.
//!
//! # Architecture
//!
//! ```text
//!   WsMux (cloneable handle)                 driver task (owns the socket)
//!   ┌──────────────────────────┐             ┌─────────────────────────────┐
//!   │ pending: id -> oneshot   │  outbound   │ select! {                   │
//!   │ next_id: AtomicU64       │ ──mpsc────► │   write queued envelopes    │
//!   │ state: watch<ConnState>  │ ◄──watch──  │   route inbound envelopes   │
//!   │ sink: notification hook  │             │ }                           │
//!   └──────────────────────────┘             └─────────────────────────────┘
//! ```
//!
//! # Key invariant
//!
//! Only the driver reads the socket, so all inbound routing is serialized.
//! The pending table is the single rendezvous between callers and the driver;
//! every entry is removed exactly once: by the matching response, by teardown,
//! or by the caller dropping its `send` future.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use url::Url;

use crate::envelope::{self, Envelope, Notification, Response};
use crate::error::MuxError;

const DEFAULT_MAX_PENDING: usize = 8192;
const DEFAULT_OUTBOUND_QUEUE: usize = 256;

fn max_pending() -> usize {
    std::env::var("WSMUX_MAX_PENDING")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_MAX_PENDING)
}

fn outbound_queue() -> usize {
    std::env::var("WSMUX_OUTBOUND_QUEUE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_OUTBOUND_QUEUE)
}

/// Connection state, published by the driver.
#[derive(Debug, Clone)]
pub enum ConnState {
    /// The socket is being dialed.
    Connecting,
    /// The socket is open and envelopes flow.
    Open,
    /// The connection ended after opening (peer close, local close, or a
    /// socket error). Terminal.
    Closed,
    /// The connection never opened. Terminal.
    Failed(String),
}

impl ConnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnState::Closed | ConnState::Failed(_))
    }
}

/// Messages sent from the handle to the driver.
enum Outbound {
    Envelope(String),
    Close,
}

type PendingSender = oneshot::Sender<Result<Value, MuxError>>;
type PendingReceiver = oneshot::Receiver<Result<Value, MuxError>>;
type BoxedSink = Box<dyn Fn(Notification) + Send + Sync>;

/// The multiplexer handle.
///
/// Issue requests with [`WsMux::send`]; register a notification sink with
/// [`WsMux::set_sink`]. Cloning is cheap and all clones share one connection.
#[derive(Clone)]
pub struct WsMux {
    inner: Arc<MuxInner>,
}

struct MuxInner {
    /// Outbound queue into the driver.
    out_tx: mpsc::Sender<Outbound>,
    /// Connection state; the driver is the only writer after construction.
    state_tx: watch::Sender<ConnState>,
    /// Pending requests: id -> completion sender.
    pending: Mutex<HashMap<u64, PendingSender>>,
    /// Dispatch sink for unsolicited notifications.
    sink: Mutex<Option<BoxedSink>>,
    /// Next request id, unique per connection.
    next_id: AtomicU64,
}

impl WsMux {
    /// Dial `url` and return the handle immediately.
    ///
    /// The connection proceeds in the background; [`WsMux::send`] may be
    /// called right away and suspends until the socket opens.
    pub fn connect(url: Url) -> Self {
        let (mux, out_rx) = Self::parts();
        let inner = Arc::clone(&mux.inner);
        tokio::spawn(async move {
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((ws, _response)) => run_driver(ws, inner, out_rx).await,
                Err(e) => {
                    tracing::warn!(error = %e, "websocket connect failed");
                    inner.teardown(ConnState::Failed(e.to_string()));
                }
            }
        });
        mux
    }

    /// Wrap an already-established WebSocket stream.
    pub fn from_socket<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mux, out_rx) = Self::parts();
        let inner = Arc::clone(&mux.inner);
        tokio::spawn(run_driver(ws, inner, out_rx));
        mux
    }

    fn parts() -> (Self, mpsc::Receiver<Outbound>) {
        let (out_tx, out_rx) = mpsc::channel(outbound_queue());
        let (state_tx, _) = watch::channel(ConnState::Connecting);
        let mux = Self {
            inner: Arc::new(MuxInner {
                out_tx,
                state_tx,
                pending: Mutex::new(HashMap::new()),
                sink: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        };
        (mux, out_rx)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        self.inner.state_tx.borrow().clone()
    }

    /// Resolve when the connection opens.
    ///
    /// Fails with [`MuxError::Connect`] when the socket never opens and with
    /// [`MuxError::ConnectionClosed`] when it has already closed.
    pub async fn ready(&self) -> Result<(), MuxError> {
        let mut state_rx = self.inner.state_tx.subscribe();
        loop {
            {
                let state = state_rx.borrow_and_update();
                match &*state {
                    ConnState::Open => return Ok(()),
                    ConnState::Closed => return Err(MuxError::ConnectionClosed),
                    ConnState::Failed(reason) => return Err(MuxError::Connect(reason.clone())),
                    ConnState::Connecting => {}
                }
            }
            if state_rx.changed().await.is_err() {
                return Err(MuxError::ConnectionClosed);
            }
        }
    }

    /// Register the dispatch sink for unsolicited notifications.
    ///
    /// Exactly one sink is active; registering again replaces the previous
    /// one. Without a sink, notifications are dropped (logged, not an error).
    pub fn set_sink<F>(&self, sink: F)
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        *self.inner.sink.lock() = Some(Box::new(sink));
    }

    /// Issue a request and await the correlated response.
    ///
    /// Suspends until the connection opens, then allocates the next id
    /// (starting at 1), registers the completion pair, and writes the request
    /// envelope. Resolves with the response's `result` value, or fails with
    /// [`MuxError::Remote`] carrying its `error` message. Concurrent calls
    /// are correlated by id only; responses may arrive in any order.
    ///
    /// When readiness fails no id is allocated. After the connection reaches
    /// a terminal state new calls fail fast with
    /// [`MuxError::ConnectionClosed`].
    pub async fn send(&self, method: &str, params: Option<Value>) -> Result<Value, MuxError> {
        self.ready().await?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let receiver = self.inner.register_pending(id)?;
        let mut guard = PendingGuard {
            inner: &self.inner,
            id,
            active: true,
        };

        let text = envelope::encode_request(id, method, params.as_ref())?;
        if self.inner.out_tx.send(Outbound::Envelope(text)).await.is_err() {
            return Err(MuxError::ConnectionClosed);
        }
        tracing::debug!(id, method, "request sent");

        let outcome = match receiver.await {
            Ok(outcome) => outcome,
            // Sender dropped without resolution: the driver is gone.
            Err(_) => Err(MuxError::ConnectionClosed),
        };
        guard.disarm();
        outcome
    }

    /// Request an orderly close. Best effort; pending requests fail with
    /// [`MuxError::ConnectionClosed`] once the driver winds down.
    pub fn close(&self) {
        let _ = self.inner.out_tx.try_send(Outbound::Close);
    }
}

/// Removes the pending entry when a `send` future is dropped before
/// resolution, so abandoned requests don't pin table slots.
struct PendingGuard<'a> {
    inner: &'a MuxInner,
    id: u64,
    active: bool,
}

impl PendingGuard<'_> {
    fn disarm(&mut self) {
        self.active = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if self.inner.pending.lock().remove(&self.id).is_some() {
            tracing::debug!(id = self.id, "send future dropped; removed pending request");
        }
    }
}

impl MuxInner {
    fn register_pending(&self, id: u64) -> Result<PendingReceiver, MuxError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            let max = max_pending();
            if pending.len() >= max {
                tracing::warn!(
                    pending_len = pending.len(),
                    max_pending = max,
                    "too many pending requests; refusing new request"
                );
                return Err(MuxError::TooManyPending);
            }
            pending.insert(id, tx);
            tracing::debug!(id, pending_len = pending.len(), "registered pending request");
        }

        // Teardown stores the terminal state before draining the table. If we
        // observe a non-terminal state here, any later teardown will drain our
        // entry; if we observe a terminal one, the drain may have already run,
        // so remove the entry ourselves.
        if self.state_tx.borrow().is_terminal() {
            self.pending.lock().remove(&id);
            return Err(MuxError::ConnectionClosed);
        }
        Ok(rx)
    }

    /// Route one inbound wire message.
    fn route_text(&self, text: &str) {
        match Envelope::parse(text) {
            Ok(Envelope::Response(response)) => self.route_response(response),
            Ok(Envelope::Notification(note)) => self.dispatch(note),
            Ok(Envelope::Invalid) => {
                tracing::debug!(len = text.len(), "envelope with neither id nor method; dropped");
            }
            Err(e) => {
                tracing::debug!(error = %e, "unparseable envelope; dropped");
            }
        }
    }

    fn route_response(&self, response: Response) {
        let waiter = self.pending.lock().remove(&response.id);
        match waiter {
            Some(tx) => {
                tracing::debug!(id = response.id, ok = response.body.is_ok(), "response delivered");
                // The caller may have dropped its future meanwhile; fine.
                let _ = tx.send(response.body.map_err(MuxError::Remote));
            }
            // Late or duplicate delivery after resolution or close; expected,
            // never an error.
            None => tracing::trace!(id = response.id, "response with no pending request; dropped"),
        }
    }

    fn dispatch(&self, note: Notification) {
        let sink = self.sink.lock();
        match sink.as_ref() {
            Some(deliver) => deliver(note),
            None => {
                tracing::debug!(method = %note.method, "notification with no sink registered; dropped");
            }
        }
    }

    /// Drive the connection to a terminal state and fail every pending
    /// request with a connection-closed error, exactly once each.
    fn teardown(&self, state: ConnState) {
        debug_assert!(state.is_terminal());
        // State first: `register_pending` re-checks it after inserting, which
        // closes the race between a new request and this drain.
        self.state_tx.send_replace(state);

        let drained: Vec<PendingSender> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, tx)| tx).collect()
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "failing pending requests on close");
        }
        for tx in drained {
            let _ = tx.send(Err(MuxError::ConnectionClosed));
        }
    }
}

/// The driver loop. Owns the socket; writes queued envelopes and routes
/// inbound ones until either side closes.
async fn run_driver<S>(
    ws: WebSocketStream<S>,
    inner: Arc<MuxInner>,
    mut out_rx: mpsc::Receiver<Outbound>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    inner.state_tx.send_replace(ConnState::Open);
    tracing::debug!("websocket open; driver running");

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            biased;

            outbound = out_rx.recv() => match outbound {
                Some(Outbound::Envelope(text)) => {
                    if let Err(e) = sink.send(Message::text(text)).await {
                        tracing::warn!(error = %e, "websocket send failed");
                        inner.teardown(ConnState::Closed);
                        return;
                    }
                }
                Some(Outbound::Close) | None => {
                    tracing::debug!("closing at local request");
                    let _ = sink.send(Message::Close(None)).await;
                    inner.teardown(ConnState::Closed);
                    return;
                }
            },

            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => inner.route_text(text.as_str()),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => inner.route_text(text),
                    Err(_) => tracing::debug!(len = data.len(), "non-utf8 binary frame; dropped"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    tracing::debug!("websocket closed by peer");
                    inner.teardown(ConnState::Closed);
                    return;
                }
                // Ping, Pong, raw frames: nothing to route.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "websocket receive failed");
                    inner.teardown(ConnState::Closed);
                    return;
                }
            },
        }
    }
}

static_assertions::assert_impl_all!(WsMux: Send, Sync, Clone);

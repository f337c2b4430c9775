//! WebSocket transport — one-shot RPC requests and the serving loop.
//!
//! Every RPC is a short-lived WebSocket connection: the caller connects,
//! sends one JSON frame, awaits a single reply frame, and closes. The
//! server side accepts connections and feeds each received frame through
//! an [`RpcHandler`], writing the handler's reply (if any) back on the
//! same connection. All calls are timeout-bounded by the caller.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, connect_async};
use tracing::{debug, error, info, warn};

use crate::error::NetworkError;
use crate::message::Message;

/// A handler that processes an inbound message and optionally returns a
/// reply to send back on the same connection.
pub type RpcHandler = Arc<
    dyn Fn(Message, SocketAddr) -> Pin<Box<dyn Future<Output = Option<Message>> + Send>>
        + Send
        + Sync,
>;

/// Byte counters for traffic flowing through this node's transport.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    sent: AtomicU64,
    received: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sent(&self, bytes: usize) {
        self.sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_received(&self, bytes: usize) {
        self.received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

/// Send a single request to `addr` and await one reply.
///
/// The entire exchange (connect, send, receive) is bounded by `timeout`;
/// a stuck peer fails its own call without blocking the caller further.
pub async fn request(
    addr: &str,
    msg: &Message,
    timeout: Duration,
    counters: &TrafficCounters,
) -> Result<Message, NetworkError> {
    let json = msg.to_json()?;

    let exchange = async {
        let url = format!("ws://{addr}");
        let (ws_stream, _) = connect_async(&url)
            .await
            .map_err(|e| NetworkError::Transport(format!("Connect to {addr} failed: {e}")))?;

        let (mut sink, mut stream) = ws_stream.split();

        counters.add_sent(json.len());
        sink.send(WsMessage::Text(json.into()))
            .await
            .map_err(|e| NetworkError::Transport(format!("Send to {addr} failed: {e}")))?;

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => {
                    counters.add_received(text.len());
                    let reply = Message::from_json(&text)?;
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Ok(reply);
                }
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {} // Ignore binary/ping/pong
                Err(e) => {
                    return Err(NetworkError::Transport(format!(
                        "Read from {addr} failed: {e}"
                    )));
                }
            }
        }

        Err(NetworkError::Transport(format!(
            "Connection to {addr} closed before reply"
        )))
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(NetworkError::Timeout(timeout)),
    }
}

/// Serve inbound RPCs on an already-bound listener until shutdown.
///
/// Each accepted connection gets its own read loop; every parsed frame
/// is dispatched to `handler` and the reply (if any) is written back.
/// Connection tasks watch the same shutdown signal, and `serve` returns
/// only after every one of them has finished, so a stopped node never
/// answers another frame, not even on an already-open connection.
pub async fn serve(
    listener: TcpListener,
    handler: RpcHandler,
    counters: Arc<TrafficCounters>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    info!("Transport listening on {local}");

    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        connections.spawn(handle_connection(
                            stream,
                            peer_addr,
                            Arc::clone(&handler),
                            Arc::clone(&counters),
                            shutdown.resubscribe(),
                        ));
                    }
                    Err(e) => {
                        error!("TCP accept failed: {e}");
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.recv() => {
                info!("Transport on {local} shutting down");
                break;
            }
        }
    }

    // Drain the open connections before returning; each exits on its
    // own copy of the shutdown signal.
    while connections.join_next().await.is_some() {}
}

/// Read loop for one accepted connection, until the peer closes or
/// shutdown is signalled.
async fn handle_connection(
    stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    handler: RpcHandler,
    counters: Arc<TrafficCounters>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket accept failed for {peer_addr}: {e}");
            return;
        }
    };
    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        counters.add_received(text.len());
                        let msg = match Message::from_json(&text) {
                            Ok(msg) => msg,
                            Err(e) => {
                                warn!("Bad frame from {peer_addr}: {e}");
                                continue;
                            }
                        };

                        if let Some(reply) = handler(msg, peer_addr).await {
                            match reply.to_json() {
                                Ok(json) => {
                                    counters.add_sent(json.len());
                                    if let Err(e) =
                                        sink.send(WsMessage::Text(json.into())).await
                                    {
                                        debug!("Reply to {peer_addr} failed: {e}");
                                        break;
                                    }
                                }
                                Err(e) => {
                                    error!("Reply serialize failed: {e}");
                                }
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        debug!("Peer {peer_addr} sent close");
                        break;
                    }
                    Some(Ok(_)) => {} // Ignore binary/ping/pong
                    Some(Err(e)) => {
                        debug!("Read error from {peer_addr}: {e}");
                        break;
                    }
                    None => break,
                }
            }
            _ = shutdown.recv() => {
                debug!("Closing connection to {peer_addr} on shutdown");
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use crate::error::RelayError;
use crate::metrics::{counters, gauges, histograms};
use crate::router::Session;
use crate::server::ServerState;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Decrements the active-connection count when a connection task ends,
/// whichever way it ends.
struct ConnGuard {
    state: Arc<ServerState>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::Relaxed);
        gauges::dec_connections_active();
    }
}

/// Upgrade an accepted TCP stream to WebSocket and serve it until it
/// closes or errors. The caller has already counted this connection; the
/// guard uncounts it on any exit path.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), RelayError> {
    let _guard = ConnGuard {
        state: Arc::clone(&state),
    };

    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_payload),
        max_frame_size: Some(state.config.max_payload),
        ..WebSocketConfig::default()
    };
    let ws_stream =
        tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (deliver_tx, mut deliver_rx) = mpsc::channel::<String>(state.config.send_queue_depth);
    let mut session = Session::new(deliver_tx);

    let result =
        run_message_loop(&mut ws_tx, &mut ws_rx, &mut deliver_rx, &state, &mut session).await;

    // graceful close and transport error both land here; the session
    // makes the leave-plus-broadcast single-shot
    if let Err(e) = &result {
        match session.peer_id() {
            Some(peer) => tracing::debug!(peer = %peer, error = %e, "connection error"),
            None => tracing::debug!(addr = %peer_addr, error = %e, "connection error"),
        }
    }
    session.finish(&state.registry);

    result
}

async fn run_message_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    deliver_rx: &mut mpsc::Receiver<String>,
    state: &ServerState,
    session: &mut Session,
) -> Result<(), RelayError> {
    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        dispatch(session, state, &text);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        // the protocol is UTF-8 JSON; tolerate binary
                        // frames that decode, ignore the rest
                        match std::str::from_utf8(&data) {
                            Ok(text) => dispatch(session, state, text),
                            Err(_) => {
                                counters::messages_dropped_total("malformed");
                                tracing::warn!("ignoring non-UTF-8 binary frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            tracing::debug!("failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(RelayError::WebSocket(e)),
                    _ => {}
                }
            }
            Some(payload) = deliver_rx.recv() => {
                ws_tx.send(Message::Text(payload)).await.map_err(RelayError::WebSocket)?;
            }
        }
    }
}

fn dispatch(session: &mut Session, state: &ServerState, text: &str) {
    let start = Instant::now();
    session.handle_frame(&state.registry, text);
    histograms::dispatch_latency_seconds(start.elapsed().as_secs_f64());
}

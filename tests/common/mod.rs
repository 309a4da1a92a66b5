use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sigrelay::config::ServerConfig;
use sigrelay::registry::Registry;
use sigrelay::server::ServerState;
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        max_conns: 1000,
        max_payload: 65_536,
        send_queue_depth: 64,
    }
}

pub struct TestClient {
    pub ws_tx: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        Message,
    >,
    pub ws_rx: futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
}

impl TestClient {
    pub async fn connect(addr: &SocketAddr) -> Self {
        let url = format!("ws://{addr}");
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let (ws_tx, ws_rx) = ws.split();
        Self { ws_tx, ws_rx }
    }

    pub async fn join(&mut self, room: &str, id: &str, name: &str) {
        self.send_json(&json!({
            "type": "join",
            "room": room,
            "id": id,
            "name": name,
        }))
        .await;
    }

    pub async fn send_json(&mut self, value: &Value) {
        self.send_raw(&value.to_string()).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws_tx
            .send(Message::Text(text.to_owned()))
            .await
            .unwrap();
    }

    pub async fn close(mut self) {
        let _ = self.ws_tx.close().await;
    }

    pub async fn recv_json(&mut self) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for message")
                .unwrap()
                .unwrap();
            match msg {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    /// Receive the next `peer_list`, skipping anything else, and return
    /// its members sorted by id.
    pub async fn recv_peer_list(&mut self) -> Vec<(String, String)> {
        loop {
            let value = self.recv_json().await;
            if value["type"] == "peer_list" {
                let mut peers: Vec<(String, String)> = value["peers"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|p| {
                        (
                            p["id"].as_str().unwrap().to_owned(),
                            p["name"].as_str().unwrap().to_owned(),
                        )
                    })
                    .collect();
                peers.sort();
                return peers;
            }
        }
    }

    /// Receive the next frame that is not a `peer_list`.
    pub async fn recv_directed(&mut self) -> Value {
        loop {
            let value = self.recv_json().await;
            if value["type"] != "peer_list" {
                return value;
            }
        }
    }

    pub async fn recv_json_timeout(&mut self, timeout: Duration) -> Option<Value> {
        tokio::time::timeout(timeout, self.recv_json()).await.ok()
    }
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(ServerState {
        registry: Registry::new(),
        config: test_config(addr),
        active_connections: AtomicUsize::new(0),
    });

    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = sigrelay::run(listener, state_clone).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, state)
}

/// Poll until `predicate` holds or two seconds pass.
pub async fn wait_until<F: Fn() -> bool>(predicate: F) -> bool {
    for _ in 0..100 {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate()
}

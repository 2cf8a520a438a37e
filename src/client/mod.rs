#![forbid(unsafe_code)]

// Client module - WebSocket signaling client that keeps a joined peer in sync

pub mod poller;

pub use poller::{SyncPoller, DEFAULT_SYNC_INTERVAL};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 64;
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Server rejected {in_reply_to:?}: {reason}")]
    Server {
        in_reply_to: Option<String>,
        reason: String,
    },

    #[error("No {0} response in time")]
    Timeout(String),

    #[error("Unexpected response: {0}")]
    Protocol(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// A signaling connection. After `join_room` it polls `sync` in the
/// background and keeps the latest room state.
pub struct SignalingClient {
    outgoing: mpsc::Sender<String>,
    incoming: mpsc::Receiver<Value>,
    tasks: Vec<JoinHandle<()>>,
    poller: Option<SyncPoller>,
    sync_interval: Duration,
    response_timeout: Duration,
    last_sync: Option<Value>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> ClientResult<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel::<Value>(CHANNEL_CAPACITY);

        // Handle outgoing messages
        let writer = tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if write.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Handle incoming messages
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match serde_json::from_str::<Value>(&text) {
                    Ok(value) => {
                        if incoming_tx.send(value).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Server sent invalid JSON: {}", e),
                }
            }
        });

        Ok(Self {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
            tasks: vec![writer, reader],
            poller: None,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            last_sync: None,
        })
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.poller.as_ref().map(|p| p.peer_id())
    }

    pub fn room_id(&self) -> Option<&str> {
        self.poller.as_ref().map(|p| p.room_id())
    }

    /// Latest `on-sync` payload (`{activeSpeaker, peers}`) seen so far
    pub fn last_sync(&self) -> Option<&Value> {
        self.last_sync.as_ref()
    }

    pub async fn send(&self, message: Value) -> ClientResult<()> {
        self.outgoing
            .send(message.to_string())
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Waits for the next message that is not a sync update
    pub async fn recv(&mut self) -> ClientResult<Value> {
        loop {
            let message = self.incoming.recv().await.ok_or(ClientError::Closed)?;
            if message["type"] == "on-sync" {
                self.last_sync = Some(message["data"].clone());
                continue;
            }
            return Ok(message);
        }
    }

    /// Sends `message` and returns the reply of type `expected`
    pub async fn request(&mut self, message: Value, expected: &str) -> ClientResult<Value> {
        self.send(message).await?;
        let timeout = self.response_timeout;
        let reply = tokio::time::timeout(timeout, async {
            loop {
                let reply = self.recv().await?;
                match reply["type"].as_str() {
                    Some(t) if t == expected => return Ok(reply),
                    Some("error") => {
                        return Err(ClientError::Server {
                            in_reply_to: reply["inReplyTo"].as_str().map(str::to_string),
                            reason: reply["reason"].as_str().unwrap_or_default().to_string(),
                        })
                    }
                    other => debug!("Skipping {:?} while waiting for {}", other, expected),
                }
            }
        })
        .await;
        reply.map_err(|_| ClientError::Timeout(expected.to_string()))?
    }

    /// Joins a room and (re)starts sync polling for the new peer
    pub async fn join_room(&mut self, room_id: &str) -> ClientResult<String> {
        // A sync for the old peer sent after the join would be rejected
        if let Some(previous) = self.poller.take() {
            previous.stop().await;
        }

        let reply = self
            .request(
                json!({ "type": "join-room", "data": { "roomId": room_id } }),
                "joined-room",
            )
            .await?;
        let peer_id = reply["data"]["peerId"]
            .as_str()
            .ok_or_else(|| ClientError::Protocol("joined-room without peerId".to_string()))?
            .to_string();

        self.poller = Some(SyncPoller::start(
            self.outgoing.clone(),
            peer_id.clone(),
            room_id.to_string(),
            self.sync_interval,
        ));
        self.last_sync = None;
        Ok(peer_id)
    }

    pub async fn get_all_peers(&mut self, room_id: &str) -> ClientResult<Value> {
        let reply = self
            .request(
                json!({ "type": "get-all-peers", "data": { "roomId": room_id } }),
                "all-peers",
            )
            .await?;
        Ok(reply["peers"].clone())
    }

    pub async fn router_capabilities(&mut self) -> ClientResult<Value> {
        let reply = self
            .request(json!({ "type": "getRouterRtpCapabilities" }), "routerCapabilities")
            .await?;
        Ok(reply["rtpCapabilities"].clone())
    }

    /// Waits until a sync update arrives that satisfies `check`
    pub async fn wait_for_sync<F>(&mut self, timeout: Duration, check: F) -> ClientResult<Value>
    where
        F: Fn(&Value) -> bool,
    {
        let waited = tokio::time::timeout(timeout, async {
            loop {
                let message = self.incoming.recv().await.ok_or(ClientError::Closed)?;
                if message["type"] == "on-sync" {
                    let data = message["data"].clone();
                    self.last_sync = Some(data.clone());
                    if check(&data) {
                        return Ok(data);
                    }
                }
            }
        })
        .await;
        waited.map_err(|_| ClientError::Timeout("on-sync".to_string()))?
    }

    /// Leaves the joined room and stops polling
    pub async fn leave_room(&mut self) -> ClientResult<()> {
        let Some(poller) = self.poller.take() else {
            return Ok(());
        };
        let message = json!({
            "type": "leave-room",
            "roomId": poller.room_id(),
            "peerId": poller.peer_id(),
        });
        poller.stop().await;
        self.request(message, "left").await?;
        Ok(())
    }

    /// Stops polling and closes the connection
    pub async fn close(mut self) {
        if let Some(poller) = self.poller.take() {
            poller.stop().await;
        }
        drop(self.outgoing);
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::fake::{audio_rtp_parameters, fake_dtls_parameters, FakeEngine};
    use crate::media::RouterConfig;
    use crate::metrics::ServerMetrics;
    use crate::recording::{Recorder, RecordingConfig};
    use crate::room::{RoomConfig, RoomRegistry};
    use crate::signaling::SignalingServer;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn spawn_server() -> (String, Arc<RoomRegistry>) {
        let engine = FakeEngine::new();
        let metrics = ServerMetrics::new();
        let registry = Arc::new(RoomRegistry::new(engine.clone(), RoomConfig::default(), metrics.clone()));
        let recorder = Recorder::new(
            engine,
            RecordingConfig::default(),
            RouterConfig::default().receiver_capabilities(),
            metrics.clone(),
        );
        let server = SignalingServer::new(registry.clone(), recorder, metrics, 16, Duration::from_secs(30));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            server.serve_on(listener).await.ok();
        });
        (format!("ws://{addr}/"), registry)
    }

    async fn client(url: &str) -> SignalingClient {
        SignalingClient::connect(url)
            .await
            .unwrap()
            .with_sync_interval(Duration::from_millis(50))
            .with_response_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_join_starts_sync_polling() {
        let (url, _registry) = spawn_server().await;
        let mut alice = client(&url).await;
        let mut bob = client(&url).await;

        let alice_id = alice.join_room("r1").await.unwrap();
        let bob_id = bob.join_room("r1").await.unwrap();

        let synced = alice
            .wait_for_sync(Duration::from_secs(2), |data| data["peers"].get(&bob_id).is_some())
            .await
            .unwrap();
        assert!(synced["peers"].get(&alice_id).is_some());
        assert!(synced["activeSpeaker"]["peerId"].is_null());

        let peers = bob.get_all_peers("r1").await.unwrap();
        assert!(peers.get(&alice_id).is_some());

        alice.close().await;
        bob.close().await;
    }

    #[tokio::test]
    async fn test_rejoin_restarts_polling_for_new_peer() {
        let (url, registry) = spawn_server().await;
        let mut alice = client(&url).await;

        let first = alice.join_room("r1").await.unwrap();
        let second = alice.join_room("r2").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(alice.peer_id(), Some(second.as_str()));
        assert_eq!(alice.room_id(), Some("r2"));

        let synced = alice
            .wait_for_sync(Duration::from_secs(2), |data| data["peers"].get(&second).is_some())
            .await
            .unwrap();
        assert!(synced["peers"].get(&first).is_none());
        assert!(!registry.peers("r1").await.unwrap().contains_key(&first));

        alice.close().await;
    }

    #[tokio::test]
    async fn test_leave_room_stops_polling() {
        let (url, registry) = spawn_server().await;
        let mut alice = client(&url).await;
        let peer_id = alice.join_room("r1").await.unwrap();

        alice.leave_room().await.unwrap();

        assert!(alice.peer_id().is_none());
        assert!(!registry.peers("r1").await.unwrap().contains_key(&peer_id));
        alice.close().await;
    }

    #[tokio::test]
    async fn test_server_errors_surface() {
        let (url, _registry) = spawn_server().await;
        let mut alice = client(&url).await;

        let result = alice.get_all_peers("missing").await;
        match result {
            Err(ClientError::Server { in_reply_to, .. }) => {
                assert_eq!(in_reply_to.as_deref(), Some("get-all-peers"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let caps = alice.router_capabilities().await.unwrap();
        assert!(caps.get("codecs").is_some());
        alice.close().await;
    }

    #[tokio::test]
    async fn test_consume_sent_before_receive_transport() {
        let (url, _registry) = spawn_server().await;
        let mut alice = client(&url).await;
        let mut bob = client(&url).await;
        let alice_id = alice.join_room("r1").await.unwrap();
        let bob_id = bob.join_room("r1").await.unwrap();

        let created = alice
            .request(
                json!({ "type": "createTransport", "data": { "direction": "send", "peerId": alice_id, "roomId": "r1" } }),
                "transportCreated",
            )
            .await
            .unwrap();
        let transport_id = created["data"]["transportOptions"]["id"].as_str().unwrap().to_string();
        alice
            .request(
                json!({
                    "type": "connectTransport",
                    "data": {
                        "transportId": transport_id,
                        "dtlsParameters": serde_json::to_value(fake_dtls_parameters()).unwrap(),
                        "roomId": "r1",
                    },
                }),
                "connected",
            )
            .await
            .unwrap();
        alice
            .request(
                json!({
                    "type": "send-track",
                    "transportId": transport_id,
                    "roomId": "r1",
                    "peerId": alice_id,
                    "kind": "audio",
                    "rtpParameters": serde_json::to_value(audio_rtp_parameters()).unwrap(),
                    "appData": { "mediaTag": "cam-audio" },
                }),
                "produced",
            )
            .await
            .unwrap();

        // The consume arrives first and waits for the transport right behind it
        bob.send(json!({
            "type": "createConsumer",
            "roomId": "r1",
            "peerId": bob_id,
            "mediaTag": "cam-audio",
            "mediaPeerId": alice_id,
            "rtpCapabilities": serde_json::to_value(RouterConfig::default().receiver_capabilities()).unwrap(),
        }))
        .await
        .unwrap();
        bob.send(json!({
            "type": "createTransport",
            "data": { "direction": "recv", "peerId": bob_id, "roomId": "r1" },
        }))
        .await
        .unwrap();

        // Well inside the server's ten second readiness timeout
        let replies = tokio::time::timeout(Duration::from_secs(3), async {
            let mut seen = Vec::new();
            while seen.len() < 2 {
                let reply = bob.recv().await.unwrap();
                assert_ne!(reply["type"], "error", "unexpected error {reply}");
                seen.push(reply);
            }
            seen
        })
        .await
        .expect("consume still waiting on the receive transport");

        let consumer = replies.iter().find(|r| r["type"] == "consumerCreated").unwrap();
        assert_eq!(consumer["kind"], "audio");
        assert!(replies.iter().any(|r| r["type"] == "transportCreated"));

        alice.close().await;
        bob.close().await;
    }
}

#![forbid(unsafe_code)]

// Periodic sync requests on behalf of a joined peer

use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How often a joined client asks for the room's state
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_millis(1000);

/// Sends `sync` for one (peer, room) every interval until stopped or dropped
pub struct SyncPoller {
    peer_id: String,
    room_id: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SyncPoller {
    pub fn start(
        outgoing: mpsc::Sender<String>,
        peer_id: String,
        room_id: String,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let message = json!({
            "type": "sync",
            "data": { "peerId": peer_id, "roomId": room_id },
        })
        .to_string();

        let task_cancel = cancel.clone();
        let task_peer = peer_id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if outgoing.send(message.clone()).await.is_err() {
                            debug!("Connection closed, sync poller for {} exiting", task_peer);
                            break;
                        }
                    }
                    _ = task_cancel.cancelled() => break,
                }
            }
        });

        Self {
            peer_id,
            room_id,
            cancel,
            handle,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stops polling and waits for the task to exit
    pub async fn stop(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for SyncPoller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

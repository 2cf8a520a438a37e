#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::handlers::{handle_client_message, SessionBinding, SignalingContext};
use super::protocol::{parse_client_message, ClientMessage, ServerMessage};
use crate::error::SignalingResult;
use crate::metrics::{Counter, ServerMetrics};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// Messages queued beyond this are stale; drop them early.
const CHANNEL_CAPACITY: usize = 64;

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// Serialize a ServerMessage and send it through the channel as pre-serialized JSON.
fn send_json(
    sender: &mpsc::Sender<Arc<String>>,
    msg: &ServerMessage,
) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(msg)?);
    sender.try_send(json).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

fn send_error(sender: &mpsc::Sender<Arc<String>>, in_reply_to: Option<String>, reason: String) {
    if let Err(e) = send_json(sender, &ServerMessage::Error { in_reply_to, reason }) {
        debug!("Dropped error response: {}", e);
    }
}

/// Queues the reply, or the error response, for one handled request
fn send_result(
    sender: &mpsc::Sender<Arc<String>>,
    metrics: &ServerMetrics,
    connection_id: &str,
    type_name: &'static str,
    result: SignalingResult<Option<ServerMessage>>,
) {
    match result {
        Ok(Some(reply)) => {
            if let Err(e) = send_json(sender, &reply) {
                warn!("Failed to queue {} reply on {}: {}", type_name, connection_id, e);
            }
        }
        Ok(None) => {}
        Err(e) => {
            warn!("Error handling {} on {}: {}", type_name, connection_id, e);
            metrics.inc(Counter::Errors);
            send_error(sender, Some(type_name.to_string()), e.to_string());
        }
    }
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    ctx: SignalingContext,
    metrics: ServerMetrics,
    idle_timeout: Duration,
    _permit: OwnedSemaphorePermit,
) {
    let connection_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", connection_id);

    metrics.inc(Counter::Connections);
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let connection_id_clone = connection_id.clone();
    let send_metrics = metrics.clone();

    // Spawn task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc(Counter::MessagesSent);
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for connection: {}", connection_id_clone);
    });

    let mut binding: Option<SessionBinding> = None;
    // createConsumer requests waiting on this peer's receive transport
    let mut pending_consumes = JoinSet::new();

    // Token bucket rate limiter state
    let mut tokens_us: u64 = MAX_TOKENS_US;
    let mut last_refill = Instant::now();
    let mut rate_limit_warned = false;

    loop {
        // Idle timeout: close connection if no message within idle_timeout
        let msg = match tokio::time::timeout(idle_timeout, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for connection {}", connection_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc(Counter::MessagesReceived);

                let now = Instant::now();
                let elapsed_us = now.duration_since(last_refill).as_micros() as u64;
                last_refill = now;
                tokens_us = (tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);

                if tokens_us >= TOKEN_US {
                    tokens_us -= TOKEN_US;
                    rate_limit_warned = false;
                } else {
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for connection {}", connection_id);
                        send_error(
                            &tx,
                            None,
                            format!("Rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} messages/second"),
                        );
                    }
                    continue;
                }

                let client_msg = match parse_client_message(&text) {
                    Ok(client_msg) => client_msg,
                    Err(malformed) => {
                        warn!("Rejected message on {}: {}", connection_id, malformed.reason);
                        metrics.inc(Counter::Errors);
                        send_error(&tx, malformed.in_reply_to, malformed.reason);
                        continue;
                    }
                };

                while pending_consumes.try_join_next().is_some() {}

                let type_name = client_msg.type_name();

                // A consume may wait for the receive transport that a later
                // message on this same socket creates, so it runs on its own task.
                // It only reads the binding, so a snapshot is enough.
                if matches!(client_msg, ClientMessage::CreateConsumer { .. }) {
                    let mut session = binding.clone();
                    let ctx = ctx.clone();
                    let tx = tx.clone();
                    let metrics = metrics.clone();
                    let connection_id = connection_id.clone();
                    pending_consumes.spawn(async move {
                        let start = Instant::now();
                        let result = handle_client_message(&ctx, &mut session, client_msg).await;
                        metrics.observe_message_handling(start.elapsed());
                        send_result(&tx, &metrics, &connection_id, type_name, result);
                    });
                    continue;
                }

                // Everything else is handled one at a time, in receipt order
                let start = Instant::now();
                let result = handle_client_message(&ctx, &mut binding, client_msg).await;
                metrics.observe_message_handling(start.elapsed());

                send_result(&tx, &metrics, &connection_id, type_name, result);
                // If channel is closed, send task has exited
                if tx.is_closed() {
                    break;
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", connection_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            _ => {
                warn!("Unexpected message type from connection {}", connection_id);
            }
        }
    }

    // The peer stays in its room until it leaves or stops syncing
    if let Some(session) = &binding {
        info!(
            "Connection {} for peer {} in room {} closed",
            connection_id, session.peer_id, session.room_id
        );
    }

    // _conn_guard dropped here → dec_connections_active
    // _permit dropped here → release semaphore

    // Abandoned consumes hold senders; the send task ends once they are gone
    pending_consumes.shutdown().await;
    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished: {}", connection_id);
}

#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication
//
// Requests carry their fields either flat or nested under `data`; both are
// accepted. Responses keep the shapes browser clients already read.

use crate::media::{TransportDirection, TransportInfo};
use crate::room::{ActiveSpeaker, ConsumerCreated, Peer};
use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Client-to-Server messages
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "join-room", rename_all = "camelCase")]
    JoinRoom { room_id: String },
    #[serde(rename = "get-all-peers", rename_all = "camelCase")]
    GetAllPeers { room_id: String },
    /// Periodic poll; also refreshes the peer's last-seen time
    #[serde(rename = "sync", rename_all = "camelCase")]
    Sync { peer_id: String, room_id: String },
    #[serde(rename = "getRouterRtpCapabilities")]
    GetRouterRtpCapabilities,
    #[serde(rename = "createTransport", rename_all = "camelCase")]
    CreateTransport {
        direction: TransportDirection,
        peer_id: String,
        room_id: String,
    },
    #[serde(rename = "connectTransport", rename_all = "camelCase")]
    ConnectTransport {
        transport_id: String,
        dtls_parameters: DtlsParameters,
        room_id: String,
        #[serde(default)]
        peer_id: Option<String>,
    },
    /// Produce media (audio/video)
    #[serde(rename = "send-track", rename_all = "camelCase")]
    SendTrack {
        transport_id: String,
        room_id: String,
        peer_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        app_data: TrackAppData,
        #[serde(default)]
        paused: bool,
    },
    #[serde(rename = "createConsumer", rename_all = "camelCase")]
    CreateConsumer {
        room_id: String,
        peer_id: String,
        media_tag: String,
        media_peer_id: String,
        rtp_capabilities: RtpCapabilities,
    },
    #[serde(rename = "resume", rename_all = "camelCase")]
    Resume {
        room_id: String,
        peer_id: String,
        consumer_id: String,
    },
    #[serde(rename = "pause", rename_all = "camelCase")]
    Pause {
        room_id: String,
        peer_id: String,
        consumer_id: String,
    },
    /// Pause a producer (mute)
    #[serde(rename = "pause-producer", rename_all = "camelCase")]
    PauseProducer {
        room_id: String,
        peer_id: String,
        producer_id: String,
    },
    /// Resume a producer (unmute)
    #[serde(rename = "resume-producer", rename_all = "camelCase")]
    ResumeProducer {
        room_id: String,
        peer_id: String,
        producer_id: String,
    },
    #[serde(rename = "close-producer", rename_all = "camelCase")]
    CloseProducer {
        room_id: String,
        peer_id: String,
        producer_id: String,
    },
    /// Preferred simulcast spatial layer for a consumer
    #[serde(rename = "consumer-set-layers", rename_all = "camelCase")]
    ConsumerSetLayers {
        room_id: String,
        peer_id: String,
        consumer_id: String,
        spatial_layer: u8,
    },
    #[serde(rename = "leave-room", rename_all = "camelCase")]
    LeaveRoom { room_id: String, peer_id: String },
    #[serde(rename = "startRecording", rename_all = "camelCase")]
    StartRecording { room_id: String },
    #[serde(rename = "stopRecording", rename_all = "camelCase")]
    StopRecording { room_id: String },
}

/// Client-supplied producer metadata
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackAppData {
    #[serde(default)]
    pub media_tag: Option<String>,
}

impl ClientMessage {
    /// Wire name of the message, echoed back as `inReplyTo` on errors
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::GetAllPeers { .. } => "get-all-peers",
            ClientMessage::Sync { .. } => "sync",
            ClientMessage::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
            ClientMessage::CreateTransport { .. } => "createTransport",
            ClientMessage::ConnectTransport { .. } => "connectTransport",
            ClientMessage::SendTrack { .. } => "send-track",
            ClientMessage::CreateConsumer { .. } => "createConsumer",
            ClientMessage::Resume { .. } => "resume",
            ClientMessage::Pause { .. } => "pause",
            ClientMessage::PauseProducer { .. } => "pause-producer",
            ClientMessage::ResumeProducer { .. } => "resume-producer",
            ClientMessage::CloseProducer { .. } => "close-producer",
            ClientMessage::ConsumerSetLayers { .. } => "consumer-set-layers",
            ClientMessage::LeaveRoom { .. } => "leave-room",
            ClientMessage::StartRecording { .. } => "startRecording",
            ClientMessage::StopRecording { .. } => "stopRecording",
        }
    }
}

/// A request that could not be decoded
#[derive(Debug, Clone)]
pub struct MalformedRequest {
    /// The request's `type`, when it had a readable one
    pub in_reply_to: Option<String>,
    pub reason: String,
}

/// Lifts the fields of a `data` object to the top level. Fields inside
/// `data` win over top-level fields of the same name.
pub fn normalize(mut value: Value) -> Value {
    if let Value::Object(ref mut map) = value {
        if let Some(Value::Object(data)) = map.remove("data") {
            for (key, field) in data {
                map.insert(key, field);
            }
        }
    }
    value
}

/// Decodes one text frame into a request
pub fn parse_client_message(text: &str) -> Result<ClientMessage, MalformedRequest> {
    let value: Value = serde_json::from_str(text).map_err(|e| MalformedRequest {
        in_reply_to: None,
        reason: format!("Invalid JSON: {e}"),
    })?;
    let in_reply_to = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string);

    serde_json::from_value(normalize(value)).map_err(|e| MalformedRequest {
        in_reply_to,
        reason: format!("Invalid message format: {e}"),
    })
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "joined-room")]
    JoinedRoom { data: JoinedRoomData },
    #[serde(rename = "all-peers")]
    AllPeers { peers: HashMap<String, Peer> },
    #[serde(rename = "on-sync")]
    OnSync { data: SyncData },
    #[serde(rename = "routerCapabilities", rename_all = "camelCase")]
    RouterCapabilities {
        rtp_capabilities: RtpCapabilitiesFinalized,
    },
    #[serde(rename = "transportCreated")]
    TransportCreated { data: TransportCreatedData },
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "produced")]
    Produced { id: String },
    #[serde(rename = "consumerCreated")]
    ConsumerCreated(ConsumerCreated),
    #[serde(rename = "resumed")]
    Resumed,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "producerPaused")]
    ProducerPaused,
    #[serde(rename = "producerResumed")]
    ProducerResumed,
    #[serde(rename = "producerClosed")]
    ProducerClosed,
    #[serde(rename = "layersSet")]
    LayersSet,
    #[serde(rename = "left")]
    Left,
    /// Error response
    #[serde(rename = "error", rename_all = "camelCase")]
    Error {
        in_reply_to: Option<String>,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedRoomData {
    pub peer_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncData {
    pub active_speaker: ActiveSpeaker,
    pub peers: HashMap<String, Peer>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCreatedData {
    pub transport_options: TransportInfo,
}

#![forbid(unsafe_code)]

// Peer records as published to clients through get-all-peers and sync

use mediasoup::prelude::RtpEncodingParameters;
use serde::Serialize;
use std::collections::HashMap;

/// One participant of a room
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub peer_id: String,
    pub join_ts: u64,
    pub last_seen_ts: u64,
    /// Keyed by the client's media tag, e.g. "cam-video"
    pub media: HashMap<String, MediaInfo>,
    /// Keyed by consumer id
    pub consumer_layers: HashMap<String, ConsumerLayerState>,
}

impl Peer {
    pub fn new(peer_id: String, now_ms: u64) -> Self {
        Self {
            peer_id,
            join_ts: now_ms,
            last_seen_ts: now_ms,
            media: HashMap::new(),
            consumer_layers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub paused: bool,
    pub encodings: Vec<RtpEncodingParameters>,
}

/// Spatial layers of one consumer: what the engine forwards and what the client asked for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayerState {
    pub current_layer: Option<u8>,
    pub client_selected_layer: Option<u8>,
}

/// Loudest producer as last reported by the audio-level observer; all null on silence
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSpeaker {
    pub producer_id: Option<String>,
    pub volume: Option<i8>,
    pub peer_id: Option<String>,
}

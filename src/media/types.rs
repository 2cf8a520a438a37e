#![forbid(unsafe_code)]

// Common types and error handling for the media module

use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Custom error type for media operations
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Router error: {0}")]
    RouterError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Producer error: {0}")]
    ProducerError(String),

    #[error("Consumer error: {0}")]
    ConsumerError(String),

    #[error("Observer error: {0}")]
    ObserverError(String),

    #[error("Transport closed: {0}")]
    Closed(String),

    #[error("Invalid id: {0}")]
    InvalidId(String),

    #[error("Mediasoup error: {0}")]
    MediasoupError(#[from] mediasoup::worker::RequestError),
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Which way media flows on a WebRTC transport, from the client's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDirection::Send => f.write_str("send"),
            TransportDirection::Recv => f.write_str("recv"),
        }
    }
}

/// Transport information for signaling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

impl From<&WebRtcTransport> for TransportInfo {
    fn from(transport: &WebRtcTransport) -> Self {
        Self {
            id: transport.id().to_string(),
            ice_parameters: transport.ice_parameters().clone(),
            ice_candidates: transport.ice_candidates().clone(),
            dtls_parameters: transport.dtls_parameters(),
        }
    }
}

/// Simulcast/SVC layer pair as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerInfo {
    pub spatial_layer: u8,
    #[serde(default)]
    pub temporal_layer: Option<u8>,
}

impl From<ConsumerLayers> for LayerInfo {
    fn from(layers: ConsumerLayers) -> Self {
        Self {
            spatial_layer: layers.spatial_layer,
            temporal_layer: layers.temporal_layer,
        }
    }
}

impl From<LayerInfo> for ConsumerLayers {
    fn from(layers: LayerInfo) -> Self {
        ConsumerLayers {
            spatial_layer: layers.spatial_layer,
            temporal_layer: layers.temporal_layer,
        }
    }
}

/// Events raised by engine objects.
///
/// Engine callbacks are synchronous and may fire on worker threads, so they
/// only push one of these into the owning room's channel.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ProducerTransportClosed { producer_id: String },
    ConsumerTransportClosed { consumer_id: String },
    ConsumerProducerClosed { consumer_id: String },
    ConsumerLayersChanged { consumer_id: String, layers: Option<LayerInfo> },
    /// Loudest producers first, volume in dBov
    Volumes(Vec<(String, i8)>),
    Silence,
}

pub type EventSink = tokio::sync::mpsc::UnboundedSender<EngineEvent>;

/// Codec details the recording encoder needs, taken from a consumer's negotiated parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecInfo {
    pub payload_type: u8,
    pub codec_name: String,
    pub clock_rate: u32,
    pub channels: u8,
}

impl CodecInfo {
    /// Picks the first audio codec; name is lowercased subtype, channels default to 2
    pub fn from_rtp_parameters(rtp_parameters: &RtpParameters) -> Option<Self> {
        rtp_parameters.codecs.iter().find_map(|codec| match codec {
            RtpCodecParameters::Audio {
                mime_type,
                payload_type,
                clock_rate,
                channels,
                ..
            } => {
                let mime = serde_json::to_value(mime_type).ok()?;
                let mime = mime.as_str()?;
                let codec_name = mime.split('/').nth(1).unwrap_or(mime).to_lowercase();
                Some(Self {
                    payload_type: *payload_type,
                    codec_name,
                    clock_rate: clock_rate.get(),
                    channels: channels.get(),
                })
            }
            RtpCodecParameters::Video { .. } => None,
        })
    }
}

/// Current wall clock in milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

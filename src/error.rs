#![forbid(unsafe_code)]

// Error taxonomy shared by the room state machine and the signaling handlers

use crate::media::MediaError;
use crate::recording::RecordingError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignalingError {
    /// Room, peer, transport, producer or consumer lookup miss
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("External process failure: {0}")]
    ExternalProcessFailure(String),

    /// The receiving client cannot consume the producer
    #[error("Cannot consume: {0}")]
    EngineCapabilityMismatch(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Message names a peer or room other than the one this connection joined
    #[error("Session mismatch: {0}")]
    SessionMismatch(String),

    #[error("Join a room first")]
    NotJoined,

    #[error("Transport not ready: {0}")]
    TransportNotReady(String),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),
}

pub type SignalingResult<T> = Result<T, SignalingError>;

impl From<RecordingError> for SignalingError {
    fn from(error: RecordingError) -> Self {
        match error {
            RecordingError::ExhaustedRange { .. } => SignalingError::ResourceExhausted(error.to_string()),
            RecordingError::Media(e) => SignalingError::Media(e),
            RecordingError::NoAudioCodec(producer_id) => {
                SignalingError::EngineCapabilityMismatch(format!("producer {producer_id} has no audio codec"))
            }
            RecordingError::EncoderSpawn(_) | RecordingError::Io(_) | RecordingError::Cancelled(_) => {
                SignalingError::ExternalProcessFailure(error.to_string())
            }
        }
    }
}

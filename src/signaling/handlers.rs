#![forbid(unsafe_code)]

// Request handlers - one function per signaling message, plus the
// connection-to-session binding that scopes them

use super::protocol::{
    ClientMessage, JoinedRoomData, ServerMessage, SyncData, TransportCreatedData,
};
use crate::error::{SignalingError, SignalingResult};
use crate::recording::{Recorder, RecordingStart};
use crate::room::RoomRegistry;
use std::sync::Arc;
use tracing::{debug, info, warn};

const MAX_ROOM_ID_LEN: usize = 128;
const MAX_MEDIA_TAG_LEN: usize = 64;

/// Shared services every connection dispatches into
#[derive(Clone)]
pub struct SignalingContext {
    pub registry: Arc<RoomRegistry>,
    pub recorder: Recorder,
}

/// The (peer, room) a connection joined as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBinding {
    pub peer_id: String,
    pub room_id: String,
}

/// Checks that a message speaks for the connection's own session
fn bound<'a>(
    binding: &'a Option<SessionBinding>,
    room_id: &str,
    peer_id: Option<&str>,
) -> SignalingResult<&'a SessionBinding> {
    let session = binding.as_ref().ok_or(SignalingError::NotJoined)?;
    if session.room_id != room_id {
        return Err(SignalingError::SessionMismatch(format!(
            "connection joined room {}, message names {}",
            session.room_id, room_id
        )));
    }
    if let Some(peer_id) = peer_id {
        if session.peer_id != peer_id {
            return Err(SignalingError::SessionMismatch(format!(
                "connection is peer {}, message names {}",
                session.peer_id, peer_id
            )));
        }
    }
    Ok(session)
}

/// Handles one request. `Ok(None)` means the message has no success reply.
pub async fn handle_client_message(
    ctx: &SignalingContext,
    binding: &mut Option<SessionBinding>,
    message: ClientMessage,
) -> SignalingResult<Option<ServerMessage>> {
    let registry = &ctx.registry;

    let reply = match message {
        ClientMessage::JoinRoom { room_id } => {
            if room_id.is_empty() || room_id.len() > MAX_ROOM_ID_LEN {
                return Err(SignalingError::InvalidMessage(format!(
                    "roomId must be 1-{MAX_ROOM_ID_LEN} characters"
                )));
            }
            // Rejoining replaces the connection's previous peer
            if let Some(old) = binding.take() {
                if let Err(e) = registry.leave(&old.room_id, &old.peer_id).await {
                    debug!("Previous peer {} already gone: {}", old.peer_id, e);
                }
            }

            let peer_id = registry.join(&room_id).await;
            *binding = Some(SessionBinding {
                peer_id: peer_id.clone(),
                room_id,
            });
            ServerMessage::JoinedRoom {
                data: JoinedRoomData { peer_id },
            }
        }

        ClientMessage::GetAllPeers { room_id } => ServerMessage::AllPeers {
            peers: registry.peers(&room_id).await?,
        },

        ClientMessage::GetRouterRtpCapabilities => ServerMessage::RouterCapabilities {
            rtp_capabilities: registry.rtp_capabilities(),
        },

        ClientMessage::Sync { peer_id, room_id } => {
            bound(binding, &room_id, Some(&peer_id))?;
            let (active_speaker, peers) = registry.sync(&room_id, &peer_id).await?;
            ServerMessage::OnSync {
                data: SyncData {
                    active_speaker,
                    peers,
                },
            }
        }

        ClientMessage::CreateTransport {
            direction,
            peer_id,
            room_id,
        } => {
            bound(binding, &room_id, Some(&peer_id))?;
            let transport_options = registry.create_transport(&room_id, &peer_id, direction).await?;
            ServerMessage::TransportCreated {
                data: TransportCreatedData { transport_options },
            }
        }

        ClientMessage::ConnectTransport {
            transport_id,
            dtls_parameters,
            room_id,
            peer_id,
        } => {
            let session = bound(binding, &room_id, peer_id.as_deref())?;
            registry
                .connect_transport(&room_id, &session.peer_id, &transport_id, dtls_parameters)
                .await?;
            ServerMessage::Connected
        }

        ClientMessage::SendTrack {
            transport_id,
            room_id,
            peer_id,
            kind,
            rtp_parameters,
            app_data,
            paused,
        } => {
            bound(binding, &room_id, Some(&peer_id))?;
            let media_tag = app_data
                .media_tag
                .filter(|tag| !tag.is_empty() && tag.len() <= MAX_MEDIA_TAG_LEN)
                .ok_or_else(|| {
                    SignalingError::InvalidMessage(format!(
                        "send-track needs appData.mediaTag of 1-{MAX_MEDIA_TAG_LEN} characters"
                    ))
                })?;
            let id = registry
                .produce(&room_id, &peer_id, &transport_id, kind, rtp_parameters, paused, &media_tag)
                .await?;
            ServerMessage::Produced { id }
        }

        ClientMessage::CreateConsumer {
            room_id,
            peer_id,
            media_tag,
            media_peer_id,
            rtp_capabilities,
        } => {
            bound(binding, &room_id, Some(&peer_id))?;
            let created = registry
                .consume(&room_id, &peer_id, &media_peer_id, &media_tag, rtp_capabilities)
                .await?;
            ServerMessage::ConsumerCreated(created)
        }

        ClientMessage::Resume {
            room_id,
            peer_id,
            consumer_id,
        } => {
            bound(binding, &room_id, Some(&peer_id))?;
            registry.resume_consumer(&room_id, &peer_id, &consumer_id).await?;
            ServerMessage::Resumed
        }

        ClientMessage::Pause {
            room_id,
            peer_id,
            consumer_id,
        } => {
            bound(binding, &room_id, Some(&peer_id))?;
            registry.pause_consumer(&room_id, &peer_id, &consumer_id).await?;
            ServerMessage::Paused
        }

        ClientMessage::PauseProducer {
            room_id,
            peer_id,
            producer_id,
        } => {
            bound(binding, &room_id, Some(&peer_id))?;
            registry.pause_producer(&room_id, &peer_id, &producer_id).await?;
            ServerMessage::ProducerPaused
        }

        ClientMessage::ResumeProducer {
            room_id,
            peer_id,
            producer_id,
        } => {
            bound(binding, &room_id, Some(&peer_id))?;
            registry.resume_producer(&room_id, &peer_id, &producer_id).await?;
            ServerMessage::ProducerResumed
        }

        ClientMessage::CloseProducer {
            room_id,
            peer_id,
            producer_id,
        } => {
            bound(binding, &room_id, Some(&peer_id))?;
            registry.close_producer(&room_id, &peer_id, &producer_id).await?;
            ServerMessage::ProducerClosed
        }

        ClientMessage::ConsumerSetLayers {
            room_id,
            peer_id,
            consumer_id,
            spatial_layer,
        } => {
            bound(binding, &room_id, Some(&peer_id))?;
            registry
                .set_consumer_layers(&room_id, &peer_id, &consumer_id, spatial_layer)
                .await?;
            ServerMessage::LayersSet
        }

        ClientMessage::LeaveRoom { room_id, peer_id } => {
            bound(binding, &room_id, Some(&peer_id))?;
            registry.leave(&room_id, &peer_id).await?;
            *binding = None;
            info!("Peer {} left room {}", peer_id, room_id);
            ServerMessage::Left
        }

        ClientMessage::StartRecording { room_id } => {
            bound(binding, &room_id, None)?;
            start_recording(ctx, &room_id).await?;
            return Ok(None);
        }

        ClientMessage::StopRecording { room_id } => {
            bound(binding, &room_id, None)?;
            let producer_ids = registry.audio_producer_ids(&room_id).await?;
            let stopped = ctx.recorder.stop_recording(&producer_ids);
            info!("Stopping {} recording(s) in room {}", stopped, room_id);
            return Ok(None);
        }
    };

    Ok(Some(reply))
}

/// Records every audio producer of the room. Fails only when every start failed.
async fn start_recording(ctx: &SignalingContext, room_id: &str) -> SignalingResult<()> {
    let producer_ids = ctx.registry.audio_producer_ids(room_id).await?;
    if producer_ids.is_empty() {
        info!("No audio producers to record in room {}", room_id);
        return Ok(());
    }

    let attempted = producer_ids.len();
    let mut started = 0;
    let mut first_error = None;
    for (producer_id, result) in ctx.recorder.start_recording(producer_ids).await {
        match result {
            Ok(RecordingStart::Started { output_path }) => {
                debug!("Producer {} recording to {}", producer_id, output_path.display());
                started += 1;
            }
            Ok(RecordingStart::AlreadyRecording) => started += 1,
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    info!("Recording {}/{} audio producer(s) in room {}", started, attempted, room_id);
    match first_error {
        Some(e) if started == 0 => Err(e.into()),
        Some(e) => {
            warn!("Some recordings in room {} did not start: {}", room_id, e);
            Ok(())
        }
        None => Ok(()),
    }
}

#![forbid(unsafe_code)]

// Per-room session state: peers plus typed transport/producer/consumer tables.
//
// Everything here is synchronous. Callers hold the room's write lock only for
// these calls and never across an engine await.

use super::peer::{ActiveSpeaker, ConsumerLayerState, MediaInfo, Peer};
use crate::error::{SignalingError, SignalingResult};
use crate::media::{
    AudioLevelObserverHandle, ConsumerHandle, EngineEvent, EventSink, ProducerHandle,
    TransportDirection, TransportHandle, WebRtcTransportHandle,
};
use mediasoup::prelude::{MediaKind, RtpEncodingParameters};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Progress of a peer's transport in one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Readiness {
    Pending,
    Created,
    Connected,
}

pub struct TransportEntry {
    pub handle: Arc<dyn WebRtcTransportHandle>,
    pub peer_id: String,
    pub direction: TransportDirection,
}

pub struct ProducerEntry {
    pub handle: Arc<dyn ProducerHandle>,
    pub peer_id: String,
    pub media_tag: String,
    pub transport_id: String,
    pub kind: MediaKind,
}

pub struct ConsumerEntry {
    pub handle: Arc<dyn ConsumerHandle>,
    pub peer_id: String,
    pub media_tag: String,
    pub media_peer_id: String,
    pub producer_id: String,
    pub transport_id: String,
}

/// Latest transport of a peer in one direction and its readiness signal
struct TransportSlot {
    readiness: watch::Sender<Readiness>,
    transport_id: Option<String>,
}

impl TransportSlot {
    fn new() -> Self {
        let (readiness, _) = watch::channel(Readiness::Pending);
        Self {
            readiness,
            transport_id: None,
        }
    }

    /// Readiness only moves forward for a given transport
    fn advance(&self, state: Readiness) {
        self.readiness.send_if_modified(|current| {
            if state > *current {
                *current = state;
                true
            } else {
                false
            }
        });
    }
}

/// Handles detached from the room when a peer leaves; the caller closes them
#[derive(Default)]
pub struct RemovedPeer {
    pub transports: Vec<Arc<dyn WebRtcTransportHandle>>,
    pub producers: Vec<Arc<dyn ProducerHandle>>,
    pub consumers: Vec<Arc<dyn ConsumerHandle>>,
}

pub struct Room {
    pub id: String,
    pub peers: HashMap<String, Peer>,
    pub transports: HashMap<String, TransportEntry>,
    pub producers: HashMap<String, ProducerEntry>,
    pub consumers: HashMap<String, ConsumerEntry>,
    pub active_speaker: ActiveSpeaker,
    /// First peer to join
    pub owner: Option<String>,
    slots: HashMap<(String, TransportDirection), TransportSlot>,
    observer: Option<Arc<dyn AudioLevelObserverHandle>>,
    events: EventSink,
}

impl Room {
    pub fn new(id: String, events: EventSink, observer: Option<Arc<dyn AudioLevelObserverHandle>>) -> Self {
        Self {
            id,
            peers: HashMap::new(),
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            active_speaker: ActiveSpeaker::default(),
            owner: None,
            slots: HashMap::new(),
            observer,
            events,
        }
    }

    /// Sink that routes engine events of this room's objects to its dispatch task
    pub fn events(&self) -> EventSink {
        self.events.clone()
    }

    pub fn observer(&self) -> Option<Arc<dyn AudioLevelObserverHandle>> {
        self.observer.clone()
    }

    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn require_peer(&self, peer_id: &str) -> SignalingResult<&Peer> {
        self.peers
            .get(peer_id)
            .ok_or_else(|| SignalingError::NotFound(format!("peer {peer_id} in room {}", self.id)))
    }

    pub fn add_peer(&mut self, peer_id: String, now_ms: u64) {
        if self.peers.is_empty() {
            self.owner = Some(peer_id.clone());
        }
        self.peers.insert(peer_id.clone(), Peer::new(peer_id, now_ms));
    }

    /// Refreshes `lastSeenTs`; false if the peer is not in the room
    pub fn touch(&mut self, peer_id: &str, now_ms: u64) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.last_seen_ts = now_ms;
                true
            }
            None => false,
        }
    }

    /// Peers whose last sync is older than `cutoff_ms`
    pub fn stale_peers(&self, cutoff_ms: u64) -> Vec<String> {
        self.peers
            .values()
            .filter(|p| p.last_seen_ts < cutoff_ms)
            .map(|p| p.peer_id.clone())
            .collect()
    }

    /// Removes a peer and everything it owns from the tables
    pub fn remove_peer(&mut self, peer_id: &str) -> Option<RemovedPeer> {
        self.peers.remove(peer_id)?;

        let mut removed = RemovedPeer::default();
        self.transports.retain(|_, t| {
            if t.peer_id == peer_id {
                removed.transports.push(t.handle.clone());
                false
            } else {
                true
            }
        });
        self.producers.retain(|_, p| {
            if p.peer_id == peer_id {
                removed.producers.push(p.handle.clone());
                false
            } else {
                true
            }
        });
        self.consumers.retain(|_, c| {
            if c.peer_id == peer_id {
                removed.consumers.push(c.handle.clone());
                false
            } else {
                true
            }
        });
        self.slots.retain(|(owner, _), _| owner != peer_id);

        if self.active_speaker.peer_id.as_deref() == Some(peer_id) {
            self.active_speaker = ActiveSpeaker::default();
        }
        info!(
            "Removed peer {} from room {} ({} transports)",
            peer_id,
            self.id,
            removed.transports.len()
        );
        Some(removed)
    }

    pub fn insert_transport(
        &mut self,
        peer_id: &str,
        direction: TransportDirection,
        handle: Arc<dyn WebRtcTransportHandle>,
    ) -> SignalingResult<()> {
        self.require_peer(peer_id)?;
        let transport_id = handle.id();
        self.transports.insert(
            transport_id.clone(),
            TransportEntry {
                handle,
                peer_id: peer_id.to_string(),
                direction,
            },
        );

        // A new transport restarts the readiness sequence for its direction
        let slot = self
            .slots
            .entry((peer_id.to_string(), direction))
            .or_insert_with(TransportSlot::new);
        slot.transport_id = Some(transport_id);
        slot.readiness.send_replace(Readiness::Created);
        Ok(())
    }

    /// Looks up a transport owned by `peer_id`
    pub fn transport_of(&self, peer_id: &str, transport_id: &str) -> SignalingResult<&TransportEntry> {
        self.transports
            .get(transport_id)
            .filter(|t| t.peer_id == peer_id)
            .ok_or_else(|| SignalingError::NotFound(format!("transport {transport_id} of peer {peer_id}")))
    }

    pub fn mark_connected(&mut self, transport_id: &str) {
        let Some(entry) = self.transports.get(transport_id) else {
            return;
        };
        let key = (entry.peer_id.clone(), entry.direction);
        if let Some(slot) = self.slots.get(&key) {
            if slot.transport_id.as_deref() == Some(transport_id) {
                slot.advance(Readiness::Connected);
            }
        }
    }

    /// Readiness signal for a peer's transport in `direction`, created on first use
    pub fn readiness(&mut self, peer_id: &str, direction: TransportDirection) -> watch::Receiver<Readiness> {
        self.slots
            .entry((peer_id.to_string(), direction))
            .or_insert_with(TransportSlot::new)
            .readiness
            .subscribe()
    }

    /// Most recently created transport of a peer in `direction`
    pub fn current_transport(
        &self,
        peer_id: &str,
        direction: TransportDirection,
    ) -> Option<Arc<dyn WebRtcTransportHandle>> {
        let slot = self.slots.get(&(peer_id.to_string(), direction))?;
        let transport_id = slot.transport_id.as_ref()?;
        self.transports
            .get(transport_id)
            .map(|t| t.handle.clone())
    }

    pub fn insert_producer(
        &mut self,
        entry: ProducerEntry,
        paused: bool,
        encodings: Vec<RtpEncodingParameters>,
    ) -> SignalingResult<()> {
        let peer = self
            .peers
            .get_mut(&entry.peer_id)
            .ok_or_else(|| SignalingError::NotFound(format!("peer {}", entry.peer_id)))?;
        peer.media
            .insert(entry.media_tag.clone(), MediaInfo { paused, encodings });
        self.producers.insert(entry.handle.id(), entry);
        Ok(())
    }

    pub fn find_producer(&self, media_peer_id: &str, media_tag: &str) -> Option<&ProducerEntry> {
        self.producers
            .values()
            .find(|p| p.peer_id == media_peer_id && p.media_tag == media_tag)
    }

    pub fn producer_of(&self, peer_id: &str, producer_id: &str) -> SignalingResult<&ProducerEntry> {
        self.producers
            .get(producer_id)
            .filter(|p| p.peer_id == peer_id)
            .ok_or_else(|| SignalingError::NotFound(format!("producer {producer_id} of peer {peer_id}")))
    }

    /// Removes a producer and, unless another producer of the same peer still
    /// carries its tag, the peer's media entry. Repeat calls are no-ops.
    pub fn remove_producer(&mut self, producer_id: &str) -> Option<ProducerEntry> {
        let entry = self.producers.remove(producer_id)?;
        let tag_still_used = self
            .producers
            .values()
            .any(|p| p.peer_id == entry.peer_id && p.media_tag == entry.media_tag);
        if !tag_still_used {
            if let Some(peer) = self.peers.get_mut(&entry.peer_id) {
                peer.media.remove(&entry.media_tag);
            }
        }
        debug!("Removed producer {} ({}) from room {}", producer_id, entry.media_tag, self.id);
        Some(entry)
    }

    pub fn set_producer_paused(&mut self, producer_id: &str, paused: bool) {
        let Some(entry) = self.producers.get(producer_id) else {
            return;
        };
        if let Some(media) = self
            .peers
            .get_mut(&entry.peer_id)
            .and_then(|p| p.media.get_mut(&entry.media_tag))
        {
            media.paused = paused;
        }
    }

    pub fn insert_consumer(&mut self, entry: ConsumerEntry) -> SignalingResult<()> {
        let peer = self
            .peers
            .get_mut(&entry.peer_id)
            .ok_or_else(|| SignalingError::NotFound(format!("peer {}", entry.peer_id)))?;
        let consumer_id = entry.handle.id();
        peer.consumer_layers
            .insert(consumer_id.clone(), ConsumerLayerState::default());
        self.consumers.insert(consumer_id, entry);
        Ok(())
    }

    pub fn consumer_of(&self, peer_id: &str, consumer_id: &str) -> SignalingResult<&ConsumerEntry> {
        self.consumers
            .get(consumer_id)
            .filter(|c| c.peer_id == peer_id)
            .ok_or_else(|| SignalingError::NotFound(format!("consumer {consumer_id} of peer {peer_id}")))
    }

    pub fn remove_consumer(&mut self, consumer_id: &str) -> Option<ConsumerEntry> {
        let entry = self.consumers.remove(consumer_id)?;
        if let Some(peer) = self.peers.get_mut(&entry.peer_id) {
            peer.consumer_layers.remove(consumer_id);
        }
        debug!("Removed consumer {} from room {}", consumer_id, self.id);
        Some(entry)
    }

    pub fn set_client_layer(&mut self, peer_id: &str, consumer_id: &str, spatial_layer: u8) {
        if let Some(layers) = self
            .peers
            .get_mut(peer_id)
            .and_then(|p| p.consumer_layers.get_mut(consumer_id))
        {
            layers.client_selected_layer = Some(spatial_layer);
        }
    }

    /// Folds one engine event into the tables
    pub fn apply_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::ProducerTransportClosed { producer_id } => {
                self.remove_producer(&producer_id);
            }
            EngineEvent::ConsumerTransportClosed { consumer_id }
            | EngineEvent::ConsumerProducerClosed { consumer_id } => {
                self.remove_consumer(&consumer_id);
            }
            EngineEvent::ConsumerLayersChanged { consumer_id, layers } => {
                let Some(entry) = self.consumers.get(&consumer_id) else {
                    return;
                };
                if let Some(state) = self
                    .peers
                    .get_mut(&entry.peer_id)
                    .and_then(|p| p.consumer_layers.get_mut(&consumer_id))
                {
                    state.current_layer = layers.map(|l| l.spatial_layer);
                }
            }
            EngineEvent::Volumes(volumes) => {
                let Some((producer_id, volume)) = volumes.into_iter().next() else {
                    return;
                };
                let Some(peer_id) = self.producers.get(&producer_id).map(|p| p.peer_id.clone()) else {
                    return;
                };
                if self.peers.contains_key(&peer_id) {
                    self.active_speaker = ActiveSpeaker {
                        producer_id: Some(producer_id),
                        volume: Some(volume),
                        peer_id: Some(peer_id),
                    };
                }
            }
            EngineEvent::Silence => {
                self.active_speaker = ActiveSpeaker::default();
            }
        }
    }

    pub fn audio_producer_ids(&self) -> Vec<String> {
        self.producers
            .iter()
            .filter(|(_, p)| p.kind == MediaKind::Audio)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#![forbid(unsafe_code)]

// Room module - room registry, per-room session state and engine event dispatch
pub mod peer;
pub mod state;

pub use peer::{ActiveSpeaker, ConsumerLayerState, MediaInfo, Peer};
pub use state::{ConsumerEntry, ProducerEntry, Readiness, Room, TransportEntry};

use crate::error::{SignalingError, SignalingResult};
use crate::media::types::now_ms;
use crate::media::{
    ConsumerHandle, EngineEvent, LayerInfo, MediaEngine, ProducerHandle, TransportDirection,
    TransportHandle, TransportInfo, WebRtcTransportHandle,
};
use crate::metrics::{Counter, ServerMetrics};
use mediasoup::prelude::*;
use serde::Serialize;
use state::RemovedPeer;
use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::RwLock as TokioRwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Room behaviour knobs
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// How long createConsumer waits for the receiving transport to exist
    pub transport_ready_timeout: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            transport_ready_timeout: Duration::from_secs(10),
        }
    }
}

/// Reply to a successful createConsumer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerCreated {
    pub producer_id: String,
    pub id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub consumer_type: String,
    pub producer_paused: bool,
}

/// Directory of rooms keyed by room id.
///
/// The outer HashMap is protected by a std::sync::RwLock held only for brief
/// lookups/inserts. Each room has its own tokio RwLock, held for table updates
/// but never across an engine call.
pub struct RoomRegistry {
    rooms: Arc<StdRwLock<HashMap<String, Arc<TokioRwLock<Room>>>>>,
    engine: Arc<dyn MediaEngine>,
    metrics: ServerMetrics,
    config: RoomConfig,
}

impl RoomRegistry {
    pub fn new(engine: Arc<dyn MediaEngine>, config: RoomConfig, metrics: ServerMetrics) -> Self {
        Self {
            rooms: Arc::new(StdRwLock::new(HashMap::new())),
            engine,
            metrics,
            config,
        }
    }

    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    /// Gets a room lock by ID (brief outer read lock, no await)
    pub fn get(&self, room_id: &str) -> Option<Arc<TokioRwLock<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).cloned()
    }

    fn room(&self, room_id: &str) -> SignalingResult<Arc<TokioRwLock<Room>>> {
        self.get(room_id)
            .ok_or_else(|| SignalingError::NotFound(format!("room {room_id}")))
    }

    /// Gets or creates a room. Concurrent creators all observe the same room.
    pub async fn get_or_create(&self, room_id: &str) -> Arc<TokioRwLock<Room>> {
        // Fast path: room exists (brief outer read lock)
        if let Some(room) = self.get(room_id) {
            return room;
        }

        // Slow path: set up the observer without holding any lock
        let (events_tx, events_rx) = mpsc::unbounded_channel::<EngineEvent>();
        let observer = match self.engine.create_audio_level_observer(events_tx.clone()).await {
            Ok(observer) => Some(observer),
            Err(e) => {
                warn!("Failed to create audio level observer for room {}: {}", room_id, e);
                None
            }
        };

        // Insert under write lock (re-check for concurrent creation)
        let room_arc = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = rooms.get(room_id) {
                return existing.clone();
            }
            let room = Arc::new(TokioRwLock::new(Room::new(
                room_id.to_string(),
                events_tx,
                observer,
            )));
            rooms.insert(room_id.to_string(), room.clone());
            room
        };

        info!("Created room {}", room_id);
        self.metrics.inc(Counter::RoomsCreated);

        // Background task holds only a Weak reference to the room
        let weak_room = Arc::downgrade(&room_arc);
        tokio::spawn(Self::dispatch_events(events_rx, weak_room));

        room_arc
    }

    /// Applies engine events to one room, one at a time, in arrival order
    async fn dispatch_events(
        mut rx: mpsc::UnboundedReceiver<EngineEvent>,
        weak_room: Weak<TokioRwLock<Room>>,
    ) {
        while let Some(event) = rx.recv().await {
            let room_arc = match weak_room.upgrade() {
                Some(r) => r,
                None => break, // Room is gone
            };
            let mut room = room_arc.write().await;
            room.apply_event(event);
        }
    }

    /// Adds a fresh peer to the room, creating the room if needed
    pub async fn join(&self, room_id: &str) -> String {
        let room_lock = self.get_or_create(room_id).await;
        let peer_id = uuid::Uuid::new_v4().to_string();
        room_lock.write().await.add_peer(peer_id.clone(), now_ms());
        self.metrics.inc(Counter::Joins);
        info!("Peer {} joined room {}", peer_id, room_id);
        peer_id
    }

    pub async fn peers(&self, room_id: &str) -> SignalingResult<HashMap<String, Peer>> {
        let room_lock = self.room(room_id)?;
        let room = room_lock.read().await;
        Ok(room.peers.clone())
    }

    /// Marks the peer as seen and returns the room's current view
    pub async fn sync(
        &self,
        room_id: &str,
        peer_id: &str,
    ) -> SignalingResult<(ActiveSpeaker, HashMap<String, Peer>)> {
        let room_lock = self.room(room_id)?;
        let mut room = room_lock.write().await;
        if !room.touch(peer_id, now_ms()) {
            return Err(SignalingError::NotFound(format!("peer {peer_id} in room {room_id}")));
        }
        Ok((room.active_speaker.clone(), room.peers.clone()))
    }

    pub fn rtp_capabilities(&self) -> RtpCapabilitiesFinalized {
        self.engine.rtp_capabilities()
    }

    pub async fn create_transport(
        &self,
        room_id: &str,
        peer_id: &str,
        direction: TransportDirection,
    ) -> SignalingResult<TransportInfo> {
        let room_lock = self.room(room_id)?;
        room_lock.read().await.require_peer(peer_id)?;

        // Create transport WITHOUT room lock
        let transport = self.engine.create_webrtc_transport(peer_id, direction).await?;
        let info = transport.info();

        let inserted = room_lock
            .write()
            .await
            .insert_transport(peer_id, direction, transport.clone());
        if let Err(e) = inserted {
            // Peer left while the engine call was in flight
            transport.close();
            return Err(e);
        }

        debug!("Created {} transport {} for peer {} in room {}", direction, info.id, peer_id, room_id);
        Ok(info)
    }

    pub async fn connect_transport(
        &self,
        room_id: &str,
        peer_id: &str,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> SignalingResult<()> {
        let room_lock = self.room(room_id)?;
        let transport = room_lock
            .read()
            .await
            .transport_of(peer_id, transport_id)?
            .handle
            .clone();

        WebRtcTransportHandle::connect(transport.as_ref(), dtls_parameters).await?;
        room_lock.write().await.mark_connected(transport_id);

        debug!("Connected transport {} for peer {}", transport_id, peer_id);
        Ok(())
    }

    /// Creates a producer on the peer's send transport and records its media tag
    #[allow(clippy::too_many_arguments)]
    pub async fn produce(
        &self,
        room_id: &str,
        peer_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        paused: bool,
        media_tag: &str,
    ) -> SignalingResult<String> {
        let room_lock = self.room(room_id)?;
        let (transport, events) = {
            let room = room_lock.read().await;
            let entry = room.transport_of(peer_id, transport_id)?;
            if entry.direction != TransportDirection::Send {
                return Err(SignalingError::InvalidMessage(format!(
                    "transport {transport_id} is not a send transport"
                )));
            }
            (entry.handle.clone(), room.events())
        };

        // Create producer WITHOUT room lock
        let encodings = rtp_parameters.encodings.clone();
        let producer = transport.produce(kind, rtp_parameters, paused, events).await?;
        let producer_id = producer.id();

        let observer = {
            let mut room = room_lock.write().await;
            let inserted = room.insert_producer(
                ProducerEntry {
                    handle: producer.clone(),
                    peer_id: peer_id.to_string(),
                    media_tag: media_tag.to_string(),
                    transport_id: transport_id.to_string(),
                    kind,
                },
                paused,
                encodings,
            );
            if let Err(e) = inserted {
                producer.close();
                return Err(e);
            }
            room.observer()
        }; // room lock released

        // Add to observer OUTSIDE lock
        if kind == MediaKind::Audio {
            if let Some(observer) = observer {
                if let Err(e) = observer.add_producer(&producer_id).await {
                    warn!("Failed to observe audio producer {}: {}", producer_id, e);
                }
            }
        }

        self.metrics.inc(Counter::ProducersCreated);
        info!(
            "Created {:?} producer {} ({}) for peer {} in room {}",
            kind, producer_id, media_tag, peer_id, room_id
        );
        Ok(producer_id)
    }

    /// Creates a paused consumer of `media_peer_id`'s `media_tag` on the peer's
    /// receive transport, waiting for that transport to exist if needed
    pub async fn consume(
        &self,
        room_id: &str,
        peer_id: &str,
        media_peer_id: &str,
        media_tag: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> SignalingResult<ConsumerCreated> {
        let room_lock = self.room(room_id)?;
        let (producer_id, mut readiness) = {
            let mut room = room_lock.write().await;
            room.require_peer(peer_id)?;
            let producer_id = room
                .find_producer(media_peer_id, media_tag)
                .map(|p| p.handle.id())
                .ok_or_else(|| {
                    SignalingError::NotFound(format!("{media_tag} from peer {media_peer_id}"))
                })?;
            (producer_id, room.readiness(peer_id, TransportDirection::Recv))
        };

        if !self.engine.can_consume(&producer_id, &rtp_capabilities) {
            return Err(SignalingError::EngineCapabilityMismatch(format!(
                "peer {peer_id} cannot consume producer {producer_id}"
            )));
        }

        let waited = tokio::time::timeout(
            self.config.transport_ready_timeout,
            readiness.wait_for(|state| *state >= Readiness::Created),
        )
        .await;
        match waited {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => {
                return Err(SignalingError::TransportNotReady(format!("peer {peer_id} left")));
            }
            Err(_) => {
                return Err(SignalingError::TransportNotReady(format!(
                    "no receive transport for peer {peer_id}"
                )));
            }
        }
        // Release the watch borrow guard before the next await
        drop(waited);

        let (transport, events) = {
            let room = room_lock.read().await;
            let transport = room
                .current_transport(peer_id, TransportDirection::Recv)
                .ok_or_else(|| {
                    SignalingError::TransportNotReady(format!("no receive transport for peer {peer_id}"))
                })?;
            (transport, room.events())
        };

        // Create consumer WITHOUT room lock; always paused until the client resumes it
        let consumer = transport
            .consume(&producer_id, rtp_capabilities, true, events)
            .await?;

        let inserted = room_lock.write().await.insert_consumer(ConsumerEntry {
            handle: consumer.clone(),
            peer_id: peer_id.to_string(),
            media_tag: media_tag.to_string(),
            media_peer_id: media_peer_id.to_string(),
            producer_id: producer_id.clone(),
            transport_id: transport.id(),
        });
        if let Err(e) = inserted {
            consumer.close();
            return Err(e);
        }

        self.metrics.inc(Counter::ConsumersCreated);
        debug!(
            "Created consumer {} of {} for peer {} in room {}",
            consumer.id(),
            producer_id,
            peer_id,
            room_id
        );

        Ok(ConsumerCreated {
            producer_id,
            id: consumer.id(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            consumer_type: consumer.consumer_type(),
            producer_paused: consumer.producer_paused(),
        })
    }

    async fn consumer_handle(
        &self,
        room_id: &str,
        peer_id: &str,
        consumer_id: &str,
    ) -> SignalingResult<Arc<dyn ConsumerHandle>> {
        let room_lock = self.room(room_id)?;
        let room = room_lock.read().await;
        Ok(room.consumer_of(peer_id, consumer_id)?.handle.clone())
    }

    async fn producer_handle(
        &self,
        room_id: &str,
        peer_id: &str,
        producer_id: &str,
    ) -> SignalingResult<Arc<dyn ProducerHandle>> {
        let room_lock = self.room(room_id)?;
        let room = room_lock.read().await;
        Ok(room.producer_of(peer_id, producer_id)?.handle.clone())
    }

    /// Resumes a consumer; resuming a running consumer is a no-op
    pub async fn resume_consumer(&self, room_id: &str, peer_id: &str, consumer_id: &str) -> SignalingResult<()> {
        let consumer = self.consumer_handle(room_id, peer_id, consumer_id).await?;
        consumer.resume().await?;
        debug!("Resumed consumer {} for peer {}", consumer_id, peer_id);
        Ok(())
    }

    pub async fn pause_consumer(&self, room_id: &str, peer_id: &str, consumer_id: &str) -> SignalingResult<()> {
        let consumer = self.consumer_handle(room_id, peer_id, consumer_id).await?;
        consumer.pause().await?;
        debug!("Paused consumer {} for peer {}", consumer_id, peer_id);
        Ok(())
    }

    pub async fn pause_producer(&self, room_id: &str, peer_id: &str, producer_id: &str) -> SignalingResult<()> {
        let producer = self.producer_handle(room_id, peer_id, producer_id).await?;
        producer.pause().await?;
        if let Some(room_lock) = self.get(room_id) {
            room_lock.write().await.set_producer_paused(producer_id, true);
        }
        debug!("Paused producer {} for peer {}", producer_id, peer_id);
        Ok(())
    }

    pub async fn resume_producer(&self, room_id: &str, peer_id: &str, producer_id: &str) -> SignalingResult<()> {
        let producer = self.producer_handle(room_id, peer_id, producer_id).await?;
        producer.resume().await?;
        if let Some(room_lock) = self.get(room_id) {
            room_lock.write().await.set_producer_paused(producer_id, false);
        }
        debug!("Resumed producer {} for peer {}", producer_id, peer_id);
        Ok(())
    }

    /// Closes a producer; its consumers go away through the engine's producer-close events
    pub async fn close_producer(&self, room_id: &str, peer_id: &str, producer_id: &str) -> SignalingResult<()> {
        let room_lock = self.room(room_id)?;
        let (entry, observer) = {
            let mut room = room_lock.write().await;
            room.producer_of(peer_id, producer_id)?;
            let entry = room
                .remove_producer(producer_id)
                .ok_or_else(|| SignalingError::NotFound(format!("producer {producer_id}")))?;
            (entry, room.observer())
        };

        if entry.kind == MediaKind::Audio {
            if let Some(observer) = observer {
                if let Err(e) = observer.remove_producer(producer_id).await {
                    debug!("Observer did not release producer {}: {}", producer_id, e);
                }
            }
        }
        entry.handle.close();
        info!("Closed producer {} for peer {} in room {}", producer_id, peer_id, room_id);
        Ok(())
    }

    /// Asks the engine for a spatial layer and records the client's choice
    pub async fn set_consumer_layers(
        &self,
        room_id: &str,
        peer_id: &str,
        consumer_id: &str,
        spatial_layer: u8,
    ) -> SignalingResult<()> {
        let consumer = self.consumer_handle(room_id, peer_id, consumer_id).await?;
        consumer
            .set_preferred_layers(LayerInfo {
                spatial_layer,
                temporal_layer: None,
            })
            .await?;
        if let Some(room_lock) = self.get(room_id) {
            room_lock
                .write()
                .await
                .set_client_layer(peer_id, consumer_id, spatial_layer);
        }
        Ok(())
    }

    /// Removes a peer and closes everything it owned
    pub async fn leave(&self, room_id: &str, peer_id: &str) -> SignalingResult<()> {
        let room_lock = self.room(room_id)?;
        let removed = room_lock
            .write()
            .await
            .remove_peer(peer_id)
            .ok_or_else(|| SignalingError::NotFound(format!("peer {peer_id} in room {room_id}")))?;
        Self::close_removed(removed);
        self.metrics.inc(Counter::Leaves);
        Ok(())
    }

    fn close_removed(removed: RemovedPeer) {
        for consumer in removed.consumers {
            consumer.close();
        }
        for producer in removed.producers {
            producer.close();
        }
        for transport in removed.transports {
            transport.close();
        }
    }

    /// Ids of every audio producer in the room, for recording
    pub async fn audio_producer_ids(&self, room_id: &str) -> SignalingResult<Vec<String>> {
        let room_lock = self.room(room_id)?;
        let room = room_lock.read().await;
        Ok(room.audio_producer_ids())
    }

    /// Removes peers that have not synced within `timeout`; returns how many
    pub async fn evict_stale_peers(&self, timeout: Duration) -> usize {
        let cutoff = now_ms().saturating_sub(timeout.as_millis() as u64);
        let room_locks: Vec<(String, Arc<TokioRwLock<Room>>)> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.iter().map(|(id, r)| (id.clone(), r.clone())).collect()
        };

        let mut evicted = 0;
        for (room_id, room_lock) in room_locks {
            let stale = room_lock.read().await.stale_peers(cutoff);
            for peer_id in stale {
                if self.leave(&room_id, &peer_id).await.is_ok() {
                    info!("Evicted silent peer {} from room {}", peer_id, room_id);
                    self.metrics.inc(Counter::PeersEvicted);
                    evicted += 1;
                }
            }
        }
        evicted
    }

    /// Gracefully shuts down all rooms, closing every transport
    pub async fn shutdown(&self) {
        info!("Shutting down all rooms...");

        // Drain all rooms from the map
        let all_rooms: Vec<(String, Arc<TokioRwLock<Room>>)> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().collect()
        };

        for (room_id, room_lock) in &all_rooms {
            let mut room = room_lock.write().await;
            let peer_ids: Vec<String> = room.peers.keys().cloned().collect();
            for peer_id in &peer_ids {
                if let Some(removed) = room.remove_peer(peer_id) {
                    Self::close_removed(removed);
                }
            }
            info!("Shut down room {} ({} peers)", room_id, peer_ids.len());
        }

        info!("All rooms shut down ({} total)", all_rooms.len());
    }

    /// Gets current room count
    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Gets total peer count across all rooms
    pub async fn total_peer_count(&self) -> usize {
        let room_locks: Vec<Arc<TokioRwLock<Room>>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };

        let mut total = 0;
        for room_lock in room_locks {
            total += room_lock.read().await.peers.len();
        }
        total
    }
}

/// Periodically evicts peers that stopped syncing. Exits when `cancel_token` fires.
pub async fn run_peer_reaper(
    registry: Arc<RoomRegistry>,
    peer_timeout: Duration,
    check_interval: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        "Starting peer reaper (timeout {:?}, interval {:?})",
        peer_timeout, check_interval
    );
    let mut interval = tokio::time::interval(check_interval);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let evicted = registry.evict_stale_peers(peer_timeout).await;
                if evicted > 0 {
                    warn!("Evicted {} silent peer(s)", evicted);
                }
            }
            _ = cancel_token.cancelled() => {
                info!("Peer reaper received shutdown signal, exiting");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::fake::{audio_rtp_parameters, fake_dtls_parameters, video_rtp_parameters, FakeEngine};
    use crate::media::RouterConfig;
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;

    fn registry_with(engine: Arc<FakeEngine>, config: RoomConfig) -> Arc<RoomRegistry> {
        Arc::new(RoomRegistry::new(engine, config, ServerMetrics::new()))
    }

    fn registry(engine: Arc<FakeEngine>) -> Arc<RoomRegistry> {
        registry_with(engine, RoomConfig::default())
    }

    fn caps() -> RtpCapabilities {
        RouterConfig::default().receiver_capabilities()
    }

    async fn sender(registry: &RoomRegistry, room_id: &str, peer_id: &str) -> String {
        let info = registry
            .create_transport(room_id, peer_id, TransportDirection::Send)
            .await
            .unwrap();
        registry
            .connect_transport(room_id, peer_id, &info.id, fake_dtls_parameters())
            .await
            .unwrap();
        info.id
    }

    /// Polls until `check` holds; engine events are applied asynchronously
    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_concurrent_joins_share_one_room() {
        let registry = registry(FakeEngine::new());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.join("r1").await })
            })
            .collect();

        let mut peer_ids = HashSet::new();
        for handle in handles {
            assert!(peer_ids.insert(handle.await.unwrap()));
        }

        assert_eq!(registry.room_count(), 1);
        assert_eq!(registry.total_peer_count().await, 16);
        let peers = registry.peers("r1").await.unwrap();
        assert!(peer_ids.iter().all(|id| peers.contains_key(id)));
    }

    #[tokio::test]
    async fn test_room_without_observer_still_works() {
        let registry = registry(FakeEngine::without_observer());
        let peer = registry.join("r1").await;

        let (speaker, peers) = registry.sync("r1", &peer).await.unwrap();
        assert_eq!(speaker, ActiveSpeaker::default());
        assert!(peers.contains_key(&peer));
    }

    #[tokio::test]
    async fn test_sync_refreshes_last_seen() {
        let registry = registry(FakeEngine::new());
        let peer = registry.join("r1").await;
        {
            let room = registry.get("r1").unwrap();
            room.write().await.peers.get_mut(&peer).unwrap().last_seen_ts = 0;
        }

        let (_, peers) = registry.sync("r1", &peer).await.unwrap();
        assert!(peers[&peer].last_seen_ts > 0);
        assert!(matches!(
            registry.sync("r1", "ghost").await,
            Err(SignalingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_produce_records_media_tag_and_encodings() {
        let engine = FakeEngine::new();
        let registry = registry(engine.clone());
        let peer = registry.join("r1").await;
        let transport = sender(&registry, "r1", &peer).await;

        let producer_id = registry
            .produce("r1", &peer, &transport, MediaKind::Video, video_rtp_parameters(), false, "cam-video")
            .await
            .unwrap();

        let peers = registry.peers("r1").await.unwrap();
        let media = &peers[&peer].media["cam-video"];
        assert!(!media.paused);
        assert_eq!(
            serde_json::to_value(&media.encodings).unwrap(),
            serde_json::to_value(&video_rtp_parameters().encodings).unwrap()
        );
        assert!(engine.producer(&producer_id).is_some());
        // Video is not observed for speaker detection
        assert!(engine.observed_producers().is_empty());
    }

    #[tokio::test]
    async fn test_produce_rejects_recv_transport() {
        let registry = registry(FakeEngine::new());
        let peer = registry.join("r1").await;
        let info = registry
            .create_transport("r1", &peer, TransportDirection::Recv)
            .await
            .unwrap();

        let result = registry
            .produce("r1", &peer, &info.id, MediaKind::Audio, audio_rtp_parameters(), false, "mic")
            .await;
        assert!(matches!(result, Err(SignalingError::InvalidMessage(_))));
    }

    #[tokio::test]
    async fn test_produce_on_foreign_transport_is_not_found() {
        let registry = registry(FakeEngine::new());
        let alice = registry.join("r1").await;
        let bob = registry.join("r1").await;
        let transport = sender(&registry, "r1", &alice).await;

        let result = registry
            .produce("r1", &bob, &transport, MediaKind::Audio, audio_rtp_parameters(), false, "mic")
            .await;
        assert!(matches!(result, Err(SignalingError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_consume_reports_producer_pause_state() {
        let registry = registry(FakeEngine::new());
        let alice = registry.join("r1").await;
        let bob = registry.join("r1").await;
        let transport = sender(&registry, "r1", &alice).await;
        let producer_id = registry
            .produce("r1", &alice, &transport, MediaKind::Video, video_rtp_parameters(), true, "cam-video")
            .await
            .unwrap();
        registry
            .create_transport("r1", &bob, TransportDirection::Recv)
            .await
            .unwrap();

        let created = registry
            .consume("r1", &bob, &alice, "cam-video", caps())
            .await
            .unwrap();

        assert_eq!(created.producer_id, producer_id);
        assert!(created.producer_paused);
        assert_eq!(created.kind, MediaKind::Video);
        assert_eq!(created.consumer_type, "simple");

        let peers = registry.peers("r1").await.unwrap();
        assert!(peers[&bob].consumer_layers.contains_key(&created.id));
    }

    #[tokio::test]
    async fn test_consume_waits_for_receive_transport() {
        let registry = registry(FakeEngine::new());
        let alice = registry.join("r1").await;
        let bob = registry.join("r1").await;
        let transport = sender(&registry, "r1", &alice).await;
        registry
            .produce("r1", &alice, &transport, MediaKind::Audio, audio_rtp_parameters(), false, "mic")
            .await
            .unwrap();

        let pending = {
            let registry = registry.clone();
            let (alice, bob) = (alice.clone(), bob.clone());
            tokio::spawn(async move { registry.consume("r1", &bob, &alice, "mic", caps()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        registry
            .create_transport("r1", &bob, TransportDirection::Recv)
            .await
            .unwrap();
        let created = pending.await.unwrap().unwrap();
        assert_eq!(created.kind, MediaKind::Audio);
    }

    #[tokio::test]
    async fn test_consume_times_out_without_transport() {
        let config = RoomConfig {
            transport_ready_timeout: Duration::from_millis(100),
        };
        let registry = registry_with(FakeEngine::new(), config);
        let alice = registry.join("r1").await;
        let bob = registry.join("r1").await;
        let transport = sender(&registry, "r1", &alice).await;
        registry
            .produce("r1", &alice, &transport, MediaKind::Audio, audio_rtp_parameters(), false, "mic")
            .await
            .unwrap();

        let result = registry.consume("r1", &bob, &alice, "mic", caps()).await;
        assert!(matches!(result, Err(SignalingError::TransportNotReady(_))));
    }

    #[tokio::test]
    async fn test_consume_capability_mismatch_creates_nothing() {
        let engine = FakeEngine::new();
        let registry = registry(engine.clone());
        let alice = registry.join("r1").await;
        let bob = registry.join("r1").await;
        let transport = sender(&registry, "r1", &alice).await;
        registry
            .produce("r1", &alice, &transport, MediaKind::Audio, audio_rtp_parameters(), false, "mic")
            .await
            .unwrap();
        registry
            .create_transport("r1", &bob, TransportDirection::Recv)
            .await
            .unwrap();

        engine.refuse_consume.store(true, Ordering::SeqCst);
        let result = registry.consume("r1", &bob, &alice, "mic", caps()).await;

        assert!(matches!(result, Err(SignalingError::EngineCapabilityMismatch(_))));
        assert!(registry.get("r1").unwrap().read().await.consumers.is_empty());
    }

    #[tokio::test]
    async fn test_consume_unknown_tag_is_not_found() {
        let registry = registry(FakeEngine::new());
        let alice = registry.join("r1").await;
        let bob = registry.join("r1").await;

        let result = registry.consume("r1", &bob, &alice, "screen", caps()).await;
        assert!(matches!(result, Err(SignalingError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_resume_twice_is_noop() {
        let engine = FakeEngine::new();
        let registry = registry(engine.clone());
        let alice = registry.join("r1").await;
        let bob = registry.join("r1").await;
        let transport = sender(&registry, "r1", &alice).await;
        registry
            .produce("r1", &alice, &transport, MediaKind::Audio, audio_rtp_parameters(), false, "mic")
            .await
            .unwrap();
        registry
            .create_transport("r1", &bob, TransportDirection::Recv)
            .await
            .unwrap();
        let created = registry.consume("r1", &bob, &alice, "mic", caps()).await.unwrap();
        assert!(engine.consumer(&created.id).unwrap().paused.load(Ordering::SeqCst));

        registry.resume_consumer("r1", &bob, &created.id).await.unwrap();
        registry.resume_consumer("r1", &bob, &created.id).await.unwrap();
        assert!(!engine.consumer(&created.id).unwrap().paused.load(Ordering::SeqCst));

        // Another peer cannot drive bob's consumer
        assert!(matches!(
            registry.resume_consumer("r1", &alice, &created.id).await,
            Err(SignalingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_layers_are_requested_and_recorded() {
        let engine = FakeEngine::new();
        let registry = registry(engine.clone());
        let alice = registry.join("r1").await;
        let bob = registry.join("r1").await;
        let transport = sender(&registry, "r1", &alice).await;
        registry
            .produce("r1", &alice, &transport, MediaKind::Video, video_rtp_parameters(), false, "cam-video")
            .await
            .unwrap();
        registry
            .create_transport("r1", &bob, TransportDirection::Recv)
            .await
            .unwrap();
        let created = registry.consume("r1", &bob, &alice, "cam-video", caps()).await.unwrap();

        registry.set_consumer_layers("r1", &bob, &created.id, 1).await.unwrap();
        let requested = *engine.consumer(&created.id).unwrap().preferred_layers.lock().unwrap();
        assert_eq!(requested.map(|l| l.spatial_layer), Some(1));

        engine.emit_layers(&created.id, Some(LayerInfo { spatial_layer: 1, temporal_layer: Some(2) }));
        let room = registry.get("r1").unwrap();
        let consumer_id = created.id.clone();
        let bob_id = bob.clone();
        eventually(|| {
            room.try_read()
                .map(|r| {
                    r.peers[&bob_id].consumer_layers[&consumer_id]
                        == ConsumerLayerState {
                            current_layer: Some(1),
                            client_selected_layer: Some(1),
                        }
                })
                .unwrap_or(false)
        })
        .await;
    }

    #[tokio::test]
    async fn test_pause_and_resume_producer_update_media() {
        let engine = FakeEngine::new();
        let registry = registry(engine.clone());
        let peer = registry.join("r1").await;
        let transport = sender(&registry, "r1", &peer).await;
        let producer_id = registry
            .produce("r1", &peer, &transport, MediaKind::Audio, audio_rtp_parameters(), false, "mic")
            .await
            .unwrap();

        registry.pause_producer("r1", &peer, &producer_id).await.unwrap();
        assert!(registry.peers("r1").await.unwrap()[&peer].media["mic"].paused);
        assert!(engine.producer(&producer_id).unwrap().paused.load(Ordering::SeqCst));

        registry.resume_producer("r1", &peer, &producer_id).await.unwrap();
        assert!(!registry.peers("r1").await.unwrap()[&peer].media["mic"].paused);
    }

    #[tokio::test]
    async fn test_transport_close_event_removes_producer() {
        let engine = FakeEngine::new();
        let registry = registry(engine.clone());
        let peer = registry.join("r1").await;
        let transport = sender(&registry, "r1", &peer).await;
        let producer_id = registry
            .produce("r1", &peer, &transport, MediaKind::Audio, audio_rtp_parameters(), false, "mic")
            .await
            .unwrap();

        // Explicit close races the engine's transport-close
        registry.close_producer("r1", &peer, &producer_id).await.unwrap();
        engine.close_transport(&transport);

        let room = registry.get("r1").unwrap();
        let peer_id = peer.clone();
        eventually(|| {
            room.try_read()
                .map(|r| r.producers.is_empty() && !r.peers[&peer_id].media.contains_key("mic"))
                .unwrap_or(false)
        })
        .await;
        assert!(engine.producer(&producer_id).unwrap().closed.load(Ordering::SeqCst));
        assert!(engine.observed_producers().is_empty());
        assert!(matches!(
            registry.close_producer("r1", &peer, &producer_id).await,
            Err(SignalingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_active_speaker_from_observer() {
        let engine = FakeEngine::new();
        let registry = registry(engine.clone());
        let peer = registry.join("r1").await;
        let transport = sender(&registry, "r1", &peer).await;
        let producer_id = registry
            .produce("r1", &peer, &transport, MediaKind::Audio, audio_rtp_parameters(), false, "mic")
            .await
            .unwrap();
        assert_eq!(engine.observed_producers(), vec![producer_id.clone()]);

        engine.emit_volumes(vec![(producer_id.clone(), -30)]);
        let room = registry.get("r1").unwrap();
        eventually(|| {
            room.try_read()
                .map(|r| r.active_speaker.producer_id.is_some())
                .unwrap_or(false)
        })
        .await;
        let (speaker, _) = registry.sync("r1", &peer).await.unwrap();
        assert_eq!(speaker.peer_id.as_deref(), Some(peer.as_str()));
        assert_eq!(speaker.volume, Some(-30));

        engine.emit_silence();
        eventually(|| {
            room.try_read()
                .map(|r| r.active_speaker == ActiveSpeaker::default())
                .unwrap_or(false)
        })
        .await;
    }

    #[tokio::test]
    async fn test_leave_closes_transports() {
        let engine = FakeEngine::new();
        let registry = registry(engine.clone());
        let peer = registry.join("r1").await;
        let transport = sender(&registry, "r1", &peer).await;

        registry.leave("r1", &peer).await.unwrap();

        assert!(engine.transport(&transport).unwrap().is_closed());
        assert_eq!(registry.total_peer_count().await, 0);
        assert!(matches!(registry.leave("r1", &peer).await, Err(SignalingError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_evict_stale_peers() {
        let registry = registry(FakeEngine::new());
        let stale = registry.join("r1").await;
        let fresh = registry.join("r1").await;
        {
            let room = registry.get("r1").unwrap();
            room.write().await.peers.get_mut(&stale).unwrap().last_seen_ts = 0;
        }

        assert_eq!(registry.evict_stale_peers(Duration::from_secs(30)).await, 1);
        let peers = registry.peers("r1").await.unwrap();
        assert!(!peers.contains_key(&stale));
        assert!(peers.contains_key(&fresh));
        assert_eq!(registry.metrics.get(Counter::PeersEvicted), 1);
    }

    #[tokio::test]
    async fn test_reaper_stops_on_cancel() {
        let registry = registry(FakeEngine::new());
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(run_peer_reaper(
            registry,
            Duration::from_secs(30),
            Duration::from_millis(20),
            cancel_token.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(result.is_ok(), "reaper should stop after cancellation");
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let engine = FakeEngine::new();
        let registry = registry(engine.clone());
        let peer = registry.join("r1").await;
        let transport = sender(&registry, "r1", &peer).await;

        registry.shutdown().await;

        assert_eq!(registry.room_count(), 0);
        assert!(engine.transport(&transport).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_unknown_room_is_not_found() {
        let registry = registry(FakeEngine::new());
        assert!(matches!(registry.peers("nope").await, Err(SignalingError::NotFound(_))));
        assert!(matches!(
            registry.create_transport("nope", "p", TransportDirection::Send).await,
            Err(SignalingError::NotFound(_))
        ));
    }
}

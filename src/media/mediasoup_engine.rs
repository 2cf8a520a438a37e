#![forbid(unsafe_code)]

// mediasoup-backed media engine: one worker and one router shared by every room.
// Objects close when the last reference is dropped, so each handle keeps the only
// long-lived clone in a Mutex<Option<..>> and `close` takes it out. Event handlers
// are detached and capture ids only, never the object itself.

use crate::media::config::MediaConfig;
use crate::media::engine::{
    AudioLevelObserverHandle, ConsumerHandle, MediaEngine, PlainTransportHandle, ProducerHandle,
    TransportHandle, WebRtcTransportHandle,
};
use crate::media::types::{
    EngineEvent, EventSink, LayerInfo, MediaError, MediaResult, TransportDirection, TransportInfo,
};
use async_trait::async_trait;
use mediasoup::audio_level_observer::{AudioLevelObserver, AudioLevelObserverOptions};
use mediasoup::consumer::ConsumerType;
use mediasoup::prelude::*;
use mediasoup::producer::ProducerId;
use mediasoup::rtp_observer::{RtpObserver, RtpObserverAddProducerOptions};
use mediasoup::worker_manager::WorkerManager;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

fn parse_producer_id(producer_id: &str) -> MediaResult<ProducerId> {
    producer_id
        .parse::<ProducerId>()
        .map_err(|_| MediaError::InvalidId(producer_id.to_string()))
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

fn get<T: Clone>(slot: &Mutex<Option<T>>, id: &str) -> MediaResult<T> {
    slot.lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .ok_or_else(|| MediaError::Closed(id.to_string()))
}

/// Media engine backed by a single mediasoup worker and router
pub struct MediasoupEngine {
    router: Router,
    config: Arc<MediaConfig>,
    worker_died: CancellationToken,
    // Dropping the worker closes the router; keep both alive with the engine
    _worker: Worker,
    _worker_manager: WorkerManager,
}

impl MediasoupEngine {
    /// Starts the worker and creates the shared router
    ///
    /// # Errors
    /// Returns an error if the worker or router cannot be created
    pub async fn new(config: MediaConfig) -> MediaResult<Self> {
        let worker_manager = WorkerManager::new();
        let worker = worker_manager
            .create_worker(config.worker_config.to_worker_settings())
            .await
            .map_err(|e| MediaError::WorkerError(format!("Failed to create worker: {e}")))?;
        info!("Created mediasoup worker {}", worker.id());

        let worker_died = CancellationToken::new();
        worker
            .on_dead({
                let worker_died = worker_died.clone();
                let worker_id = worker.id();
                move |reason| {
                    error!("Worker {} died: {:?}", worker_id, reason);
                    worker_died.cancel();
                }
            })
            .detach();

        let router = worker
            .create_router(config.router_config.to_router_options())
            .await
            .map_err(|e| MediaError::RouterError(format!("Failed to create router: {e}")))?;
        info!("Created router {}", router.id());

        Ok(Self {
            router,
            config: Arc::new(config),
            worker_died,
            _worker: worker,
            _worker_manager: worker_manager,
        })
    }

    /// Cancelled if the worker process exits
    pub fn worker_died(&self) -> CancellationToken {
        self.worker_died.clone()
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    fn rtp_capabilities(&self) -> RtpCapabilitiesFinalized {
        self.router.rtp_capabilities().clone()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        match producer_id.parse::<ProducerId>() {
            Ok(id) => self.router.can_consume(&id, rtp_capabilities),
            Err(_) => false,
        }
    }

    async fn create_webrtc_transport(
        &self,
        peer_id: &str,
        direction: TransportDirection,
    ) -> MediaResult<Arc<dyn WebRtcTransportHandle>> {
        debug!("Creating {} transport for peer {}", direction, peer_id);

        let transport_config = &self.config.webrtc_transport_config;
        let transport = self
            .router
            .create_webrtc_transport(transport_config.to_transport_options())
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to create {direction} transport: {e}")))?;

        if let Some(bitrate) = transport_config.max_incoming_bitrate {
            if let Err(e) = transport.set_max_incoming_bitrate(bitrate).await {
                warn!("Failed to set max incoming bitrate on transport {}: {}", transport.id(), e);
            }
        }

        let closed = Arc::new(AtomicBool::new(false));
        transport
            .on_close({
                let closed = closed.clone();
                let peer_id = peer_id.to_string();
                let transport_id = transport.id().to_string();
                Box::new(move || {
                    closed.store(true, Ordering::SeqCst);
                    debug!("Transport {} ({}) closed for peer {}", transport_id, direction, peer_id);
                })
            })
            .detach();
        transport
            .on_dtls_state_change({
                let peer_id = peer_id.to_string();
                let transport_id = transport.id().to_string();
                move |dtls_state| {
                    debug!("DTLS state: {:?} for {} transport {} (peer {})",
                           dtls_state, direction, transport_id, peer_id);
                }
            })
            .detach();

        let info = TransportInfo::from(&transport);
        info!("Created {} transport {} for peer {}", direction, info.id, peer_id);

        Ok(Arc::new(MediasoupWebRtcTransport {
            id: info.id.clone(),
            info,
            inner: Mutex::new(Some(transport)),
            closed,
        }))
    }

    async fn create_plain_transport(&self) -> MediaResult<Arc<dyn PlainTransportHandle>> {
        let plain_config = &self.config.plain_transport_config;
        let transport = self
            .router
            .create_plain_transport(plain_config.to_transport_options())
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to create plain transport: {e}")))?;

        let closed = Arc::new(AtomicBool::new(false));
        transport
            .on_close({
                let closed = closed.clone();
                Box::new(move || closed.store(true, Ordering::SeqCst))
            })
            .detach();

        debug!("Created plain transport {}", transport.id());
        Ok(Arc::new(MediasoupPlainTransport {
            id: transport.id().to_string(),
            local_ip: plain_config.listen_ip,
            inner: Mutex::new(Some(transport)),
            closed,
        }))
    }

    async fn create_audio_level_observer(
        &self,
        events: EventSink,
    ) -> MediaResult<Arc<dyn AudioLevelObserverHandle>> {
        let mut options = AudioLevelObserverOptions::default();
        options.interval = self.config.observer_interval_ms;

        let observer = self
            .router
            .create_audio_level_observer(options)
            .await
            .map_err(|e| MediaError::ObserverError(format!("Failed to create audio level observer: {e}")))?;

        observer
            .on_volumes({
                let events = events.clone();
                move |volumes| {
                    let entries: Vec<(String, i8)> = volumes
                        .iter()
                        .map(|v| (v.producer.id().to_string(), v.volume))
                        .collect();
                    let _ = events.send(EngineEvent::Volumes(entries));
                }
            })
            .detach();
        observer
            .on_silence(move || {
                let _ = events.send(EngineEvent::Silence);
            })
            .detach();

        Ok(Arc::new(MediasoupAudioLevelObserver { observer }))
    }
}

async fn consume_on<T: Transport>(
    transport: &T,
    producer_id: &str,
    rtp_capabilities: RtpCapabilities,
    paused: bool,
    events: EventSink,
) -> MediaResult<Arc<dyn ConsumerHandle>> {
    let mut consumer_options = ConsumerOptions::new(parse_producer_id(producer_id)?, rtp_capabilities);
    consumer_options.paused = paused;

    let consumer = transport
        .consume(consumer_options)
        .await
        .map_err(|e| MediaError::ConsumerError(format!("Failed to create consumer: {e}")))?;

    let consumer_id = consumer.id().to_string();
    consumer
        .on_transport_close({
            let events = events.clone();
            let consumer_id = consumer_id.clone();
            move || {
                let _ = events.send(EngineEvent::ConsumerTransportClosed { consumer_id });
            }
        })
        .detach();
    consumer
        .on_producer_close({
            let events = events.clone();
            let consumer_id = consumer_id.clone();
            move || {
                let _ = events.send(EngineEvent::ConsumerProducerClosed { consumer_id });
            }
        })
        .detach();
    consumer
        .on_layers_change({
            let consumer_id = consumer_id.clone();
            move |layers| {
                let _ = events.send(EngineEvent::ConsumerLayersChanged {
                    consumer_id: consumer_id.clone(),
                    layers: layers.as_ref().map(|l| LayerInfo {
                        spatial_layer: l.spatial_layer,
                        temporal_layer: l.temporal_layer,
                    }),
                });
            }
        })
        .detach();

    let consumer_type = match consumer.r#type() {
        ConsumerType::Simple => "simple",
        ConsumerType::Simulcast => "simulcast",
        ConsumerType::Svc => "svc",
        ConsumerType::Pipe => "pipe",
    };

    debug!("Created consumer {} for producer {}", consumer_id, producer_id);
    Ok(Arc::new(MediasoupConsumer {
        id: consumer_id,
        producer_id: producer_id.to_string(),
        kind: consumer.kind(),
        rtp_parameters: consumer.rtp_parameters().clone(),
        consumer_type: consumer_type.to_string(),
        inner: Mutex::new(Some(consumer)),
    }))
}

struct MediasoupWebRtcTransport {
    id: String,
    info: TransportInfo,
    inner: Mutex<Option<WebRtcTransport>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl TransportHandle for MediasoupWebRtcTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            || self.inner.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    fn close(&self) {
        if take(&self.inner).is_some() {
            debug!("Released transport {}", self.id);
        }
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
        events: EventSink,
    ) -> MediaResult<Arc<dyn ConsumerHandle>> {
        let transport = get(&self.inner, &self.id)?;
        consume_on(&transport, producer_id, rtp_capabilities, paused, events).await
    }
}

#[async_trait]
impl WebRtcTransportHandle for MediasoupWebRtcTransport {
    fn info(&self) -> TransportInfo {
        self.info.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> MediaResult<()> {
        let transport = get(&self.inner, &self.id)?;
        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to connect transport: {e}")))
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        paused: bool,
        events: EventSink,
    ) -> MediaResult<Arc<dyn ProducerHandle>> {
        let transport = get(&self.inner, &self.id)?;

        let mut producer_options = ProducerOptions::new(kind, rtp_parameters);
        producer_options.paused = paused;

        let producer = transport
            .produce(producer_options)
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to create producer: {e}")))?;

        let producer_id = producer.id().to_string();
        producer
            .on_transport_close({
                let producer_id = producer_id.clone();
                move || {
                    let _ = events.send(EngineEvent::ProducerTransportClosed { producer_id });
                }
            })
            .detach();

        Ok(Arc::new(MediasoupProducer {
            id: producer_id,
            kind: producer.kind(),
            rtp_parameters: producer.rtp_parameters().clone(),
            inner: Mutex::new(Some(producer)),
        }))
    }
}

struct MediasoupPlainTransport {
    id: String,
    local_ip: IpAddr,
    inner: Mutex<Option<PlainTransport>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl TransportHandle for MediasoupPlainTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            || self.inner.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    fn close(&self) {
        if take(&self.inner).is_some() {
            debug!("Released plain transport {}", self.id);
        }
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
        events: EventSink,
    ) -> MediaResult<Arc<dyn ConsumerHandle>> {
        let transport = get(&self.inner, &self.id)?;
        consume_on(&transport, producer_id, rtp_capabilities, paused, events).await
    }
}

#[async_trait]
impl PlainTransportHandle for MediasoupPlainTransport {
    fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    async fn connect(&self, ip: IpAddr, port: u16) -> MediaResult<()> {
        let transport = get(&self.inner, &self.id)?;
        transport
            .connect(PlainTransportRemoteParameters {
                ip: Some(ip),
                port: Some(port),
                rtcp_port: None,
                srtp_parameters: None,
            })
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to connect plain transport: {e}")))
    }
}

struct MediasoupProducer {
    id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    inner: Mutex<Option<Producer>>,
}

#[async_trait]
impl ProducerHandle for MediasoupProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|p| p.paused())
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    async fn pause(&self) -> MediaResult<()> {
        let producer = get(&self.inner, &self.id)?;
        producer
            .pause()
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to pause producer: {e}")))
    }

    async fn resume(&self) -> MediaResult<()> {
        let producer = get(&self.inner, &self.id)?;
        producer
            .resume()
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to resume producer: {e}")))
    }

    fn close(&self) {
        if take(&self.inner).is_some() {
            debug!("Released producer {}", self.id);
        }
    }
}

struct MediasoupConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumer_type: String,
    inner: Mutex<Option<Consumer>>,
}

#[async_trait]
impl ConsumerHandle for MediasoupConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn producer_id(&self) -> String {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn consumer_type(&self) -> String {
        self.consumer_type.clone()
    }

    fn paused(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|c| c.paused())
    }

    fn producer_paused(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|c| c.producer_paused())
    }

    async fn pause(&self) -> MediaResult<()> {
        let consumer = get(&self.inner, &self.id)?;
        consumer
            .pause()
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to pause consumer: {e}")))
    }

    async fn resume(&self) -> MediaResult<()> {
        let consumer = get(&self.inner, &self.id)?;
        consumer
            .resume()
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to resume consumer: {e}")))
    }

    async fn set_preferred_layers(&self, layers: LayerInfo) -> MediaResult<()> {
        let consumer = get(&self.inner, &self.id)?;
        consumer
            .set_preferred_layers(layers.into())
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to set preferred layers: {e}")))
    }

    fn close(&self) {
        if take(&self.inner).is_some() {
            debug!("Released consumer {}", self.id);
        }
    }
}

struct MediasoupAudioLevelObserver {
    observer: AudioLevelObserver,
}

#[async_trait]
impl AudioLevelObserverHandle for MediasoupAudioLevelObserver {
    async fn add_producer(&self, producer_id: &str) -> MediaResult<()> {
        let id = parse_producer_id(producer_id)?;
        self.observer
            .add_producer(RtpObserverAddProducerOptions::new(id))
            .await
            .map_err(|e| MediaError::ObserverError(format!("Failed to observe producer {producer_id}: {e}")))
    }

    async fn remove_producer(&self, producer_id: &str) -> MediaResult<()> {
        let id = parse_producer_id(producer_id)?;
        self.observer
            .remove_producer(id)
            .await
            .map_err(|e| MediaError::ObserverError(format!("Failed to unobserve producer {producer_id}: {e}")))
    }
}

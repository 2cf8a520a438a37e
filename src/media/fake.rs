#![forbid(unsafe_code)]

// In-memory MediaEngine for unit tests. Records calls and lets tests fire engine events.

use crate::media::engine::{
    AudioLevelObserverHandle, ConsumerHandle, MediaEngine, PlainTransportHandle, ProducerHandle,
    TransportHandle, WebRtcTransportHandle,
};
use crate::media::types::{
    EngineEvent, EventSink, LayerInfo, MediaError, MediaResult, TransportDirection, TransportInfo,
};
use async_trait::async_trait;
use mediasoup::prelude::*;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct FakeState {
    next_id: AtomicUsize,
    transports: Mutex<HashMap<String, Arc<FakeTransport>>>,
    producers: Mutex<HashMap<String, Arc<FakeProducer>>>,
    consumers: Mutex<HashMap<String, Arc<FakeConsumer>>>,
    observer: Mutex<Option<Arc<FakeObserver>>>,
}

impl FakeState {
    fn next(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[derive(Default)]
pub struct FakeEngine {
    pub fail_observer: AtomicBool,
    pub refuse_consume: AtomicBool,
    state: Arc<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn without_observer() -> Arc<Self> {
        let engine = Self::default();
        engine.fail_observer.store(true, Ordering::SeqCst);
        Arc::new(engine)
    }

    /// Simulates the engine closing a transport and fires close events for everything on it
    pub fn close_transport(&self, transport_id: &str) {
        let Some(transport) = self.transport(transport_id) else {
            return;
        };
        transport.closed.store(true, Ordering::SeqCst);
        for producer in self.state.producers.lock().unwrap().values() {
            if producer.transport_id == transport_id {
                let _ = producer.events.send(EngineEvent::ProducerTransportClosed {
                    producer_id: producer.id.clone(),
                });
            }
        }
        for consumer in self.state.consumers.lock().unwrap().values() {
            if consumer.transport_id == transport_id {
                let _ = consumer.events.send(EngineEvent::ConsumerTransportClosed {
                    consumer_id: consumer.id.clone(),
                });
            }
        }
    }

    /// Simulates a producer closing; every consumer of it sees producer-close
    pub fn close_producer(&self, producer_id: &str) {
        for consumer in self.state.consumers.lock().unwrap().values() {
            if consumer.producer_id == producer_id {
                let _ = consumer.events.send(EngineEvent::ConsumerProducerClosed {
                    consumer_id: consumer.id.clone(),
                });
            }
        }
    }

    pub fn emit_layers(&self, consumer_id: &str, layers: Option<LayerInfo>) {
        if let Some(consumer) = self.consumer(consumer_id) {
            let _ = consumer.events.send(EngineEvent::ConsumerLayersChanged {
                consumer_id: consumer_id.to_string(),
                layers,
            });
        }
    }

    pub fn emit_volumes(&self, volumes: Vec<(String, i8)>) {
        if let Some(observer) = self.state.observer.lock().unwrap().as_ref() {
            let _ = observer.events.send(EngineEvent::Volumes(volumes));
        }
    }

    pub fn emit_silence(&self) {
        if let Some(observer) = self.state.observer.lock().unwrap().as_ref() {
            let _ = observer.events.send(EngineEvent::Silence);
        }
    }

    pub fn observed_producers(&self) -> Vec<String> {
        self.state
            .observer
            .lock()
            .unwrap()
            .as_ref()
            .map(|o| o.producers.lock().unwrap().clone())
            .unwrap_or_default()
    }

    pub fn transport(&self, transport_id: &str) -> Option<Arc<FakeTransport>> {
        self.state.transports.lock().unwrap().get(transport_id).cloned()
    }

    pub fn producer(&self, producer_id: &str) -> Option<Arc<FakeProducer>> {
        self.state.producers.lock().unwrap().get(producer_id).cloned()
    }

    pub fn consumer(&self, consumer_id: &str) -> Option<Arc<FakeConsumer>> {
        self.state.consumers.lock().unwrap().get(consumer_id).cloned()
    }

    pub fn plain_transports(&self) -> Vec<Arc<FakeTransport>> {
        self.state
            .transports
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.direction.is_none())
            .cloned()
            .collect()
    }
}

pub fn fake_transport_info(id: &str) -> TransportInfo {
    TransportInfo {
        id: id.to_string(),
        ice_parameters: serde_json::from_value(serde_json::json!({
            "usernameFragment": "ufrag",
            "password": "pwd",
            "iceLite": true,
        }))
        .expect("ice parameters"),
        ice_candidates: vec![],
        dtls_parameters: fake_dtls_parameters(),
    }
}

pub fn fake_dtls_parameters() -> DtlsParameters {
    serde_json::from_value(serde_json::json!({
        "role": "auto",
        "fingerprints": [],
    }))
    .expect("dtls parameters")
}

#[async_trait]
impl MediaEngine for FakeEngine {
    fn rtp_capabilities(&self) -> RtpCapabilitiesFinalized {
        serde_json::from_value(serde_json::json!({ "codecs": [], "headerExtensions": [] }))
            .expect("rtp capabilities")
    }

    fn can_consume(&self, producer_id: &str, _rtp_capabilities: &RtpCapabilities) -> bool {
        !self.refuse_consume.load(Ordering::SeqCst)
            && self.state.producers.lock().unwrap().contains_key(producer_id)
    }

    async fn create_webrtc_transport(
        &self,
        _peer_id: &str,
        direction: TransportDirection,
    ) -> MediaResult<Arc<dyn WebRtcTransportHandle>> {
        let transport = FakeTransport::new(self.state.next("transport"), Some(direction), &self.state);
        Ok(transport)
    }

    async fn create_plain_transport(&self) -> MediaResult<Arc<dyn PlainTransportHandle>> {
        let transport = FakeTransport::new(self.state.next("plain"), None, &self.state);
        Ok(transport)
    }

    async fn create_audio_level_observer(
        &self,
        events: EventSink,
    ) -> MediaResult<Arc<dyn AudioLevelObserverHandle>> {
        if self.fail_observer.load(Ordering::SeqCst) {
            return Err(MediaError::ObserverError("observer disabled".to_string()));
        }
        let observer = Arc::new(FakeObserver {
            events,
            producers: Mutex::new(Vec::new()),
        });
        *self.state.observer.lock().unwrap() = Some(observer.clone());
        Ok(observer)
    }
}

pub struct FakeTransport {
    pub id: String,
    pub direction: Option<TransportDirection>,
    pub closed: AtomicBool,
    pub connected: AtomicBool,
    pub remote: Mutex<Option<(IpAddr, u16)>>,
    state: Arc<FakeState>,
}

impl FakeTransport {
    fn new(id: String, direction: Option<TransportDirection>, state: &Arc<FakeState>) -> Arc<Self> {
        let transport = Arc::new(Self {
            id,
            direction,
            closed: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            remote: Mutex::new(None),
            state: state.clone(),
        });
        state
            .transports
            .lock()
            .unwrap()
            .insert(transport.id.clone(), transport.clone());
        transport
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportHandle for FakeTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn closed(&self) -> bool {
        self.is_closed()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn consume(
        &self,
        producer_id: &str,
        _rtp_capabilities: RtpCapabilities,
        paused: bool,
        events: EventSink,
    ) -> MediaResult<Arc<dyn ConsumerHandle>> {
        if self.is_closed() {
            return Err(MediaError::Closed(self.id.clone()));
        }
        let producer = self
            .state
            .producers
            .lock()
            .unwrap()
            .get(producer_id)
            .cloned()
            .ok_or_else(|| MediaError::ConsumerError(format!("unknown producer {producer_id}")))?;

        let consumer = Arc::new(FakeConsumer {
            id: self.state.next("consumer"),
            producer_id: producer_id.to_string(),
            transport_id: self.id.clone(),
            kind: producer.kind,
            rtp_parameters: producer.rtp_parameters.clone(),
            paused: AtomicBool::new(paused),
            producer_paused: producer.paused.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
            preferred_layers: Mutex::new(None),
            events,
        });
        self.state
            .consumers
            .lock()
            .unwrap()
            .insert(consumer.id.clone(), consumer.clone());
        Ok(consumer)
    }
}

#[async_trait]
impl WebRtcTransportHandle for FakeTransport {
    fn info(&self) -> TransportInfo {
        fake_transport_info(&self.id)
    }

    async fn connect(&self, _dtls_parameters: DtlsParameters) -> MediaResult<()> {
        if self.is_closed() {
            return Err(MediaError::Closed(self.id.clone()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        paused: bool,
        events: EventSink,
    ) -> MediaResult<Arc<dyn ProducerHandle>> {
        if self.is_closed() {
            return Err(MediaError::Closed(self.id.clone()));
        }
        let producer = Arc::new(FakeProducer {
            id: self.state.next("producer"),
            transport_id: self.id.clone(),
            kind,
            rtp_parameters,
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
            events,
        });
        self.state
            .producers
            .lock()
            .unwrap()
            .insert(producer.id.clone(), producer.clone());
        Ok(producer)
    }
}

#[async_trait]
impl PlainTransportHandle for FakeTransport {
    fn local_ip(&self) -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    async fn connect(&self, ip: IpAddr, port: u16) -> MediaResult<()> {
        *self.remote.lock().unwrap() = Some((ip, port));
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeProducer {
    pub id: String,
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: AtomicBool,
    pub closed: AtomicBool,
    events: EventSink,
}

#[async_trait]
impl ProducerHandle for FakeProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    async fn pause(&self) -> MediaResult<()> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> MediaResult<()> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeConsumer {
    pub id: String,
    pub producer_id: String,
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: AtomicBool,
    pub producer_paused: bool,
    pub closed: AtomicBool,
    pub preferred_layers: Mutex<Option<LayerInfo>>,
    events: EventSink,
}

#[async_trait]
impl ConsumerHandle for FakeConsumer {
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
        "simple".to_string()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn producer_paused(&self) -> bool {
        self.producer_paused
    }

    async fn pause(&self) -> MediaResult<()> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> MediaResult<()> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn set_preferred_layers(&self, layers: LayerInfo) -> MediaResult<()> {
        *self.preferred_layers.lock().unwrap() = Some(layers);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeObserver {
    events: EventSink,
    producers: Mutex<Vec<String>>,
}

#[async_trait]
impl AudioLevelObserverHandle for FakeObserver {
    async fn add_producer(&self, producer_id: &str) -> MediaResult<()> {
        self.producers.lock().unwrap().push(producer_id.to_string());
        Ok(())
    }

    async fn remove_producer(&self, producer_id: &str) -> MediaResult<()> {
        self.producers.lock().unwrap().retain(|p| p != producer_id);
        Ok(())
    }
}

/// Opus audio parameters with one encoding
pub fn audio_rtp_parameters() -> RtpParameters {
    use std::num::{NonZeroU32, NonZeroU8};

    RtpParameters {
        mid: Some("0".to_string()),
        codecs: vec![RtpCodecParameters::Audio {
            mime_type: MimeTypeAudio::Opus,
            payload_type: 111,
            clock_rate: NonZeroU32::new(48000).unwrap(),
            channels: NonZeroU8::new(2).unwrap(),
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: vec![],
        }],
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(1111),
            ..RtpEncodingParameters::default()
        }],
        ..RtpParameters::default()
    }
}

/// VP8 video parameters with two simulcast encodings
pub fn video_rtp_parameters() -> RtpParameters {
    use std::num::NonZeroU32;

    RtpParameters {
        mid: Some("1".to_string()),
        codecs: vec![RtpCodecParameters::Video {
            mime_type: MimeTypeVideo::Vp8,
            payload_type: 96,
            clock_rate: NonZeroU32::new(90000).unwrap(),
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: vec![],
        }],
        encodings: vec![
            RtpEncodingParameters {
                ssrc: Some(2222),
                ..RtpEncodingParameters::default()
            },
            RtpEncodingParameters {
                ssrc: Some(3333),
                ..RtpEncodingParameters::default()
            },
        ],
        ..RtpParameters::default()
    }
}

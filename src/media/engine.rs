#![forbid(unsafe_code)]

// Capability interface over the selective forwarding unit.
// Rooms and recordings only ever talk to these traits.

use crate::media::types::{EventSink, LayerInfo, MediaResult, TransportDirection, TransportInfo};
use async_trait::async_trait;
use mediasoup::prelude::*;
use std::net::IpAddr;
use std::sync::Arc;

/// Router-level operations shared by every room
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Static capability set of the router
    fn rtp_capabilities(&self) -> RtpCapabilitiesFinalized;

    /// Whether a client with these capabilities can receive the given producer
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn create_webrtc_transport(
        &self,
        peer_id: &str,
        direction: TransportDirection,
    ) -> MediaResult<Arc<dyn WebRtcTransportHandle>>;

    /// One-way RTP transport on localhost, used to feed the recording encoder
    async fn create_plain_transport(&self) -> MediaResult<Arc<dyn PlainTransportHandle>>;

    /// Volumes and silence are delivered to `events`
    async fn create_audio_level_observer(
        &self,
        events: EventSink,
    ) -> MediaResult<Arc<dyn AudioLevelObserverHandle>>;
}

/// Operations common to WebRTC and plain transports
#[async_trait]
pub trait TransportHandle: Send + Sync {
    fn id(&self) -> String;

    fn closed(&self) -> bool;

    /// Releases the transport. Safe to call more than once.
    fn close(&self);

    /// Creates a consumer; transport-close, producer-close and layer changes go to `events`
    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
        events: EventSink,
    ) -> MediaResult<Arc<dyn ConsumerHandle>>;
}

#[async_trait]
pub trait WebRtcTransportHandle: TransportHandle {
    fn info(&self) -> TransportInfo;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> MediaResult<()>;

    /// Creates a producer; its transport-close goes to `events`
    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        paused: bool,
        events: EventSink,
    ) -> MediaResult<Arc<dyn ProducerHandle>>;
}

#[async_trait]
pub trait PlainTransportHandle: TransportHandle {
    fn local_ip(&self) -> IpAddr;

    /// Points the transport at the encoder's receiving address
    async fn connect(&self, ip: IpAddr, port: u16) -> MediaResult<()>;
}

#[async_trait]
pub trait ProducerHandle: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn paused(&self) -> bool;
    fn rtp_parameters(&self) -> RtpParameters;
    async fn pause(&self) -> MediaResult<()>;
    async fn resume(&self) -> MediaResult<()>;
    fn close(&self);
}

#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    fn id(&self) -> String;
    fn producer_id(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    /// "simple", "simulcast", "svc" or "pipe"
    fn consumer_type(&self) -> String;
    fn paused(&self) -> bool;
    fn producer_paused(&self) -> bool;
    async fn pause(&self) -> MediaResult<()>;
    async fn resume(&self) -> MediaResult<()>;
    async fn set_preferred_layers(&self, layers: LayerInfo) -> MediaResult<()>;
    fn close(&self);
}

#[async_trait]
pub trait AudioLevelObserverHandle: Send + Sync {
    async fn add_producer(&self, producer_id: &str) -> MediaResult<()>;
    async fn remove_producer(&self, producer_id: &str) -> MediaResult<()>;
}

#![forbid(unsafe_code)]

// Media module - capability interface to the SFU and its mediasoup implementation

pub mod config;
pub mod engine;
pub mod mediasoup_engine;
pub mod types;

#[cfg(test)]
pub mod fake;

pub use config::{MediaConfig, PlainTransportConfig, RouterConfig, WebRtcTransportConfig, WorkerConfig};
pub use engine::{
    AudioLevelObserverHandle, ConsumerHandle, MediaEngine, PlainTransportHandle, ProducerHandle,
    TransportHandle, WebRtcTransportHandle,
};
pub use mediasoup_engine::MediasoupEngine;
pub use types::{
    CodecInfo, EngineEvent, EventSink, LayerInfo, MediaError, MediaResult, TransportDirection,
    TransportInfo,
};

#![forbid(unsafe_code)]

// confsig library - signaling and session orchestration for mediasoup conferencing

pub mod client;
pub mod config;
pub mod error;
pub mod media;
pub mod metrics;
pub mod recording;
pub mod room;
pub mod signaling;

#![forbid(unsafe_code)]

// Recording module - per-producer audio recording through a local RTP loop into ffmpeg

pub mod encoder;
pub mod ports;
pub mod sdp;
mod session;

pub use encoder::{EncoderConfig, EncoderEvent, EncoderProcess};
pub use ports::{PortAllocator, PortAllocatorConfig};
pub use session::RecordingOutcome;

use crate::media::{CodecInfo, MediaEngine, MediaError, PlainTransportHandle, TransportHandle};
use crate::metrics::{Counter, ServerMetrics};
use futures_util::future::join_all;
use mediasoup::prelude::RtpCapabilities;
use rand::Rng;
use session::SessionResources;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("No free port in range {start}-{end}")]
    ExhaustedRange { start: u16, end: u16 },

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Producer {0} has no audio codec")]
    NoAudioCodec(String),

    #[error("Failed to start encoder: {0}")]
    EncoderSpawn(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Recording of producer {0} was stopped during setup")]
    Cancelled(String),
}

pub type RecordingResult<T> = Result<T, RecordingError>;

/// Upper bound on how long shutdown waits for sessions to clean up
const STOP_ALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RecordingConfig {
    pub output_dir: PathBuf,
    /// Where session description files are written
    pub temp_dir: PathBuf,
    /// Hard cap on one session's length
    pub max_duration: Duration,
    pub encoder: EncoderConfig,
    pub ports: PortAllocatorConfig,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            temp_dir: std::env::temp_dir(),
            max_duration: Duration::from_secs(10 * 60),
            encoder: EncoderConfig::default(),
            ports: PortAllocatorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingStart {
    Started { output_path: PathBuf },
    AlreadyRecording,
}

struct ActiveSession {
    session_id: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<Option<RecordingOutcome>>>,
}

pub(crate) struct RecorderInner {
    engine: Arc<dyn MediaEngine>,
    ports: PortAllocator,
    config: RecordingConfig,
    rtp_capabilities: RtpCapabilities,
    metrics: ServerMetrics,
    sessions: Mutex<HashMap<String, ActiveSession>>,
}

impl RecorderInner {
    /// Drops the map entry if it still belongs to `session_id`
    fn forget_session(&self, producer_id: &str, session_id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if sessions
            .get(producer_id)
            .is_some_and(|s| s.session_id == session_id)
        {
            sessions.remove(producer_id);
        }
    }
}

/// Starts, tracks and stops recording sessions, at most one per producer
#[derive(Clone)]
pub struct Recorder {
    inner: Arc<RecorderInner>,
}

impl Recorder {
    /// `rtp_capabilities` are what the recording consumer advertises to the router
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        config: RecordingConfig,
        rtp_capabilities: RtpCapabilities,
        metrics: ServerMetrics,
    ) -> Self {
        let ports = PortAllocator::new(config.ports.clone());
        Self {
            inner: Arc::new(RecorderInner {
                engine,
                ports,
                config,
                rtp_capabilities,
                metrics,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.inner.ports
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_recording(&self, producer_id: &str) -> bool {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(producer_id)
    }

    /// Ensures a session for each producer. Producers are started concurrently
    /// and a failure only affects its own producer.
    pub async fn start_recording(
        &self,
        producer_ids: Vec<String>,
    ) -> Vec<(String, RecordingResult<RecordingStart>)> {
        let starts = producer_ids.into_iter().map(|producer_id| async move {
            let result = self.start_for_producer(&producer_id).await;
            if let Err(e) = &result {
                error!("Failed to start recording for producer {}: {}", producer_id, e);
            }
            (producer_id, result)
        });
        join_all(starts).await
    }

    /// Starts one session unless the producer is already being recorded
    pub async fn start_for_producer(&self, producer_id: &str) -> RecordingResult<RecordingStart> {
        let session_id = format!(
            "{}_{}_{}",
            producer_id,
            crate::media::types::now_ms(),
            rand::thread_rng().gen_range(0..1000)
        );
        let cancel = CancellationToken::new();

        {
            let mut sessions = self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner());
            if sessions.contains_key(producer_id) {
                info!("Producer {} is already being recorded", producer_id);
                return Ok(RecordingStart::AlreadyRecording);
            }
            sessions.insert(
                producer_id.to_string(),
                ActiveSession {
                    session_id: session_id.clone(),
                    cancel: cancel.clone(),
                    task: None,
                },
            );
        }

        let resources = Arc::new(SessionResources::new(
            producer_id,
            &session_id,
            &self.inner.config.temp_dir,
            &self.inner.config.output_dir,
        ));

        let prepared = tokio::select! {
            prepared = self.prepare(&resources) => prepared,
            _ = cancel.cancelled() => Err(RecordingError::Cancelled(producer_id.to_string())),
        };
        let (encoder, consumer_events) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                resources.cleanup(&self.inner, false).await;
                return Err(e);
            }
        };

        self.inner.metrics.inc(Counter::RecordingsStarted);
        info!(
            "Recording producer {} to {}",
            producer_id,
            resources.output_path.display()
        );

        let output_path = resources.output_path.clone();
        let task = tokio::spawn(session::supervise(
            self.inner.clone(),
            resources,
            encoder,
            consumer_events,
            cancel,
        ));

        let mut sessions = self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = sessions.get_mut(producer_id) {
            if session.session_id == session_id {
                session.task = Some(task);
            }
        }

        Ok(RecordingStart::Started { output_path })
    }

    /// Port, plain transport, consumer, SDP file and encoder, in that order
    async fn prepare(
        &self,
        resources: &SessionResources,
    ) -> RecordingResult<(EncoderProcess, mpsc::UnboundedReceiver<crate::media::EngineEvent>)> {
        let inner = &self.inner;
        let port = inner.ports.acquire().await?;
        resources.set_port(port);

        let transport = inner.engine.create_plain_transport().await?;
        resources.set_transport(transport.clone());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let consumer = transport
            .consume(
                &resources.producer_id,
                inner.rtp_capabilities.clone(),
                false,
                events_tx,
            )
            .await?;
        resources.set_consumer(consumer.clone());

        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        PlainTransportHandle::connect(transport.as_ref(), loopback, port).await?;

        // Payload types can differ per consumer, so the SDP follows the consumer
        let codec = CodecInfo::from_rtp_parameters(&consumer.rtp_parameters())
            .ok_or_else(|| RecordingError::NoAudioCodec(resources.producer_id.clone()))?;
        let sdp = sdp::audio_sdp(transport.local_ip(), port, &codec);

        tokio::fs::create_dir_all(&inner.config.output_dir).await?;
        tokio::fs::write(&resources.sdp_path, sdp).await?;

        let encoder = EncoderProcess::spawn(&inner.config.encoder, &resources.sdp_path, &resources.output_path)?;
        Ok((encoder, events_rx))
    }

    /// Requests a stop; cleanup runs on the session's own task
    pub fn stop(&self, producer_id: &str) -> bool {
        let sessions = self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match sessions.get(producer_id) {
            Some(session) => {
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Stops the sessions of the given producers, returning how many were running
    pub fn stop_recording(&self, producer_ids: &[String]) -> usize {
        producer_ids.iter().filter(|id| self.stop(id)).count()
    }

    /// Stops every session, including ones still being set up, and waits for their cleanup
    pub async fn stop_all(&self) {
        if self.active_count() == 0 {
            return;
        }
        info!("Stopping {} recording session(s)", self.active_count());

        let mut saved = 0;
        let drained = tokio::time::timeout(STOP_ALL_TIMEOUT, async {
            loop {
                let (tasks, remaining): (Vec<_>, usize) = {
                    let mut sessions = self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner());
                    let tasks = sessions
                        .values_mut()
                        .filter_map(|session| {
                            session.cancel.cancel();
                            session.task.take()
                        })
                        .collect();
                    (tasks, sessions.len())
                };
                if remaining == 0 && tasks.is_empty() {
                    break;
                }

                if tasks.is_empty() {
                    // Sessions in setup forget themselves once their cleanup ran
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    continue;
                }
                for result in join_all(tasks).await {
                    match result {
                        Ok(Some(RecordingOutcome::Saved)) => saved += 1,
                        Ok(_) => {}
                        Err(e) => warn!("Recording task failed: {}", e),
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!("{} recording session(s) still cleaning up at shutdown", self.active_count());
        }
        info!("{} recording(s) saved on shutdown", saved);
    }

    #[cfg(test)]
    async fn wait_until_stopped(&self, producer_id: &str) {
        for _ in 0..200 {
            if !self.is_recording(producer_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("recording of {producer_id} did not stop");
    }
}

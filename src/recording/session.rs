#![forbid(unsafe_code)]

// One recording job: its resources, supervision loop and cleanup

use super::encoder::{EncoderEvent, EncoderProcess};
use super::RecorderInner;
use crate::metrics::Counter;
use crate::media::{ConsumerHandle, EngineEvent, PlainTransportHandle};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a session stopped recording
#[derive(Debug)]
pub(crate) enum StopReason {
    Exited(Option<ExitStatus>),
    Timeout,
    StartupTimeout,
    Stopped,
    EncoderFailed(String),
    ProducerClosed,
}

/// How a finished session ended up on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingOutcome {
    Saved,
    Failed,
}

/// Everything a session holds. Filled in step by step during setup so a
/// failure at any step can undo exactly what was done.
pub(crate) struct SessionResources {
    pub producer_id: String,
    pub session_id: String,
    pub sdp_path: PathBuf,
    pub output_path: PathBuf,
    port: Mutex<Option<u16>>,
    transport: Mutex<Option<Arc<dyn PlainTransportHandle>>>,
    consumer: Mutex<Option<Arc<dyn ConsumerHandle>>>,
    cleaned: AtomicBool,
}

impl SessionResources {
    pub fn new(producer_id: &str, session_id: &str, temp_dir: &Path, output_dir: &Path) -> Self {
        Self {
            producer_id: producer_id.to_string(),
            session_id: session_id.to_string(),
            sdp_path: temp_dir.join(format!("recording_{session_id}.sdp")),
            output_path: output_dir.join(format!("recording_{session_id}.mp3")),
            port: Mutex::new(None),
            transport: Mutex::new(None),
            consumer: Mutex::new(None),
            cleaned: AtomicBool::new(false),
        }
    }

    pub fn set_port(&self, port: u16) {
        *self.port.lock().unwrap_or_else(|e| e.into_inner()) = Some(port);
    }

    pub fn set_transport(&self, transport: Arc<dyn PlainTransportHandle>) {
        *self.transport.lock().unwrap_or_else(|e| e.into_inner()) = Some(transport);
    }

    pub fn set_consumer(&self, consumer: Arc<dyn ConsumerHandle>) {
        *self.consumer.lock().unwrap_or_else(|e| e.into_inner()) = Some(consumer);
    }

    /// Releases everything the session holds. Runs once; later calls return `None`.
    /// `classify` inspects the output file; it is false when the encoder never ran.
    pub async fn cleanup(&self, recorder: &RecorderInner, classify: bool) -> Option<RecordingOutcome> {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return None;
        }

        let consumer = self.consumer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(consumer) = consumer {
            consumer.close();
        }
        let transport = self.transport.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(transport) = transport {
            if !transport.closed() {
                transport.close();
            }
        }
        let port = self.port.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(port) = port {
            recorder.ports.release_port(port);
        }

        match tokio::fs::remove_file(&self.sdp_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete {}: {}", self.sdp_path.display(), e),
        }

        let outcome = if classify {
            Some(self.classify_output(recorder).await)
        } else {
            None
        };

        // Last, so a restart for this producer sees a fully released session
        recorder.forget_session(&self.producer_id, &self.session_id);
        outcome
    }

    /// A missing or zero-byte output counts as a failed recording
    async fn classify_output(&self, recorder: &RecorderInner) -> RecordingOutcome {
        let size = tokio::fs::metadata(&self.output_path).await.map(|m| m.len());
        match size {
            Ok(len) if len > 0 => {
                info!("Recording saved to {} ({} bytes)", self.output_path.display(), len);
                recorder.metrics.inc(Counter::RecordingsCompleted);
                RecordingOutcome::Saved
            }
            Ok(_) => {
                warn!("Recording {} is empty, deleting it", self.output_path.display());
                if let Err(e) = tokio::fs::remove_file(&self.output_path).await {
                    warn!("Failed to delete empty recording: {}", e);
                }
                recorder.metrics.inc(Counter::RecordingsFailed);
                RecordingOutcome::Failed
            }
            Err(_) => {
                warn!("Recording {} was not created", self.output_path.display());
                recorder.metrics.inc(Counter::RecordingsFailed);
                RecordingOutcome::Failed
            }
        }
    }
}

/// Runs until the encoder exits or any stop condition fires, then cleans up
pub(crate) async fn supervise(
    recorder: Arc<RecorderInner>,
    resources: Arc<SessionResources>,
    mut encoder: EncoderProcess,
    mut consumer_events: mpsc::UnboundedReceiver<EngineEvent>,
    cancel: CancellationToken,
) -> Option<RecordingOutcome> {
    let session_timeout = tokio::time::sleep(recorder.config.max_duration);
    let startup_deadline = tokio::time::sleep(recorder.config.encoder.startup_timeout);
    tokio::pin!(session_timeout);
    tokio::pin!(startup_deadline);

    let mut started = false;
    let mut events_open = true;

    let reason = loop {
        tokio::select! {
            event = encoder.next_event() => match event {
                EncoderEvent::Started => {
                    if !started {
                        debug!("Encoder for producer {} is writing output", resources.producer_id);
                        started = true;
                    }
                }
                EncoderEvent::Fatal(line) => break StopReason::EncoderFailed(line),
                EncoderEvent::Exited(status) => break StopReason::Exited(status),
            },
            _ = &mut session_timeout => break StopReason::Timeout,
            _ = &mut startup_deadline, if !started => break StopReason::StartupTimeout,
            _ = cancel.cancelled() => break StopReason::Stopped,
            event = consumer_events.recv(), if events_open => match event {
                Some(EngineEvent::ConsumerProducerClosed { .. })
                | Some(EngineEvent::ConsumerTransportClosed { .. }) => break StopReason::ProducerClosed,
                Some(_) => {}
                None => events_open = false,
            },
        }
    };

    info!(
        "Recording of producer {} stopping: {:?}",
        resources.producer_id, reason
    );

    if !matches!(reason, StopReason::Exited(_)) {
        let status = encoder.stop(recorder.config.encoder.stop_grace).await;
        debug!("Encoder for producer {} exited with {:?}", resources.producer_id, status);
    }

    resources.cleanup(&recorder, true).await
}

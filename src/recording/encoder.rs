#![forbid(unsafe_code)]

// External audio encoder process (ffmpeg) fed by one RTP stream

use super::{RecordingError, RecordingResult};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// Stderr substrings meaning the encoder is up and writing output
const STARTED_MARKERS: [&str; 2] = ["Output #0", "encoder setup"];

/// Stderr substrings meaning the encoder cannot receive RTP
const FATAL_MARKERS: [&str; 2] = ["bind failed", "Error number"];

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub program: PathBuf,
    /// Encoder is killed if it has not reported startup within this window
    pub startup_timeout: Duration,
    /// Time between the graceful quit request and a hard kill
    pub stop_grace: Duration,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            startup_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(3),
        }
    }
}

/// What the supervisor learns from the running encoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderEvent {
    Started,
    Fatal(String),
    Exited(Option<ExitStatus>),
}

enum StderrSignal {
    Started,
    Fatal(String),
}

pub struct EncoderProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    signals: mpsc::UnboundedReceiver<StderrSignal>,
}

impl EncoderProcess {
    /// Spawns the encoder reading `sdp_path` and writing an mp3 to `output_path`
    pub fn spawn(config: &EncoderConfig, sdp_path: &Path, output_path: &Path) -> RecordingResult<Self> {
        let mut child = Command::new(&config.program)
            .args(["-loglevel", "debug", "-protocol_whitelist", "file,udp,rtp", "-i"])
            .arg(sdp_path)
            .args(["-acodec", "libmp3lame", "-b:a", "128k", "-ar", "48000", "-ac", "2", "-y"])
            .arg(output_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RecordingError::EncoderSpawn(format!("{}: {}", config.program.display(), e))
            })?;

        let stdin = child.stdin.take();
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RecordingError::EncoderSpawn("stderr not captured".to_string()))?;

        let (tx, signals) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                trace!("encoder: {}", line);
                if FATAL_MARKERS.iter().any(|m| line.contains(m)) {
                    error!("Encoder reported fatal error: {}", line);
                    let _ = tx.send(StderrSignal::Fatal(line));
                } else if STARTED_MARKERS.iter().any(|m| line.contains(m)) {
                    let _ = tx.send(StderrSignal::Started);
                } else if line.contains("Error") || line.contains("error") {
                    warn!("Encoder stderr: {}", line);
                }
            }
        });

        debug!("Spawned encoder pid={:?} for {}", child.id(), output_path.display());
        Ok(Self { child, stdin, signals })
    }

    /// Waits for the next startup/fatal report or for the process to exit
    pub async fn next_event(&mut self) -> EncoderEvent {
        tokio::select! {
            status = self.child.wait() => EncoderEvent::Exited(status.ok()),
            Some(signal) = self.signals.recv() => match signal {
                StderrSignal::Started => EncoderEvent::Started,
                StderrSignal::Fatal(line) => EncoderEvent::Fatal(line),
            },
        }
    }

    /// Asks the encoder to finish the file, then kills it after `grace`
    pub async fn stop(&mut self, grace: Duration) -> Option<ExitStatus> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Some(status);
        }

        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.write_all(b"q\n").await {
                debug!("Could not send quit to encoder: {}", e);
            }
            drop(stdin);
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status.ok(),
            Err(_) => {
                warn!("Encoder ignored quit request, killing it");
                if let Err(e) = self.child.start_kill() {
                    debug!("Kill failed: {}", e);
                }
                self.child.wait().await.ok()
            }
        }
    }
}

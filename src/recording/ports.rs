#![forbid(unsafe_code)]

// Local UDP port pool for recording encoders.
//
// The encoder binds RTP on an even port and RTCP on the port above it, so the
// pool hands out pairs keyed by the even port. A pair is in use from the moment
// it is reserved until its delayed release timer fires. Reservation happens
// under the lock before the OS bind check, so two concurrent callers can never be
// handed the same or overlapping pairs.

use super::{RecordingError, RecordingResult};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Port allocator settings
#[derive(Debug, Clone)]
pub struct PortAllocatorConfig {
    pub range_start: u16,
    pub range_end: u16,
    /// How long a released port stays reserved
    pub release_delay: Duration,
    pub bind_timeout: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub bind_ip: IpAddr,
}

impl Default for PortAllocatorConfig {
    fn default() -> Self {
        Self {
            range_start: 50000,
            range_end: 51000,
            release_delay: Duration::from_millis(2000),
            bind_timeout: Duration::from_millis(500),
            max_attempts: 5,
            retry_delay: Duration::from_millis(200),
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

#[derive(Default)]
struct PortEntry {
    release_timer: Option<JoinHandle<()>>,
    /// Bumped on every release so a stale timer never frees a re-armed port
    generation: u64,
}

/// Shared pool of recording ports
#[derive(Clone)]
pub struct PortAllocator {
    config: Arc<PortAllocatorConfig>,
    ports: Arc<Mutex<HashMap<u16, PortEntry>>>,
}

impl PortAllocator {
    pub fn new(config: PortAllocatorConfig) -> Self {
        Self {
            config: Arc::new(config),
            ports: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &PortAllocatorConfig {
        &self.config
    }

    /// Number of port pairs currently reserved, including ones waiting out their release delay
    pub fn in_use_count(&self) -> usize {
        self.ports.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether `port` belongs to a reserved pair, as its RTP or its RTCP port
    pub fn is_in_use(&self, port: u16) -> bool {
        let base = port - port % 2;
        self.ports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&base)
    }

    /// Reserves `port` if nobody holds it
    fn try_reserve(&self, port: u16) -> bool {
        let mut ports = self.ports.lock().unwrap_or_else(|e| e.into_inner());
        if ports.contains_key(&port) {
            return false;
        }
        ports.insert(port, PortEntry::default());
        true
    }

    fn unreserve(&self, port: u16) {
        self.ports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&port);
    }

    /// Checks that the OS will let us bind the port right now
    async fn can_bind(&self, port: u16) -> bool {
        let addr = SocketAddr::new(self.config.bind_ip, port);
        match tokio::time::timeout(self.config.bind_timeout, UdpSocket::bind(addr)).await {
            Ok(Ok(socket)) => {
                drop(socket);
                true
            }
            Ok(Err(e)) => {
                debug!("Port {} not bindable: {}", port, e);
                false
            }
            Err(_) => {
                debug!("Bind check of port {} timed out", port);
                false
            }
        }
    }

    /// Scans the even ports of `start..=end` and returns the first one that, together
    /// with `port + 1`, is free locally and bindable
    ///
    /// # Errors
    /// Returns `RecordingError::ExhaustedRange` if every pair is taken
    pub async fn find_available_port(&self, start: u16, end: u16) -> RecordingResult<u16> {
        for port in pair_bases(start, end) {
            if !self.try_reserve(port) {
                continue;
            }
            if self.can_bind(port).await && self.can_bind(port + 1).await {
                debug!("Reserved recording ports {}-{}", port, port + 1);
                return Ok(port);
            }
            self.unreserve(port);
        }
        Err(RecordingError::ExhaustedRange { start, end })
    }

    /// Allocates a port from the configured range, retrying with a short backoff
    ///
    /// # Errors
    /// Returns `RecordingError::ExhaustedRange` once every attempt has failed
    pub async fn acquire(&self) -> RecordingResult<u16> {
        let (start, end) = (self.config.range_start, self.config.range_end);
        for attempt in 1..=self.config.max_attempts {
            match self.find_available_port(start, end).await {
                Ok(port) => return Ok(port),
                Err(e) => {
                    warn!("Port allocation attempt {}/{} failed: {}", attempt, self.config.max_attempts, e);
                    if attempt < self.config.max_attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }
        Err(RecordingError::ExhaustedRange { start, end })
    }

    /// Frees the pair starting at `port` after the release delay. Releasing again restarts the delay;
    /// unknown ports are ignored.
    pub fn release_port(&self, port: u16) {
        let mut ports = self.ports.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = ports.get_mut(&port) else {
            debug!("Release of unknown port {} ignored", port);
            return;
        };

        if let Some(timer) = entry.release_timer.take() {
            timer.abort();
        }
        entry.generation += 1;
        let generation = entry.generation;

        let pool = self.ports.clone();
        let delay = self.config.release_delay;
        entry.release_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut ports = pool.lock().unwrap_or_else(|e| e.into_inner());
            if ports.get(&port).is_some_and(|e| e.generation == generation) {
                ports.remove(&port);
                debug!("Recording port {} released", port);
            }
        }));
    }
}

/// Even ports in `start..=end` whose RTCP companion also fits the range
fn pair_bases(start: u16, end: u16) -> impl Iterator<Item = u16> {
    let first = start.saturating_add(start % 2);
    (first..end).step_by(2)
}

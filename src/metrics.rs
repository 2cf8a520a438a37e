#![forbid(unsafe_code)]

// Server metrics: lock-free counters rendered in the Prometheus text format.
// Point-in-time gauges (rooms, peers, recordings) are read from their owners
// at scrape time rather than tracked here.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Monotonic event counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Connections,
    MessagesReceived,
    MessagesSent,
    Errors,
    RoomsCreated,
    Joins,
    Leaves,
    ProducersCreated,
    ConsumersCreated,
    PeersEvicted,
    RecordingsStarted,
    RecordingsCompleted,
    RecordingsFailed,
}

impl Counter {
    const ALL: [Counter; 13] = [
        Counter::Connections,
        Counter::MessagesReceived,
        Counter::MessagesSent,
        Counter::Errors,
        Counter::RoomsCreated,
        Counter::Joins,
        Counter::Leaves,
        Counter::ProducersCreated,
        Counter::ConsumersCreated,
        Counter::PeersEvicted,
        Counter::RecordingsStarted,
        Counter::RecordingsCompleted,
        Counter::RecordingsFailed,
    ];

    /// Metric name and help text
    fn describe(self) -> (&'static str, &'static str) {
        match self {
            Counter::Connections => ("confsig_connections_total", "WebSocket connections accepted"),
            Counter::MessagesReceived => ("confsig_messages_received_total", "Messages received from clients"),
            Counter::MessagesSent => ("confsig_messages_sent_total", "Messages sent to clients"),
            Counter::Errors => ("confsig_errors_total", "Requests answered with an error"),
            Counter::RoomsCreated => ("confsig_rooms_created_total", "Rooms created"),
            Counter::Joins => ("confsig_joins_total", "Room joins"),
            Counter::Leaves => ("confsig_leaves_total", "Room leaves"),
            Counter::ProducersCreated => ("confsig_producers_created_total", "Producers created"),
            Counter::ConsumersCreated => ("confsig_consumers_created_total", "Consumers created"),
            Counter::PeersEvicted => ("confsig_peers_evicted_total", "Peers removed for inactivity"),
            Counter::RecordingsStarted => ("confsig_recordings_started_total", "Recording sessions started"),
            Counter::RecordingsCompleted => ("confsig_recordings_completed_total", "Recordings saved with audio"),
            Counter::RecordingsFailed => ("confsig_recordings_failed_total", "Recordings that produced no output"),
        }
    }
}

/// Shared handle to the server's counters
#[derive(Clone, Default)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    counters: [AtomicU64; Counter::ALL.len()],
    connections_active: AtomicU64,
    handling_count: AtomicU64,
    handling_sum_us: AtomicU64,
    handling_max_us: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, counter: Counter) {
        self.inner.counters[counter as usize].fetch_add(1, Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.inner.counters[counter as usize].load(Relaxed)
    }

    /// Counts an open connection until the returned guard is dropped
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    /// Time spent handling one request
    pub fn observe_message_handling(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.inner.handling_count.fetch_add(1, Relaxed);
        self.inner.handling_sum_us.fetch_add(us, Relaxed);
        self.inner.handling_max_us.fetch_max(us, Relaxed);
    }

    /// Prometheus text exposition of every counter plus the given gauges
    pub fn render_prometheus(
        &self,
        rooms_active: usize,
        peers_active: usize,
        recordings_active: usize,
    ) -> String {
        let mut out = String::with_capacity(2048);

        for counter in Counter::ALL {
            let (name, help) = counter.describe();
            render(&mut out, name, help, "counter", self.get(counter));
        }

        let inner = &self.inner;
        let gauges = [
            ("confsig_connections_active", "Open WebSocket connections", inner.connections_active.load(Relaxed)),
            ("confsig_rooms_active", "Rooms in the registry", rooms_active as u64),
            ("confsig_peers_active", "Joined peers", peers_active as u64),
            ("confsig_recordings_active", "Running recording sessions", recordings_active as u64),
        ];
        for (name, help, value) in gauges {
            render(&mut out, name, help, "gauge", value);
        }

        let name = "confsig_message_handling_seconds";
        let _ = writeln!(out, "# HELP {name} Request handling time");
        let _ = writeln!(out, "# TYPE {name} summary");
        let _ = writeln!(out, "{name}_sum {}", seconds(inner.handling_sum_us.load(Relaxed)));
        let _ = writeln!(out, "{name}_count {}", inner.handling_count.load(Relaxed));
        render(
            &mut out,
            "confsig_message_handling_max_seconds",
            "Slowest request handled",
            "gauge",
            seconds(inner.handling_max_us.load(Relaxed)),
        );

        out
    }
}

/// Decrements the active connection gauge on drop, panics included
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn seconds(us: u64) -> String {
    format!("{}.{:06}", us / 1_000_000, us % 1_000_000)
}

fn render(out: &mut String, name: &str, help: &str, kind: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}

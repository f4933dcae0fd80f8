use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Operational status of the hub, served by the web surface. Sensor data
/// itself is owned by the sequencer and never lives here.
pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub flush_paused: bool,
    pub last_flush: Option<DateTime<Utc>>,
    pub readings_accepted: u64,
    pub readings_dropped: u64,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Provision,
    Flush,
    Reload,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub flush_paused: bool,
    pub last_flush: Option<DateTime<Utc>>,
    pub readings_accepted: u64,
    pub readings_dropped: u64,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            flush_paused: false,
            last_flush: None,
            readings_accepted: 0,
            readings_dropped: 0,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn record_ingest(&mut self, accepted: usize, dropped: usize) {
        self.readings_accepted += accepted as u64;
        self.readings_dropped += dropped as u64;
    }

    pub fn record_provision(&mut self, serial: &str, sensors: usize) {
        self.push_event(
            EventKind::Provision,
            format!("device {serial} provisioned with {sensors} sensor(s)"),
        );
    }

    /// Only flushes that produced or committed something are logged as
    /// events; idle cycles just move `last_flush`.
    pub fn record_flush(&mut self, aggregated: usize, committed: usize) {
        self.last_flush = Some(Utc::now());
        if aggregated > 0 || committed > 0 {
            self.push_event(
                EventKind::Flush,
                format!("{aggregated} aggregated, {committed} committed"),
            );
        }
    }

    pub fn record_reload(&mut self, detail: String) {
        self.push_event(EventKind::Reload, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            flush_paused: self.flush_paused,
            last_flush: self.last_flush,
            readings_accepted: self.readings_accepted,
            readings_dropped: self.readings_dropped,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

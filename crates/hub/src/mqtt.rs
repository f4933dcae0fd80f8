use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::model::RawReading;
use crate::sequencer::EngineHandle;
use crate::state::SharedState;

/// Devices publish batches here.
pub(crate) const READING_TOPIC_FILTER: &str = "tele/+/reading";

/// Any publish on this topic asks the hub to reload from the store, e.g.
/// after the remote-sync collaborator finished a download.
pub(crate) const RELOAD_TOPIC: &str = "hub/reload";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct Reading {
    pub(crate) sensor_type_id: i64,
    pub(crate) value: f64,
    #[serde(default)]
    pub(crate) duration_us: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReadingMsg {
    /// Device clock, unix seconds. Logged only; batches are stamped with the
    /// hub's receipt time.
    #[serde(default)]
    pub(crate) ts: Option<i64>,
    pub(crate) readings: Vec<Reading>,
}

impl ReadingMsg {
    pub(crate) fn raw_readings(&self) -> Vec<RawReading> {
        self.readings
            .iter()
            .map(|r| RawReading::from_micros(r.sensor_type_id, r.value, r.duration_us))
            .collect()
    }

    /// The device timestamp, if present and representable.
    pub(crate) fn device_time(&self) -> Option<DateTime<Utc>> {
        self.ts.and_then(|ts| Utc.timestamp_opt(ts, 0).single())
    }
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract the serial number from "tele/<serial>/reading".
pub(crate) fn extract_serial(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tele" && parts[2] == "reading" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

pub(crate) fn telemetry_topic(sensor_id: &str) -> String {
    format!("telemetry/{sensor_id}")
}

/// Route one incoming publish. Readings are queued for the engine; nothing
/// here waits on it.
pub(crate) async fn route_publish(
    topic: &str,
    payload: &[u8],
    engine: &EngineHandle,
    shared: &SharedState,
) {
    if topic == RELOAD_TOPIC {
        debug!("reload requested over mqtt");
        engine.reload();
        return;
    }

    let Some(serial) = extract_serial(topic) else {
        debug!(topic, "unhandled topic");
        return;
    };

    match serde_json::from_slice::<ReadingMsg>(payload) {
        Ok(msg) => {
            let received_at = Utc::now();
            debug!(
                serial,
                readings = msg.readings.len(),
                device_time = ?msg.device_time(),
                %received_at,
                "telemetry"
            );
            engine.ingest_at(serial, msg.raw_readings(), received_at);
        }
        Err(e) => {
            warn!(topic, "bad telemetry json: {e}");
            let mut st = shared.write().await;
            st.record_error(format!("bad telemetry json from {serial}: {e}"));
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

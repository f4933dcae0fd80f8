//! Core data model: datapoints, day histories, and the device topology the
//! engine works against.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::Serialize;

use crate::aggregate::AggregationRule;
use crate::codec;
use crate::error::HubError;
use crate::history::HistoryAction;

// ---------------------------------------------------------------------------
// Datapoint
// ---------------------------------------------------------------------------

/// One reading, or one aggregated window of readings.
///
/// Timestamps are truncated to whole microseconds on construction so a
/// datapoint survives the history codec unchanged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Datapoint {
    value: f64,
    timestamp: DateTime<Utc>,
    duration: Duration,
}

impl Datapoint {
    pub fn new(value: f64, timestamp: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            value,
            timestamp: timestamp.trunc_subsecs(6),
            duration,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

/// A raw reading as delivered by the transport, before it is stamped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawReading {
    pub sensor_type_id: i64,
    pub value: f64,
    pub duration: Duration,
}

impl RawReading {
    pub fn from_micros(sensor_type_id: i64, value: f64, duration_us: i64) -> Self {
        Self {
            sensor_type_id,
            value,
            duration: Duration::microseconds(duration_us),
        }
    }
}

// ---------------------------------------------------------------------------
// DayHistory
// ---------------------------------------------------------------------------

/// All datapoints of one sensor for one local calendar day.
///
/// `raw_data` is the encoded form of `data` and is kept in step with it by
/// every mutation, so the store can write it without re-encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct DayHistory {
    pub sensor_id: String,
    pub location_id: String,
    /// Local midnight that ends the day this record belongs to.
    pub day_boundary: DateTime<Utc>,
    data: Vec<Datapoint>,
    raw_data: Vec<u8>,
}

impl DayHistory {
    pub fn new(sensor_id: String, location_id: String, day_boundary: DateTime<Utc>) -> Self {
        Self::with_data(sensor_id, location_id, day_boundary, Vec::new())
    }

    pub fn with_data(
        sensor_id: String,
        location_id: String,
        day_boundary: DateTime<Utc>,
        data: Vec<Datapoint>,
    ) -> Self {
        let raw_data = codec::encode(&data);
        Self {
            sensor_id,
            location_id,
            day_boundary,
            data,
            raw_data,
        }
    }

    /// Rebuild a history from its stored blob.
    pub fn from_raw(
        sensor_id: String,
        location_id: String,
        day_boundary: DateTime<Utc>,
        raw_data: Vec<u8>,
    ) -> Result<Self, HubError> {
        let data = codec::decode(&raw_data)?;
        Ok(Self {
            sensor_id,
            location_id,
            day_boundary,
            data,
            raw_data,
        })
    }

    pub fn data(&self) -> &[Datapoint] {
        &self.data
    }

    pub fn raw_data(&self) -> &[u8] {
        &self.raw_data
    }

    pub fn latest(&self) -> Option<&Datapoint> {
        self.data.last()
    }

    /// Append a datapoint and re-serialize the whole day.
    pub fn push(&mut self, dp: Datapoint) {
        self.data.push(dp);
        self.raw_data = codec::encode(&self.data);
    }
}

// ---------------------------------------------------------------------------
// Topology + reference data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorType {
    pub id: i64,
    pub parameter_id: i64,
    pub name: String,
}

impl SensorType {
    pub fn rule(&self) -> AggregationRule {
        AggregationRule::for_parameter(self.parameter_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sensor {
    pub id: String,
    pub device_id: String,
    pub sensor_type_id: i64,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub id: String,
    /// Hardware-assigned identifier from the transport; the provisioning key.
    pub serial_number: String,
    pub name: String,
    pub location_id: String,
    pub sensors: Vec<Sensor>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Location {
    pub id: String,
    pub name: String,
    pub owner_id: String,
}

/// The slice of user settings provisioning depends on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub owner_id: Option<String>,
    pub last_baseline_sync: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// SensorState
// ---------------------------------------------------------------------------

/// In-memory working unit for one sensor: its fresh buffer and the day
/// history currently loaded for it.
#[derive(Debug, Clone)]
pub struct SensorState {
    pub sensor: Sensor,
    pub location_id: String,
    /// Datapoints received since the last flush.
    pub fresh: Vec<Datapoint>,
    pub day: Option<DayHistory>,
    /// Persistence action `day` still owes the store after a failed commit.
    pub unsaved: Option<HistoryAction>,
    /// Earlier days that rolled over before their last increment was
    /// committed. Frozen; written on the next successful commit.
    pub owed: Vec<(HistoryAction, DayHistory)>,
}

impl SensorState {
    /// Whether anything is waiting for a commit.
    pub fn is_dirty(&self) -> bool {
        self.unsaved.is_some() || !self.owed.is_empty()
    }

    pub fn new(sensor: Sensor, location_id: String) -> Self {
        Self {
            sensor,
            location_id,
            fresh: Vec::new(),
            day: None,
            unsaved: None,
            owed: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn datapoint_truncates_to_microseconds() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let dp = Datapoint::new(1.0, ts, Duration::zero());
        assert_eq!(dp.timestamp().timestamp_subsec_nanos(), 123_456_000);
    }

    #[test]
    fn push_keeps_blob_in_step() {
        let boundary = Utc.timestamp_opt(1_700_006_400, 0).unwrap();
        let mut day = DayHistory::new("s1".into(), "loc".into(), boundary);
        assert!(day.raw_data().is_empty());

        let dp = Datapoint::new(4.5, boundary - Duration::hours(1), Duration::seconds(60));
        day.push(dp);

        assert_eq!(day.data(), &[dp]);
        assert_eq!(codec::decode(day.raw_data()).unwrap(), vec![dp]);
    }

    #[test]
    fn from_raw_rejects_truncated_blob() {
        let boundary = Utc.timestamp_opt(1_700_006_400, 0).unwrap();
        let err = DayHistory::from_raw("s1".into(), "loc".into(), boundary, vec![0u8; 23])
            .unwrap_err();
        assert!(matches!(err, HubError::Codec(_)));
    }

    #[test]
    fn raw_reading_from_micros() {
        let r = RawReading::from_micros(3, 7.0, 1_500_000);
        assert_eq!(r.duration, Duration::milliseconds(1500));
    }
}

//! Binary encoding of a day's datapoint collection.
//!
//! Each datapoint is a fixed 24-byte little-endian record:
//!
//! ```text
//! value: f64 | timestamp: i64 (unix µs) | duration: i64 (µs)
//! ```

use chrono::{Duration, TimeZone, Utc};

use crate::error::HubError;
use crate::model::Datapoint;

pub const RECORD_LEN: usize = 24;

pub fn encode(data: &[Datapoint]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * RECORD_LEN);
    for dp in data {
        out.extend_from_slice(&dp.value().to_le_bytes());
        out.extend_from_slice(&dp.timestamp().timestamp_micros().to_le_bytes());
        // Spans beyond ±292k years don't occur; saturate rather than fail.
        let dur = dp.duration().num_microseconds().unwrap_or(i64::MAX);
        out.extend_from_slice(&dur.to_le_bytes());
    }
    out
}

pub fn decode(blob: &[u8]) -> Result<Vec<Datapoint>, HubError> {
    if blob.len() % RECORD_LEN != 0 {
        return Err(HubError::Codec(format!(
            "blob length {} is not a multiple of {RECORD_LEN}",
            blob.len()
        )));
    }

    blob.chunks_exact(RECORD_LEN)
        .enumerate()
        .map(|(i, rec)| {
            let value = f64::from_le_bytes(field(rec, 0));
            let ts_us = i64::from_le_bytes(field(rec, 8));
            let dur_us = i64::from_le_bytes(field(rec, 16));
            let timestamp = Utc.timestamp_micros(ts_us).single().ok_or_else(|| {
                HubError::Codec(format!("record {i}: timestamp {ts_us} out of range"))
            })?;
            Ok(Datapoint::new(
                value,
                timestamp,
                Duration::microseconds(dur_us),
            ))
        })
        .collect()
}

fn field(rec: &[u8], at: usize) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&rec[at..at + 8]);
    buf
}

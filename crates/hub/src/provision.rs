//! First-contact registration of unknown devices.
//!
//! A device reporting a serial number the hub has never seen gets a new
//! `Device`, a default-named `Location` owned by the current user, and one
//! `Sensor` per distinct known sensor type it reported. Provisioning is
//! gated: until the first baseline sync with the remote store completes the
//! hub cannot tell a new box from one that exists remotely, so the batch is
//! dropped and retried naturally with the next one.

use std::collections::HashMap;

use tracing::warn;
use uuid::Uuid;

use crate::error::{HubError, RejectReason};
use crate::model::{Device, Location, Sensor, SensorType, Session};

#[derive(Debug, Clone, PartialEq)]
pub struct Provisioned {
    pub device: Device,
    pub location: Location,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn reject(serial: &str, reason: RejectReason) -> HubError {
    HubError::ProvisionRejected {
        serial: serial.to_string(),
        reason,
    }
}

/// Decide whether `serial` may be provisioned and build the records if so.
/// Nothing is mutated here; the caller mirrors the result to storage and
/// only then adds it to memory.
pub fn plan(
    serial: &str,
    observed_types: &[i64],
    devices: &[Device],
    sensor_types: &HashMap<i64, SensorType>,
    session: &Session,
) -> Result<Provisioned, HubError> {
    if session.last_baseline_sync.is_none() {
        return Err(reject(serial, RejectReason::NotSynced));
    }
    let Some(owner_id) = session.owner_id.as_deref() else {
        return Err(reject(serial, RejectReason::NoOwner));
    };
    if devices.iter().any(|d| d.serial_number == serial) {
        return Err(reject(serial, RejectReason::AlreadyKnown));
    }

    let mut type_ids: Vec<i64> = Vec::new();
    for &t in observed_types {
        if type_ids.contains(&t) {
            continue;
        }
        if !sensor_types.contains_key(&t) {
            warn!(serial, sensor_type = t, "provisioning: unknown sensor type skipped");
            continue;
        }
        type_ids.push(t);
    }
    if type_ids.is_empty() {
        return Err(reject(serial, RejectReason::NoKnownSensorTypes));
    }

    let name = format!("Box Number {}", devices.len());
    let location = Location {
        id: new_id(),
        name: name.clone(),
        owner_id: owner_id.to_string(),
    };
    let device_id = new_id();
    let sensors = type_ids
        .into_iter()
        .map(|sensor_type_id| Sensor {
            id: new_id(),
            device_id: device_id.clone(),
            sensor_type_id,
            enabled: true,
        })
        .collect();

    Ok(Provisioned {
        device: Device {
            id: device_id,
            serial_number: serial.to_string(),
            name,
            location_id: location.id.clone(),
            sensors,
        },
        location,
    })
}

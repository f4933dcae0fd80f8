//! The in-memory telemetry engine.
//!
//! Owns every `SensorState` plus the cached devices, sensor types and
//! session. It is not shared: the sequencer holds the only instance and
//! drives it one command at a time, so no method here needs a lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::aggregate::{self, AggregationRule};
use crate::error::HubError;
use crate::history::{self, HistoryAction};
use crate::model::{Datapoint, Device, RawReading, Sensor, SensorState, SensorType, Session};
use crate::notify::{self, Notification, Notifier, SensorReading};
use crate::provision::{self, Provisioned};
use crate::store::Store;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Serial number of a device registered by this batch, if any.
    pub provisioned: Option<String>,
    pub sensors_added: usize,
    pub accepted: usize,
    pub dropped: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushOutcome {
    pub aggregated: usize,
    pub committed: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadOutcome {
    pub devices: usize,
    pub sensors_added: usize,
    pub histories_changed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorSnapshot {
    pub sensor_id: String,
    pub device_id: String,
    pub sensor_type_id: i64,
    pub location_id: String,
    pub buffered: usize,
    pub day_boundary: Option<DateTime<Utc>>,
    pub points_today: usize,
    pub latest_value: Option<f64>,
    pub latest_at: Option<DateTime<Utc>>,
    pub unsaved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub devices: usize,
    pub synced: bool,
    pub sensors: Vec<SensorSnapshot>,
}

pub struct Engine {
    store: Arc<dyn Store>,
    notifier: Notifier,
    sensors: BTreeMap<String, SensorState>,
    devices: Vec<Device>,
    sensor_types: HashMap<i64, SensorType>,
    session: Session,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, notifier: Notifier) -> Self {
        Self {
            store,
            notifier,
            sensors: BTreeMap::new(),
            devices: Vec::new(),
            sensor_types: HashMap::new(),
            session: Session::default(),
        }
    }

    #[cfg(test)]
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    #[cfg(test)]
    pub fn sensor_state(&self, sensor_id: &str) -> Option<&SensorState> {
        self.sensors.get(sensor_id)
    }

    /// Create the state for `sensor` or refresh its metadata. Buffers and
    /// histories of an existing state are left alone. Returns `true` when
    /// a new state was created.
    fn ensure_state(&mut self, sensor: &Sensor, location_id: &str) -> bool {
        match self.sensors.get_mut(&sensor.id) {
            Some(state) => {
                state.sensor = sensor.clone();
                state.location_id = location_id.to_string();
                false
            }
            None => {
                self.sensors.insert(
                    sensor.id.clone(),
                    SensorState::new(sensor.clone(), location_id.to_string()),
                );
                true
            }
        }
    }

    /// Rebuild the in-memory view from the store. Everything is loaded
    /// before anything is touched, so a failed load leaves memory as it was.
    pub async fn reload(&mut self) -> Result<ReloadOutcome, HubError> {
        let now = Utc::now();
        let devices = self
            .store
            .load_devices_with_sensors()
            .await
            .map_err(HubError::persistence)?;
        let histories = self
            .store
            .load_todays_histories(now)
            .await
            .map_err(HubError::persistence)?;
        let sensor_types = self
            .store
            .load_sensor_types()
            .await
            .map_err(HubError::persistence)?;
        let session = self.store.load_session().await.map_err(HubError::persistence)?;

        let mut outcome = ReloadOutcome {
            devices: devices.len(),
            ..ReloadOutcome::default()
        };

        for device in &devices {
            for sensor in &device.sensors {
                if self.ensure_state(sensor, &device.location_id) {
                    outcome.sensors_added += 1;
                }
            }
        }

        for stored in histories {
            let Some(state) = self.sensors.get_mut(&stored.sensor_id) else {
                let err = HubError::LookupMiss(format!("history for sensor {}", stored.sensor_id));
                warn!("reload: {err}");
                continue;
            };
            if history::absorb(state, stored) {
                outcome.histories_changed += 1;
            }
        }

        self.devices = devices;
        self.sensor_types = sensor_types.into_iter().map(|t| (t.id, t)).collect();
        self.session = session;

        info!(
            devices = outcome.devices,
            sensors = self.sensors.len(),
            added = outcome.sensors_added,
            histories = outcome.histories_changed,
            "reload complete"
        );
        Ok(outcome)
    }

    /// Register `serial` if it is new. The store is written first; memory is
    /// only touched once the device is durable.
    async fn provision(
        &mut self,
        serial: &str,
        readings: &[RawReading],
    ) -> Result<usize, HubError> {
        let observed: Vec<i64> = readings.iter().map(|r| r.sensor_type_id).collect();
        let Provisioned { device, location } = provision::plan(
            serial,
            &observed,
            &self.devices,
            &self.sensor_types,
            &self.session,
        )?;

        self.store
            .add_device(&device, &location)
            .await
            .map_err(HubError::persistence)?;

        let mut added = 0;
        for sensor in &device.sensors {
            if self.ensure_state(sensor, &device.location_id) {
                added += 1;
            }
        }
        info!(serial, device = %device.id, sensors = added, "device provisioned");
        self.devices.push(device);
        Ok(added)
    }

    /// Buffer one batch of readings from the device identified by `serial`.
    /// All readings in a batch share the receipt timestamp.
    pub async fn ingest(
        &mut self,
        serial: &str,
        readings: &[RawReading],
        received_at: DateTime<Utc>,
    ) -> Result<IngestOutcome, HubError> {
        let mut outcome = IngestOutcome::default();

        if !self.devices.iter().any(|d| d.serial_number == serial) {
            outcome.sensors_added = self.provision(serial, readings).await?;
            outcome.provisioned = Some(serial.to_string());
        }

        let Some(device) = self.devices.iter().find(|d| d.serial_number == serial) else {
            return Err(HubError::LookupMiss(format!("device {serial}")));
        };

        let mut live = Vec::with_capacity(readings.len());
        for r in readings {
            let state = device
                .sensors
                .iter()
                .find(|s| s.sensor_type_id == r.sensor_type_id)
                .and_then(|s| self.sensors.get_mut(&s.id));
            let Some(state) = state else {
                let err = HubError::LookupMiss(format!(
                    "device {serial} has no sensor of type {}",
                    r.sensor_type_id
                ));
                warn!("ingest: {err}");
                outcome.dropped += 1;
                continue;
            };

            let dp = Datapoint::new(r.value, received_at, r.duration);
            state.fresh.push(dp);
            live.push(SensorReading::from_datapoint(&state.sensor.id, &dp));
            outcome.accepted += 1;
        }

        debug!(serial, accepted = outcome.accepted, dropped = outcome.dropped, "batch buffered");
        if !live.is_empty() {
            notify::publish(&self.notifier, Notification::Live(live));
        }
        Ok(outcome)
    }

    fn rule_for(&self, sensor: &Sensor) -> AggregationRule {
        match self.sensor_types.get(&sensor.sensor_type_id) {
            Some(t) => t.rule(),
            None => {
                let err = HubError::LookupMiss(format!(
                    "sensor type {} for sensor {}",
                    sensor.sensor_type_id, sensor.id
                ));
                warn!("flush: {err}; falling back to plain mean");
                AggregationRule::Mean
            }
        }
    }

    /// Aggregate every fresh buffer into its day history and commit all
    /// changed histories, plus any still owed from a failed commit, in one
    /// unit of work.
    pub async fn flush(&mut self) -> Result<FlushOutcome, HubError> {
        let rules: HashMap<String, AggregationRule> = self
            .sensors
            .values()
            .filter(|s| !s.fresh.is_empty())
            .map(|s| (s.sensor.id.clone(), self.rule_for(&s.sensor)))
            .collect();

        let mut aggregated = Vec::new();
        for (id, rule) in &rules {
            let Some(state) = self.sensors.get_mut(id) else {
                continue;
            };
            let Some(dp) = aggregate::reduce(&mut state.fresh, *rule) else {
                continue;
            };
            let action = history::apply(state, dp, &Local);
            state.unsaved = Some(HistoryAction::combine(state.unsaved, action));
            aggregated.push(SensorReading::from_datapoint(id, &dp));
        }
        aggregated.sort_by(|a, b| a.sensor_id.cmp(&b.sensor_id));

        let mut outcome = FlushOutcome {
            aggregated: aggregated.len(),
            committed: 0,
        };
        if !aggregated.is_empty() {
            notify::publish(&self.notifier, Notification::Aggregated(aggregated));
        }

        let mut work = self.store.begin_unit_of_work();
        let mut marked = Vec::new();
        for (id, state) in &self.sensors {
            if !state.is_dirty() {
                continue;
            }
            for (action, day) in &state.owed {
                work.mark(*action, day.clone());
            }
            if let (Some(action), Some(day)) = (state.unsaved, &state.day) {
                work.mark(action, day.clone());
            }
            marked.push(id.clone());
        }
        if work.is_empty() {
            return Ok(outcome);
        }

        self.store.commit(work).await.map_err(HubError::persistence)?;
        for id in &marked {
            if let Some(state) = self.sensors.get_mut(id) {
                state.owed.clear();
                state.unsaved = None;
            }
        }
        outcome.committed = marked.len();
        Ok(outcome)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let sensors = self
            .sensors
            .values()
            .map(|s| {
                let latest = s.day.as_ref().and_then(|d| d.latest());
                SensorSnapshot {
                    sensor_id: s.sensor.id.clone(),
                    device_id: s.sensor.device_id.clone(),
                    sensor_type_id: s.sensor.sensor_type_id,
                    location_id: s.location_id.clone(),
                    buffered: s.fresh.len(),
                    day_boundary: s.day.as_ref().map(|d| d.day_boundary),
                    points_today: s.day.as_ref().map_or(0, |d| d.data().len()),
                    latest_value: latest.map(|dp| dp.value()),
                    latest_at: latest.map(|dp| dp.timestamp()),
                    unsaved: s.is_dirty(),
                }
            })
            .collect();

        EngineSnapshot {
            devices: self.devices.len(),
            synced: self.session.last_baseline_sync.is_some(),
            sensors,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

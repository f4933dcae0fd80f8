//! Persistence gateway contract consumed by the engine.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::history::HistoryAction;
use crate::model::{DayHistory, Device, Location, SensorType, Session};

/// The set of history writes one flush hands to the store. Each entry is
/// tagged explicitly; nothing related to a history is written implicitly.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    entries: Vec<(HistoryAction, DayHistory)>,
}

impl UnitOfWork {
    pub fn mark_insert(&mut self, history: DayHistory) {
        self.entries.push((HistoryAction::Insert, history));
    }

    pub fn mark_unchanged_except_data(&mut self, history: DayHistory) {
        self.entries.push((HistoryAction::UpdateDataOnly, history));
    }

    pub fn mark(&mut self, action: HistoryAction, history: DayHistory) {
        match action {
            HistoryAction::Insert => self.mark_insert(history),
            HistoryAction::UpdateDataOnly => self.mark_unchanged_except_data(history),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn entries(&self) -> &[(HistoryAction, DayHistory)] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<(HistoryAction, DayHistory)> {
        self.entries
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn load_devices_with_sensors(&self) -> Result<Vec<Device>>;

    /// Histories whose day has not ended as of `now`.
    async fn load_todays_histories(&self, now: DateTime<Utc>) -> Result<Vec<DayHistory>>;

    async fn load_sensor_types(&self) -> Result<Vec<SensorType>>;

    async fn load_session(&self) -> Result<Session>;

    /// Mirror a freshly provisioned device, its location and its sensors.
    /// All rows land or none do.
    async fn add_device(&self, device: &Device, location: &Location) -> Result<()>;

    fn begin_unit_of_work(&self) -> UnitOfWork {
        UnitOfWork::default()
    }

    /// Apply every marked write in one transaction.
    async fn commit(&self, work: UnitOfWork) -> Result<()>;
}

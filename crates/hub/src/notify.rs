//! Best-effort notification side channel.
//!
//! Delivery is decoupled from persistence: a notification goes out whether
//! or not the commit that accompanies it succeeds, and a slow subscriber
//! only ever loses its own messages.

use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::model::Datapoint;
use crate::mqtt::telemetry_topic;

/// Capacity of the notification channel. A subscriber that falls further
/// behind than this skips to the newest message.
pub const NOTIFY_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub sensor_id: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub duration_us: i64,
}

impl SensorReading {
    pub fn from_datapoint(sensor_id: &str, dp: &Datapoint) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            value: dp.value(),
            timestamp: dp.timestamp(),
            duration_us: dp.duration().num_microseconds().unwrap_or(i64::MAX),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Raw readings as they were buffered.
    Live(Vec<SensorReading>),
    /// One aggregated datapoint per sensor, emitted after a flush.
    Aggregated(Vec<SensorReading>),
}

pub type Notifier = broadcast::Sender<Notification>;

pub fn channel() -> Notifier {
    broadcast::channel(NOTIFY_CAPACITY).0
}

/// Fire and forget. Having no subscribers is not an error.
pub fn publish(tx: &Notifier, notification: Notification) {
    if tx.send(notification).is_err() {
        debug!("no notification subscribers");
    }
}

/// Republish aggregated readings to `telemetry/<sensor_id>` until the
/// channel closes.
pub async fn relay_to_mqtt(mut rx: broadcast::Receiver<Notification>, client: AsyncClient) {
    loop {
        match rx.recv().await {
            Ok(Notification::Aggregated(readings)) => {
                for r in readings {
                    let payload = match serde_json::to_vec(&r) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(sensor = %r.sensor_id, "relay: encode failed: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = client
                        .publish(telemetry_topic(&r.sensor_id), QoS::AtMostOnce, false, payload)
                        .await
                    {
                        warn!(sensor = %r.sensor_id, "relay: publish failed: {e}");
                    }
                }
            }
            Ok(Notification::Live(_)) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "relay: lagging, dropped notifications");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

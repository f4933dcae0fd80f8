//! Reduction of a sensor's fresh buffer into one datapoint per flush cycle.
//!
//! ```text
//! span        = ts(last) - ts(first) - duration(first)
//! cumulative  = Σ duration
//! mean        = Σ value / n
//!
//! Level  → value = round_half_even(mean), duration = span
//! Flow   → value = mean,                  duration = cumulative
//! other  → value = mean,                  duration = span
//! ```
//!
//! The output is always stamped with the last sample's timestamp.

use chrono::Duration;

use crate::model::Datapoint;

/// Reference-data parameter id for level (point-in-time) sensors.
pub const LEVEL_PARAMETER_ID: i64 = 5;

/// Reference-data parameter id for water flow (additive) sensors.
pub const FLOW_PARAMETER_ID: i64 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationRule {
    /// Mean rounded to the nearest integer, ties to even.
    Level,
    /// Unrounded mean over the summed sample durations.
    Flow,
    /// Unrounded mean over the buffered span.
    Mean,
}

impl AggregationRule {
    pub fn for_parameter(parameter_id: i64) -> Self {
        match parameter_id {
            LEVEL_PARAMETER_ID => Self::Level,
            FLOW_PARAMETER_ID => Self::Flow,
            _ => Self::Mean,
        }
    }
}

/// Reduce `buffer` to at most one datapoint. The buffer is always left
/// empty, whether or not anything was produced.
pub fn reduce(buffer: &mut Vec<Datapoint>, rule: AggregationRule) -> Option<Datapoint> {
    let samples = std::mem::take(buffer);
    let first = samples.first()?;
    let last = samples.last()?;

    let span = (last.timestamp() - first.timestamp()) - first.duration();

    let mut cumulative = Duration::zero();
    let mut sum = 0.0;
    for dp in &samples {
        cumulative = cumulative + dp.duration();
        sum += dp.value();
    }
    let mean = sum / samples.len() as f64;

    let (value, duration) = match rule {
        AggregationRule::Level => (mean.round_ties_even(), span),
        AggregationRule::Flow => (mean, cumulative),
        AggregationRule::Mean => (mean, span),
    };

    Some(Datapoint::new(value, last.timestamp(), duration))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    /// Samples one second apart, each with the given duration.
    fn buffer(values: &[f64], each: Duration) -> Vec<Datapoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| Datapoint::new(v, t0() + Duration::seconds(i as i64), each))
            .collect()
    }

    #[test]
    fn rule_dispatch_by_parameter() {
        assert_eq!(AggregationRule::for_parameter(5), AggregationRule::Level);
        assert_eq!(AggregationRule::for_parameter(9), AggregationRule::Flow);
        assert_eq!(AggregationRule::for_parameter(1), AggregationRule::Mean);
        assert_eq!(AggregationRule::for_parameter(-1), AggregationRule::Mean);
    }

    #[test]
    fn empty_buffer_yields_nothing() {
        let mut buf = Vec::new();
        assert!(reduce(&mut buf, AggregationRule::Mean).is_none());
    }

    #[test]
    fn mean_rule_uses_span_and_mean() {
        let mut buf = buffer(&[10.0, 20.0, 30.0], Duration::seconds(1));
        let dp = reduce(&mut buf, AggregationRule::Mean).unwrap();

        assert_eq!(dp.value(), 20.0);
        // (t+2s - t) - 1s
        assert_eq!(dp.duration(), Duration::seconds(1));
        assert_eq!(dp.timestamp(), t0() + Duration::seconds(2));
        assert!(buf.is_empty());
    }

    #[test]
    fn flow_rule_sums_durations_regardless_of_span() {
        let mut buf = vec![
            Datapoint::new(2.0, t0(), Duration::milliseconds(500)),
            Datapoint::new(4.0, t0() + Duration::seconds(30), Duration::milliseconds(700)),
            Datapoint::new(6.0, t0() + Duration::seconds(59), Duration::milliseconds(300)),
        ];
        let dp = reduce(&mut buf, AggregationRule::Flow).unwrap();

        assert_eq!(dp.value(), 4.0);
        assert_eq!(dp.duration(), Duration::milliseconds(1500));
    }

    #[test]
    fn level_rule_rounds_to_nearest() {
        let mut buf = buffer(&[1.0, 2.0, 2.0], Duration::zero());
        let dp = reduce(&mut buf, AggregationRule::Level).unwrap();
        assert_eq!(dp.value(), 2.0);
        assert_eq!(dp.duration(), Duration::seconds(2));
    }

    #[test]
    fn level_rule_ties_round_to_even() {
        let mut buf = buffer(&[2.0, 3.0], Duration::zero());
        assert_eq!(reduce(&mut buf, AggregationRule::Level).unwrap().value(), 2.0);

        let mut buf = buffer(&[3.0, 4.0], Duration::zero());
        assert_eq!(reduce(&mut buf, AggregationRule::Level).unwrap().value(), 4.0);

        let mut buf = buffer(&[-2.0, -3.0], Duration::zero());
        assert_eq!(reduce(&mut buf, AggregationRule::Level).unwrap().value(), -2.0);
    }

    #[test]
    fn single_sample_span_is_negative_own_duration() {
        let mut buf = buffer(&[7.5], Duration::seconds(3));
        let dp = reduce(&mut buf, AggregationRule::Mean).unwrap();
        assert_eq!(dp.value(), 7.5);
        assert_eq!(dp.duration(), -Duration::seconds(3));
        assert_eq!(dp.timestamp(), t0());
    }
}

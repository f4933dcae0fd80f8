//! Day-partitioned history: rollover decisions for new datapoints and the
//! reconciliation of stored vs. in-memory histories during reload.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use tracing::debug;

use crate::model::{DayHistory, Datapoint, SensorState};

/// What the store must do with a history after it changed in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryAction {
    /// The record is new; write the full row.
    Insert,
    /// The row already exists; rewrite only the data blob and timestamps.
    UpdateDataOnly,
}

impl HistoryAction {
    /// Fold a new action into one still owed from an earlier failed commit.
    /// An owed insert stays an insert until it lands.
    pub fn combine(pending: Option<Self>, next: Self) -> Self {
        match (pending, next) {
            (Some(Self::Insert), _) | (_, Self::Insert) => Self::Insert,
            _ => Self::UpdateDataOnly,
        }
    }
}

/// Local midnight following `ts` in `tz`, as a UTC instant.
pub fn next_day_boundary<Tz: TimeZone>(ts: DateTime<Utc>, tz: &Tz) -> DateTime<Utc> {
    let local_date = ts.with_timezone(tz).date_naive();
    let Some(next) = local_date.succ_opt() else {
        return ts + Duration::days(1);
    };
    let midnight = next.and_time(NaiveTime::MIN);

    // Zones that jump their clocks at midnight have no 00:00 on that day;
    // the first valid instant is an hour later.
    tz.from_local_datetime(&midnight)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(midnight + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| ts + Duration::days(1))
}

/// Fold a freshly aggregated datapoint into the sensor's day history,
/// rolling over to a new day when the loaded one has ended.
pub fn apply<Tz: TimeZone>(state: &mut SensorState, dp: Datapoint, tz: &Tz) -> HistoryAction {
    let rolls_over = match &state.day {
        None => true,
        Some(day) => {
            let data_before = day.latest().map_or(true, |l| l.timestamp() < dp.timestamp());
            data_before && dp.timestamp() >= day.day_boundary
        }
    };

    if !rolls_over {
        if let Some(day) = state.day.as_mut() {
            day.push(dp);
            return HistoryAction::UpdateDataOnly;
        }
    }

    owe_current_day(state);

    let mut day = DayHistory::new(
        state.sensor.id.clone(),
        state.location_id.clone(),
        next_day_boundary(dp.timestamp(), tz),
    );
    day.push(dp);
    state.day = Some(day);
    HistoryAction::Insert
}

/// Move an uncommitted current day onto the owed list so a rollover
/// never discards it. The moved day is not mutated again.
fn owe_current_day(state: &mut SensorState) {
    let Some(action) = state.unsaved.take() else {
        return;
    };
    if let Some(old) = state.day.take() {
        debug!(
            sensor = %state.sensor.id,
            boundary = %old.day_boundary,
            points = old.data().len(),
            "day rolled over before its last commit; keeping it owed"
        );
        state.owed.push((action, old));
    }
}

/// Reconcile a stored history with the in-memory one for the same sensor.
///
/// The later day wins outright. For the same day, a side with no data
/// yields to the other; otherwise both are concatenated, de-duplicated by
/// timestamp (stored sample kept) and put in chronological order.
pub fn merge(stored: &DayHistory, in_memory: &DayHistory) -> DayHistory {
    match stored.day_boundary.cmp(&in_memory.day_boundary) {
        Ordering::Greater => return stored.clone(),
        Ordering::Less => return in_memory.clone(),
        Ordering::Equal => {}
    }

    if stored == in_memory || in_memory.data().is_empty() {
        return stored.clone();
    }
    if stored.data().is_empty() {
        return in_memory.clone();
    }

    let mut by_ts: BTreeMap<DateTime<Utc>, Datapoint> = BTreeMap::new();
    for dp in stored.data().iter().chain(in_memory.data()) {
        by_ts.entry(dp.timestamp()).or_insert(*dp);
    }

    DayHistory::with_data(
        stored.sensor_id.clone(),
        stored.location_id.clone(),
        stored.day_boundary,
        by_ts.into_values().collect(),
    )
}

/// Absorb a history reloaded from the store into a sensor's state.
/// Returns `true` when the in-memory history changed.
pub fn absorb(state: &mut SensorState, stored: DayHistory) -> bool {
    let Some(current) = state.day.as_ref() else {
        state.day = Some(stored);
        return true;
    };

    match stored.day_boundary.cmp(&current.day_boundary) {
        Ordering::Less => false,
        Ordering::Greater => {
            owe_current_day(state);
            state.day = Some(stored);
            true
        }
        Ordering::Equal => {
            let merged = merge(&stored, current);

            // The row exists now, so anything still owed becomes an update.
            if state.unsaved.is_some() || merged != stored {
                state.unsaved = Some(HistoryAction::UpdateDataOnly);
            }

            if &merged == current {
                false
            } else {
                state.day = Some(merged);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Sensor;
    use chrono::FixedOffset;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    // 2023-11-14T22:13:20Z
    const T: i64 = 1_700_000_000;
    // 2023-11-15T00:00:00Z
    const MIDNIGHT: i64 = 1_700_006_400;

    fn dp(secs: i64, value: f64) -> Datapoint {
        Datapoint::new(value, at(secs), Duration::seconds(60))
    }

    fn state() -> SensorState {
        SensorState::new(
            Sensor {
                id: "s1".into(),
                device_id: "d1".into(),
                sensor_type_id: 1,
                enabled: true,
            },
            "loc".into(),
        )
    }

    fn day(boundary: i64, points: &[Datapoint]) -> DayHistory {
        DayHistory::with_data("s1".into(), "loc".into(), at(boundary), points.to_vec())
    }

    // -- next_day_boundary -------------------------------------------------

    #[test]
    fn boundary_is_next_utc_midnight() {
        assert_eq!(next_day_boundary(at(T), &Utc), at(MIDNIGHT));
    }

    #[test]
    fn boundary_at_exact_midnight_is_following_day() {
        assert_eq!(next_day_boundary(at(MIDNIGHT), &Utc), at(MIDNIGHT + 86_400));
    }

    #[test]
    fn boundary_respects_offset() {
        // 22:13Z is 00:13 the next day at +02:00, so the boundary is the
        // following local midnight: 2023-11-16T00:00+02:00 = 2023-11-15T22:00Z.
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        assert_eq!(next_day_boundary(at(T), &tz), at(MIDNIGHT + 22 * 3600));
    }

    // -- apply ---------------------------------------------------------------

    #[test]
    fn first_datapoint_inserts_new_day() {
        let mut st = state();
        let action = apply(&mut st, dp(T, 1.0), &Utc);

        assert_eq!(action, HistoryAction::Insert);
        let d = st.day.as_ref().unwrap();
        assert_eq!(d.day_boundary, at(MIDNIGHT));
        assert_eq!(d.data().len(), 1);
        assert_eq!(d.location_id, "loc");
    }

    #[test]
    fn same_day_appends_in_place() {
        let mut st = state();
        st.day = Some(day(MIDNIGHT, &[dp(T, 1.0)]));

        let action = apply(&mut st, dp(T + 60, 2.0), &Utc);

        assert_eq!(action, HistoryAction::UpdateDataOnly);
        let d = st.day.as_ref().unwrap();
        assert_eq!(d.data().len(), 2);
        assert_eq!(d.data()[1].value(), 2.0);
        assert_eq!(crate::codec::decode(d.raw_data()).unwrap(), d.data());
    }

    #[test]
    fn datapoint_at_boundary_rolls_over() {
        let mut st = state();
        st.day = Some(day(MIDNIGHT, &[dp(T, 1.0), dp(T + 60, 2.0)]));

        let action = apply(&mut st, dp(MIDNIGHT, 3.0), &Utc);

        assert_eq!(action, HistoryAction::Insert);
        let d = st.day.as_ref().unwrap();
        assert_eq!(d.day_boundary, at(MIDNIGHT + 86_400));
        assert_eq!(d.data(), &[dp(MIDNIGHT, 3.0)]);
    }

    #[test]
    fn datapoint_after_boundary_rolls_over() {
        let mut st = state();
        st.day = Some(day(MIDNIGHT, &[dp(T, 1.0)]));

        let action = apply(&mut st, dp(MIDNIGHT + 5_000, 3.0), &Utc);

        assert_eq!(action, HistoryAction::Insert);
        assert_eq!(st.day.as_ref().unwrap().data().len(), 1);
    }

    #[test]
    fn rollover_of_uncommitted_day_keeps_it_owed() {
        let mut st = state();
        let old = day(MIDNIGHT, &[dp(T, 1.0), dp(T + 60, 2.0)]);
        st.day = Some(old.clone());
        st.unsaved = Some(HistoryAction::UpdateDataOnly);

        let action = apply(&mut st, dp(MIDNIGHT + 60, 3.0), &Utc);

        assert_eq!(action, HistoryAction::Insert);
        assert_eq!(st.unsaved, None);
        assert_eq!(st.owed, vec![(HistoryAction::UpdateDataOnly, old)]);
        assert_eq!(st.day.as_ref().unwrap().day_boundary, at(MIDNIGHT + 86_400));
        assert!(st.is_dirty());
    }

    #[test]
    fn rollover_of_committed_day_owes_nothing() {
        let mut st = state();
        st.day = Some(day(MIDNIGHT, &[dp(T, 1.0)]));

        apply(&mut st, dp(MIDNIGHT + 60, 3.0), &Utc);

        assert!(st.owed.is_empty());
    }

    #[test]
    fn combine_keeps_owed_insert() {
        use HistoryAction::*;
        assert_eq!(HistoryAction::combine(None, UpdateDataOnly), UpdateDataOnly);
        assert_eq!(HistoryAction::combine(None, Insert), Insert);
        assert_eq!(HistoryAction::combine(Some(Insert), UpdateDataOnly), Insert);
        assert_eq!(HistoryAction::combine(Some(UpdateDataOnly), Insert), Insert);
        assert_eq!(
            HistoryAction::combine(Some(UpdateDataOnly), UpdateDataOnly),
            UpdateDataOnly
        );
    }

    // -- merge ---------------------------------------------------------------

    #[test]
    fn merge_with_itself_is_identity() {
        let h = day(MIDNIGHT, &[dp(T, 1.0), dp(T + 60, 2.0), dp(T + 120, 3.0)]);
        assert_eq!(merge(&h, &h), h);

        let empty = day(MIDNIGHT, &[]);
        assert_eq!(merge(&empty, &empty), empty);
    }

    #[test]
    fn merge_newer_boundary_wins_outright() {
        let old = day(MIDNIGHT, &[dp(T, 1.0)]);
        let new = day(MIDNIGHT + 86_400, &[dp(MIDNIGHT + 10, 9.0)]);
        assert_eq!(merge(&old, &new), new);
        assert_eq!(merge(&new, &old), new);
    }

    #[test]
    fn merge_same_day_interleaves_without_duplicates() {
        let stored = day(MIDNIGHT, &[dp(T, 1.0), dp(T + 120, 3.0), dp(T + 240, 5.0)]);
        let memory = day(MIDNIGHT, &[dp(T + 60, 2.0), dp(T + 180, 4.0)]);

        let merged = merge(&stored, &memory);

        let values: Vec<f64> = merged.data().iter().map(|d| d.value()).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(crate::codec::decode(merged.raw_data()).unwrap(), merged.data());
    }

    #[test]
    fn merge_collision_keeps_stored_sample() {
        let stored = day(MIDNIGHT, &[dp(T, 1.0)]);
        let memory = day(MIDNIGHT, &[dp(T, 100.0), dp(T + 60, 2.0)]);

        let merged = merge(&stored, &memory);
        assert_eq!(merged.data(), &[dp(T, 1.0), dp(T + 60, 2.0)]);
    }

    #[test]
    fn merge_same_day_empty_side_yields() {
        let full = day(MIDNIGHT, &[dp(T, 1.0)]);
        let empty = day(MIDNIGHT, &[]);
        assert_eq!(merge(&full, &empty), full);
        assert_eq!(merge(&empty, &full), full);
    }

    // -- absorb --------------------------------------------------------------

    #[test]
    fn absorb_into_empty_state_takes_stored() {
        let mut st = state();
        let stored = day(MIDNIGHT, &[dp(T, 1.0)]);
        assert!(absorb(&mut st, stored.clone()));
        assert_eq!(st.day, Some(stored));
        assert_eq!(st.unsaved, None);
    }

    #[test]
    fn absorb_same_day_downgrades_owed_insert() {
        let mut st = state();
        st.day = Some(day(MIDNIGHT, &[dp(T + 60, 2.0)]));
        st.unsaved = Some(HistoryAction::Insert);

        assert!(absorb(&mut st, day(MIDNIGHT, &[dp(T, 1.0)])));

        assert_eq!(st.day.as_ref().unwrap().data().len(), 2);
        assert_eq!(st.unsaved, Some(HistoryAction::UpdateDataOnly));
    }

    #[test]
    fn absorb_identical_is_noop() {
        let mut st = state();
        let h = day(MIDNIGHT, &[dp(T, 1.0)]);
        st.day = Some(h.clone());

        assert!(!absorb(&mut st, h));
        assert_eq!(st.unsaved, None);
    }

    #[test]
    fn absorb_older_stored_day_is_ignored() {
        let mut st = state();
        let current = day(MIDNIGHT + 86_400, &[dp(MIDNIGHT + 10, 1.0)]);
        st.day = Some(current.clone());

        assert!(!absorb(&mut st, day(MIDNIGHT, &[dp(T, 1.0)])));
        assert_eq!(st.day, Some(current));
    }

    #[test]
    fn absorb_newer_stored_day_keeps_uncommitted_one_owed() {
        let mut st = state();
        let current = day(MIDNIGHT, &[dp(T, 1.0)]);
        st.day = Some(current.clone());
        st.unsaved = Some(HistoryAction::Insert);

        let stored = day(MIDNIGHT + 86_400, &[dp(MIDNIGHT + 10, 4.0)]);
        assert!(absorb(&mut st, stored.clone()));

        assert_eq!(st.day, Some(stored));
        assert_eq!(st.unsaved, None);
        assert_eq!(st.owed, vec![(HistoryAction::Insert, current)]);
    }

    #[test]
    fn absorb_keeps_fresh_buffer() {
        let mut st = state();
        st.fresh.push(dp(T + 30, 7.0));
        absorb(&mut st, day(MIDNIGHT, &[dp(T, 1.0)]));
        assert_eq!(st.fresh, vec![dp(T + 30, 7.0)]);
    }
}

use chrono::{DateTime, Utc};

use crate::types::{TimeIntervalState, TimeWindow};

/// The boundary the next window starts at.
pub fn next_boundary(state: &TimeIntervalState) -> DateTime<Utc> {
    state.last_processed.unwrap_or(state.anchor)
}

/// Number of complete windows after the watermark whose end is at least `min_delay` in the past.
pub fn eligible_window_count(state: &TimeIntervalState, now: DateTime<Utc>) -> i64 {
    let Some(width) = state.interval.num_microseconds().filter(|w| *w > 0) else {
        return 0;
    };
    let Some(horizon) = now.checked_sub_signed(state.min_delay) else {
        return 0;
    };

    let start = next_boundary(state).timestamp_micros();
    match horizon.timestamp_micros().checked_sub(start) {
        Some(elapsed) if elapsed >= 0 => elapsed / width,
        _ => 0,
    }
}

/// Every eligible window in order, each `interval` wide and aligned to the anchor.
pub fn eligible_windows(
    state: &TimeIntervalState,
    now: DateTime<Utc>,
) -> impl Iterator<Item = TimeWindow> + '_ {
    let count = eligible_window_count(state, now);
    (0..count).map_while(move |k| window_span(state, k, k + 1))
}

/// The unit of work for a single command invocation.
///
/// Non-batched pipelines get the next eligible window only. Batched pipelines get every
/// eligible window merged into one `[first_start, last_end)` range.
pub fn resolve_window(state: &TimeIntervalState, now: DateTime<Utc>) -> Option<TimeWindow> {
    let count = eligible_window_count(state, now);
    if count == 0 {
        return None;
    }

    if state.batched {
        window_span(state, 0, count)
    } else {
        window_span(state, 0, 1)
    }
}

// The range covering windows [from, to) counted from the next boundary
fn window_span(state: &TimeIntervalState, from: i64, to: i64) -> Option<TimeWindow> {
    let width = state.interval.num_microseconds()?;
    let base = next_boundary(state).timestamp_micros();
    let offset = |k: i64| {
        k.checked_mul(width)
            .and_then(|delta| base.checked_add(delta))
            .and_then(DateTime::from_timestamp_micros)
    };

    Some(TimeWindow {
        start: offset(from)?,
        end: offset(to)?,
    })
}

use crate::types::{CounterPosition, SequenceRange};

/// Computes the next range of counter values to process.
///
/// The range starts right after the watermark, or at the counter's origin when nothing has
/// been processed yet, and ends at the last value the counter handed out. The watermark is
/// always treated as a floor: a counter that was reset below it yields nothing until it
/// catches up again.
pub fn resolve_range(
    last_processed: Option<i64>,
    position: &CounterPosition,
) -> Option<SequenceRange> {
    let start = match last_processed {
        Some(last) => last.checked_add(1)?,
        None => position.origin,
    };
    let end = position.last_value?;

    if start > end {
        return None;
    }

    Some(SequenceRange { start, end })
}

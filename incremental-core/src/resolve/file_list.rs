use std::collections::HashSet;

/// Items from `listing` that are not in the ledger, in listing order and without repeats.
pub fn unprocessed_files(listing: Vec<String>, processed: &HashSet<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    listing
        .into_iter()
        .filter(|path| !processed.contains(path) && seen.insert(path.clone()))
        .collect()
}

/// Splits pending items into the groups passed to consecutive command calls.
///
/// Non-batched pipelines process one item per call. Batched pipelines take chunks of
/// `max_batch_size`, or everything at once when the size is absent or not positive.
pub fn plan_batches(
    files: Vec<String>,
    batched: bool,
    max_batch_size: Option<i32>,
) -> Vec<Vec<String>> {
    if files.is_empty() {
        return Vec::new();
    }

    if !batched {
        return files.into_iter().map(|file| vec![file]).collect();
    }

    match max_batch_size.and_then(|size| usize::try_from(size).ok()) {
        Some(size) if size > 0 => files.chunks(size).map(<[String]>::to_vec).collect(),
        _ => vec![files],
    }
}

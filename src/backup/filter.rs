use std::sync::Arc;

use futures_util::stream::{self, StreamExt};

use crate::icloud::photos::{EntryStream, MediaEntry};
use crate::storage::StorageBackend;

struct SkipState {
    entries: EntryStream,
    backend: Arc<dyn StorageBackend>,
    until_found: Option<u32>,
    streak: u32,
    finished: bool,
}

/// An entry is present only if it and its companion are both stored at
/// their expected sizes.
async fn is_present(backend: &dyn StorageBackend, entry: &MediaEntry) -> bool {
    if !backend.already_stored(entry).await {
        return false;
    }
    match entry.companion.as_deref() {
        Some(companion) => backend.already_stored(companion).await,
        None => true,
    }
}

/// Drop entries that are already stored.
///
/// With `until_found = Some(k)`, enumeration stops as soon as `k` present
/// entries have been seen in a row; nothing further is pulled from
/// `entries`. An enumeration error is passed through and ends the stream.
pub fn skip_already_stored(
    entries: EntryStream,
    backend: Arc<dyn StorageBackend>,
    until_found: Option<u32>,
) -> EntryStream {
    let state = SkipState {
        entries,
        backend,
        until_found,
        streak: 0,
        finished: false,
    };
    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            let entry = match state.entries.next().await? {
                Ok(entry) => entry,
                Err(e) => {
                    state.finished = true;
                    return Some((Err(e), state));
                }
            };
            if !is_present(state.backend.as_ref(), &entry).await {
                state.streak = 0;
                return Some((Ok(entry), state));
            }

            tracing::info!("Skipping {}", state.backend.location(&entry));
            if let Some(companion) = entry.companion.as_deref() {
                tracing::info!("Skipping {}", state.backend.location(companion));
            }
            state.streak += 1;
            if let Some(limit) = state.until_found {
                if state.streak >= limit {
                    tracing::warn!("Found {} consecutive files. Stopping!", state.streak);
                    return None;
                }
            }
        }
    })
    .boxed()
}

/// Flatten each entry into its independently downloadable units, parent
/// first, then companion.
pub fn expand(entries: EntryStream) -> EntryStream {
    entries
        .flat_map(|item| {
            let units: Vec<_> = match item {
                Ok(entry) => entry.into_units().into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(units)
        })
        .boxed()
}

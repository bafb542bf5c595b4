use futures_util::StreamExt;

use crate::icloud::error::ICloudError;
use crate::icloud::photos::EntryStream;
use crate::storage::StorageBackend;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletionOutcome {
    pub deleted: usize,
    pub failed: usize,
}

/// Delete the stored copy of every unit in `units` (typically the expanded
/// "recently deleted" catalog). Deletes are attempted once; a failed
/// delete is logged and the batch continues. Only an enumeration error
/// ends the pass early.
pub async fn delete_removed(
    mut units: EntryStream,
    backend: &dyn StorageBackend,
) -> Result<DeletionOutcome, ICloudError> {
    let mut outcome = DeletionOutcome::default();
    while let Some(unit) = units.next().await {
        let unit = unit?;
        let location = backend.location(&unit);
        match backend.delete(&unit).await {
            Ok(true) => {
                tracing::info!("Deleted {}", location);
                outcome.deleted += 1;
            }
            Ok(false) => tracing::debug!(path = %location, "Nothing to delete"),
            Err(e) => {
                tracing::error!("Could not delete {}! {}", location, e);
                outcome.failed += 1;
            }
        }
    }
    Ok(outcome)
}

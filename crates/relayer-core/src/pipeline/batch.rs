//! Stage 2 regrouping: partition a [`ScratchUnit`] into [`SendBatch`]es by
//! media-kind compatibility.

use crate::model::BatchClass;
use crate::pipeline::scratch::{ScratchHandle, ScratchUnit};

/// Maximum constituent items in one compatibility-class batch.
pub const SEND_BATCH_CAP: usize = 10;

#[derive(Debug, Clone)]
pub struct SendBatch {
    pub class: BatchClass,
    pub handles: Vec<ScratchHandle>,
    /// The rendered caption for the unit this batch was derived from,
    /// attached to the first item of this batch at send time. Set on every
    /// batch split out of a unit, not just the first — the remote wire
    /// format attaches a caption to the first item of whichever batch it
    /// rides in, so a unit split across batches needs it on each one.
    pub caption: Option<String>,
}

/// Partition `unit`'s handles into batches: a new batch starts whenever the
/// compatibility class changes, the current batch is at capacity, or the
/// class is [`BatchClass::Singleton`] (those always batch alone). `cap`
/// overrides [`SEND_BATCH_CAP`] — the CLI's `--batch-size` surfaces this,
/// bounded to `1..=SEND_BATCH_CAP` by the caller. A given unit's handles
/// never merge with another unit's, preserving source-order structure
/// regardless of `cap` (the `--preserve-structure` default).
pub fn regroup_with_cap(unit: &ScratchUnit, cap: usize) -> Vec<SendBatch> {
    let cap = cap.clamp(1, SEND_BATCH_CAP);
    let mut batches: Vec<SendBatch> = Vec::new();

    for handle in unit.handles() {
        let class = handle.media_kind.batch_class();
        let needs_new_batch = match (batches.last(), class) {
            (_, BatchClass::Singleton) => true,
            (Some(last), c) if last.class == c && last.handles.len() < cap => false,
            _ => true,
        };

        if needs_new_batch {
            batches.push(SendBatch {
                class,
                handles: vec![handle.clone()],
                caption: None,
            });
        } else {
            batches.last_mut().expect("just checked").handles.push(handle.clone());
        }
    }

    batches
}

/// Convenience wrapper over [`regroup_with_cap`] using [`SEND_BATCH_CAP`].
pub fn regroup(unit: &ScratchUnit) -> Vec<SendBatch> {
    regroup_with_cap(unit, SEND_BATCH_CAP)
}

//! Submission of the page-table update batch.
//!
//! The hypervisor applies a batch in order and validates each request
//! against the tables as they stand at that point.  A batch is therefore
//! checked locally before it leaves the builder: a malformed one is never
//! submitted.

use std::collections::HashSet;

use log::info;
use xeno_abi::PTE_FLAGS_MASK;

use crate::builder::{PageUpdate, UpdateBatch};
use crate::control::ControlPlane;
use crate::error::{ControlPlaneError, Result};

/// Check that `updates` can be applied in order.
///
/// - The first update pins the root table, and no other update pins.
/// - Every entry written outside the root table lands in a leaf table
///   already installed by an earlier root entry.
pub fn check_order(updates: &[PageUpdate]) -> std::result::Result<(), ControlPlaneError> {
    let root = match updates.first() {
        Some(PageUpdate::PinRootTable { table }) => table.addr(),
        _ => {
            return Err(ControlPlaneError::MalformedBatch {
                index: 0,
                reason: "first request must pin the root table",
            })
        }
    };

    let mut installed = HashSet::new();
    for (index, update) in updates.iter().enumerate().skip(1) {
        match *update {
            PageUpdate::PinRootTable { .. } => {
                return Err(ControlPlaneError::MalformedBatch {
                    index,
                    reason: "root table pinned twice",
                })
            }
            PageUpdate::WriteEntry { slot, entry } => {
                let table = slot & !PTE_FLAGS_MASK;
                if table == root {
                    installed.insert(entry & !PTE_FLAGS_MASK);
                } else if !installed.contains(&table) {
                    return Err(ControlPlaneError::MalformedBatch {
                        index,
                        reason: "entry written before its leaf table was installed",
                    });
                }
            }
            PageUpdate::RecordMapping { .. } => {}
        }
    }
    Ok(())
}

/// Check `batch` and hand it to the hypervisor as one all-or-nothing call.
///
/// Returns the number of requests submitted.
pub fn submit(control: &mut impl ControlPlane, batch: &UpdateBatch) -> Result<usize> {
    check_order(batch.as_slice())?;
    let mut requests = batch.encode();
    control.submit_updates(&mut requests)?;
    info!("Submitted {} page-table updates", requests.len());
    Ok(requests.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BuildError;
    use crate::layout::{root_entry, table_slot, Mfn};
    use crate::testing::FakeControlPlane;

    const ROOT: Mfn = Mfn(0x20);
    const LEAF: Mfn = Mfn(0x21);

    fn pin() -> PageUpdate {
        PageUpdate::PinRootTable { table: ROOT }
    }

    fn install() -> PageUpdate {
        PageUpdate::WriteEntry {
            slot: table_slot(ROOT, 0x300),
            entry: root_entry(LEAF),
        }
    }

    fn leaf_write(index: u64) -> PageUpdate {
        PageUpdate::WriteEntry {
            slot: table_slot(LEAF, index),
            entry: Mfn(0x100 + index).addr() | 0x23,
        }
    }

    fn batch(updates: &[PageUpdate]) -> UpdateBatch {
        let mut batch = UpdateBatch::with_capacity(updates.len());
        for update in updates {
            batch.push(*update).unwrap();
        }
        batch
    }

    #[test]
    fn well_ordered_batch_passes() {
        let updates = [
            pin(),
            install(),
            leaf_write(0),
            PageUpdate::RecordMapping {
                frame: Mfn(0x100),
                pfn: 0,
            },
            leaf_write(1),
        ];
        check_order(&updates).unwrap();
    }

    #[test]
    fn missing_pin_is_rejected() {
        let err = check_order(&[install(), leaf_write(0)]).unwrap_err();
        assert!(matches!(err, ControlPlaneError::MalformedBatch { index: 0, .. }));
        assert!(check_order(&[]).is_err());
    }

    #[test]
    fn second_pin_is_rejected() {
        let err = check_order(&[pin(), install(), pin()]).unwrap_err();
        assert!(matches!(err, ControlPlaneError::MalformedBatch { index: 2, .. }));
    }

    #[test]
    fn leaf_write_before_install_is_rejected() {
        let err = check_order(&[pin(), leaf_write(0), install()]).unwrap_err();
        assert!(matches!(err, ControlPlaneError::MalformedBatch { index: 1, .. }));
    }

    #[test]
    fn submit_hands_over_encoded_batch() {
        let mut control = FakeControlPlane::new(1, vec![]);
        let batch = batch(&[pin(), install(), leaf_write(0)]);
        assert_eq!(submit(&mut control, &batch).unwrap(), 3);

        let submitted = control.submitted.unwrap();
        assert_eq!(submitted, batch.encode());
        assert_eq!(submitted[0], pin().encode());
    }

    #[test]
    fn malformed_batch_is_never_submitted() {
        let mut control = FakeControlPlane::new(1, vec![]);
        let batch = batch(&[install(), pin()]);
        let err = submit(&mut control, &batch).unwrap_err();
        assert!(matches!(
            err,
            BuildError::ControlPlane(ControlPlaneError::MalformedBatch { .. })
        ));
        assert!(control.calls.is_empty());
    }

    #[test]
    fn rejected_batch_surfaces_control_plane_error() {
        let mut control = FakeControlPlane::new(1, vec![]);
        control.reject_updates = true;
        let err = submit(&mut control, &batch(&[pin()])).unwrap_err();
        assert!(matches!(
            err,
            BuildError::ControlPlane(ControlPlaneError::UpdatesRejected { count: 1, .. })
        ));
        assert!(control.submitted.is_none());
    }
}

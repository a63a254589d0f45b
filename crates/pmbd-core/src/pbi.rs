//! Per-block index (PBI).
//!
//! One lock plus one buffer link per 4 KiB physical block. Holding a
//! block's lock licenses the owner to read or write the block's bytes
//! (subject to the permission gate), inspect and mutate its buffer link,
//! and mutate the linked slot's info.
//!
//! Invariant: a block is buffered iff its link holds a valid BBN and the
//! pointed-to slot's back-pointer names this block. Both ends are arena
//! indices, never pointers; `None` is the unlinked sentinel.

use parking_lot::{Mutex, MutexGuard};
use pmbd_types::{Bbn, Pbn};

/// Mutable per-block state, reachable only through the block's lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockLink {
    /// Slot buffering this block, if any.
    pub bbn: Option<Bbn>,
}

/// The per-device table of block locks and links.
#[derive(Debug)]
pub struct PbiTable {
    blocks: Box<[Mutex<BlockLink>]>,
}

impl PbiTable {
    #[must_use]
    pub fn new(total_blocks: u64) -> Self {
        let total = usize::try_from(total_blocks).expect("block count fits usize");
        let mut blocks = Vec::with_capacity(total);
        blocks.resize_with(total, || Mutex::new(BlockLink::default()));
        Self {
            blocks: blocks.into_boxed_slice(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Lock one block.
    #[must_use]
    pub fn lock(&self, pbn: Pbn) -> MutexGuard<'_, BlockLink> {
        let idx = usize::try_from(pbn.0).expect("pbn fits usize");
        self.blocks[idx].lock()
    }

    /// Lock an inclusive block range in ascending order.
    ///
    /// Ascending acquisition is what keeps two overlapping range locks
    /// from deadlocking against each other.
    #[must_use]
    pub fn lock_range(&self, first: Pbn, last: Pbn) -> Vec<MutexGuard<'_, BlockLink>> {
        debug_assert!(first <= last);
        (first.0..=last.0).map(|pbn| self.lock(Pbn(pbn))).collect()
    }
}

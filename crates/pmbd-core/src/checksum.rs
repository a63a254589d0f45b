//! Out-of-band CRC-32 checksum store, one value per block.
//!
//! `on_write` recomputes the checksum of every covered block by reading
//! the block back from the region, so the stored value always reflects
//! what the medium actually holds, not what the writer intended.
//! `on_read` recomputes and compares; a mismatch is reported loudly but
//! the read still returns the bytes.
//!
//! The table is process-local and volatile; it is rebuilt implicitly by
//! the writes of a fresh activation.

use crate::stats::DeviceStats;
use pmbd_region::MemRegion;
use pmbd_types::{DeviceGeometry, Pbn};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::warn;

#[derive(Debug)]
pub struct ChecksumStore {
    table: Box<[AtomicU32]>,
    block_size: usize,
}

impl ChecksumStore {
    #[must_use]
    pub fn new(total_blocks: u64, block_size: u32) -> Self {
        let total = usize::try_from(total_blocks).expect("block count fits usize");
        let mut table = Vec::with_capacity(total);
        table.resize_with(total, || AtomicU32::new(0));
        Self {
            table: table.into_boxed_slice(),
            block_size: block_size as usize,
        }
    }

    fn compute(&self, region: &MemRegion, geometry: DeviceGeometry, pbn: Pbn) -> u32 {
        let offset = usize::try_from(geometry.pbn_to_byte(pbn)).expect("offset fits usize");
        let mut block = vec![0_u8; self.block_size];
        region.read_into(offset, &mut block);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&block);
        hasher.finalize()
    }

    fn blocks_covering(
        geometry: DeviceGeometry,
        byte_offset: u64,
        len: usize,
    ) -> std::ops::RangeInclusive<u64> {
        debug_assert!(len > 0);
        let first = geometry.byte_to_pbn(byte_offset);
        let last = geometry.byte_to_pbn(byte_offset + len as u64 - 1);
        first.0..=last.0
    }

    /// Recompute and store the checksum of every block the written range
    /// touches, wholly or partially.
    pub fn on_write(
        &self,
        region: &MemRegion,
        geometry: DeviceGeometry,
        byte_offset: u64,
        len: usize,
    ) {
        if len == 0 {
            return;
        }
        for pbn in Self::blocks_covering(geometry, byte_offset, len) {
            let checksum = self.compute(region, geometry, Pbn(pbn));
            self.table[usize::try_from(pbn).expect("pbn fits usize")]
                .store(checksum, Ordering::Relaxed);
        }
    }

    /// Verify every covered block. Returns the number of mismatches;
    /// mismatches are reported and counted but never fail the read.
    pub fn on_read(
        &self,
        region: &MemRegion,
        geometry: DeviceGeometry,
        byte_offset: u64,
        len: usize,
        stats: &DeviceStats,
    ) -> usize {
        if len == 0 {
            return 0;
        }
        let mut mismatches = 0;
        for pbn in Self::blocks_covering(geometry, byte_offset, len) {
            let computed = self.compute(region, geometry, Pbn(pbn));
            let stored =
                self.table[usize::try_from(pbn).expect("pbn fits usize")].load(Ordering::Relaxed);
            if stored != computed {
                mismatches += 1;
                stats.count_checksum_mismatch();
                let report = pmbd_error::PmbdError::ChecksumMismatch {
                    pbn,
                    stored,
                    computed,
                };
                warn!(
                    target: "pmbd::checksum",
                    event = "checksum_mismatch",
                    pbn,
                    "{report}"
                );
            }
        }
        mismatches
    }
}

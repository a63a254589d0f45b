//! Policy-selected copy primitives.
//!
//! All traffic between RAM buffers and the memory region funnels through
//! [`store_to_region`] and [`load_from_region`]. The device's
//! [`CopyPolicy`] decides the mechanism:
//!
//! - non-temporal stores (`nts`) copy 64-byte-aligned lines and issue one
//!   store-fence at the end; the fence is mandatory under `nts`, WC, and
//!   UC−;
//! - non-temporal loads (`ntl`) mirror that on the read side;
//! - the flush path runs when `clflush` is set, or when a FUA write lands
//!   on a write-back region without non-temporal stores;
//! - `subupdate` compares source and destination one cache line at a time
//!   and stores only the lines that changed.
//!
//! Ranges shorter than one cache line fall back to a regular copy. The
//! target has no real non-temporal intrinsics to offer safe code, so the
//! non-temporal paths are a line-granular copy followed by the fence the
//! durability contract requires; observable ordering is identical.

use crate::{MemRegion, arena::ByteArena};
use pmbd_types::{CACHE_LINE_SIZE, CacheMode};
use std::sync::atomic::{Ordering, fence};

/// Per-device copy mechanism selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyPolicy {
    /// Use non-temporal stores plus a trailing store-fence.
    pub nts: bool,
    /// Use non-temporal loads.
    pub ntl: bool,
    /// Flush cache lines over every written range.
    pub clflush: bool,
    /// Compare per cache line and store only changed lines.
    pub subupdate: bool,
    /// Cacheability of the destination pages.
    pub cache: CacheMode,
}

impl CopyPolicy {
    /// Whether the store path must end with a store-fence.
    #[must_use]
    pub fn store_fence_required(self) -> bool {
        self.nts || self.cache.needs_store_fence()
    }

    /// Whether a FUA write must flush cache lines explicitly.
    #[must_use]
    pub fn fua_needs_clflush(self) -> bool {
        self.cache == CacheMode::Wb && !self.nts
    }
}

/// What a store actually did; feeds the stage statistics and makes
/// `subupdate` observable.
///
/// The flush path is the caller's move: it decides from
/// [`CopyPolicy::clflush`] / [`CopyPolicy::fua_needs_clflush`] and calls
/// [`flush_cache_lines`] over the written range afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOutcome {
    /// Bytes physically stored (smaller than the request under `subupdate`).
    pub bytes_stored: usize,
    /// Whether a store-fence was issued.
    pub fenced: bool,
}

/// Number of cache lines overlapping `[offset, offset + len)`.
#[must_use]
pub fn lines_covering(offset: usize, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let first = offset / CACHE_LINE_SIZE;
    let last = (offset + len - 1) / CACHE_LINE_SIZE;
    last - first + 1
}

/// Issue a store-fence (sfence analogue): all prior stores become visible
/// before any later ones.
pub fn store_fence() {
    fence(Ordering::Release);
}

/// Flush the cache lines overlapping a written range (clflush analogue).
///
/// Returns the number of lines covered. Ends with a full fence, which is
/// what anchors the durability contract for the flushed range.
#[must_use]
pub fn flush_cache_lines(offset: usize, len: usize) -> usize {
    let lines = lines_covering(offset, len);
    if lines > 0 {
        fence(Ordering::SeqCst);
    }
    lines
}

/// Broadcast full cache write-back (wbinvd analogue), used by the barrier
/// when a write-back region has neither `nts` nor `clflush` ordering.
pub fn full_cache_writeback() {
    fence(Ordering::SeqCst);
}

fn copy_line_granular(arena: &ByteArena, offset: usize, src: &[u8]) {
    // The line-at-a-time loop stands in for movntdq: each 64-byte unit is
    // stored whole, and the caller fences once after the last line.
    let mut pos = 0;
    while pos < src.len() {
        let end = (pos + CACHE_LINE_SIZE).min(src.len());
        arena.write_from(offset + pos, &src[pos..end]);
        pos = end;
    }
}

/// Store `src` into the region at `offset` under the device policy.
///
/// The store permit (the CR0 critical section when that mode is active)
/// spans the compare-and-copy loop and nothing else.
pub fn store_to_region(
    region: &MemRegion,
    offset: usize,
    src: &[u8],
    policy: CopyPolicy,
) -> StoreOutcome {
    let mut outcome = StoreOutcome::default();
    if src.is_empty() {
        return outcome;
    }

    {
        let _permit = region.gate().store_permit(offset, src.len());
        if policy.subupdate {
            // Compare one cache line at a time and skip lines that did not
            // change. Comparison is free of the permission gate; only the
            // stores are covered by the permit.
            let mut pos = 0;
            while pos < src.len() {
                let end = (pos + CACHE_LINE_SIZE).min(src.len());
                let chunk = &src[pos..end];
                if !region.arena().range_eq(offset + pos, chunk) {
                    region.checked_store(offset + pos, chunk);
                    outcome.bytes_stored += chunk.len();
                }
                pos = end;
            }
        } else if policy.nts && src.len() >= CACHE_LINE_SIZE {
            region.gate().assert_store_allowed(offset, src.len());
            copy_line_granular(region.arena(), offset, src);
            outcome.bytes_stored = src.len();
        } else {
            region.checked_store(offset, src);
            outcome.bytes_stored = src.len();
        }
    }

    if policy.store_fence_required() {
        store_fence();
        outcome.fenced = true;
    }
    outcome
}

/// Load from the region at `offset` into `dst` under the device policy.
pub fn load_from_region(region: &MemRegion, offset: usize, dst: &mut [u8], policy: CopyPolicy) {
    if dst.is_empty() {
        return;
    }
    if policy.ntl && dst.len() >= CACHE_LINE_SIZE {
        // Non-temporal loads read whole 64-byte units.
        let mut pos = 0;
        while pos < dst.len() {
            let end = (pos + CACHE_LINE_SIZE).min(dst.len());
            region.arena().read_into(offset + pos, &mut dst[pos..end]);
            pos = end;
        }
    } else {
        region.arena().read_into(offset, dst);
    }
}

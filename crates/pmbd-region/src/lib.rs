#![forbid(unsafe_code)]
//! Memory region layer for the PMBD emulator.
//!
//! A [`MemPool`] models the reserved physical space handed to the driver;
//! [`MemRegion`] is one device's exclusive, page-aligned mapping of part
//! of it, carrying the page-permission gate and the cacheability of its
//! pages. Copy traffic goes through [`copy`], never through the arena
//! directly, so the permission discipline and fence policy hold at every
//! store site.

pub mod arena;
pub mod copy;
pub mod protect;

pub use arena::ByteArena;
pub use copy::{CopyPolicy, StoreOutcome, load_from_region, store_to_region};
pub use protect::{PermissionGate, RangeWindow, StorePermit};

use parking_lot::Mutex;
use pmbd_error::{PmbdError, Result};
use pmbd_types::{CacheMode, WpMode};
use std::sync::Arc;
use tracing::{debug, info};

/// One reserved byte range inside the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reservation {
    start: u64,
    len: u64,
}

impl Reservation {
    fn end(self) -> u64 {
        self.start + self.len
    }

    fn overlaps(self, other: Reservation) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

#[derive(Debug)]
struct PoolInner {
    total: u64,
    reservations: Mutex<Vec<Reservation>>,
}

impl PoolInner {
    fn release(&self, reservation: Reservation) {
        let mut reservations = self.reservations.lock();
        reservations.retain(|r| *r != reservation);
    }
}

/// The reserved physical memory space regions are carved out of.
///
/// This is the explicit activation context standing in for the
/// module-global reserved range: every device maps its region out of one
/// pool, and ranges are exclusive until the region drops.
#[derive(Debug, Clone)]
pub struct MemPool {
    inner: Arc<PoolInner>,
}

impl MemPool {
    #[must_use]
    pub fn new(total_bytes: u64) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                total: total_bytes,
                reservations: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.inner.total
    }

    /// Map a region of `len_bytes` at the lowest free range.
    pub fn map(&self, len_bytes: usize, wrprot: bool, wpmode: WpMode) -> Result<MemRegion> {
        let len = len_bytes as u64;
        if len == 0 {
            return Err(PmbdError::BadConfig("region length must be non-zero".to_owned()));
        }
        let reservation = {
            let mut reservations = self.inner.reservations.lock();
            reservations.sort_by_key(|r| r.start);
            let mut cursor = 0_u64;
            let mut found = None;
            for r in reservations.iter() {
                if r.start.saturating_sub(cursor) >= len {
                    break;
                }
                cursor = cursor.max(r.end());
            }
            if cursor + len <= self.inner.total {
                let reservation = Reservation { start: cursor, len };
                reservations.push(reservation);
                found = Some(reservation);
            }
            found.ok_or_else(|| {
                PmbdError::OutOfMemory(format!(
                    "no free range of {len} bytes in a pool of {}",
                    self.inner.total
                ))
            })?
        };
        Ok(self.build_region(reservation, wrprot, wpmode))
    }

    /// Map a region at an explicit offset, the `hmo`-style placement.
    ///
    /// Fails `Busy` when the range is already reserved by another region.
    pub fn map_at(
        &self,
        offset: u64,
        len_bytes: usize,
        wrprot: bool,
        wpmode: WpMode,
    ) -> Result<MemRegion> {
        let len = len_bytes as u64;
        if len == 0 {
            return Err(PmbdError::BadConfig("region length must be non-zero".to_owned()));
        }
        let wanted = Reservation { start: offset, len };
        if wanted.end() > self.inner.total {
            return Err(PmbdError::OutOfMemory(format!(
                "range [{offset}, {}) exceeds pool of {} bytes",
                wanted.end(),
                self.inner.total
            )));
        }
        {
            let mut reservations = self.inner.reservations.lock();
            if let Some(existing) = reservations.iter().find(|r| r.overlaps(wanted)) {
                return Err(PmbdError::Busy(format!(
                    "range [{offset}, {}) overlaps reservation at [{}, {})",
                    wanted.end(),
                    existing.start,
                    existing.end()
                )));
            }
            reservations.push(wanted);
        }
        Ok(self.build_region(wanted, wrprot, wpmode))
    }

    fn build_region(&self, reservation: Reservation, wrprot: bool, wpmode: WpMode) -> MemRegion {
        info!(
            target: "pmbd::region",
            event = "region_map",
            start = reservation.start,
            len = reservation.len,
            wrprot,
            wpmode = wpmode.as_str()
        );
        let len = usize::try_from(reservation.len).expect("region length fits usize");
        MemRegion {
            arena: ByteArena::new(len),
            gate: PermissionGate::new(len, wrprot, wpmode),
            cache: Mutex::new(CacheState {
                current: CacheMode::Wb,
                pinned: false,
            }),
            pool: Arc::clone(&self.inner),
            reservation,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CacheState {
    current: CacheMode,
    pinned: bool,
}

/// One device's contiguous byte-addressable backing range.
///
/// Invariants: the range is page-aligned and either entirely mapped or
/// entirely unmapped; cacheability is set exactly once after mapping and
/// restored to write-back at teardown.
#[derive(Debug)]
pub struct MemRegion {
    arena: ByteArena,
    gate: PermissionGate,
    cache: Mutex<CacheState>,
    pool: Arc<PoolInner>,
    reservation: Reservation,
}

impl MemRegion {
    #[must_use]
    pub fn len_bytes(&self) -> usize {
        self.arena.len()
    }

    #[must_use]
    pub fn arena(&self) -> &ByteArena {
        &self.arena
    }

    #[must_use]
    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    /// Set the cacheability of the region's pages. Allowed exactly once,
    /// right after mapping.
    pub fn set_cacheability(&self, mode: CacheMode) -> Result<()> {
        let mut cache = self.cache.lock();
        if cache.pinned {
            return Err(PmbdError::BadConfig(format!(
                "cacheability already set to {}",
                cache.current
            )));
        }
        cache.current = mode;
        cache.pinned = true;
        info!(
            target: "pmbd::region",
            event = "set_cacheability",
            mode = mode.as_str()
        );
        Ok(())
    }

    #[must_use]
    pub fn cacheability(&self) -> CacheMode {
        self.cache.lock().current
    }

    /// Permission-checked store: panics when the range is read-only and no
    /// RW window covers it.
    pub fn checked_store(&self, offset: usize, src: &[u8]) {
        self.gate.assert_store_allowed(offset, src.len());
        self.arena.write_from(offset, src);
    }

    /// Plain load; reads are never gated.
    pub fn read_into(&self, offset: usize, dst: &mut [u8]) {
        self.arena.read_into(offset, dst);
    }

    /// Compare region contents against `expected` (write verification).
    #[must_use]
    pub fn range_eq(&self, offset: usize, expected: &[u8]) -> bool {
        self.arena.range_eq(offset, expected)
    }

    /// Test support: a stray in-process store that bypasses the permission
    /// gate, the wild pointer the gate exists to catch.
    #[doc(hidden)]
    pub fn wild_store(&self, offset: usize, value: u8) {
        self.arena.write_byte(offset, value);
    }
}

impl Drop for MemRegion {
    fn drop(&mut self) {
        // Teardown contract: pages go back to write-back before the range
        // is returned to the pool.
        let mut cache = self.cache.lock();
        if cache.current != CacheMode::Wb {
            debug!(
                target: "pmbd::region",
                event = "restore_cacheability",
                from = cache.current.as_str()
            );
            cache.current = CacheMode::Wb;
        }
        drop(cache);
        self.pool.release(self.reservation);
        info!(
            target: "pmbd::region",
            event = "region_unmap",
            start = self.reservation.start,
            len = self.reservation.len
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_maps_exclusively_and_reclaims_on_drop() {
        let pool = MemPool::new(1 << 20);
        let first = pool.map(1 << 19, false, WpMode::Pte).expect("first map");
        let second = pool.map(1 << 19, false, WpMode::Pte).expect("second map");
        // Pool exhausted now.
        let err = pool.map(4096, false, WpMode::Pte).unwrap_err();
        assert!(matches!(err, PmbdError::OutOfMemory(_)));

        drop(first);
        drop(second);
        let again = pool.map(1 << 20, false, WpMode::Pte);
        assert!(again.is_ok());
    }

    #[test]
    fn map_at_conflicts_report_busy() {
        let pool = MemPool::new(1 << 20);
        let _held = pool.map_at(4096, 8192, false, WpMode::Pte).expect("map_at");
        let err = pool.map_at(8192, 4096, false, WpMode::Pte).unwrap_err();
        assert!(matches!(err, PmbdError::Busy(_)));
        // Non-overlapping placement is fine.
        assert!(pool.map_at(12288, 4096, false, WpMode::Pte).is_ok());
    }

    #[test]
    fn cacheability_is_set_once() {
        let pool = MemPool::new(1 << 16);
        let region = pool.map(4096, false, WpMode::Pte).expect("map");
        assert_eq!(region.cacheability(), CacheMode::Wb);
        region.set_cacheability(CacheMode::Wc).expect("first set");
        assert_eq!(region.cacheability(), CacheMode::Wc);
        let err = region.set_cacheability(CacheMode::Uc).unwrap_err();
        assert!(matches!(err, PmbdError::BadConfig(_)));
    }

    #[test]
    fn checked_store_honours_the_gate() {
        let pool = MemPool::new(1 << 16);
        let region = pool.map(8192, true, WpMode::Pte).expect("map");
        {
            let _window = region.gate().open_range(0, 4096);
            region.checked_store(100, &[1, 2, 3]);
        }
        let mut back = [0_u8; 3];
        region.read_into(100, &mut back);
        assert_eq!(back, [1, 2, 3]);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            region.checked_store(100, &[4]);
        }));
        assert!(result.is_err(), "store outside a window must be fatal");

        // The wild-store stub is exactly the bypass the verifier catches.
        region.wild_store(100, 0xFF);
        assert!(!region.range_eq(100, &[1, 2, 3]));
    }
}
